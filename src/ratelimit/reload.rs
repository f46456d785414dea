//! Rules file loading and hot reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::limiter::RateLimiter;
use super::rules::RuleSetConfig;
use crate::error::Result;

/// A rules file and the contents last applied from it.
#[derive(Debug, Clone)]
pub struct RulesFile {
    path: PathBuf,
    last: Option<String>,
}

impl RulesFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file and install its rules if the contents changed since the
    /// last call. Returns the new rule set version, or `None` if unchanged.
    ///
    /// Contents that fail to parse or validate are remembered too, so a bad
    /// file is reported once rather than on every poll.
    pub async fn reload(&mut self, limiter: &RateLimiter) -> Result<Option<u64>> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        if self.last.as_deref() == Some(contents.as_str()) {
            return Ok(None);
        }

        let result = RuleSetConfig::from_yaml(&contents)
            .and_then(RuleSetConfig::into_rules)
            .and_then(|(rules, default_rule)| {
                limiter.replace_rules(rules, default_rule.as_deref())
            });
        self.last = Some(contents);

        let version = result?;
        info!(path = %self.path.display(), version = version, "Rate limit rules loaded");
        Ok(Some(version))
    }
}

/// Background task that polls a rules file and swaps changed rules into a
/// [`RateLimiter`]. Stops when dropped or shut down.
#[derive(Debug)]
pub struct RuleReloader {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl RuleReloader {
    /// Start polling `file` every `interval`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(limiter: Arc<RateLimiter>, mut file: RulesFile, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        info!(path = %file.path().display(), interval = ?interval, "Watching rate limit rules");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }

                match file.reload(&limiter).await {
                    Ok(Some(_)) => {}
                    Ok(None) => debug!(path = %file.path().display(), "Rules unchanged"),
                    Err(e) => warn!(
                        path = %file.path().display(),
                        error = %e,
                        "Failed to reload rules, keeping current rules"
                    ),
                }
            }

            debug!("Rule reloader stopped");
        });

        Self {
            shutdown_tx,
            task: Some(task),
        }
    }

    /// Stop polling and wait for the task to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RuleReloader {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::store::MemoryStore;

    const RULES: &str = r#"
rules:
  - name: api
    algorithm: fixed_window
    limit: 100
    unit: minute
"#;

    const TIGHTER: &str = r#"
rules:
  - name: api
    algorithm: fixed_window
    limit: 5
    unit: minute
"#;

    const INVALID: &str = r#"
rules:
  - name: api
    algorithm: fixed_window
    limit: 0
    unit: minute
"#;

    struct TempRules(PathBuf);

    impl TempRules {
        fn new(contents: &str) -> Self {
            let path = std::env::temp_dir().join(format!("sluice-rules-{}.yaml", uuid::Uuid::new_v4()));
            std::fs::write(&path, contents).unwrap();
            Self(path)
        }

        fn write(&self, contents: &str) {
            std::fs::write(&self.0, contents).unwrap();
        }
    }

    impl Drop for TempRules {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn limit_of(limiter: &RateLimiter) -> Option<u64> {
        limiter.registry().snapshot().get("api").map(|rule| rule.limit)
    }

    #[tokio::test]
    async fn test_reload_skips_unchanged_contents() {
        let temp = TempRules::new(RULES);
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let mut file = RulesFile::new(&temp.0);

        assert_eq!(file.reload(&limiter).await.unwrap(), Some(1));
        assert_eq!(file.reload(&limiter).await.unwrap(), None);
        assert_eq!(limit_of(&limiter), Some(100));

        temp.write(TIGHTER);
        assert_eq!(file.reload(&limiter).await.unwrap(), Some(2));
        assert_eq!(limit_of(&limiter), Some(5));
    }

    #[tokio::test]
    async fn test_invalid_file_keeps_current_rules() {
        let temp = TempRules::new(RULES);
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let mut file = RulesFile::new(&temp.0);
        file.reload(&limiter).await.unwrap();

        temp.write(INVALID);
        let err = file.reload(&limiter).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidRule);
        assert_eq!(limit_of(&limiter), Some(100));

        // Reported once, then treated as unchanged
        assert_eq!(file.reload(&limiter).await.unwrap(), None);

        temp.write("rules: [not, a, rule");
        let err = file.reload(&limiter).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Config);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let mut file = RulesFile::new("/nonexistent/sluice/rules.yaml");
        let err = file.reload(&limiter).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Io);
    }

    #[tokio::test]
    async fn test_reloader_picks_up_changes() {
        let temp = TempRules::new(RULES);
        let limiter = Arc::new(RateLimiter::new(Arc::new(MemoryStore::new())));
        let mut file = RulesFile::new(&temp.0);
        file.reload(&limiter).await.unwrap();

        let reloader = RuleReloader::spawn(limiter.clone(), file, Duration::from_millis(10));
        temp.write(TIGHTER);

        let mut waited = Duration::ZERO;
        while limit_of(&limiter) != Some(5) && waited < Duration::from_secs(5) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += Duration::from_millis(10);
        }
        assert_eq!(limit_of(&limiter), Some(5));

        reloader.shutdown().await;
        let version = limiter.registry().snapshot().version();

        temp.write(RULES);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.registry().snapshot().version(), version);
    }
}
