use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Cfg;
use crate::error::{error_report, FilterError};
use crate::rules::Snapshot;

#[derive(Debug)]
struct LoadState {
    modified: SystemTime,
    version: u64,
}

/// Owns the current rule snapshot and swaps in a new one when the
/// configuration file changes on disk.
pub struct RuleProvider {
    path: Utf8PathBuf,
    startup: Cfg,
    current: ArcSwap<Snapshot>,
    state: Mutex<LoadState>,
}

impl RuleProvider {
    pub async fn load(path: &Utf8Path) -> Result<Self, FilterError> {
        let modified = modified(path).await?.0;
        let startup = Cfg::load(path)?;
        let snapshot = Snapshot::compile(&startup, 1)?;

        Ok(RuleProvider {
            path: path.to_owned(),
            startup,
            current: ArcSwap::from_pointee(snapshot),
            state: Mutex::new(LoadState {
                modified,
                version: 1,
            }),
        })
    }

    /// The configuration as it was read at startup. Listener and upstream
    /// addresses, logging and audit settings are only taken from here.
    pub fn config(&self) -> &Cfg {
        &self.startup
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Recompiles the rules if the file's modification time moved. Returns
    /// whether a new snapshot was published. On error the current snapshot
    /// stays in place and the next call tries again.
    pub async fn reload_if_changed(&self) -> Result<bool, FilterError> {
        let mut state = self.state.lock().await;

        let (modified, len) = modified(&self.path).await?;
        if modified == state.modified || len == 0 {
            return Ok(false);
        }

        let cfg = Cfg::load(&self.path)?;
        let snapshot = Snapshot::compile(&cfg, state.version + 1)?;
        state.version = snapshot.version;
        state.modified = modified;
        self.current.store(Arc::new(snapshot));
        Ok(true)
    }

    /// Polls the configuration file until `cancel` fires.
    pub async fn watch(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.reload_if_changed().await {
                Ok(true) => info!(path = %self.path, version = self.snapshot().version, "reload done"),
                Ok(false) => {}
                Err(e) => error!(
                    path = %self.path,
                    error = %error_report(&e),
                    "reload failed, keeping previous rules"
                ),
            }
        }
    }
}

async fn modified(path: &Utf8Path) -> Result<(SystemTime, u64), FilterError> {
    let to_error = |source| FilterError::ConfigStat {
        path: path.to_string(),
        source,
    };
    let meta = tokio::fs::metadata(path).await.map_err(to_error)?;
    Ok((meta.modified().map_err(to_error)?, meta.len()))
}
