use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ConfigError, Policy};

/// Current snapshot plus the mtime of the file revision it came from.
struct State {
    policy: Arc<Policy>,
    mtime: Option<SystemTime>,
}

/// Hot-reloadable holder of the active [`Policy`].
///
/// Readers take a cheap `Arc` clone under a read lock and keep using that
/// snapshot for the rest of their request, so a concurrent reload never
/// hands them a half-updated policy. Reloads are serialized by the
/// `reload` mutex; the write lock is only held for the pointer swap.
pub struct PolicyStore {
    path: PathBuf,
    state: RwLock<State>,
    /// Serializes reloads. Holds the mtime of the last revision that failed
    /// to load, so a broken file is parsed (and reported) once rather than
    /// on every poll.
    reload: Mutex<Option<SystemTime>>,
}

impl PolicyStore {
    /// Loads the policy file. Fails if the initial load fails: the service
    /// must not start without a policy.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let mtime = modified(&path).await;
        let policy = Policy::load(&path).await?;

        info!(
            "Policy loaded from {}: {} command(s), {} director(y/ies)",
            path.display(),
            policy.allowed_commands.len(),
            policy.allowed_directories.len()
        );

        Ok(Self {
            path,
            state: RwLock::new(State {
                policy: Arc::new(policy),
                mtime,
            }),
            reload: Mutex::new(None),
        })
    }

    /// Returns the current policy snapshot.
    pub fn snapshot(&self) -> Arc<Policy> {
        match self.state.read() {
            Ok(state) => Arc::clone(&state.policy),
            // A panic while holding the lock cannot leave a torn snapshot:
            // the guarded value is only ever replaced whole.
            Err(poisoned) => Arc::clone(&poisoned.into_inner().policy),
        }
    }

    /// Re-reads the policy file and swaps in the new snapshot. Callers hold
    /// the reload lock.
    ///
    /// On failure the previous snapshot stays active and the broken
    /// revision's mtime is remembered in `failed`.
    async fn load_locked(&self, failed: &mut Option<SystemTime>) -> Result<(), ConfigError> {
        let mtime = modified(&self.path).await;
        match Policy::load(&self.path).await {
            Ok(policy) => {
                self.swap(policy, mtime);
                *failed = None;
                Ok(())
            }
            Err(e) => {
                *failed = mtime;
                Err(e)
            }
        }
    }

    /// Reloads the policy if the file's mtime moved past the one last seen.
    ///
    /// Returns `Ok(true)` when a new snapshot was installed.
    pub async fn check_for_update(&self) -> Result<bool, ConfigError> {
        let mut failed = self.reload.lock().await;

        let Some(current) = modified(&self.path).await else {
            // File vanished or is unreadable; keep serving the last policy.
            debug!("Policy file {} not accessible, keeping current policy", self.path.display());
            return Ok(false);
        };

        let seen = self.stored_mtime();
        if seen.is_some_and(|seen| current <= seen) {
            return Ok(false);
        }
        if *failed == Some(current) {
            return Ok(false);
        }

        info!("Policy file {} changed, reloading", self.path.display());
        self.load_locked(&mut failed).await?;
        Ok(true)
    }

    /// Spawns the background task that polls the policy file.
    pub fn spawn_watcher(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; the policy was just loaded.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match self.check_for_update().await {
                    Ok(true) => {
                        let policy = self.snapshot();
                        info!(
                            "Policy reloaded: commands [{}], directories [{}], strict={}",
                            policy.commands_list(),
                            policy.directories_list(),
                            policy.strict_validation
                        );
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Policy reload failed, keeping previous policy: {e}"),
                }
            }
        })
    }

    fn swap(&self, policy: Policy, mtime: Option<SystemTime>) {
        let next = State {
            policy: Arc::new(policy),
            mtime,
        };
        match self.state.write() {
            Ok(mut state) => *state = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    fn stored_mtime(&self) -> Option<SystemTime> {
        match self.state.read() {
            Ok(state) => state.mtime,
            Err(poisoned) => poisoned.into_inner().mtime,
        }
    }
}

async fn modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .ok()
}
