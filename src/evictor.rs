/// Background eviction: watch memory pressure, reclaim cold fork servers
use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};

use crate::cgroup::MemCGroup;
use crate::manager::CacheManager;
use crate::types::Result;

/// Poll interval for the pressure loop.
const TICK: Duration = Duration::from_millis(50);

/// Pressure at which the cache is declared full and eviction starts.
const HIGH_WATER: f64 = 0.9;

/// Pressure below which the full flag clears.
const LOW_WATER: f64 = 0.7;

/// Watches the parent memory cgroup of all cache sandboxes and reclaims the
/// least useful leaf servers when usage approaches the configured budget.
pub struct Evictor {
    manager: Weak<CacheManager>,
    cgroup: MemCGroup,
    budget_bytes: u64,
}

/// Join/shutdown handle for a running evictor thread.
pub struct EvictorHandle {
    shutdown: Sender<()>,
    thread: JoinHandle<()>,
}

impl EvictorHandle {
    /// Stop the loop and wait for it to exit.
    pub fn stop(self) {
        let _ = self.shutdown.send(());
        if self.thread.join().is_err() {
            log::error!("evictor thread panicked");
        }
    }
}

impl Evictor {
    /// Start the eviction loop over `cgroup` with a budget in kilobytes.
    ///
    /// The loop holds only a weak reference to the manager and exits on
    /// shutdown or once the manager is dropped.
    pub fn spawn(manager: Weak<CacheManager>, cgroup: MemCGroup, budget_kb: u64) -> EvictorHandle {
        let evictor = Evictor {
            manager,
            cgroup,
            budget_bytes: budget_kb.saturating_mul(1024).max(1),
        };

        let (shutdown, signal) = crossbeam_channel::bounded(1);
        let thread = std::thread::spawn(move || loop {
            match signal.recv_timeout(TICK) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            let manager = match evictor.manager.upgrade() {
                Some(manager) => manager,
                None => break,
            };
            if let Err(e) = evictor.check_usage(&manager) {
                log::warn!("evictor: {}", e);
            }
        });

        EvictorHandle { shutdown, thread }
    }

    /// One pressure check. Above the high-water mark: set the full flag and
    /// reclaim one victim. Below the low-water mark: clear the flag.
    fn check_usage(&self, manager: &CacheManager) -> Result<()> {
        let usage = self.cgroup.usage()?;
        let pressure = usage as f64 / self.budget_bytes as f64;

        if pressure >= HIGH_WATER {
            if !manager.full() {
                log::info!(
                    "import cache under pressure ({} of {} bytes), evicting",
                    usage,
                    self.budget_bytes
                );
            }
            manager.set_full(true);

            if let Some(victim) = manager.evict_one() {
                // Kill off-thread; tearing a sandbox down can be slow.
                std::thread::spawn(move || {
                    if let Err(e) = victim.kill() {
                        log::error!("failed to kill fork server {}: {}", victim.id(), e);
                    }
                });
            }
        } else if pressure <= LOW_WATER {
            if manager.full() {
                log::info!("import cache pressure relieved ({} bytes)", usage);
            }
            manager.set_full(false);
        }

        Ok(())
    }
}
