//! Multiprocess dispatcher
//!
//! The dispatcher splits the account and proxy lists into contiguous,
//! disjoint partitions and spawns one worker process per partition by
//! re-invoking the current executable with the `worker` subcommand. Workers
//! receive only their index and the total count; they re-derive the same
//! partitions from the same input files, so both sides agree without any
//! serialized hand-off.
//!
//! Worker stdin doubles as the termination channel: the dispatcher holds the
//! pipe open and closes it to request a graceful stop, escalating to a kill
//! after a short grace period.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::utils::shutdown::ShutdownSignal;

const SUPERVISE_INTERVAL: Duration = Duration::from_secs(1);
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Effective worker process count.
///
/// Bounded by the configured maximum (0 means unset), by `cpu_count - 1`
/// with a floor of one, and by the number of accounts, since an account
/// belongs to exactly one worker.
pub fn worker_count(configured_max: usize, cpu_count: usize, account_count: usize) -> usize {
    let cpu_bound = cpu_count.saturating_sub(1).max(1);
    let configured = if configured_max > 0 {
        configured_max
    } else {
        cpu_bound
    };
    configured.min(cpu_bound).min(account_count).max(1)
}

/// Split proxies into contiguous partitions; the first `len mod n` workers
/// receive one extra proxy.
pub fn partition_proxies(proxies: &[String], workers: usize) -> Vec<Vec<String>> {
    let mut partitions = Vec::with_capacity(workers);
    if proxies.is_empty() {
        partitions.resize(workers, Vec::new());
        return partitions;
    }

    let per_worker = proxies.len() / workers;
    let remainder = proxies.len() % workers;

    let mut start = 0;
    for i in 0..workers {
        let count = per_worker + usize::from(i < remainder);
        partitions.push(proxies[start..start + count].to_vec());
        start += count;
    }
    partitions
}

/// Split accounts into contiguous near-equal partitions; the last worker
/// absorbs the remainder.
pub fn partition_accounts(accounts: &[String], workers: usize) -> Vec<Vec<String>> {
    let per_worker = accounts.len() / workers;
    let mut partitions = Vec::with_capacity(workers);

    for i in 0..workers {
        let start = i * per_worker;
        let end = if i == workers - 1 {
            accounts.len()
        } else {
            start + per_worker
        };
        partitions.push(accounts[start..end].to_vec());
    }
    partitions
}

struct WorkerHandle {
    index: usize,
    child: Child,
}

/// Spawns and supervises the worker fleet
pub struct WorkerDispatcher {
    config_path: PathBuf,
    accounts_path: PathBuf,
    proxies_path: PathBuf,
    fail_fast: bool,
    workers: Vec<WorkerHandle>,
}

impl WorkerDispatcher {
    pub fn new(
        config_path: impl Into<PathBuf>,
        accounts_path: impl Into<PathBuf>,
        proxies_path: impl Into<PathBuf>,
        fail_fast: bool,
    ) -> Self {
        Self {
            config_path: config_path.into(),
            accounts_path: accounts_path.into(),
            proxies_path: proxies_path.into(),
            fail_fast,
            workers: Vec::new(),
        }
    }

    fn spawn_worker(&self, index: usize, total: usize, exe: &Path) -> Result<Child> {
        Command::new(exe)
            .arg("worker")
            .arg("--config")
            .arg(&self.config_path)
            .arg("--accounts")
            .arg(&self.accounts_path)
            .arg("--proxies")
            .arg(&self.proxies_path)
            .arg("--worker-index")
            .arg(index.to_string())
            .arg("--worker-count")
            .arg(total.to_string())
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::with_source(format!("Failed to spawn worker {index}"), e))
    }

    /// Start `total` worker processes.
    pub fn start(&mut self, total: usize) -> Result<()> {
        let exe = std::env::current_exe()
            .map_err(|e| Error::with_source("Cannot resolve current executable", e))?;

        for index in 0..total {
            let child = self.spawn_worker(index, total, &exe)?;
            info!(worker = index, pid = child.id(), "Worker process started");
            self.workers.push(WorkerHandle { index, child });
        }
        Ok(())
    }

    /// Poll worker liveness until shutdown or the fleet winds down.
    ///
    /// With `fail_fast` (the default), one unexpected worker exit terminates
    /// the whole fleet. Without it, exits are logged and the rest keep going.
    pub async fn supervise(&mut self, shutdown: &ShutdownSignal) -> Result<()> {
        loop {
            if shutdown.is_triggered() {
                info!("Shutdown requested, stopping workers");
                self.stop().await;
                break;
            }

            let mut exited = Vec::new();
            for (pos, handle) in self.workers.iter_mut().enumerate() {
                match handle.child.try_wait() {
                    Ok(Some(status)) => {
                        error!(worker = handle.index, %status, "Worker exited unexpectedly");
                        exited.push(pos);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(worker = handle.index, error = %e, "Failed to poll worker");
                        exited.push(pos);
                    }
                }
            }

            if !exited.is_empty() {
                if self.fail_fast {
                    warn!("Terminating remaining workers");
                    self.stop().await;
                    break;
                }
                for pos in exited.into_iter().rev() {
                    self.workers.remove(pos);
                }
            }

            if self.workers.is_empty() {
                info!("All workers have exited");
                break;
            }

            tokio::time::sleep(SUPERVISE_INTERVAL).await;
        }
        Ok(())
    }

    /// Terminate all workers: graceful stdin close, short grace, then kill.
    /// Idempotent.
    pub async fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        info!(count = self.workers.len(), "Terminating worker processes");

        for handle in &mut self.workers {
            // Closing the control pipe asks the worker to stop
            drop(handle.child.stdin.take());
        }

        tokio::time::sleep(TERMINATE_GRACE).await;

        for handle in &mut self.workers {
            if let Ok(None) = handle.child.try_wait() {
                if let Err(e) = handle.child.kill().await {
                    warn!(worker = handle.index, error = %e, "Failed to kill worker");
                }
            }
        }

        self.workers.clear();
        info!("All workers terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labeled(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("item-{i}")).collect()
    }

    #[test]
    fn test_worker_count_bounds() {
        // Configured cap applies
        assert_eq!(worker_count(2, 8, 100), 2);
        // CPU bound keeps one core free
        assert_eq!(worker_count(16, 4, 100), 3);
        // Unset falls back to the CPU bound
        assert_eq!(worker_count(0, 4, 100), 3);
        // Never more workers than accounts
        assert_eq!(worker_count(8, 8, 2), 2);
        // Single-core machine still gets one worker
        assert_eq!(worker_count(0, 1, 100), 1);
    }

    #[test]
    fn test_partition_proxies_covers_all_exactly_once() {
        let proxies = labeled(10);
        let parts = partition_proxies(&proxies, 3);

        assert_eq!(parts.len(), 3);
        let flat: Vec<_> = parts.iter().flatten().cloned().collect();
        assert_eq!(flat, proxies);

        // 10 = 4 + 3 + 3: first (10 mod 3) partitions take one extra
        assert_eq!(parts[0].len(), 4);
        assert_eq!(parts[1].len(), 3);
        assert_eq!(parts[2].len(), 3);
    }

    #[test]
    fn test_partition_proxies_sizes_differ_at_most_one() {
        for n in 1..=7 {
            for workers in 1..=5 {
                let parts = partition_proxies(&labeled(n), workers);
                let max = parts.iter().map(Vec::len).max().unwrap();
                let min = parts.iter().map(Vec::len).min().unwrap();
                assert!(max - min <= 1, "n={n} workers={workers}");
            }
        }
    }

    #[test]
    fn test_partition_proxies_empty() {
        let parts = partition_proxies(&[], 3);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(Vec::is_empty));
    }

    #[test]
    fn test_partition_accounts_last_absorbs_remainder() {
        let accounts = labeled(10);
        let parts = partition_accounts(&accounts, 3);

        assert_eq!(parts[0].len(), 3);
        assert_eq!(parts[1].len(), 3);
        assert_eq!(parts[2].len(), 4);

        let flat: Vec<_> = parts.iter().flatten().cloned().collect();
        assert_eq!(flat, accounts);
    }

    #[test]
    fn test_partitions_deterministic() {
        let accounts = labeled(17);
        assert_eq!(
            partition_accounts(&accounts, 4),
            partition_accounts(&accounts, 4)
        );
        let proxies = labeled(23);
        assert_eq!(
            partition_proxies(&proxies, 4),
            partition_proxies(&proxies, 4)
        );
    }
}
