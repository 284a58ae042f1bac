//! Per-worker farm scheduler
//!
//! Bootstraps the worker's account partition into a device roster, then
//! loops: pick up to a batch of ready devices, skip the ones already in
//! flight, and spawn a bounded, timeboxed unit for each. Schedule marks
//! live in the store, so readiness is re-read from it every tick.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::farm::{runner, FarmContext};
use crate::models::{
    derive_device_id, mark_after, Account, Device, CPU_ARCHITECTURE, CPU_FINGERPRINTS,
    DESKTOP_USER_AGENTS,
};
use crate::utils::shutdown::ShutdownSignal;

/// Account rows are resolved from the store in chunks of this size.
const ACCOUNT_CHUNK: usize = 2000;
/// Bulk mark updates are written in batches of this size.
const MARK_BATCH: usize = 1000;
/// Pause between scheduling ticks and when no device is ready.
const IDLE_INTERVAL: Duration = Duration::from_secs(5);

/// Scheduler for one worker's partition of accounts and proxies
pub struct FarmScheduler {
    ctx: Arc<FarmContext>,
    account_emails: Vec<String>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl FarmScheduler {
    pub fn new(ctx: Arc<FarmContext>, account_emails: Vec<String>) -> Self {
        Self {
            ctx,
            account_emails,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Number of devices currently in flight (diagnostics).
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// Resolve the partition's emails to logged-in account rows.
    fn prepare_accounts(&self) -> Result<Vec<Account>> {
        debug!(
            worker = self.ctx.worker_id,
            count = self.account_emails.len(),
            "Preparing accounts"
        );

        let mut accounts = Vec::new();
        for chunk in self.account_emails.chunks(ACCOUNT_CHUNK) {
            accounts.extend(self.ctx.store.accounts_by_emails(chunk)?);
        }

        let resolved = accounts.len();
        accounts.retain(|account| {
            if account.is_logged_in() {
                true
            } else {
                warn!(
                    worker = self.ctx.worker_id,
                    account = %account.email,
                    "Account not logged in, skipped for farming"
                );
                false
            }
        });

        debug!(
            worker = self.ctx.worker_id,
            prepared = accounts.len(),
            resolved,
            "Accounts prepared"
        );
        Ok(accounts)
    }

    /// Ensure each account has its devices, creating the shortfall from the
    /// proxy pool. Returns the roster of device ids this worker schedules.
    async fn prepare_devices(&self, accounts: &[Account]) -> Result<Vec<String>> {
        let results = futures::future::join_all(
            accounts
                .iter()
                .map(|account| self.prepare_account_devices(account)),
        )
        .await;

        let mut roster: Vec<Device> = Vec::new();
        for (account, result) in accounts.iter().zip(results) {
            match result {
                Ok(devices) => roster.extend(devices),
                Err(e) => warn!(
                    worker = self.ctx.worker_id,
                    account = %account.email,
                    error = %e,
                    "Device preparation failed for account"
                ),
            }
        }

        if roster.is_empty() {
            warn!(worker = self.ctx.worker_id, "No devices prepared for farming");
            return Ok(Vec::new());
        }

        self.stagger_devices(&mut roster)?;

        info!(
            worker = self.ctx.worker_id,
            devices = roster.len(),
            "Devices prepared for farming"
        );
        Ok(roster.into_iter().map(|d| d.device_id).collect())
    }

    async fn prepare_account_devices(&self, account: &Account) -> Result<Vec<Device>> {
        let cfg = &self.ctx.config.devices;
        let wanted = rand::thread_rng()
            .gen_range(cfg.per_account_min..=cfg.per_account_max.max(cfg.per_account_min));

        let existing = self.ctx.store.devices_for_account(&account.email, wanted)?;
        let shortfall = (wanted as usize).saturating_sub(existing.len());

        if shortfall > 0 {
            let mut proxies = Vec::with_capacity(shortfall);
            for _ in 0..shortfall {
                match self.ctx.pool.acquire().await {
                    Some(proxy) => proxies.push(proxy),
                    None => break,
                }
            }

            if proxies.len() < shortfall {
                warn!(
                    worker = self.ctx.worker_id,
                    account = %account.email,
                    available = proxies.len(),
                    wanted = shortfall,
                    "Not enough proxies, creating devices with what is available"
                );
            }

            for proxy in proxies {
                let device = self.new_device(account, proxy);
                self.ctx.store.upsert_device(&device)?;
            }
        }

        self.ctx.store.devices_for_account(&account.email, wanted)
    }

    fn new_device(&self, account: &Account, proxy: String) -> Device {
        let mut rng = rand::thread_rng();
        let user_agent = DESKTOP_USER_AGENTS[rng.gen_range(0..DESKTOP_USER_AGENTS.len())];
        let (model, cores, os) = CPU_FINGERPRINTS[rng.gen_range(0..CPU_FINGERPRINTS.len())];

        Device {
            device_id: derive_device_id(&proxy),
            account_email: account.email.clone(),
            user_agent: user_agent.to_string(),
            cpu_architecture: CPU_ARCHITECTURE.to_string(),
            cpu_model: model.to_string(),
            cpu_processor_count: cores,
            device_os: os.to_string(),
            active_proxy: Some(proxy),
            next_ping_at: None,
            next_task_request_at: None,
        }
    }

    /// Spread initial eligibility with a random per-device delay so a cold
    /// start does not hit the service all at once.
    fn stagger_devices(&self, devices: &mut [Device]) -> Result<()> {
        let cfg = &self.ctx.config.devices;
        if cfg.initial_delay_max_secs == 0 {
            return Ok(());
        }

        for device in devices.iter_mut() {
            let delay = rand::thread_rng()
                .gen_range(cfg.initial_delay_min_secs..=cfg.initial_delay_max_secs);
            let at = mark_after(chrono::Duration::seconds(delay as i64));
            device.next_ping_at = Some(at);
            device.next_task_request_at = Some(at);
        }

        for chunk in devices.chunks(MARK_BATCH) {
            self.ctx.store.bulk_update_marks(chunk)?;
        }
        Ok(())
    }

    /// Devices whose marks have elapsed, capped at the batch limit.
    fn ready_devices(&self, roster: &[String], limit: usize) -> Result<Vec<Device>> {
        let now = Utc::now();
        let mut ready = Vec::new();

        for device_id in roster {
            if let Some(device) = self.ctx.store.get_device(device_id)? {
                if device.is_ready(now) {
                    ready.push(device);
                }
            }
            if ready.len() >= limit {
                break;
            }
        }
        Ok(ready)
    }

    /// Mark a device in flight and spawn its bounded, timeboxed unit.
    ///
    /// The id enters the in-flight set before the task is spawned and leaves
    /// it on every completion path, timeouts included.
    fn launch_unit(
        &self,
        device: Device,
        semaphore: Arc<Semaphore>,
        unit_timeout: Duration,
    ) -> tokio::task::JoinHandle<()> {
        self.in_flight
            .lock()
            .unwrap()
            .insert(device.device_id.clone());

        let ctx = Arc::clone(&self.ctx);
        let in_flight = Arc::clone(&self.in_flight);

        tokio::spawn(async move {
            if let Ok(_permit) = semaphore.acquire().await {
                let unit = runner::run_unit(&ctx, &device);
                if tokio::time::timeout(unit_timeout, unit).await.is_err() {
                    error!(
                        worker = ctx.worker_id,
                        device = %device.device_id,
                        account = %device.account_email,
                        timeout_secs = unit_timeout.as_secs(),
                        "Farm unit timed out"
                    );
                }
            }
            // The unit must never wedge its device
            in_flight.lock().unwrap().remove(&device.device_id);
        })
    }

    /// Run the scheduling loop until shutdown.
    pub async fn run(&self, shutdown: ShutdownSignal) -> Result<()> {
        let accounts = self.prepare_accounts()?;
        if accounts.is_empty() {
            warn!(
                worker = self.ctx.worker_id,
                "No accounts prepared, most likely none are logged in"
            );
            return Ok(());
        }

        let roster = self.prepare_devices(&accounts).await?;
        if roster.is_empty() {
            return Ok(());
        }

        let farm_cfg = &self.ctx.config.farm;
        let semaphore = Arc::new(Semaphore::new(farm_cfg.max_concurrent_tasks));
        let unit_timeout = self.ctx.config.device_task_timeout();

        info!(worker = self.ctx.worker_id, "Farming loop started");

        loop {
            if shutdown.is_triggered() {
                info!(worker = self.ctx.worker_id, "Farming loop stopping");
                break;
            }

            let ready = self.ready_devices(&roster, farm_cfg.max_devices_per_batch)?;
            let ready: Vec<Device> = {
                let guard = self.in_flight.lock().unwrap();
                ready
                    .into_iter()
                    .filter(|d| !guard.contains(&d.device_id))
                    .collect()
            };

            if ready.is_empty() {
                tokio::time::sleep(IDLE_INTERVAL).await;
                continue;
            }

            for device in ready {
                self.launch_unit(device, Arc::clone(&semaphore), unit_timeout);
            }

            tokio::time::sleep(IDLE_INTERVAL).await;
        }

        Ok(())
    }
}
