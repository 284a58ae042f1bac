//! Per-device farm unit
//!
//! A unit runs one device through its eligible actions: a ping when the ping
//! mark has elapsed, then a task request when the task mark has elapsed.
//! Each action re-checks its own mark and reschedules it after the attempt
//! regardless of outcome, so a failing device backs off like a healthy one.
//!
//! The attempt loop rotates the proxy on transport-shaped failures and gives
//! up for the cycle on recognized business errors or exhausted attempts.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::api::TaskServiceClient;
use crate::error::{Error, Result};
use crate::farm::FarmContext;
use crate::models::{mark_after, mark_elapsed, Account, Device, ProxyHolder};
use crate::rules::TaskRun;
use crate::utils::retry::{RetryDecision, RetryPolicy};

fn ping_cooldown() -> chrono::Duration {
    chrono::Duration::minutes(2)
}

fn task_cooldown() -> chrono::Duration {
    chrono::Duration::minutes(1)
}

/// Farm actions a device performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FarmAction {
    Ping,
    RequestTask,
}

/// Run one scheduling unit for a device.
///
/// Never returns an error: every failure mode ends the unit for this cycle
/// and leaves the device eligible again once its marks elapse.
pub async fn run_unit(ctx: &FarmContext, device: &Device) {
    let account = match ctx.store.get_account(&device.account_email) {
        Ok(Some(account)) => account,
        Ok(None) => {
            warn!(
                worker = ctx.worker_id,
                device = %device.device_id,
                account = %device.account_email,
                "Account missing for device, skipping"
            );
            return;
        }
        Err(e) => {
            error!(worker = ctx.worker_id, device = %device.device_id, error = %e, "Account lookup failed");
            return;
        }
    };

    // Eligibility is evaluated per action, against the current store state
    let now = Utc::now();
    let ping_eligible = mark_elapsed(device.next_ping_at, now);
    let task_eligible = mark_elapsed(device.next_task_request_at, now);

    if !ping_eligible && !task_eligible {
        return;
    }

    if ping_eligible {
        farm_action(ctx, device, &account, FarmAction::Ping).await;
        if let Err(e) = ctx
            .store
            .set_next_ping(&device.device_id, mark_after(ping_cooldown()))
        {
            error!(worker = ctx.worker_id, device = %device.device_id, error = %e, "Failed to persist ping mark");
        }
    }

    if task_eligible {
        farm_action(ctx, device, &account, FarmAction::RequestTask).await;
        if let Err(e) = ctx
            .store
            .set_next_task_request(&device.device_id, mark_after(task_cooldown()))
        {
            error!(worker = ctx.worker_id, device = %device.device_id, error = %e, "Failed to persist task mark");
        }
    }
}

/// Attempt one action with retry and proxy rotation.
async fn farm_action(ctx: &FarmContext, device: &Device, account: &Account, action: FarmAction) {
    let policy = RetryPolicy::from_config(&ctx.config.retry);
    let mut current_proxy: Option<String> = None;
    let mut attempt: u32 = 1;

    loop {
        let proxy = match resolve_proxy(ctx, device, account, current_proxy.take()).await {
            Ok(proxy) => proxy,
            Err(e) => {
                warn!(
                    worker = ctx.worker_id,
                    device = %device.device_id,
                    account = %account.email,
                    error = %e,
                    "No proxy available, skipping until next cycle"
                );
                return;
            }
        };

        let result = attempt_action(ctx, device, account, &proxy, action).await;

        match result {
            Ok(()) => {
                debug!(
                    worker = ctx.worker_id,
                    device = %device.device_id,
                    account = %account.email,
                    ?action,
                    attempt,
                    "Farm action completed"
                );
                return;
            }
            Err(e) => match policy.decide(attempt, &e) {
                RetryDecision::GiveUp => {
                    error!(
                        worker = ctx.worker_id,
                        device = %device.device_id,
                        account = %account.email,
                        ?action,
                        attempt,
                        error = %e,
                        "Farm action failed, skipped until next cycle"
                    );
                    return;
                }
                RetryDecision::RotateAndRetry => {
                    warn!(
                        worker = ctx.worker_id,
                        device = %device.device_id,
                        account = %account.email,
                        attempt,
                        error = %e,
                        "Rotating proxy and retrying"
                    );
                    match rotate_proxy(ctx, device, account, &proxy).await {
                        Ok(new_proxy) => current_proxy = Some(new_proxy),
                        Err(rot_err) => {
                            warn!(
                                worker = ctx.worker_id,
                                account = %account.email,
                                error = %rot_err,
                                "Proxy rotation failed, skipping until next cycle"
                            );
                            return;
                        }
                    }
                    policy.wait(attempt).await;
                    attempt += 1;
                }
                RetryDecision::Retry => {
                    warn!(
                        worker = ctx.worker_id,
                        device = %device.device_id,
                        account = %account.email,
                        attempt,
                        error = %e,
                        "Retrying with same proxy"
                    );
                    policy.wait(attempt).await;
                    attempt += 1;
                }
            },
        }
    }
}

async fn attempt_action(
    ctx: &FarmContext,
    device: &Device,
    account: &Account,
    proxy: &str,
    action: FarmAction,
) -> Result<()> {
    // One client per attempt so the proxy applies to every connection
    let client = TaskServiceClient::new(
        &ctx.config.api.base_url,
        Some(proxy),
        account.auth_token.clone(),
        ctx.config.request_timeout(),
    )?;

    match action {
        FarmAction::Ping => {
            info!(worker = ctx.worker_id, device = %device.device_id, account = %account.email, "Sending ping");
            client.send_ping(device).await
        }
        FarmAction::RequestTask => process_task(ctx, &client, device, account).await,
    }
}

/// Request a task, execute its rules, submit the result.
async fn process_task(
    ctx: &FarmContext,
    client: &TaskServiceClient,
    device: &Device,
    account: &Account,
) -> Result<()> {
    info!(worker = ctx.worker_id, device = %device.device_id, account = %account.email, "Requesting task");

    let Some(assignment) = client.request_task(device).await? else {
        info!(worker = ctx.worker_id, device = %device.device_id, "No task available");
        return Ok(());
    };

    info!(worker = ctx.worker_id, device = %device.device_id, task = %assignment.id, "Received task, processing");

    let html = match assignment.target_url() {
        Some(url) => client.fetch_page(url, assignment.fetch_timeout()).await,
        None => None,
    };

    let run = TaskRun::new(
        assignment.id.clone(),
        html,
        assignment.rule_collection.yaml_rules.clone(),
        assignment.vars.clone(),
    );
    let payload = run.build_payload();

    // Brief human-shaped pause before submission
    let pause = rand::thread_rng().gen_range(2..=5);
    tokio::time::sleep(Duration::from_secs(pause)).await;

    if TaskRun::extracted_title(&payload) {
        info!(worker = ctx.worker_id, task = %assignment.id, "Page data extracted, completing task");
    } else {
        info!(worker = ctx.worker_id, task = %assignment.id, "Page data not extracted, submitting empty result");
    }

    client.complete_task(device, &assignment.id, &payload).await?;
    info!(worker = ctx.worker_id, device = %device.device_id, task = %assignment.id, "Task completed");
    Ok(())
}

/// Resolve the effective proxy for an attempt.
///
/// A freshly rotated proxy wins; otherwise the device's own assignment, then
/// the account's (copied onto the device), then a pool acquisition persisted
/// to both. An empty pool is an error: the unit skips the cycle.
async fn resolve_proxy(
    ctx: &FarmContext,
    device: &Device,
    account: &Account,
    rotated: Option<String>,
) -> Result<String> {
    if let Some(proxy) = rotated {
        return Ok(proxy);
    }

    if let Some(proxy) = device.assigned_proxy() {
        return Ok(proxy.to_string());
    }

    if let Some(proxy) = account.assigned_proxy() {
        ctx.store.update_device_proxy(&device.device_id, proxy)?;
        return Ok(proxy.to_string());
    }

    let proxy = ctx
        .pool
        .acquire()
        .await
        .ok_or_else(|| Error::other("No proxies available"))?;

    ctx.store.update_device_proxy(&device.device_id, &proxy)?;
    ctx.store.update_account_proxy(&account.email, &proxy)?;
    Ok(proxy)
}

/// Swap the unit's proxy: acquire a replacement, return the old one to the
/// pool, persist the new assignment.
async fn rotate_proxy(
    ctx: &FarmContext,
    device: &Device,
    account: &Account,
    old_proxy: &str,
) -> Result<String> {
    let new_proxy = ctx.pool.acquire().await;
    ctx.pool.release(old_proxy).await;

    let new_proxy = new_proxy.ok_or_else(|| Error::other("No proxies available for rotation"))?;

    ctx.store.update_device_proxy(&device.device_id, &new_proxy)?;
    ctx.store.update_account_proxy(&account.email, &new_proxy)?;

    info!(worker = ctx.worker_id, account = %account.email, "Rotated proxy");
    Ok(new_proxy)
}
