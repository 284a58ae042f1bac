//! Farm orchestration: dispatcher, per-worker scheduler, device units

pub mod dispatcher;
pub mod processor;
pub mod runner;

use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::proxy::ProxyPool;
use crate::store::Store;

pub use dispatcher::{partition_accounts, partition_proxies, worker_count, WorkerDispatcher};
pub use processor::FarmScheduler;

/// Shared state for one worker process
pub struct FarmContext {
    pub worker_id: usize,
    pub config: Config,
    pub store: Arc<Store>,
    pub pool: Arc<ProxyPool>,
}

/// Parse an account list: one email per line, `email:password` tolerated,
/// `#` comments and blank lines skipped.
pub fn parse_account_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.split(':').next().unwrap_or(line).trim().to_string())
        .filter(|email| !email.is_empty())
        .collect()
}

/// Load account emails from a file.
pub async fn load_account_file(path: &Path) -> Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(parse_account_list(&content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_account_list() {
        let content = "\
# farming accounts
alice@example.com
bob@example.com:secretpass

charlie@example.com
";
        let accounts = parse_account_list(content);
        assert_eq!(
            accounts,
            vec![
                "alice@example.com".to_string(),
                "bob@example.com".to_string(),
                "charlie@example.com".to_string(),
            ]
        );
    }
}
