//! SQLite persistence for accounts and devices
//!
//! The store is shared across worker processes through a single database
//! file in WAL mode. Safety relies on the dispatcher's static, disjoint
//! partitioning of accounts: no two processes ever write the same rows.
//!
//! Uses `Mutex` to ensure thread-safety for the SQLite connection; all
//! operations are short row-level reads and read-modify-writes.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

use crate::error::Result;
use crate::models::{Account, Device};

/// Persistent store for accounts and their devices
pub struct Store {
    conn: Mutex<Connection>,
}

fn mark_to_sql(mark: Option<DateTime<Utc>>) -> Option<String> {
    mark.map(|m| m.to_rfc3339())
}

fn mark_from_sql(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        device_id: row.get(0)?,
        account_email: row.get(1)?,
        user_agent: row.get(2)?,
        cpu_architecture: row.get(3)?,
        cpu_model: row.get(4)?,
        cpu_processor_count: row.get(5)?,
        device_os: row.get(6)?,
        active_proxy: row.get(7)?,
        next_ping_at: mark_from_sql(row.get(8)?),
        next_task_request_at: mark_from_sql(row.get(9)?),
    })
}

const DEVICE_COLUMNS: &str = "device_id, account_email, user_agent, cpu_architecture, \
     cpu_model, cpu_processor_count, device_os, active_proxy, next_ping_at, next_task_request_at";

impl Store {
    /// Open (or create) the store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .context("Failed to open SQLite database")
            .map_err(crate::error::Error::from)?;

        // WAL mode for cross-process readers/writers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;

        info!(path = %path.display(), "Store initialized");
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("Failed to create in-memory SQLite")
            .map_err(crate::error::Error::from)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS accounts (
                    email TEXT PRIMARY KEY,
                    auth_token TEXT,
                    active_proxy TEXT
                );

                CREATE TABLE IF NOT EXISTS devices (
                    device_id TEXT PRIMARY KEY,
                    account_email TEXT NOT NULL REFERENCES accounts(email),
                    user_agent TEXT NOT NULL,
                    cpu_architecture TEXT NOT NULL,
                    cpu_model TEXT NOT NULL,
                    cpu_processor_count INTEGER NOT NULL,
                    device_os TEXT NOT NULL,
                    active_proxy TEXT,
                    next_ping_at TEXT,
                    next_task_request_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_devices_account
                    ON devices(account_email);
                "#,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    /// Create an account or update its mutable fields.
    pub fn upsert_account(&self, account: &Account) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO accounts (email, auth_token, active_proxy)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(email) DO UPDATE SET
                auth_token = COALESCE(excluded.auth_token, accounts.auth_token),
                active_proxy = COALESCE(excluded.active_proxy, accounts.active_proxy)
            "#,
            params![account.email, account.auth_token, account.active_proxy],
        )?;
        Ok(())
    }

    /// Get account by email.
    pub fn get_account(&self, email: &str) -> Result<Option<Account>> {
        let conn = self.conn.lock().unwrap();
        let account = conn
            .query_row(
                "SELECT email, auth_token, active_proxy FROM accounts WHERE email = ?1",
                params![email],
                |row| {
                    Ok(Account {
                        email: row.get(0)?,
                        auth_token: row.get(1)?,
                        active_proxy: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(account)
    }

    /// Resolve account rows for one chunk of emails.
    ///
    /// Callers batch their email lists; this method is a single query.
    pub fn accounts_by_emails(&self, emails: &[String]) -> Result<Vec<Account>> {
        if emails.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().unwrap();
        let placeholders: String = emails.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query = format!(
            "SELECT email, auth_token, active_proxy FROM accounts WHERE email IN ({placeholders})"
        );

        let mut stmt = conn.prepare(&query)?;
        let sql_params: Vec<&dyn rusqlite::ToSql> =
            emails.iter().map(|e| e as &dyn rusqlite::ToSql).collect();

        let accounts = stmt
            .query_map(sql_params.as_slice(), |row| {
                Ok(Account {
                    email: row.get(0)?,
                    auth_token: row.get(1)?,
                    active_proxy: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(accounts)
    }

    /// Persist a new proxy assignment on an account.
    pub fn update_account_proxy(&self, email: &str, proxy: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE accounts SET active_proxy = ?1 WHERE email = ?2",
            params![proxy, email],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    /// Create a device or rebind an existing row with the same id.
    pub fn upsert_device(&self, device: &Device) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                r#"
                INSERT INTO devices ({DEVICE_COLUMNS})
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(device_id) DO UPDATE SET
                    account_email = excluded.account_email,
                    user_agent = excluded.user_agent,
                    cpu_architecture = excluded.cpu_architecture,
                    cpu_model = excluded.cpu_model,
                    cpu_processor_count = excluded.cpu_processor_count,
                    device_os = excluded.device_os,
                    active_proxy = excluded.active_proxy
                "#
            ),
            params![
                device.device_id,
                device.account_email,
                device.user_agent,
                device.cpu_architecture,
                device.cpu_model,
                device.cpu_processor_count,
                device.device_os,
                device.active_proxy,
                mark_to_sql(device.next_ping_at),
                mark_to_sql(device.next_task_request_at),
            ],
        )?;
        Ok(())
    }

    /// Get device by its identifier.
    pub fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        let conn = self.conn.lock().unwrap();
        let device = conn
            .query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE device_id = ?1"),
                params![device_id],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    /// Devices belonging to an account, capped at `limit`.
    pub fn devices_for_account(&self, email: &str, limit: u32) -> Result<Vec<Device>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE account_email = ?1 LIMIT ?2"
        ))?;
        let devices = stmt
            .query_map(params![email, limit], device_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(devices)
    }

    /// Persist a new proxy assignment on a device.
    pub fn update_device_proxy(&self, device_id: &str, proxy: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE devices SET active_proxy = ?1 WHERE device_id = ?2",
            params![proxy, device_id],
        )?;
        Ok(())
    }

    /// Set the ping mark independently of the task mark.
    pub fn set_next_ping(&self, device_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE devices SET next_ping_at = ?1 WHERE device_id = ?2",
            params![at.to_rfc3339(), device_id],
        )?;
        Ok(())
    }

    /// Set the task-request mark independently of the ping mark.
    pub fn set_next_task_request(&self, device_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE devices SET next_task_request_at = ?1 WHERE device_id = ?2",
            params![at.to_rfc3339(), device_id],
        )?;
        Ok(())
    }

    /// Write both schedule marks for a batch of devices in one transaction.
    ///
    /// Used at bootstrap; callers chunk the device list.
    pub fn bulk_update_marks(&self, devices: &[Device]) -> Result<()> {
        if devices.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE devices SET next_ping_at = ?1, next_task_request_at = ?2 \
                 WHERE device_id = ?3",
            )?;
            for device in devices {
                stmt.execute(params![
                    mark_to_sql(device.next_ping_at),
                    mark_to_sql(device.next_task_request_at),
                    device.device_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Total device count (diagnostics).
    pub fn device_count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM devices", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{derive_device_id, CPU_ARCHITECTURE, CPU_FINGERPRINTS, DESKTOP_USER_AGENTS};
    use chrono::Duration;

    fn sample_device(email: &str, proxy: &str) -> Device {
        Device {
            device_id: derive_device_id(proxy),
            account_email: email.to_string(),
            user_agent: DESKTOP_USER_AGENTS[0].to_string(),
            cpu_architecture: CPU_ARCHITECTURE.to_string(),
            cpu_model: CPU_FINGERPRINTS[0].0.to_string(),
            cpu_processor_count: CPU_FINGERPRINTS[0].1,
            device_os: CPU_FINGERPRINTS[0].2.to_string(),
            active_proxy: Some(proxy.to_string()),
            next_ping_at: None,
            next_task_request_at: None,
        }
    }

    fn store_with_account(email: &str) -> Store {
        let store = Store::in_memory().unwrap();
        store
            .upsert_account(&Account {
                email: email.to_string(),
                auth_token: Some("token".into()),
                active_proxy: None,
            })
            .unwrap();
        store
    }

    #[test]
    fn test_account_round_trip() {
        let store = store_with_account("user@example.com");
        let account = store.get_account("user@example.com").unwrap().unwrap();
        assert_eq!(account.auth_token.as_deref(), Some("token"));
        assert!(store.get_account("missing@example.com").unwrap().is_none());
    }

    #[test]
    fn test_accounts_by_emails_chunk() {
        let store = Store::in_memory().unwrap();
        for i in 0..5 {
            store
                .upsert_account(&Account::new(format!("u{i}@example.com")))
                .unwrap();
        }

        let wanted = vec![
            "u1@example.com".to_string(),
            "u3@example.com".to_string(),
            "u9@example.com".to_string(),
        ];
        let found = store.accounts_by_emails(&wanted).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_device_upsert_preserves_marks() {
        let store = store_with_account("user@example.com");
        let mut device = sample_device("user@example.com", "http://p:1");
        store.upsert_device(&device).unwrap();

        let at = Utc::now() + Duration::minutes(2);
        store.set_next_ping(&device.device_id, at).unwrap();

        // Re-upserting the same device id must not clobber schedule marks
        device.active_proxy = Some("http://p:2".to_string());
        store.upsert_device(&device).unwrap();

        let loaded = store.get_device(&device.device_id).unwrap().unwrap();
        assert!(loaded.next_ping_at.is_some());
        assert_eq!(loaded.active_proxy.as_deref(), Some("http://p:2"));
    }

    #[test]
    fn test_marks_independent() {
        let store = store_with_account("user@example.com");
        let device = sample_device("user@example.com", "http://p:1");
        store.upsert_device(&device).unwrap();

        let ping_at = Utc::now() + Duration::minutes(2);
        store.set_next_ping(&device.device_id, ping_at).unwrap();

        let loaded = store.get_device(&device.device_id).unwrap().unwrap();
        assert!(loaded.next_ping_at.is_some());
        assert!(loaded.next_task_request_at.is_none());
    }

    #[test]
    fn test_bulk_update_marks() {
        let store = store_with_account("user@example.com");
        let mut devices = Vec::new();
        for i in 0..3 {
            let mut device = sample_device("user@example.com", &format!("http://p:{i}"));
            store.upsert_device(&device).unwrap();
            device.next_ping_at = Some(Utc::now() + Duration::seconds(10 + i));
            device.next_task_request_at = device.next_ping_at;
            devices.push(device);
        }

        store.bulk_update_marks(&devices).unwrap();

        for device in &devices {
            let loaded = store.get_device(&device.device_id).unwrap().unwrap();
            assert!(loaded.next_ping_at.is_some());
            assert!(loaded.next_task_request_at.is_some());
        }
    }

    #[test]
    fn test_devices_for_account_limit() {
        let store = store_with_account("user@example.com");
        for i in 0..4 {
            store
                .upsert_device(&sample_device("user@example.com", &format!("http://p:{i}")))
                .unwrap();
        }
        assert_eq!(
            store.devices_for_account("user@example.com", 2).unwrap().len(),
            2
        );
        assert_eq!(store.device_count().unwrap(), 4);
    }
}
