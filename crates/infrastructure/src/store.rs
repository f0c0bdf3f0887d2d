//! SQLite state store
//!
//! Durable implementation of the [`StateStore`] port over `sqlx`. One file,
//! two tables, WAL journal for crash safety, a single pooled connection so
//! the single-writer contract holds at the engine level too. Conditional
//! writes are plain `UPDATE ... WHERE` statements whose affected-row count
//! decides between success and a conflict error.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use proxmox_ca_domain::state_store::{StateStore, StoreError, VmRecord};
use proxmox_ca_shared::{VmState, Vmid};

#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Open (or create) the store file. The parent directory is created on
    /// demand.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::backend(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        Self::connect(options).await
    }

    /// Volatile store for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::backend(e.to_string()))?;
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        // One connection: the store is single-writer by contract, and a
        // second connection to an in-memory database would see a different
        // database entirely.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(backend)?;
        Ok(Self { pool })
    }

    fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<VmRecord, StoreError> {
        let state_raw: String = row.try_get("state").map_err(backend)?;
        let state = VmState::from_str(&state_raw)
            .map_err(|e| StoreError::backend(format!("corrupt row: {e}")))?;
        Ok(VmRecord {
            vmid: Vmid(row.try_get::<i64, _>("vmid").map_err(backend)? as u32),
            group_id: row.try_get("group_id").map_err(backend)?,
            hostname: row.try_get("hostname").map_err(backend)?,
            state,
            created_at: row.try_get("created_at").map_err(backend)?,
            last_transition_at: row.try_get("last_transition_at").map_err(backend)?,
            last_error: row.try_get("last_error").map_err(backend)?,
        })
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::backend(err.to_string())
}

fn now() -> i64 {
    Utc::now().timestamp()
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vms (
                vmid               INTEGER PRIMARY KEY,
                group_id           TEXT NOT NULL,
                hostname           TEXT NOT NULL,
                state              TEXT NOT NULL,
                created_at         INTEGER NOT NULL,
                last_transition_at INTEGER NOT NULL,
                last_error         TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_vms_group ON vms(group_id)")
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS group_desired (
                group_id   TEXT PRIMARY KEY,
                desired    INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn insert_vm(&self, record: &VmRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO vms (vmid, group_id, hostname, state, created_at, last_transition_at, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.vmid.0 as i64)
        .bind(&record.group_id)
        .bind(&record.hostname)
        .bind(record.state.as_str())
        .bind(record.created_at)
        .bind(record.last_transition_at)
        .bind(&record.last_error)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::AlreadyExists { vmid: record.vmid })
            }
            Err(err) => Err(backend(err)),
        }
    }

    async fn get_vm(&self, vmid: Vmid) -> Result<Option<VmRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM vms WHERE vmid = ?")
            .bind(vmid.0 as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn list_vms(&self, group_id: &str) -> Result<Vec<VmRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM vms WHERE group_id = ? ORDER BY vmid")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(Self::record_from_row).collect()
    }

    async fn list_all_vms(&self) -> Result<Vec<VmRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM vms ORDER BY vmid")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(Self::record_from_row).collect()
    }

    async fn transition_vm(
        &self,
        vmid: Vmid,
        from: VmState,
        to: VmState,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE vms SET state = ?, last_transition_at = ?, last_error = ? WHERE vmid = ? AND state = ?",
        )
        .bind(to.as_str())
        .bind(now())
        .bind(last_error)
        .bind(vmid.0 as i64)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            let actual = self.get_vm(vmid).await?.map(|r| r.state);
            return Err(StoreError::StaleState {
                vmid,
                expected: from,
                actual,
            });
        }
        Ok(())
    }

    async fn remove_vm(&self, vmid: Vmid, from: VmState) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM vms WHERE vmid = ? AND state = ?")
            .bind(vmid.0 as i64)
            .bind(from.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            let actual = self.get_vm(vmid).await?.map(|r| r.state);
            return Err(StoreError::StaleState {
                vmid,
                expected: from,
                actual,
            });
        }
        Ok(())
    }

    async fn set_last_error(&self, vmid: Vmid, message: Option<&str>) -> Result<(), StoreError> {
        sqlx::query("UPDATE vms SET last_error = ? WHERE vmid = ?")
            .bind(message)
            .bind(vmid.0 as i64)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn count_live(&self, group_id: &str) -> Result<u32, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM vms WHERE group_id = ? AND state IN ('pending', 'active')",
        )
        .bind(group_id)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok(count as u32)
    }

    async fn get_desired(&self, group_id: &str) -> Result<Option<u32>, StoreError> {
        let desired: Option<i64> =
            sqlx::query_scalar("SELECT desired FROM group_desired WHERE group_id = ?")
                .bind(group_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        Ok(desired.map(|d| d as u32))
    }

    async fn init_desired(&self, group_id: &str, default: u32) -> Result<u32, StoreError> {
        sqlx::query(
            "INSERT INTO group_desired (group_id, desired, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(group_id) DO NOTHING",
        )
        .bind(group_id)
        .bind(default as i64)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        self.get_desired(group_id).await.map(|d| d.unwrap_or(default))
    }

    async fn cas_desired(
        &self,
        group_id: &str,
        expected: u32,
        new: u32,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE group_desired SET desired = ?, updated_at = ? WHERE group_id = ? AND desired = ?",
        )
        .bind(new as i64)
        .bind(now())
        .bind(group_id)
        .bind(expected as i64)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ConcurrentUpdate {
                group_id: group_id.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStateStore {
        let store = SqliteStateStore::in_memory().await.unwrap();
        store.init().await.unwrap();
        store
    }

    fn record(vmid: u32, state: VmState) -> VmRecord {
        VmRecord {
            vmid: Vmid(vmid),
            group_id: "web".into(),
            hostname: format!("ca-web-{vmid}"),
            state,
            created_at: 1_700_000_000,
            last_transition_at: 1_700_000_000,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn insert_and_list() {
        let store = store().await;
        store.insert_vm(&record(101, VmState::Pending)).await.unwrap();
        store.insert_vm(&record(102, VmState::Active)).await.unwrap();

        let rows = store.list_vms("web").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].vmid, Vmid(101));
        assert_eq!(rows[0].state, VmState::Pending);
        assert_eq!(rows[1].hostname, "ca-web-102");
        assert_eq!(store.count_live("web").await.unwrap(), 2);
        assert!(store.list_vms("db").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_vmid_is_rejected() {
        let store = store().await;
        store.insert_vm(&record(101, VmState::Pending)).await.unwrap();
        let err = store.insert_vm(&record(101, VmState::Active)).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { vmid } if vmid == Vmid(101)));
    }

    #[tokio::test]
    async fn transition_is_conditional() {
        let store = store().await;
        store.insert_vm(&record(101, VmState::Pending)).await.unwrap();

        store
            .transition_vm(Vmid(101), VmState::Pending, VmState::Active, None)
            .await
            .unwrap();
        assert_eq!(
            store.get_vm(Vmid(101)).await.unwrap().unwrap().state,
            VmState::Active
        );

        let err = store
            .transition_vm(Vmid(101), VmState::Pending, VmState::Failed, None)
            .await
            .unwrap_err();
        match err {
            StoreError::StaleState {
                expected, actual, ..
            } => {
                assert_eq!(expected, VmState::Pending);
                assert_eq!(actual, Some(VmState::Active));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn remove_is_conditional() {
        let store = store().await;
        store
            .insert_vm(&record(101, VmState::DeletingNode))
            .await
            .unwrap();

        assert!(store.remove_vm(Vmid(101), VmState::DeletingVm).await.is_err());
        store.remove_vm(Vmid(101), VmState::DeletingNode).await.unwrap();
        assert!(store.get_vm(Vmid(101)).await.unwrap().is_none());
        assert!(store.remove_vm(Vmid(101), VmState::DeletingNode).await.is_err());
    }

    #[tokio::test]
    async fn desired_size_cas() {
        let store = store().await;
        assert_eq!(store.get_desired("web").await.unwrap(), None);
        assert_eq!(store.init_desired("web", 1).await.unwrap(), 1);
        // Second init keeps the stored value.
        assert_eq!(store.init_desired("web", 5).await.unwrap(), 1);

        store.cas_desired("web", 1, 3).await.unwrap();
        assert_eq!(store.get_desired("web").await.unwrap(), Some(3));

        let err = store.cas_desired("web", 1, 4).await.unwrap_err();
        assert!(matches!(err, StoreError::ConcurrentUpdate { .. }));
        assert_eq!(store.get_desired("web").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        {
            let store = SqliteStateStore::new(&path).await.unwrap();
            store.init().await.unwrap();
            store.insert_vm(&record(101, VmState::Active)).await.unwrap();
            store.init_desired("web", 2).await.unwrap();
        }

        let store = SqliteStateStore::new(&path).await.unwrap();
        store.init().await.unwrap();
        assert_eq!(
            store.get_vm(Vmid(101)).await.unwrap().unwrap().state,
            VmState::Active
        );
        assert_eq!(store.get_desired("web").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn last_error_is_recorded() {
        let store = store().await;
        store.insert_vm(&record(101, VmState::Pending)).await.unwrap();
        store
            .set_last_error(Vmid(101), Some("import failed"))
            .await
            .unwrap();
        assert_eq!(
            store.get_vm(Vmid(101)).await.unwrap().unwrap().last_error,
            Some("import failed".to_string())
        );
        store.set_last_error(Vmid(101), None).await.unwrap();
        assert_eq!(store.get_vm(Vmid(101)).await.unwrap().unwrap().last_error, None);
    }
}
