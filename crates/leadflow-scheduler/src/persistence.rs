//! SQLite-backed persistence for leads, flows and calendar connections.
//! Every trait write is a single UPDATE statement, so status, current node
//! and error land together or not at all.

use async_trait::async_trait;
use leadflow_core::traits::{FlowGraphStore, LeadStateStore, UserStore};
use leadflow_core::{
    CalendarConnection, ErrorRecord, Flow, Lead, LeadStatus, LeadUpdate, LeadflowError, Node,
    OAuthTokens, Result, Route, Verification,
};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// SQLite document store implementing the lead, flow and user stores.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> LeadflowError {
    LeadflowError::infra(format!("sqlite: {e}"))
}

impl SqliteStore {
    /// Open or create the store database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                owner TEXT,
                lead_data TEXT NOT NULL DEFAULT '{}',   -- JSON
                status INTEGER NOT NULL DEFAULT 1,       -- 0 failed, 1 new, 2 running, 3 advancing, 9 finished
                current_node TEXT,
                error TEXT,                              -- JSON error record
                verification TEXT,                       -- JSON verification result
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS flows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                owner TEXT,
                nodes TEXT NOT NULL DEFAULT '[]',        -- JSON array of {id, settings}
                routes TEXT NOT NULL DEFAULT '[]'        -- JSON array of {source, target}
            );

            CREATE TABLE IF NOT EXISTS calendar_connections (
                id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                email TEXT,
                tokens TEXT NOT NULL,                    -- JSON OAuth tokens
                PRIMARY KEY (user_id, id)
            );
         ",
            )
            .map_err(db_err)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| LeadflowError::infra(format!("store lock poisoned: {e}")))
    }

    // ─── Administrative writes ──────────────────────────────

    /// Insert or replace a lead document.
    pub fn save_lead(&self, lead: &Lead) -> Result<()> {
        let error = lead.error.as_ref().map(serde_json::to_string).transpose()?;
        let verification = lead
            .verification
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO leads
                 (id, name, owner, lead_data, status, current_node, error, verification, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    lead.id,
                    lead.name,
                    lead.owner,
                    lead.lead_data.to_string(),
                    lead.status.code(),
                    lead.current_node,
                    error,
                    verification,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Insert or replace a flow graph.
    pub fn save_flow(&self, flow: &Flow) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO flows (id, name, owner, nodes, routes)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    flow.id,
                    flow.name,
                    flow.owner,
                    serde_json::to_string(&flow.nodes)?,
                    serde_json::to_string(&flow.routes)?,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Insert or replace a calendar connection.
    pub fn save_connection(&self, conn: &CalendarConnection) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO calendar_connections (id, user_id, email, tokens)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    conn.id,
                    conn.user_id,
                    conn.email,
                    serde_json::to_string(&conn.tokens)?,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// One UPDATE, optionally guarded on the current node. `Ok(false)` when
    /// the guard did not match an existing lead.
    fn apply_update(
        &self,
        lead_id: &str,
        node_id: Option<&str>,
        update: &LeadUpdate,
    ) -> Result<bool> {
        let error = update.error.as_ref().map(serde_json::to_string).transpose()?;
        let verification = update
            .verification
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.lock()?;
        // NULL parameters leave the column untouched.
        let changed = conn
            .execute(
                "UPDATE leads SET
                    status = COALESCE(?1, status),
                    current_node = COALESCE(?2, current_node),
                    error = COALESCE(?3, error),
                    verification = COALESCE(?4, verification),
                    updated_at = ?5
                 WHERE id = ?6 AND (?7 IS NULL OR current_node = ?7)",
                rusqlite::params![
                    update.status.map(LeadStatus::code),
                    update.current_node,
                    error,
                    verification,
                    chrono::Utc::now().to_rfc3339(),
                    lead_id,
                    node_id,
                ],
            )
            .map_err(db_err)?;
        if changed > 0 {
            return Ok(true);
        }

        let exists = conn
            .query_row("SELECT 1 FROM leads WHERE id = ?1", [lead_id], |_| Ok(()))
            .optional()
            .map_err(db_err)?
            .is_some();
        if !exists {
            return Err(LeadflowError::not_found(format!("Lead {lead_id}")));
        }
        Ok(false)
    }

    fn load_flow(&self, flow_id: &str) -> Result<Flow> {
        let row = self
            .lock()?
            .query_row(
                "SELECT id, name, owner, nodes, routes FROM flows WHERE id = ?1",
                [flow_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let (id, name, owner, nodes, routes) =
            row.ok_or_else(|| LeadflowError::not_found(format!("Flow {flow_id}")))?;
        Ok(Flow {
            id,
            name,
            owner,
            nodes: serde_json::from_str::<Vec<Node>>(&nodes)?,
            routes: serde_json::from_str::<Vec<Route>>(&routes)?,
        })
    }
}

#[async_trait]
impl FlowGraphStore for SqliteStore {
    async fn get_node(&self, flow_id: &str, node_id: &str) -> Result<Node> {
        let flow = self.load_flow(flow_id)?;
        flow.node(node_id)
            .cloned()
            .ok_or_else(|| LeadflowError::not_found(format!("Node {node_id} in flow {flow_id}")))
    }

    async fn get_routes(&self, flow_id: &str) -> Result<Vec<Route>> {
        Ok(self.load_flow(flow_id)?.routes)
    }
}

#[async_trait]
impl LeadStateStore for SqliteStore {
    async fn get_lead(&self, lead_id: &str) -> Result<Lead> {
        let row = self
            .lock()?
            .query_row(
                "SELECT id, name, owner, lead_data, status, current_node, error, verification
                 FROM leads WHERE id = ?1",
                [lead_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, u8>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let (id, name, owner, data, status, current_node, error, verification) =
            row.ok_or_else(|| LeadflowError::not_found(format!("Lead {lead_id}")))?;
        Ok(Lead {
            id,
            name,
            owner,
            lead_data: serde_json::from_str(&data)?,
            status: LeadStatus::from_code(status).ok_or_else(|| {
                LeadflowError::infra(format!("lead {lead_id} has unknown status {status}"))
            })?,
            current_node,
            error: error
                .map(|e| serde_json::from_str::<ErrorRecord>(&e))
                .transpose()?,
            verification: verification
                .map(|v| serde_json::from_str::<Verification>(&v))
                .transpose()?,
        })
    }

    async fn update_status_and_node(
        &self,
        lead_id: &str,
        status: LeadStatus,
        node_id: &str,
    ) -> Result<()> {
        let changed = self
            .lock()?
            .execute(
                "UPDATE leads SET status = ?1, current_node = ?2, updated_at = ?3 WHERE id = ?4",
                rusqlite::params![status.code(), node_id, chrono::Utc::now().to_rfc3339(), lead_id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(LeadflowError::not_found(format!("Lead {lead_id}")));
        }
        Ok(())
    }

    async fn update_lead(&self, lead_id: &str, update: LeadUpdate) -> Result<()> {
        self.apply_update(lead_id, None, &update)?;
        Ok(())
    }

    async fn update_lead_on_node(
        &self,
        lead_id: &str,
        node_id: &str,
        update: LeadUpdate,
    ) -> Result<bool> {
        self.apply_update(lead_id, Some(node_id), &update)
    }
}

#[async_trait]
impl UserStore for SqliteStore {
    async fn get_calendar_connection(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<CalendarConnection> {
        let row = self
            .lock()?
            .query_row(
                "SELECT id, user_id, email, tokens FROM calendar_connections
                 WHERE user_id = ?1 AND id = ?2",
                [user_id, connection_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let (id, user_id, email, tokens) = row.ok_or_else(|| {
            LeadflowError::not_found(format!("Calendar connection {connection_id} of user {user_id}"))
        })?;
        Ok(CalendarConnection {
            id,
            user_id,
            email,
            tokens: serde_json::from_str::<OAuthTokens>(&tokens)?,
        })
    }

    async fn update_tokens(
        &self,
        user_id: &str,
        connection_id: &str,
        tokens: &OAuthTokens,
    ) -> Result<()> {
        let changed = self
            .lock()?
            .execute(
                "UPDATE calendar_connections SET tokens = ?1 WHERE user_id = ?2 AND id = ?3",
                rusqlite::params![serde_json::to_string(tokens)?, user_id, connection_id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(LeadflowError::not_found(format!(
                "Calendar connection {connection_id} of user {user_id}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn store_with_lead() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .save_lead(&Lead::new("l1", "Acme", serde_json::json!({"email": "a@acme.test"})))
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_open_file_and_migrate() {
        let dir = std::env::temp_dir().join("leadflow-store-test");
        let path = dir.join("store.db");
        let store = SqliteStore::open(&path).unwrap();
        assert!(matches!(
            store.get_lead("missing").await,
            Err(LeadflowError::NotFound(_))
        ));
        drop(store);
        // Reopening runs the migration again without error.
        SqliteStore::open(&path).unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_status_and_node_update() {
        let store = store_with_lead();
        store
            .update_status_and_node("l1", LeadStatus::Running, "aiCall_1")
            .await
            .unwrap();
        let lead = store.get_lead("l1").await.unwrap();
        assert_eq!(lead.status, LeadStatus::Running);
        assert_eq!(lead.current_node.as_deref(), Some("aiCall_1"));
        assert_eq!(lead.email(), Some("a@acme.test"));
    }

    #[tokio::test]
    async fn test_update_missing_lead_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .update_status_and_node("ghost", LeadStatus::Running, "aiCall_1")
            .await
            .unwrap_err();
        assert!(matches!(err, LeadflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_partial_update_keeps_other_fields() {
        let store = store_with_lead();
        store
            .update_status_and_node("l1", LeadStatus::Running, "preVerify_1")
            .await
            .unwrap();
        let verification = Verification {
            passed: false,
            reason: Some("adult content".into()),
            checked_at: Utc::now(),
        };
        store
            .update_lead("l1", LeadUpdate::verification(verification.clone()))
            .await
            .unwrap();

        let lead = store.get_lead("l1").await.unwrap();
        assert_eq!(lead.status, LeadStatus::Running);
        assert_eq!(lead.current_node.as_deref(), Some("preVerify_1"));
        assert_eq!(lead.verification, Some(verification));

        let record = ErrorRecord {
            status: false,
            message: "Task preVerify failed".into(),
            task_id: "m1".into(),
            stack_trace: "trace".into(),
        };
        store
            .update_lead("l1", LeadUpdate::failed(record.clone()))
            .await
            .unwrap();
        let lead = store.get_lead("l1").await.unwrap();
        assert_eq!(lead.status, LeadStatus::Failed);
        assert_eq!(lead.error, Some(record));
        assert_eq!(lead.current_node.as_deref(), Some("preVerify_1"));
    }

    #[tokio::test]
    async fn test_node_guarded_update() {
        let store = store_with_lead();
        store
            .update_status_and_node("l1", LeadStatus::Running, "aiCall_3")
            .await
            .unwrap();

        let applied = store
            .update_lead_on_node("l1", "sendWebhook_2", LeadUpdate::status(LeadStatus::Finished))
            .await
            .unwrap();
        assert!(!applied);
        let lead = store.get_lead("l1").await.unwrap();
        assert_eq!(lead.status, LeadStatus::Running);
        assert_eq!(lead.current_node.as_deref(), Some("aiCall_3"));

        let applied = store
            .update_lead_on_node("l1", "aiCall_3", LeadUpdate::status(LeadStatus::Finished))
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(store.get_lead("l1").await.unwrap().status, LeadStatus::Finished);

        let err = store
            .update_lead_on_node("ghost", "aiCall_3", LeadUpdate::status(LeadStatus::Finished))
            .await
            .unwrap_err();
        assert!(matches!(err, LeadflowError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_flow_lookup() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .save_flow(&Flow {
                id: "f1".into(),
                name: "demo".into(),
                owner: None,
                nodes: vec![Node {
                    id: "sendWebhook_1".into(),
                    settings: serde_json::json!({"webhookUrl": "https://hooks.test"}),
                }],
                routes: vec![Route::new("start", "sendWebhook_1")],
            })
            .unwrap();

        let node = store.get_node("f1", "sendWebhook_1").await.unwrap();
        assert_eq!(node.settings["webhookUrl"], "https://hooks.test");
        assert_eq!(store.get_routes("f1").await.unwrap().len(), 1);
        assert!(matches!(
            store.get_node("f1", "aiCall_9").await,
            Err(LeadflowError::NotFound(_))
        ));
        assert!(matches!(
            store.get_routes("nope").await,
            Err(LeadflowError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_token_rotation_write() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .save_connection(&CalendarConnection {
                id: "c1".into(),
                user_id: "u1".into(),
                email: Some("owner@acme.test".into()),
                tokens: OAuthTokens {
                    access_token: "old".into(),
                    refresh_token: Some("r1".into()),
                    expiry: None,
                },
            })
            .unwrap();

        let rotated = OAuthTokens {
            access_token: "new".into(),
            refresh_token: Some("r1".into()),
            expiry: Some(Utc::now()),
        };
        store.update_tokens("u1", "c1", &rotated).await.unwrap();
        let conn = store.get_calendar_connection("u1", "c1").await.unwrap();
        assert_eq!(conn.tokens.access_token, "new");
        assert!(store.update_tokens("u2", "c1", &rotated).await.is_err());
    }
}
