//! SQLite implementation of `RequestRepository`.
//!
//! Persistent storage that survives service restarts, so pending cards stay
//! resolvable after a redeploy. A `schema_version` table tracks the schema;
//! bump `CURRENT_SCHEMA_VERSION` and extend `run_migrations` to change it.
//!
//! Synchronous rusqlite calls run under `tokio::task::spawn_blocking` so
//! they never block the async runtime.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

use super::{ClaimResult, RepositoryError, RequestRepository};
use crate::tracker::state::{MembershipRequest, MessageId, RequestState};

const CURRENT_SCHEMA_VERSION: i64 = 1;

pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (or create) the database at the given path and run migrations.
    ///
    /// The database is configured with `journal_mode = WAL` and
    /// `synchronous = FULL`; WAL must actually take effect, since some
    /// filesystems silently refuse it and that would void the durability
    /// guarantees the tracker relies on.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "failed to enable WAL mode: SQLite returned '{}' instead of 'wal'",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "database schema version {} is newer than supported version {}",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS requests (
                    card_id INTEGER PRIMARY KEY,
                    state TEXT NOT NULL,
                    request_json TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_pending
                    ON requests(state) WHERE state = 'pending';
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT INTO schema_version (id, version) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET version = ?1",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("record schema version", e.to_string()))?;

        Ok(())
    }

    /// Run a blocking closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| RepositoryError::storage(operation, e.to_string()))?;
            f(&conn).map_err(|e| RepositoryError::storage(operation, e.to_string()))
        })
        .await
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?
    }
}

fn row_to_request(json: String) -> Result<MembershipRequest, rusqlite::Error> {
    serde_json::from_str(&json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[async_trait]
impl RequestRepository for SqliteRepository {
    async fn get(&self, card: &MessageId) -> Result<Option<MembershipRequest>, RepositoryError> {
        let card_id = card.0 as i64;
        self.with_conn("get request", move |conn| {
            conn.query_row(
                "SELECT request_json FROM requests WHERE card_id = ?1",
                params![card_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(row_to_request)
            .transpose()
        })
        .await
    }

    async fn put(&self, request: MembershipRequest) -> Result<(), RepositoryError> {
        let card_id = request.card.0 as i64;
        let state = request.state.as_str();
        let created_at = request.created_at.timestamp();
        let json = serde_json::to_string(&request)
            .map_err(|e| RepositoryError::storage("serialize request", e.to_string()))?;

        self.with_conn("put request", move |conn| {
            conn.execute(
                "INSERT INTO requests (card_id, state, request_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(card_id) DO UPDATE SET
                     state = ?2, request_json = ?3, created_at = ?4",
                params![card_id, state, json, created_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(
        &self,
        card: &MessageId,
    ) -> Result<Option<MembershipRequest>, RepositoryError> {
        let card_id = card.0 as i64;
        self.with_conn("delete request", move |conn| {
            let existing = conn
                .query_row(
                    "SELECT request_json FROM requests WHERE card_id = ?1",
                    params![card_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .map(row_to_request)
                .transpose()?;

            conn.execute("DELETE FROM requests WHERE card_id = ?1", params![card_id])?;
            Ok(existing)
        })
        .await
    }

    async fn claim_decision(
        &self,
        card: &MessageId,
        next: RequestState,
    ) -> Result<ClaimResult, RepositoryError> {
        let card_id = card.0 as i64;
        self.with_conn("claim decision", move |conn| {
            let existing = conn
                .query_row(
                    "SELECT request_json FROM requests WHERE card_id = ?1",
                    params![card_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;

            let Some(json) = existing else {
                return Ok(ClaimResult::Missing);
            };
            let mut request = row_to_request(json)?;
            if request.state.is_terminal() {
                return Ok(ClaimResult::AlreadyDecided);
            }

            request.state = next;
            let updated_json = serde_json::to_string(&request).map_err(|e| {
                rusqlite::Error::ToSqlConversionFailure(Box::new(e))
            })?;

            // The WHERE clause re-checks pending so the update is a
            // compare-and-swap even if another connection raced us.
            let rows = conn.execute(
                "UPDATE requests SET state = ?2, request_json = ?3
                 WHERE card_id = ?1 AND state = 'pending'",
                params![card_id, next.as_str(), updated_json],
            )?;

            if rows == 0 {
                Ok(ClaimResult::AlreadyDecided)
            } else {
                Ok(ClaimResult::Claimed(request))
            }
        })
        .await
    }

    async fn get_pending(&self) -> Result<Vec<MembershipRequest>, RepositoryError> {
        self.with_conn("get pending requests", |conn| {
            let mut stmt =
                conn.prepare("SELECT request_json FROM requests WHERE state = 'pending'")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

            let mut pending = Vec::new();
            for row in rows {
                pending.push(row_to_request(row?)?);
            }
            Ok(pending)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::state::{
        EnrollmentPayload, RequestPayload, Requester, UserId,
    };

    fn repo() -> SqliteRepository {
        SqliteRepository::new(":memory:").unwrap()
    }

    fn request(card: u64) -> MembershipRequest {
        MembershipRequest::pending(
            MessageId(card),
            Requester::new(UserId(7), "jane"),
            RequestPayload::DirectoryEnrollment(
                EnrollmentPayload::validate("Jane", "Doe", "jane@example.com").unwrap(),
            ),
        )
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let repo = repo();
        let r = request(1);

        repo.put(r.clone()).await.unwrap();
        let loaded = repo.get(&MessageId(1)).await.unwrap();
        assert_eq!(loaded, Some(r));
    }

    #[tokio::test]
    async fn test_get_unknown_card() {
        let repo = repo();
        assert_eq!(repo.get(&MessageId(404)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_is_upsert() {
        let repo = repo();
        let mut r = request(1);
        repo.put(r.clone()).await.unwrap();

        r.requester.name = "jane#1234".to_string();
        repo.put(r.clone()).await.unwrap();

        let loaded = repo.get(&MessageId(1)).await.unwrap().unwrap();
        assert_eq!(loaded.requester.name, "jane#1234");
    }

    #[tokio::test]
    async fn test_delete_returns_removed_request() {
        let repo = repo();
        let r = request(1);
        repo.put(r.clone()).await.unwrap();

        assert_eq!(repo.delete(&MessageId(1)).await.unwrap(), Some(r));
        assert_eq!(repo.delete(&MessageId(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_claim_decision_is_single_winner() {
        let repo = repo();
        repo.put(request(1)).await.unwrap();

        let first = repo
            .claim_decision(&MessageId(1), RequestState::Approved)
            .await
            .unwrap();
        let ClaimResult::Claimed(claimed) = first else {
            panic!("first claim should win");
        };
        assert_eq!(claimed.state, RequestState::Approved);

        let second = repo
            .claim_decision(&MessageId(1), RequestState::Rejected)
            .await
            .unwrap();
        assert_eq!(second, ClaimResult::AlreadyDecided);

        // Persisted row reflects the winning decision.
        let loaded = repo.get(&MessageId(1)).await.unwrap().unwrap();
        assert_eq!(loaded.state, RequestState::Approved);
    }

    #[tokio::test]
    async fn test_claim_missing_card() {
        let repo = repo();
        let result = repo
            .claim_decision(&MessageId(99), RequestState::Approved)
            .await
            .unwrap();
        assert_eq!(result, ClaimResult::Missing);
    }

    #[tokio::test]
    async fn test_get_pending_excludes_terminal() {
        let repo = repo();
        repo.put(request(1)).await.unwrap();
        repo.put(request(2)).await.unwrap();
        repo.claim_decision(&MessageId(2), RequestState::Rejected)
            .await
            .unwrap();

        let pending = repo.get_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].card, MessageId(1));
    }
}
