use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use thiserror::Error;
use wag_core::{
    now_millis, AppRecord, CompletionSession, Header, Message, MessageMetadata, MessageType, Mode,
    Role, TranscriptOffset,
};

pub const WAGUI_SCHEMA_VERSION: i64 = 1;
pub const DEFAULT_MESSAGE_LIMIT: usize = 100;

const MESSAGE_COLUMNS: &str =
    "id, timestamp, mode, app, branch, context, role, type, content, metadata";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Durable store behind the wagui server: messages, apps, transcript
/// watermarks and completion-gate sessions.
pub struct WagStore {
    conn: Connection,
}

impl WagStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > WAGUI_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: WAGUI_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_wagui_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Inserts a message, replacing any existing row with the same id.
    pub fn append_message(&self, message: &Message) -> Result<(), StorageError> {
        let metadata_json = message
            .metadata
            .as_ref()
            .map(|metadata| {
                serde_json::to_string(metadata)
                    .map_err(|err| StorageError::Serialization(err.to_string()))
            })
            .transpose()?;

        self.conn.execute(
            "
            INSERT OR REPLACE INTO messages (
                id,
                timestamp,
                mode,
                app,
                branch,
                context,
                role,
                type,
                content,
                metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                message.id,
                message.timestamp,
                message.header.mode.map(|mode| mode.as_str()),
                message.header.app,
                message.header.branch,
                message.header.context,
                message.role.as_str(),
                message.r#type.as_str(),
                message.content,
                metadata_json,
            ],
        )?;

        Ok(())
    }

    /// Earliest messages first, ties broken by insertion order.
    pub fn messages(&self, limit: Option<usize>) -> Result<Vec<Message>, StorageError> {
        let limit = limit.unwrap_or(DEFAULT_MESSAGE_LIMIT);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages ORDER BY timestamp ASC, rowid ASC LIMIT ?1"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map([limit], message_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// The newest `limit` messages, returned in ascending order.
    pub fn recent_messages(&self, limit: usize) -> Result<Vec<Message>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "
            SELECT {MESSAGE_COLUMNS} FROM (
                SELECT {MESSAGE_COLUMNS}, rowid AS seq
                FROM messages
                ORDER BY timestamp DESC, rowid DESC
                LIMIT ?1
            )
            ORDER BY timestamp ASC, seq ASC
            "
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map([limit], message_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn message(&self, id: &str) -> Result<Option<Message>, StorageError> {
        let message = self
            .conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                [id],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    pub fn has_message(&self, id: &str) -> Result<bool, StorageError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM messages WHERE id = ?1 LIMIT 1",
                [id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn message_count(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?)
    }

    /// Removes every message. Returns the number of deleted rows.
    pub fn clear_messages(&self) -> Result<usize, StorageError> {
        Ok(self.conn.execute("DELETE FROM messages", [])?)
    }

    pub fn upsert_app(&self, app: &AppRecord) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO apps (name, app_root, repo_root, last_used)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(name) DO UPDATE SET
                app_root=excluded.app_root,
                repo_root=excluded.repo_root,
                last_used=excluded.last_used
            ",
            params![app.name, app.app_root, app.repo_root, app.last_used],
        )?;
        Ok(())
    }

    /// Most recently used first.
    pub fn apps(&self) -> Result<Vec<AppRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT name, app_root, repo_root, last_used
            FROM apps
            ORDER BY last_used DESC, rowid DESC
            ",
        )?;
        let rows = stmt.query_map([], app_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn app(&self, name: &str) -> Result<Option<AppRecord>, StorageError> {
        let app = self
            .conn
            .query_row(
                "SELECT name, app_root, repo_root, last_used FROM apps WHERE name = ?1",
                [name],
                app_from_row,
            )
            .optional()?;
        Ok(app)
    }

    pub fn transcript_offset(&self, app: &str) -> Result<Option<TranscriptOffset>, StorageError> {
        let offset = self
            .conn
            .query_row(
                "
                SELECT app, file_path, byte_offset, updated_at
                FROM transcript_offsets
                WHERE app = ?1
                ",
                [app],
                |row| {
                    Ok(TranscriptOffset {
                        app: row.get(0)?,
                        file_path: row.get(1)?,
                        byte_offset: row.get::<_, i64>(2)?.max(0) as u64,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(offset)
    }

    /// Overwrites the single watermark kept per app.
    pub fn set_transcript_offset(
        &self,
        app: &str,
        file_path: &str,
        byte_offset: u64,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO transcript_offsets (app, file_path, byte_offset, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(app) DO UPDATE SET
                file_path=excluded.file_path,
                byte_offset=excluded.byte_offset,
                updated_at=excluded.updated_at
            ",
            params![app, file_path, byte_offset as i64, now_millis()],
        )?;
        Ok(())
    }

    /// Inserts a session; re-saving an existing id only refreshes the verdict.
    pub fn save_completion_session(&self, session: &CompletionSession) -> Result<(), StorageError> {
        let failures_json = if session.failures.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&session.failures)
                    .map_err(|err| StorageError::Serialization(err.to_string()))?,
            )
        };

        self.conn.execute(
            "
            INSERT INTO cop_sessions (id, app, pbi, passed, failures, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                passed=excluded.passed,
                failures=excluded.failures,
                updated_at=excluded.updated_at
            ",
            params![
                session.id,
                session.app,
                session.pbi,
                session.passed,
                failures_json,
                session.created_at,
                session.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn latest_completion_session(
        &self,
        app: &str,
        pbi: &str,
    ) -> Result<Option<CompletionSession>, StorageError> {
        let session = self
            .conn
            .query_row(
                "
                SELECT id, app, pbi, passed, failures, created_at, updated_at
                FROM cop_sessions
                WHERE app = ?1 AND pbi = ?2
                ORDER BY updated_at DESC, rowid DESC
                LIMIT 1
                ",
                params![app, pbi],
                |row| {
                    let failures_json: Option<String> = row.get(4)?;
                    let failures = match failures_json {
                        Some(json) => serde_json::from_str(&json).map_err(|err| {
                            rusqlite::Error::FromSqlConversionFailure(
                                4,
                                rusqlite::types::Type::Text,
                                Box::new(err),
                            )
                        })?,
                        None => Vec::new(),
                    };
                    Ok(CompletionSession {
                        id: row.get(0)?,
                        app: row.get(1)?,
                        pbi: row.get(2)?,
                        passed: row.get(3)?,
                        failures,
                        created_at: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    pub fn clear_completion_session(&self, app: &str, pbi: &str) -> Result<usize, StorageError> {
        Ok(self.conn.execute(
            "DELETE FROM cop_sessions WHERE app = ?1 AND pbi = ?2",
            params![app, pbi],
        )?)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let mode = row
        .get::<_, Option<String>>(2)?
        .map(|value| value.parse::<Mode>().map_err(|err| conversion_error(2, err)))
        .transpose()?;
    let role = row
        .get::<_, String>(6)?
        .parse::<Role>()
        .map_err(|err| conversion_error(6, err))?;
    let r#type = row
        .get::<_, String>(7)?
        .parse::<MessageType>()
        .map_err(|err| conversion_error(7, err))?;
    let metadata = row
        .get::<_, Option<String>>(9)?
        .map(|json| {
            serde_json::from_str::<MessageMetadata>(&json).map_err(|err| conversion_error(9, err))
        })
        .transpose()?;

    Ok(Message {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        header: Header {
            mode,
            app: row.get(3)?,
            branch: row.get(4)?,
            context: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        },
        role,
        r#type,
        content: row.get(8)?,
        metadata,
    })
}

fn app_from_row(row: &Row<'_>) -> rusqlite::Result<AppRecord> {
    Ok(AppRecord {
        name: row.get(0)?,
        app_root: row.get(1)?,
        repo_root: row.get(2)?,
        last_used: row.get(3)?,
    })
}

fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}
