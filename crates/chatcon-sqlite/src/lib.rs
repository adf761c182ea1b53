//! SQLite implementation of the storage port.
//!
//! One connection behind a mutex; every call runs on the blocking pool.
//! Timestamps are stored as RFC 3339 text, statuses as lowercase strings.

use std::{
    collections::HashSet,
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chatcon_core::{
    domain::{
        Account, AccountId, AttemptId, AttemptStatus, CounterDelta, JoinAttempt, Link, LinkId,
        LinkStatus, LinkUpdate, NewJoinAttempt,
    },
    store::AccountStore,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, types::Type, Connection, ErrorCode, OptionalExtension, Row};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("storage task failed: {0}")]
    Task(String),

    #[error("connection lock poisoned")]
    Poisoned,
}

impl From<StorageError> for chatcon_core::Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::AccountNotFound(id) => chatcon_core::Error::AccountNotFound(id.to_string()),
            other => chatcon_core::Error::Storage(other.to_string()),
        }
    }
}

type StoreResult<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
#[error("unexpected column value {0:?}")]
struct BadValue(String);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS accounts (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        phone            TEXT NOT NULL UNIQUE,
        session_ref      TEXT NOT NULL,
        is_active        INTEGER NOT NULL DEFAULT 1,
        successful_joins INTEGER NOT NULL DEFAULT 0,
        errors           INTEGER NOT NULL DEFAULT 0,
        last_used        TEXT NOT NULL,
        created_at       TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS links (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id       INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
        address          TEXT NOT NULL,
        status           TEXT NOT NULL DEFAULT 'pending',
        joined           INTEGER NOT NULL DEFAULT 0,
        successful_joins INTEGER NOT NULL DEFAULT 0,
        last_checked     TEXT NOT NULL,
        created_at       TEXT NOT NULL,
        UNIQUE (account_id, address)
    );

    CREATE INDEX IF NOT EXISTS idx_links_account_status ON links (account_id, status);

    CREATE TABLE IF NOT EXISTS join_attempts (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id  INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
        link_id     INTEGER NOT NULL REFERENCES links(id) ON DELETE CASCADE,
        status      TEXT NOT NULL,
        error       TEXT,
        created_at  TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_attempts_account ON join_attempts (account_id, id);
";

const ACCOUNT_COLUMNS: &str =
    "id, phone, session_ref, is_active, successful_joins, errors, last_used, created_at";
const LINK_COLUMNS: &str =
    "id, account_id, address, status, joined, successful_joins, last_checked, created_at";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database file and apply the schema.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> chatcon_core::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let res = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StorageError::Poisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?;
        Ok(res?)
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn bad_value(idx: usize, value: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(BadValue(value)))
}

fn ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| bad_value(idx, raw))
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: AccountId(row.get(0)?),
        phone: row.get(1)?,
        session_ref: row.get(2)?,
        is_active: row.get::<_, i32>(3)? != 0,
        successful_joins: row.get::<_, i64>(4)? as u64,
        errors: row.get::<_, i64>(5)? as u64,
        last_used: ts(row, 6)?,
        created_at: ts(row, 7)?,
    })
}

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<Link> {
    let status: String = row.get(3)?;
    Ok(Link {
        id: LinkId(row.get(0)?),
        account_id: AccountId(row.get(1)?),
        address: row.get(2)?,
        status: LinkStatus::parse(&status).ok_or_else(|| bad_value(3, status))?,
        joined: row.get::<_, i32>(4)? != 0,
        successful_joins: row.get::<_, i64>(5)? as u64,
        last_checked: ts(row, 6)?,
        created_at: ts(row, 7)?,
    })
}

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<JoinAttempt> {
    let status: String = row.get(3)?;
    Ok(JoinAttempt {
        id: AttemptId(row.get(0)?),
        account_id: AccountId(row.get(1)?),
        link_id: LinkId(row.get(2)?),
        status: AttemptStatus::parse(&status).ok_or_else(|| bad_value(3, status))?,
        error: row.get(4)?,
        created_at: ts(row, 5)?,
    })
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

fn get_account(conn: &Connection, id: AccountId) -> StoreResult<Option<Account>> {
    let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![id.0], account_from_row)
        .optional()?)
}

fn require_account(conn: &Connection, id: AccountId) -> StoreResult<()> {
    let found: Option<i64> = conn
        .query_row("SELECT id FROM accounts WHERE id = ?1", params![id.0], |r| {
            r.get(0)
        })
        .optional()?;
    found.map(|_| ()).ok_or(StorageError::AccountNotFound(id))
}

fn get_link(conn: &Connection, id: i64) -> StoreResult<Link> {
    let sql = format!("SELECT {LINK_COLUMNS} FROM links WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], link_from_row)?)
}

fn links_where(
    conn: &Connection,
    account_id: AccountId,
    status: Option<LinkStatus>,
) -> StoreResult<Vec<Link>> {
    let rows = match status {
        Some(status) => {
            let sql = format!(
                "SELECT {LINK_COLUMNS} FROM links WHERE account_id = ?1 AND status = ?2 ORDER BY id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![account_id.0, status.as_str()], link_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
        None => {
            let sql = format!("SELECT {LINK_COLUMNS} FROM links WHERE account_id = ?1 ORDER BY id");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![account_id.0], link_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        }
    };
    Ok(rows)
}

fn add_links(
    conn: &mut Connection,
    account_id: AccountId,
    addresses: &[String],
) -> StoreResult<Vec<Link>> {
    let tx = conn.transaction()?;
    require_account(&tx, account_id)?;

    let created = now();
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for address in addresses {
        if !seen.insert(address.as_str()) {
            continue;
        }
        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, status FROM links WHERE account_id = ?1 AND address = ?2",
                params![account_id.0, address],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let id = match existing {
            None => {
                tx.execute(
                    "INSERT INTO links (account_id, address, status, joined, successful_joins, last_checked, created_at)
                     VALUES (?1, ?2, ?3, 0, 0, ?4, ?4)",
                    params![account_id.0, address, LinkStatus::Pending.as_str(), created],
                )?;
                tx.last_insert_rowid()
            }
            Some((id, status)) if status == LinkStatus::Failed.as_str() => {
                tx.execute(
                    "UPDATE links SET status = ?1 WHERE id = ?2",
                    params![LinkStatus::Pending.as_str(), id],
                )?;
                id
            }
            Some(_) => continue,
        };
        out.push(get_link(&tx, id)?);
    }
    tx.commit()?;
    Ok(out)
}

fn update_link_status(conn: &Connection, link_id: LinkId, update: LinkUpdate) -> StoreResult<()> {
    let current: Option<String> = conn
        .query_row(
            "SELECT status FROM links WHERE id = ?1",
            params![link_id.0],
            |r| r.get(0),
        )
        .optional()?;
    match current {
        None => return Err(StorageError::NotFound(format!("link {link_id}"))),
        Some(s) if s != LinkStatus::Pending.as_str() => {
            return Err(StorageError::InvalidTransition(format!(
                "link {link_id} is {s}, not pending"
            )))
        }
        Some(_) => {}
    }

    conn.execute(
        "UPDATE links
         SET status = ?1,
             last_checked = ?2,
             joined = joined OR ?3,
             successful_joins = successful_joins + ?4
         WHERE id = ?5",
        params![
            update.status.as_str(),
            now(),
            update.joined as i32,
            update.joined as i64,
            link_id.0
        ],
    )?;
    Ok(())
}

#[async_trait]
impl AccountStore for SqliteStore {
    async fn create_account(&self, phone: &str, session_ref: &str) -> chatcon_core::Result<Account> {
        let phone = phone.to_string();
        let session_ref = session_ref.to_string();
        self.with_conn(move |conn| {
            let created = now();
            let res = conn.execute(
                "INSERT INTO accounts (phone, session_ref, is_active, successful_joins, errors, last_used, created_at)
                 VALUES (?1, ?2, 1, 0, 0, ?3, ?3)",
                params![phone, session_ref, created],
            );
            match res {
                Ok(_) => {}
                Err(e) if is_constraint_violation(&e) => {
                    return Err(StorageError::AlreadyExists(format!("account {phone}")))
                }
                Err(e) => return Err(e.into()),
            }
            let id = AccountId(conn.last_insert_rowid());
            debug!(account_id = id.0, "account row inserted");
            get_account(conn, id)?.ok_or(StorageError::AccountNotFound(id))
        })
        .await
    }

    async fn get_account(&self, id: AccountId) -> chatcon_core::Result<Option<Account>> {
        self.with_conn(move |conn| get_account(conn, id)).await
    }

    async fn get_account_by_phone(&self, phone: &str) -> chatcon_core::Result<Option<Account>> {
        let phone = phone.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE phone = ?1");
            Ok(conn
                .query_row(&sql, params![phone], account_from_row)
                .optional()?)
        })
        .await
    }

    async fn update_account_counters(
        &self,
        id: AccountId,
        delta: CounterDelta,
    ) -> chatcon_core::Result<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE accounts
                 SET successful_joins = successful_joins + ?1,
                     errors = errors + ?2,
                     last_used = ?3
                 WHERE id = ?4",
                params![
                    delta.successful_joins as i64,
                    delta.errors as i64,
                    now(),
                    id.0
                ],
            )?;
            if changed == 0 {
                return Err(StorageError::AccountNotFound(id));
            }
            Ok(())
        })
        .await
    }

    async fn reset_account_counters(&self, id: AccountId) -> chatcon_core::Result<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE accounts SET successful_joins = 0, errors = 0 WHERE id = ?1",
                params![id.0],
            )?;
            if changed == 0 {
                return Err(StorageError::AccountNotFound(id));
            }
            Ok(())
        })
        .await
    }

    async fn set_account_active(&self, id: AccountId, active: bool) -> chatcon_core::Result<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE accounts SET is_active = ?1 WHERE id = ?2",
                params![active as i32, id.0],
            )?;
            if changed == 0 {
                return Err(StorageError::AccountNotFound(id));
            }
            Ok(())
        })
        .await
    }

    async fn add_links(
        &self,
        account_id: AccountId,
        addresses: &[String],
    ) -> chatcon_core::Result<Vec<Link>> {
        let addresses = addresses.to_vec();
        self.with_conn(move |conn| add_links(conn, account_id, &addresses))
            .await
    }

    async fn get_pending_links(&self, account_id: AccountId) -> chatcon_core::Result<Vec<Link>> {
        self.with_conn(move |conn| links_where(conn, account_id, Some(LinkStatus::Pending)))
            .await
    }

    async fn get_failed_links(&self, account_id: AccountId) -> chatcon_core::Result<Vec<Link>> {
        self.with_conn(move |conn| links_where(conn, account_id, Some(LinkStatus::Failed)))
            .await
    }

    async fn list_links(&self, account_id: AccountId) -> chatcon_core::Result<Vec<Link>> {
        self.with_conn(move |conn| links_where(conn, account_id, None))
            .await
    }

    async fn update_link_status(
        &self,
        link_id: LinkId,
        update: LinkUpdate,
    ) -> chatcon_core::Result<()> {
        self.with_conn(move |conn| update_link_status(conn, link_id, update))
            .await
    }

    async fn requeue_failed_links(&self, account_id: AccountId) -> chatcon_core::Result<usize> {
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "UPDATE links SET status = ?1 WHERE account_id = ?2 AND status = ?3",
                params![
                    LinkStatus::Pending.as_str(),
                    account_id.0,
                    LinkStatus::Failed.as_str()
                ],
            )?)
        })
        .await
    }

    async fn record_join_attempt(
        &self,
        attempt: NewJoinAttempt,
    ) -> chatcon_core::Result<JoinAttempt> {
        self.with_conn(move |conn| {
            let created = now();
            conn.execute(
                "INSERT INTO join_attempts (account_id, link_id, status, error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    attempt.account_id.0,
                    attempt.link_id.0,
                    attempt.status.as_str(),
                    attempt.error,
                    created
                ],
            )?;
            let id = conn.last_insert_rowid();
            Ok(conn.query_row(
                "SELECT id, account_id, link_id, status, error, created_at
                 FROM join_attempts WHERE id = ?1",
                params![id],
                attempt_from_row,
            )?)
        })
        .await
    }

    async fn list_attempts(
        &self,
        account_id: AccountId,
        limit: usize,
    ) -> chatcon_core::Result<Vec<JoinAttempt>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, account_id, link_id, status, error, created_at
                 FROM join_attempts WHERE account_id = ?1
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![account_id.0, limit], attempt_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }
}
