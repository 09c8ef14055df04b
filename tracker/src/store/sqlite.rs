use crate::model::{
    Action, ActionKind, ActionName, ActionNameId, ActionNameIds, ActionNameKind, Fingerprint,
    NewAction, NewHit, NewVisit, RecordedHit, Timestamp, Visit, VisitId, VisitTarget,
};
use crate::store::{StoreConnector, StoreError, TrackerStore};
use async_trait::async_trait;
use site_cache::SiteId;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS log_visit (
        idvisit INTEGER PRIMARY KEY AUTOINCREMENT,
        idsite INTEGER NOT NULL,
        idvisitor TEXT NOT NULL,
        visit_first_action_time INTEGER NOT NULL,
        visit_last_action_time INTEGER NOT NULL,
        visit_total_actions INTEGER NOT NULL,
        custom_variables TEXT NOT NULL,
        location_ip TEXT,
        user_agent TEXT,
        location_browser_lang TEXT,
        attributes TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS index_idsite_idvisitor
        ON log_visit (idsite, idvisitor, visit_last_action_time)",
    "CREATE TABLE IF NOT EXISTS log_action (
        idaction INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        type INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS index_type_name ON log_action (type, name)",
    "CREATE TABLE IF NOT EXISTS log_link_visit_action (
        idlink_va INTEGER PRIMARY KEY AUTOINCREMENT,
        idvisit INTEGER NOT NULL,
        idsite INTEGER NOT NULL,
        action_kind TEXT NOT NULL,
        idaction_url INTEGER,
        idaction_name INTEGER,
        idaction_event_category INTEGER,
        idaction_event_action INTEGER,
        event_value REAL,
        position INTEGER NOT NULL,
        server_time INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS index_idvisit ON log_link_visit_action (idvisit)",
    "CREATE TABLE IF NOT EXISTS options (
        option_name TEXT PRIMARY KEY,
        option_value TEXT NOT NULL
    )",
];

const VISIT_COLUMNS: &str = "idvisit, idsite, idvisitor, visit_first_action_time, \
    visit_last_action_time, visit_total_actions, custom_variables, location_ip, user_agent, \
    location_browser_lang, attributes";

const ACTION_COLUMNS: &str = "idlink_va, idvisit, idsite, action_kind, idaction_url, \
    idaction_name, idaction_event_category, idaction_event_action, event_value, position, \
    server_time";

/// SQLite backed storage. The pool and schema are created on first connect,
/// and every connect checks that the database still answers.
pub struct SqliteConnector {
    path: PathBuf,
    options: SqliteConnectOptions,
    max_connections: u32,
    pool: OnceCell<SqlitePool>,
}

impl SqliteConnector {
    pub fn new(path: impl AsRef<Path>, max_connections: u32) -> Self {
        let path = path.as_ref().to_path_buf();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        SqliteConnector {
            path,
            options,
            max_connections,
            pool: OnceCell::new(),
        }
    }

    async fn pool(&self) -> Result<&SqlitePool, sqlx::Error> {
        self.pool
            .get_or_try_init(|| async {
                let pool = SqlitePoolOptions::new()
                    .max_connections(self.max_connections)
                    .connect_with(self.options.clone())
                    .await?;
                for statement in SCHEMA {
                    sqlx::query(statement).execute(&pool).await?;
                }
                tracing::info!(path = %self.path.display(), "sqlite storage ready");
                Ok::<_, sqlx::Error>(pool)
            })
            .await
    }
}

#[async_trait]
impl StoreConnector for SqliteConnector {
    async fn connect(&self) -> Result<Arc<dyn TrackerStore>, StoreError> {
        let unavailable = |err: sqlx::Error| StoreError::Unavailable(err.to_string());
        let pool = self.pool().await.map_err(unavailable)?;
        sqlx::query("SELECT 1")
            .execute(pool)
            .await
            .map_err(unavailable)?;
        Ok(Arc::new(SqliteStore { pool: pool.clone() }))
    }
}

pub struct SqliteStore {
    pool: SqlitePool,
}

fn visit_from_row(row: &SqliteRow) -> Result<Visit, StoreError> {
    let fingerprint: String = row.try_get("idvisitor")?;
    let custom_variables: String = row.try_get("custom_variables")?;
    let attributes: String = row.try_get("attributes")?;

    Ok(Visit {
        id: row.try_get("idvisit")?,
        site_id: row.try_get::<i64, _>("idsite")? as SiteId,
        fingerprint: Fingerprint::from_hex(&fingerprint)
            .ok_or_else(|| StoreError::Corrupt(format!("visitor id {fingerprint:?}")))?,
        first_action_time: row.try_get("visit_first_action_time")?,
        last_action_time: row.try_get("visit_last_action_time")?,
        action_count: row.try_get::<i64, _>("visit_total_actions")? as u32,
        custom_variables: serde_json::from_str(&custom_variables)?,
        client_ip: row.try_get("location_ip")?,
        user_agent: row.try_get("user_agent")?,
        language: row.try_get("location_browser_lang")?,
        attributes: serde_json::from_str(&attributes)?,
    })
}

fn action_from_row(row: &SqliteRow) -> Result<Action, StoreError> {
    let kind: String = row.try_get("action_kind")?;

    Ok(Action {
        id: row.try_get("idlink_va")?,
        visit_id: row.try_get("idvisit")?,
        site_id: row.try_get::<i64, _>("idsite")? as SiteId,
        kind: ActionKind::parse(&kind)
            .ok_or_else(|| StoreError::Corrupt(format!("action kind {kind:?}")))?,
        url_id: row.try_get("idaction_url")?,
        name_id: row.try_get("idaction_name")?,
        event_category_id: row.try_get("idaction_event_category")?,
        event_action_id: row.try_get("idaction_event_action")?,
        event_value: row.try_get("event_value")?,
        position: row.try_get::<i64, _>("position")? as u32,
        server_time: row.try_get("server_time")?,
    })
}

/// Inserts a visit unless an open one exists. Check and insert happen in one
/// statement, so two writers can never both create an open visit for the
/// same fingerprint.
async fn insert_visit(
    conn: &mut SqliteConnection,
    visit: &NewVisit,
    since: Timestamp,
) -> Result<Visit, StoreError> {
    let sql = format!(
        "INSERT INTO log_visit (
            idsite, idvisitor, visit_first_action_time, visit_last_action_time,
            visit_total_actions, custom_variables, location_ip, user_agent,
            location_browser_lang, attributes
         )
         SELECT ?, ?, ?, ?, 1, ?, ?, ?, ?, ?
         WHERE NOT EXISTS (
            SELECT 1 FROM log_visit
            WHERE idsite = ? AND idvisitor = ? AND visit_last_action_time >= ?
         )
         RETURNING {VISIT_COLUMNS}"
    );
    let fingerprint = visit.fingerprint.to_string();
    let row = sqlx::query(&sql)
        .bind(i64::from(visit.site_id))
        .bind(&fingerprint)
        .bind(visit.first_action_time)
        .bind(visit.first_action_time)
        .bind(serde_json::to_string(&visit.custom_variables)?)
        .bind(&visit.client_ip)
        .bind(&visit.user_agent)
        .bind(&visit.language)
        .bind(serde_json::to_string(&visit.attributes)?)
        .bind(i64::from(visit.site_id))
        .bind(&fingerprint)
        .bind(since)
        .fetch_optional(&mut *conn)
        .await?;

    match row {
        Some(row) => visit_from_row(&row),
        None => Err(StoreError::Conflict),
    }
}

/// Counts one more action on a visit and advances its last action time.
async fn touch_visit(
    conn: &mut SqliteConnection,
    visit_id: VisitId,
    at: Timestamp,
) -> Result<Visit, StoreError> {
    let sql = format!(
        "UPDATE log_visit
         SET visit_last_action_time = MAX(visit_last_action_time, ?),
             visit_total_actions = visit_total_actions + 1
         WHERE idvisit = ?
         RETURNING {VISIT_COLUMNS}"
    );
    let row = sqlx::query(&sql)
        .bind(at)
        .bind(visit_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(StoreError::NotFound)?;
    visit_from_row(&row)
}

async fn find_action_name(
    conn: &mut SqliteConnection,
    name: &str,
    kind: ActionNameKind,
) -> Result<Option<ActionNameId>, StoreError> {
    let id = sqlx::query_scalar(
        "SELECT idaction FROM log_action WHERE type = ? AND name = ? ORDER BY idaction LIMIT 1",
    )
    .bind(kind.code())
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(id)
}

async fn action_name_id(
    conn: &mut SqliteConnection,
    name: &str,
    kind: ActionNameKind,
) -> Result<ActionNameId, StoreError> {
    if let Some(id) = find_action_name(conn, name, kind).await? {
        return Ok(id);
    }
    let id =
        sqlx::query_scalar("INSERT INTO log_action (name, type) VALUES (?, ?) RETURNING idaction")
            .bind(name)
            .bind(kind.code())
            .fetch_one(&mut *conn)
            .await?;
    Ok(id)
}

async fn insert_action(
    conn: &mut SqliteConnection,
    action: &NewAction,
) -> Result<Action, StoreError> {
    let sql = format!(
        "INSERT INTO log_link_visit_action (
            idvisit, idsite, action_kind, idaction_url, idaction_name,
            idaction_event_category, idaction_event_action, event_value, position, server_time
         )
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         RETURNING {ACTION_COLUMNS}"
    );
    let row = sqlx::query(&sql)
        .bind(action.visit_id)
        .bind(i64::from(action.site_id))
        .bind(action.kind.as_str())
        .bind(action.url_id)
        .bind(action.name_id)
        .bind(action.event_category_id)
        .bind(action.event_action_id)
        .bind(action.event_value)
        .bind(i64::from(action.position))
        .bind(action.server_time)
        .fetch_one(&mut *conn)
        .await?;
    action_from_row(&row)
}

#[async_trait]
impl TrackerStore for SqliteStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn find_open_visit(
        &self,
        site_id: SiteId,
        fingerprint: Fingerprint,
        since: Timestamp,
    ) -> Result<Option<Visit>, StoreError> {
        let sql = format!(
            "SELECT {VISIT_COLUMNS} FROM log_visit
             WHERE idsite = ? AND idvisitor = ? AND visit_last_action_time >= ?
             ORDER BY visit_last_action_time DESC LIMIT 1"
        );
        sqlx::query(&sql)
            .bind(i64::from(site_id))
            .bind(fingerprint.to_string())
            .bind(since)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(visit_from_row)
            .transpose()
    }

    async fn record_hit(&self, hit: &NewHit) -> Result<RecordedHit, StoreError> {
        // Dropping the transaction before commit rolls every write back.
        let mut tx = self.pool.begin().await?;

        let (visit, visit_created) = match &hit.target {
            VisitTarget::Open(visit_id) => {
                (touch_visit(&mut tx, *visit_id, hit.time).await?, false)
            }
            VisitTarget::New { visit, since } => {
                (insert_visit(&mut tx, visit, *since).await?, true)
            }
        };

        let mut ids = ActionNameIds::default();
        for name in &hit.names {
            ids.set(name.slot, action_name_id(&mut tx, &name.name, name.kind).await?);
        }
        let action = insert_action(&mut tx, &hit.action(&visit, ids)).await?;

        tx.commit().await?;
        Ok(RecordedHit {
            visit,
            action,
            visit_created,
        })
    }

    async fn visit(&self, visit_id: VisitId) -> Result<Option<Visit>, StoreError> {
        let sql = format!("SELECT {VISIT_COLUMNS} FROM log_visit WHERE idvisit = ?");
        sqlx::query(&sql)
            .bind(visit_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(visit_from_row)
            .transpose()
    }

    async fn visit_count(&self, site_id: SiteId) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM log_visit WHERE idsite = ?")
            .bind(i64::from(site_id))
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn find_action_name(
        &self,
        name: &str,
        kind: ActionNameKind,
    ) -> Result<Option<ActionNameId>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        find_action_name(&mut conn, name, kind).await
    }

    async fn action_name(&self, id: ActionNameId) -> Result<Option<ActionName>, StoreError> {
        let row = sqlx::query("SELECT idaction, name, type FROM log_action WHERE idaction = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let code: i64 = row.try_get("type")?;
        Ok(Some(ActionName {
            id: row.try_get("idaction")?,
            name: row.try_get("name")?,
            kind: ActionNameKind::from_code(code)
                .ok_or_else(|| StoreError::Corrupt(format!("action name type {code}")))?,
        }))
    }

    async fn actions_of_visit(&self, visit_id: VisitId) -> Result<Vec<Action>, StoreError> {
        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM log_link_visit_action WHERE idvisit = ? ORDER BY idlink_va"
        );
        sqlx::query(&sql)
            .bind(visit_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(action_from_row)
            .collect()
    }

    async fn get_option(&self, name: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar("SELECT option_value FROM options WHERE option_name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_option(&self, name: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO options (option_name, option_value) VALUES (?, ?)
             ON CONFLICT (option_name) DO UPDATE SET option_value = excluded.option_value",
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
