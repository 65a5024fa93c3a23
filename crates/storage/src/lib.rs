use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tokio::sync::broadcast;
use tracing::debug;

use shared::{
    domain::{
        ConnectionId, ConnectionStatus, OpportunityId, OpportunitySummary, ProfileSummary,
        QuestionnaireId, QuestionnaireLinkId, RequestType, UserId,
    },
    protocol::{ConnectionRecord, QuestionnaireLink},
};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Handle to the connection store. Cloning shares both the pool and the
/// change notification channel.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<RowChange>,
}

/// Emitted after every write to a connection row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowChange {
    pub connection_id: ConnectionId,
    pub requester_id: UserId,
    pub responder_id: UserId,
}

impl RowChange {
    /// Scope filter: the change concerns `user_id` as requester or responder.
    pub fn touches(&self, user_id: UserId) -> bool {
        self.requester_id == user_id || self.responder_id == user_id
    }
}

/// Partial update of one connection row. `None` leaves a column untouched;
/// `decline_reason: Some(None)` clears it.
#[derive(Debug, Clone)]
pub struct ConnectionPatch {
    pub status: Option<ConnectionStatus>,
    pub decline_reason: Option<Option<String>>,
    /// Leaves the row untouched when its current reason equals this one.
    pub unless_decline_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectionPatch {
    pub fn at(updated_at: DateTime<Utc>) -> Self {
        Self {
            status: None,
            decline_reason: None,
            unless_decline_reason: None,
            updated_at,
        }
    }

    pub fn status(mut self, status: ConnectionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn decline_reason(mut self, reason: impl Into<String>) -> Self {
        self.decline_reason = Some(Some(reason.into()));
        self
    }

    pub fn clear_decline_reason(mut self) -> Self {
        self.decline_reason = Some(None);
        self
    }

    pub fn unless_decline_reason(mut self, reason: impl Into<String>) -> Self {
        self.unless_decline_reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct StoredConnection {
    pub connection_id: ConnectionId,
    pub requester_id: UserId,
    pub responder_id: UserId,
    pub opportunity_id: Option<OpportunityId>,
    pub status: String,
    pub request_type: Option<String>,
    pub decline_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewProfile<'a> {
    pub username: &'a str,
    pub display_name: Option<&'a str>,
    pub company: Option<&'a str>,
    pub title: Option<&'a str>,
    pub avatar_url: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct NewConnection {
    pub requester_id: UserId,
    pub responder_id: UserId,
    pub opportunity_id: Option<OpportunityId>,
    pub request_type: Option<RequestType>,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run connection store migrations")?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self { pool, changes })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Subscribes to every connection row change. Callers narrow the stream
    /// with [`RowChange::touches`].
    pub fn subscribe_changes(&self) -> broadcast::Receiver<RowChange> {
        self.changes.subscribe()
    }

    fn publish(&self, change: RowChange) {
        debug!(
            connection_id = change.connection_id.0,
            requester_id = change.requester_id.0,
            responder_id = change.responder_id.0,
            "store: connection row changed"
        );
        // No receivers is fine; nobody is watching yet.
        let _ = self.changes.send(change);
    }

    pub async fn create_user(&self, profile: &NewProfile<'_>) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username, display_name, company, title, avatar_url)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(username) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, users.display_name),
                company = COALESCE(excluded.company, users.company),
                title = COALESCE(excluded.title, users.title),
                avatar_url = COALESCE(excluded.avatar_url, users.avatar_url)
             RETURNING id",
        )
        .bind(profile.username)
        .bind(profile.display_name)
        .bind(profile.company)
        .bind(profile.title)
        .bind(profile.avatar_url)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to upsert user '{}'", profile.username))?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn profile(&self, user_id: UserId) -> Result<Option<ProfileSummary>> {
        let row = sqlx::query(
            "SELECT id, COALESCE(display_name, username) AS name, company, title, avatar_url
             FROM users WHERE id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ProfileSummary {
            user_id: UserId(r.get::<i64, _>("id")),
            name: r.get::<String, _>("name"),
            company: r.get::<Option<String>, _>("company"),
            title: r.get::<Option<String>, _>("title"),
            avatar_url: r.get::<Option<String>, _>("avatar_url"),
        }))
    }

    pub async fn create_opportunity(&self, owner: UserId, title: &str) -> Result<OpportunityId> {
        let rec =
            sqlx::query("INSERT INTO opportunities (owner_user_id, title) VALUES (?, ?) RETURNING id")
                .bind(owner.0)
                .bind(title)
                .fetch_one(&self.pool)
                .await?;
        Ok(OpportunityId(rec.get::<i64, _>(0)))
    }

    pub async fn create_questionnaire(&self, owner: UserId, title: &str) -> Result<QuestionnaireId> {
        let rec = sqlx::query(
            "INSERT INTO questionnaires (owner_user_id, title) VALUES (?, ?) RETURNING id",
        )
        .bind(owner.0)
        .bind(title)
        .fetch_one(&self.pool)
        .await?;
        Ok(QuestionnaireId(rec.get::<i64, _>(0)))
    }

    /// Inserts a pending connection. Only seeding and tests create rows;
    /// the request flow that normally does so lives elsewhere.
    pub async fn create_connection(&self, new: &NewConnection) -> Result<ConnectionId> {
        let rec = sqlx::query(
            "INSERT INTO connections
                (requester_id, responder_id, opportunity_id, status, request_type, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(new.requester_id.0)
        .bind(new.responder_id.0)
        .bind(new.opportunity_id.map(|id| id.0))
        .bind(ConnectionStatus::Pending.as_store())
        .bind(new.request_type.map(RequestType::as_store))
        .bind(new.created_at)
        .bind(new.created_at)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert connection")?;
        let connection_id = ConnectionId(rec.get::<i64, _>(0));
        self.publish(RowChange {
            connection_id,
            requester_id: new.requester_id,
            responder_id: new.responder_id,
        });
        Ok(connection_id)
    }

    /// Writes a raw status string, bypassing the display vocabulary. Used to
    /// load rows written by other clients of the same table.
    pub async fn set_raw_status(&self, connection_id: ConnectionId, raw: &str) -> Result<bool> {
        let row = sqlx::query(
            "UPDATE connections SET status = ? WHERE id = ? RETURNING requester_id, responder_id",
        )
        .bind(raw)
        .bind(connection_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(self.publish_patched(connection_id, row))
    }

    pub async fn load_connection(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<StoredConnection>> {
        let row = sqlx::query(
            "SELECT id, requester_id, responder_id, opportunity_id, status, request_type,
                    decline_reason, created_at, updated_at
             FROM connections WHERE id = ?",
        )
        .bind(connection_id.0)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load connection {connection_id}"))?;
        Ok(row.map(|r| StoredConnection {
            connection_id: ConnectionId(r.get::<i64, _>("id")),
            requester_id: UserId(r.get::<i64, _>("requester_id")),
            responder_id: UserId(r.get::<i64, _>("responder_id")),
            opportunity_id: r.get::<Option<i64>, _>("opportunity_id").map(OpportunityId),
            status: r.get::<String, _>("status"),
            request_type: r.get::<Option<String>, _>("request_type"),
            decline_reason: r.get::<Option<String>, _>("decline_reason"),
            created_at: r.get::<DateTime<Utc>, _>("created_at"),
            updated_at: r.get::<DateTime<Utc>, _>("updated_at"),
        }))
    }

    /// Every connection where `user_id` is requester or responder, joined
    /// with both profiles and the opportunity, newest first.
    pub async fn list_connections_for_user(&self, user_id: UserId) -> Result<Vec<ConnectionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.status, c.request_type, c.decline_reason, c.created_at, c.updated_at,
                   rq.id AS rq_id, COALESCE(rq.display_name, rq.username) AS rq_name,
                   rq.company AS rq_company, rq.title AS rq_title, rq.avatar_url AS rq_avatar,
                   rs.id AS rs_id, COALESCE(rs.display_name, rs.username) AS rs_name,
                   rs.company AS rs_company, rs.title AS rs_title, rs.avatar_url AS rs_avatar,
                   o.id AS opportunity_id, o.title AS opportunity_title
            FROM connections c
            INNER JOIN users rq ON rq.id = c.requester_id
            INNER JOIN users rs ON rs.id = c.responder_id
            LEFT JOIN opportunities o ON o.id = c.opportunity_id
            WHERE c.requester_id = ?1 OR c.responder_id = ?1
            ORDER BY c.created_at DESC, c.id DESC
            "#,
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list connections for user {user_id}"))?;

        Ok(rows.iter().map(connection_record_from_row).collect())
    }

    /// Applies `patch` in a single UPDATE. Returns `false` when no row has
    /// that id or the row's reason matches `unless_decline_reason`.
    pub async fn patch_connection(
        &self,
        connection_id: ConnectionId,
        patch: &ConnectionPatch,
    ) -> Result<bool> {
        let (touch_reason, reason) = match &patch.decline_reason {
            Some(reason) => (true, reason.clone()),
            None => (false, None),
        };
        let row = sqlx::query(
            "UPDATE connections SET
                status = COALESCE(?1, status),
                decline_reason = CASE WHEN ?2 THEN ?3 ELSE decline_reason END,
                updated_at = ?4
             WHERE id = ?5
               AND (?6 IS NULL OR decline_reason IS NULL OR decline_reason != ?6)
             RETURNING requester_id, responder_id",
        )
        .bind(patch.status.map(ConnectionStatus::as_store))
        .bind(touch_reason)
        .bind(reason)
        .bind(patch.updated_at)
        .bind(connection_id.0)
        .bind(patch.unless_decline_reason.as_deref())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to patch connection {connection_id}"))?;
        Ok(self.publish_patched(connection_id, row))
    }

    fn publish_patched(&self, connection_id: ConnectionId, row: Option<SqliteRow>) -> bool {
        let Some(row) = row else {
            return false;
        };
        self.publish(RowChange {
            connection_id,
            requester_id: UserId(row.get::<i64, _>("requester_id")),
            responder_id: UserId(row.get::<i64, _>("responder_id")),
        });
        true
    }

    pub async fn insert_questionnaire_link(
        &self,
        connection_id: ConnectionId,
        questionnaire_id: QuestionnaireId,
        created_at: DateTime<Utc>,
    ) -> Result<QuestionnaireLink> {
        let rec = sqlx::query(
            "INSERT INTO connection_questionnaires (connection_id, questionnaire_id, status, created_at)
             VALUES (?, ?, 'sent', ?)
             RETURNING id, status",
        )
        .bind(connection_id.0)
        .bind(questionnaire_id.0)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await
        .with_context(|| {
            format!("failed to link questionnaire {questionnaire_id} to connection {connection_id}")
        })?;
        Ok(QuestionnaireLink {
            link_id: QuestionnaireLinkId(rec.get::<i64, _>("id")),
            connection_id,
            questionnaire_id,
            status: rec.get::<String, _>("status"),
            created_at,
        })
    }

    pub async fn list_questionnaire_links(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Vec<QuestionnaireLink>> {
        let rows = sqlx::query(
            "SELECT id, questionnaire_id, status, created_at
             FROM connection_questionnaires
             WHERE connection_id = ?
             ORDER BY id ASC",
        )
        .bind(connection_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| QuestionnaireLink {
                link_id: QuestionnaireLinkId(r.get::<i64, _>("id")),
                connection_id,
                questionnaire_id: QuestionnaireId(r.get::<i64, _>("questionnaire_id")),
                status: r.get::<String, _>("status"),
                created_at: r.get::<DateTime<Utc>, _>("created_at"),
            })
            .collect())
    }

    /// Raw status strings with their row counts for one user's connections.
    pub async fn status_counts_for_user(&self, user_id: UserId) -> Result<Vec<(String, u64)>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n
             FROM connections
             WHERE requester_id = ?1 OR responder_id = ?1
             GROUP BY status",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to count connections for user {user_id}"))?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let n = r.get::<i64, _>("n");
                (r.get::<String, _>("status"), u64::try_from(n).unwrap_or(0))
            })
            .collect())
    }
}

fn connection_record_from_row(r: &SqliteRow) -> ConnectionRecord {
    let opportunity = r
        .get::<Option<i64>, _>("opportunity_id")
        .map(|id| OpportunitySummary {
            opportunity_id: OpportunityId(id),
            title: r
                .get::<Option<String>, _>("opportunity_title")
                .unwrap_or_default(),
        });
    ConnectionRecord {
        connection_id: ConnectionId(r.get::<i64, _>("id")),
        requester: ProfileSummary {
            user_id: UserId(r.get::<i64, _>("rq_id")),
            name: r.get::<String, _>("rq_name"),
            company: r.get::<Option<String>, _>("rq_company"),
            title: r.get::<Option<String>, _>("rq_title"),
            avatar_url: r.get::<Option<String>, _>("rq_avatar"),
        },
        responder: ProfileSummary {
            user_id: UserId(r.get::<i64, _>("rs_id")),
            name: r.get::<String, _>("rs_name"),
            company: r.get::<Option<String>, _>("rs_company"),
            title: r.get::<Option<String>, _>("rs_title"),
            avatar_url: r.get::<Option<String>, _>("rs_avatar"),
        },
        opportunity,
        status: r.get::<String, _>("status"),
        request_type: r.get::<Option<String>, _>("request_type"),
        decline_reason: r.get::<Option<String>, _>("decline_reason"),
        created_at: r.get::<DateTime<Utc>, _>("created_at"),
        updated_at: r.get::<DateTime<Utc>, _>("updated_at"),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
