use chrono::Utc;
use shared::{
    domain::{
        ConnectionId, ConnectionStatus, QuestionnaireId, ReconsiderPolicy, UserId,
        REVOKED_DECLINE_REASON,
    },
    error::{ApiError, ErrorCode},
    protocol::{ConnectionRecord, ConnectionStats, QuestionnaireLink},
};
use storage::{ConnectionPatch, Storage, StoredConnection};
use tracing::{error, info};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub reconsider_policy: ReconsiderPolicy,
}

impl ApiContext {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            reconsider_policy: ReconsiderPolicy::default(),
        }
    }

    pub fn with_reconsider_policy(mut self, policy: ReconsiderPolicy) -> Self {
        self.reconsider_policy = policy;
        self
    }
}

pub async fn list_connections(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ConnectionRecord>, ApiError> {
    ctx.storage
        .list_connections_for_user(user_id)
        .await
        .map_err(|err| store_failure("list_connections", err))
}

pub async fn connection_stats(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<ConnectionStats, ApiError> {
    let counts = ctx
        .storage
        .status_counts_for_user(user_id)
        .await
        .map_err(|err| store_failure("connection_stats", err))?;

    let mut stats = ConnectionStats::default();
    for (raw, count) in counts {
        stats.record(ConnectionStatus::from_store(&raw), count);
    }
    Ok(stats)
}

pub async fn share_contact(ctx: &ApiContext, connection_id: ConnectionId) -> Result<(), ApiError> {
    let patch = ConnectionPatch::at(Utc::now()).status(ConnectionStatus::Active);
    apply_patch(ctx, "share_contact", connection_id, &patch).await?;
    info!(connection_id = connection_id.0, "connections: contact shared");
    Ok(())
}

pub async fn send_questionnaire(
    ctx: &ApiContext,
    connection_id: ConnectionId,
    questionnaire_id: QuestionnaireId,
) -> Result<QuestionnaireLink, ApiError> {
    load_existing(ctx, "send_questionnaire", connection_id).await?;
    let link = ctx
        .storage
        .insert_questionnaire_link(connection_id, questionnaire_id, Utc::now())
        .await
        .map_err(|err| store_failure("send_questionnaire", err))?;
    info!(
        connection_id = connection_id.0,
        questionnaire_id = questionnaire_id.0,
        link_id = link.link_id.0,
        "connections: questionnaire sent"
    );
    Ok(link)
}

pub async fn revoke_access(ctx: &ApiContext, connection_id: ConnectionId) -> Result<(), ApiError> {
    let patch = ConnectionPatch::at(Utc::now())
        .status(ConnectionStatus::Declined)
        .decline_reason(REVOKED_DECLINE_REASON);
    apply_patch(ctx, "revoke_access", connection_id, &patch).await?;
    info!(connection_id = connection_id.0, "connections: access revoked");
    Ok(())
}

/// Stores `reason` verbatim; an empty reason is kept as an empty string.
pub async fn decline_connection(
    ctx: &ApiContext,
    connection_id: ConnectionId,
    reason: &str,
) -> Result<(), ApiError> {
    let patch = ConnectionPatch::at(Utc::now())
        .status(ConnectionStatus::Declined)
        .decline_reason(reason);
    apply_patch(ctx, "decline_connection", connection_id, &patch).await?;
    info!(connection_id = connection_id.0, "connections: connection declined");
    Ok(())
}

pub async fn reconsider_connection(
    ctx: &ApiContext,
    connection_id: ConnectionId,
) -> Result<(), ApiError> {
    let mut patch = ConnectionPatch::at(Utc::now())
        .status(ConnectionStatus::Pending)
        .clear_decline_reason();
    if let Some(reason) = ctx.reconsider_policy.protected_reason() {
        patch = patch.unless_decline_reason(reason);
    }
    let updated = ctx
        .storage
        .patch_connection(connection_id, &patch)
        .await
        .map_err(|err| store_failure("reconsider_connection", err))?;
    if !updated {
        // The row exists, so the policy guard in the UPDATE refused it.
        load_existing(ctx, "reconsider_connection", connection_id).await?;
        error!(
            connection_id = connection_id.0,
            policy = ?ctx.reconsider_policy,
            "connections: reconsider refused for revoked connection"
        );
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "revoked connections cannot be reconsidered",
        ));
    }
    info!(connection_id = connection_id.0, "connections: connection reconsidered");
    Ok(())
}

async fn apply_patch(
    ctx: &ApiContext,
    operation: &'static str,
    connection_id: ConnectionId,
    patch: &ConnectionPatch,
) -> Result<(), ApiError> {
    let updated = ctx
        .storage
        .patch_connection(connection_id, patch)
        .await
        .map_err(|err| store_failure(operation, err))?;
    if !updated {
        return Err(missing(operation, connection_id));
    }
    Ok(())
}

async fn load_existing(
    ctx: &ApiContext,
    operation: &'static str,
    connection_id: ConnectionId,
) -> Result<StoredConnection, ApiError> {
    ctx.storage
        .load_connection(connection_id)
        .await
        .map_err(|err| store_failure(operation, err))?
        .ok_or_else(|| missing(operation, connection_id))
}

fn missing(operation: &'static str, connection_id: ConnectionId) -> ApiError {
    error!(
        operation,
        connection_id = connection_id.0,
        "connections: connection not found"
    );
    ApiError::not_found(format!("connection {connection_id}"))
}

fn store_failure(operation: &'static str, err: anyhow::Error) -> ApiError {
    error!(operation, error = %format!("{err:#}"), "connections: store call failed");
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
