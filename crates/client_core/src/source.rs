use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{future, stream::BoxStream, StreamExt};
use shared::{
    domain::{ConnectionId, QuestionnaireId, UserId},
    error::{ApiError, ApiException},
    protocol::{ConnectionRecord, ConnectionStats, QuestionnaireLink},
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::warn;

use connections_api::ApiContext;

/// A reload trigger. Carries no authoritative data about the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeNotice {
    Changed(ConnectionId),
    /// Notifications were dropped upstream.
    Resync,
}

pub type ChangeStream = BoxStream<'static, ChangeNotice>;

/// Everything the feed and the view need from the connection store.
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    async fn list_connections(&self, user_id: UserId) -> Result<Vec<ConnectionRecord>>;
    async fn connection_stats(&self, user_id: UserId) -> Result<ConnectionStats>;
    async fn share_contact(&self, connection_id: ConnectionId) -> Result<()>;
    async fn revoke_access(&self, connection_id: ConnectionId) -> Result<()>;
    async fn decline_connection(&self, connection_id: ConnectionId, reason: &str) -> Result<()>;
    async fn reconsider_connection(&self, connection_id: ConnectionId) -> Result<()>;
    async fn send_questionnaire(
        &self,
        connection_id: ConnectionId,
        questionnaire_id: QuestionnaireId,
    ) -> Result<QuestionnaireLink>;
    /// Notifications for rows where `user_id` is requester or responder.
    async fn subscribe(&self, user_id: UserId) -> Result<ChangeStream>;
}

/// In-process source: calls the transition service directly and listens on
/// the store's own change channel.
#[derive(Clone)]
pub struct LocalSource {
    ctx: ApiContext,
}

impl LocalSource {
    pub fn new(ctx: ApiContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ApiContext {
        &self.ctx
    }
}

fn api_failure(err: ApiError) -> anyhow::Error {
    anyhow::Error::new(ApiException::from(err))
}

#[async_trait]
impl ConnectionSource for LocalSource {
    async fn list_connections(&self, user_id: UserId) -> Result<Vec<ConnectionRecord>> {
        connections_api::list_connections(&self.ctx, user_id)
            .await
            .map_err(api_failure)
    }

    async fn connection_stats(&self, user_id: UserId) -> Result<ConnectionStats> {
        connections_api::connection_stats(&self.ctx, user_id)
            .await
            .map_err(api_failure)
    }

    async fn share_contact(&self, connection_id: ConnectionId) -> Result<()> {
        connections_api::share_contact(&self.ctx, connection_id)
            .await
            .map_err(api_failure)
    }

    async fn revoke_access(&self, connection_id: ConnectionId) -> Result<()> {
        connections_api::revoke_access(&self.ctx, connection_id)
            .await
            .map_err(api_failure)
    }

    async fn decline_connection(&self, connection_id: ConnectionId, reason: &str) -> Result<()> {
        connections_api::decline_connection(&self.ctx, connection_id, reason)
            .await
            .map_err(api_failure)
    }

    async fn reconsider_connection(&self, connection_id: ConnectionId) -> Result<()> {
        connections_api::reconsider_connection(&self.ctx, connection_id)
            .await
            .map_err(api_failure)
    }

    async fn send_questionnaire(
        &self,
        connection_id: ConnectionId,
        questionnaire_id: QuestionnaireId,
    ) -> Result<QuestionnaireLink> {
        connections_api::send_questionnaire(&self.ctx, connection_id, questionnaire_id)
            .await
            .map_err(api_failure)
    }

    async fn subscribe(&self, user_id: UserId) -> Result<ChangeStream> {
        self.ctx
            .storage
            .health_check()
            .await
            .context("cannot subscribe to an unreachable store")?;
        let changes = BroadcastStream::new(self.ctx.storage.subscribe_changes());
        let scoped = changes.filter_map(move |item| {
            future::ready(match item {
                Ok(change) if change.touches(user_id) => {
                    Some(ChangeNotice::Changed(change.connection_id))
                }
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(user_id = user_id.0, skipped, "feed: change channel lagged");
                    Some(ChangeNotice::Resync)
                }
            })
        });
        Ok(scoped.boxed())
    }
}
