use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{future, StreamExt};
use reqwest::{Client, Response};
use shared::{
    domain::{ConnectionId, QuestionnaireId, UserId},
    error::{ApiError, ApiException},
    protocol::{
        ConnectionRecord, ConnectionStats, DeclineRequest, QuestionnaireLink,
        SendQuestionnaireRequest, ServerEvent,
    },
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use url::Url;

use crate::{
    error::SourceError,
    source::{ChangeNotice, ChangeStream, ConnectionSource},
};

/// Talks to the HTTP server for reads and transitions and to `/ws` for
/// change notifications.
pub struct RemoteSource {
    http: Client,
    server_url: String,
}

impl RemoteSource {
    pub fn new(server_url: impl Into<String>) -> Result<Self> {
        let server_url = server_url.into().trim_end_matches('/').to_string();
        if !(server_url.starts_with("http://") || server_url.starts_with("https://")) {
            return Err(SourceError::InvalidServerUrl(server_url).into());
        }
        Ok(Self {
            http: Client::new(),
            server_url,
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// `http(s)://host/...` becomes `ws(s)://host/ws?user_id=..`.
    pub fn ws_url(&self, user_id: UserId) -> Result<Url> {
        let mut url = Url::parse(&self.server_url)
            .with_context(|| format!("invalid server url: {}", self.server_url))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| SourceError::InvalidServerUrl(self.server_url.clone()))?;
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}/ws"));
        url.query_pairs_mut()
            .clear()
            .append_pair("user_id", &user_id.0.to_string());
        Ok(url)
    }

    async fn post_transition(&self, path: String) -> Result<()> {
        let response = self
            .http
            .post(format!("{}{path}", self.server_url))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api) => Err(SourceError::Api(ApiException::from(api)).into()),
        Err(_) => Err(SourceError::UnexpectedStatus {
            status: status.as_u16(),
            body,
        }
        .into()),
    }
}

#[async_trait]
impl ConnectionSource for RemoteSource {
    async fn list_connections(&self, user_id: UserId) -> Result<Vec<ConnectionRecord>> {
        let response = self
            .http
            .get(format!("{}/users/{}/connections", self.server_url, user_id.0))
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    async fn connection_stats(&self, user_id: UserId) -> Result<ConnectionStats> {
        let response = self
            .http
            .get(format!(
                "{}/users/{}/connections/stats",
                self.server_url, user_id.0
            ))
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    async fn share_contact(&self, connection_id: ConnectionId) -> Result<()> {
        self.post_transition(format!("/connections/{}/share", connection_id.0))
            .await
    }

    async fn revoke_access(&self, connection_id: ConnectionId) -> Result<()> {
        self.post_transition(format!("/connections/{}/revoke", connection_id.0))
            .await
    }

    async fn decline_connection(&self, connection_id: ConnectionId, reason: &str) -> Result<()> {
        let response = self
            .http
            .post(format!(
                "{}/connections/{}/decline",
                self.server_url, connection_id.0
            ))
            .json(&DeclineRequest {
                reason: reason.to_string(),
            })
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn reconsider_connection(&self, connection_id: ConnectionId) -> Result<()> {
        self.post_transition(format!("/connections/{}/reconsider", connection_id.0))
            .await
    }

    async fn send_questionnaire(
        &self,
        connection_id: ConnectionId,
        questionnaire_id: QuestionnaireId,
    ) -> Result<QuestionnaireLink> {
        let response = self
            .http
            .post(format!(
                "{}/connections/{}/questionnaires",
                self.server_url, connection_id.0
            ))
            .json(&SendQuestionnaireRequest { questionnaire_id })
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    async fn subscribe(&self, user_id: UserId) -> Result<ChangeStream> {
        let ws_url = self.ws_url(user_id)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        info!(user_id = user_id.0, "feed: change subscription open");
        let (_, ws_reader) = ws_stream.split();

        let notices = ws_reader
            .take_while(|msg| {
                let open = match msg {
                    Ok(Message::Close(_)) => false,
                    Ok(_) => true,
                    Err(err) => {
                        warn!(%err, "feed: websocket receive failed");
                        false
                    }
                };
                future::ready(open)
            })
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => notice_from_text(&text),
                    _ => None,
                })
            });
        Ok(notices.boxed())
    }
}

fn notice_from_text(text: &str) -> Option<ChangeNotice> {
    match serde_json::from_str::<ServerEvent>(text) {
        Ok(ServerEvent::ConnectionChanged { connection_id, .. }) => {
            Some(ChangeNotice::Changed(connection_id))
        }
        Ok(ServerEvent::Resync) => Some(ChangeNotice::Resync),
        Ok(ServerEvent::Error(err)) => {
            warn!(code = err.code.as_str(), message = %err.message, "feed: server reported error");
            None
        }
        Err(err) => {
            warn!(%err, "feed: invalid server event");
            None
        }
    }
}
