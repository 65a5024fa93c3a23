use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ConnectionId, ConnectionStatus, OpportunitySummary, ProfileSummary, QuestionnaireId,
        QuestionnaireLinkId, UserId,
    },
    error::ApiError,
};

/// A connection row as the store returns it: both participants joined with
/// their profile summary, status still in store vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub connection_id: ConnectionId,
    pub requester: ProfileSummary,
    pub responder: ProfileSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opportunity: Option<OpportunitySummary>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decline_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub active: u64,
    pub pending: u64,
    pub declined: u64,
    pub total: u64,
}

impl ConnectionStats {
    pub fn record(&mut self, status: ConnectionStatus, count: u64) {
        match status {
            ConnectionStatus::Active => self.active += count,
            ConnectionStatus::Pending => self.pending += count,
            ConnectionStatus::Declined => self.declined += count,
        }
        self.total += count;
    }

    pub fn count(&self, status: ConnectionStatus) -> u64 {
        match status {
            ConnectionStatus::Active => self.active,
            ConnectionStatus::Pending => self.pending,
            ConnectionStatus::Declined => self.declined,
        }
    }
}

impl FromIterator<ConnectionStatus> for ConnectionStats {
    fn from_iter<I: IntoIterator<Item = ConnectionStatus>>(iter: I) -> Self {
        let mut stats = ConnectionStats::default();
        for status in iter {
            stats.record(status, 1);
        }
        stats
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionnaireLink {
    pub link_id: QuestionnaireLinkId,
    pub connection_id: ConnectionId,
    pub questionnaire_id: QuestionnaireId,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeclineRequest {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendQuestionnaireRequest {
    pub questionnaire_id: QuestionnaireId,
}

/// Pushed over `/ws`. Consumers treat `ConnectionChanged` as a reload
/// trigger, never as delta data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    ConnectionChanged {
        connection_id: ConnectionId,
        requester_id: UserId,
        responder_id: UserId,
    },
    /// Some notifications were dropped; reload everything.
    Resync,
    Error(ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_total_tracks_every_recorded_status() {
        let stats: ConnectionStats = [
            ConnectionStatus::Pending,
            ConnectionStatus::Pending,
            ConnectionStatus::Active,
        ]
        .into_iter()
        .collect();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.declined, 0);
        assert_eq!(stats.total, stats.active + stats.pending + stats.declined);
    }

    #[test]
    fn server_event_uses_tagged_payload() {
        let event = ServerEvent::ConnectionChanged {
            connection_id: ConnectionId(7),
            requester_id: UserId(1),
            responder_id: UserId(2),
        };
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["type"], "connection_changed");
        assert_eq!(json["payload"]["connection_id"], 7);
    }
}
