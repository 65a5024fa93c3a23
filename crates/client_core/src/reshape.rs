use chrono::{DateTime, Utc};
use shared::{
    domain::{
        ConnectionId, ConnectionStatus, OpportunitySummary, ProfileSummary, RequestType, UserId,
        REVOKED_DECLINE_REASON,
    },
    protocol::ConnectionRecord,
};

/// The other participant, flattened for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counterparty {
    pub user_id: UserId,
    pub name: String,
    pub company: Option<String>,
    pub title: Option<String>,
    pub avatar_url: Option<String>,
}

impl From<ProfileSummary> for Counterparty {
    fn from(profile: ProfileSummary) -> Self {
        Self {
            user_id: profile.user_id,
            name: profile.name,
            company: profile.company,
            title: profile.title,
            avatar_url: profile.avatar_url,
        }
    }
}

/// A connection as one viewer sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: ConnectionId,
    pub requester_id: UserId,
    pub responder_id: UserId,
    pub self_id: UserId,
    pub counterparty: Counterparty,
    pub opportunity: Option<OpportunitySummary>,
    pub status: ConnectionStatus,
    pub request_type: Option<RequestType>,
    pub decline_reason: Option<String>,
    /// Whole days since creation; only set while pending.
    pub waiting_days: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    pub fn is_revoked(&self) -> bool {
        self.status == ConnectionStatus::Declined
            && self.decline_reason.as_deref() == Some(REVOKED_DECLINE_REASON)
    }
}

/// Resolves self and counterparty from `viewer`. A viewer who is neither
/// participant is treated as the responder.
pub fn reshape(record: ConnectionRecord, viewer: UserId, now: DateTime<Utc>) -> Connection {
    let requester_id = record.requester.user_id;
    let responder_id = record.responder.user_id;
    let counterparty = if viewer == requester_id {
        record.responder
    } else {
        record.requester
    };
    let status = ConnectionStatus::from_store(&record.status);
    let waiting_days = (status == ConnectionStatus::Pending)
        .then(|| (now - record.created_at).num_days().max(0));

    Connection {
        id: record.connection_id,
        requester_id,
        responder_id,
        self_id: viewer,
        counterparty: counterparty.into(),
        opportunity: record.opportunity,
        status,
        request_type: record.request_type.as_deref().and_then(RequestType::from_store),
        decline_reason: record.decline_reason,
        waiting_days,
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}
