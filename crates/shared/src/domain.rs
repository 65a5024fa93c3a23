use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConnectionId);
id_newtype!(OpportunityId);
id_newtype!(QuestionnaireId);
id_newtype!(QuestionnaireLinkId);

/// Decline reason written by a revoke. Also how a revoked record is told
/// apart from an ordinary decline.
pub const REVOKED_DECLINE_REASON: &str = "Access revoked by user";

/// Lifecycle status in display vocabulary.
///
/// The store keeps `accepted | pending | rejected`; translation happens only
/// through [`ConnectionStatus::from_store`] and [`ConnectionStatus::as_store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Active,
    Pending,
    Declined,
}

impl ConnectionStatus {
    pub const ALL: [ConnectionStatus; 3] = [
        ConnectionStatus::Active,
        ConnectionStatus::Pending,
        ConnectionStatus::Declined,
    ];

    /// Total mapping from the store vocabulary. Unknown values are declined.
    pub fn from_store(raw: &str) -> Self {
        match raw {
            "accepted" => ConnectionStatus::Active,
            "pending" => ConnectionStatus::Pending,
            _ => ConnectionStatus::Declined,
        }
    }

    pub fn as_store(self) -> &'static str {
        match self {
            ConnectionStatus::Active => "accepted",
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Declined => "rejected",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ConnectionStatus::Active => "Active",
            ConnectionStatus::Pending => "Pending",
            ConnectionStatus::Declined => "Declined",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Direct,
    Questionnaire,
}

impl RequestType {
    pub fn from_store(raw: &str) -> Option<Self> {
        match raw {
            "direct" => Some(RequestType::Direct),
            "questionnaire" => Some(RequestType::Questionnaire),
            _ => None,
        }
    }

    pub fn as_store(self) -> &'static str {
        match self {
            RequestType::Direct => "direct",
            RequestType::Questionnaire => "questionnaire",
        }
    }
}

/// Whether a declined connection may be moved back to pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconsiderPolicy {
    /// Any declined connection can be reopened, revoked ones included.
    #[default]
    AllowAll,
    /// Revoked connections stay closed; ordinary declines can be reopened.
    DeclinedOnly,
}

impl ReconsiderPolicy {
    pub fn permits(self, decline_reason: Option<&str>) -> bool {
        decline_reason.is_none() || decline_reason != self.protected_reason()
    }

    /// Decline reason whose rows this policy keeps closed, if any.
    pub fn protected_reason(self) -> Option<&'static str> {
        match self {
            ReconsiderPolicy::AllowAll => None,
            ReconsiderPolicy::DeclinedOnly => Some(REVOKED_DECLINE_REASON),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "allow_all" | "allow-all" | "all" => Some(ReconsiderPolicy::AllowAll),
            "declined_only" | "declined-only" => Some(ReconsiderPolicy::DeclinedOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub user_id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunitySummary {
    pub opportunity_id: OpportunityId,
    pub title: String,
}
