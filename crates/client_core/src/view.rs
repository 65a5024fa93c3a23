use std::{
    collections::{BTreeSet, HashSet},
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::Result;
use shared::{
    domain::{ConnectionId, ConnectionStatus, QuestionnaireId, ReconsiderPolicy},
    protocol::ConnectionStats,
};
use tracing::{info, warn};

use crate::{error::describe_failure, reshape::Connection, source::ConnectionSource};

pub const GENERIC_ERROR_MESSAGE: &str = "Something went wrong. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionTab {
    #[default]
    Active,
    Pending,
    Declined,
}

impl ConnectionTab {
    pub const ALL: [ConnectionTab; 3] = [
        ConnectionTab::Active,
        ConnectionTab::Pending,
        ConnectionTab::Declined,
    ];

    pub fn status(self) -> ConnectionStatus {
        match self {
            ConnectionTab::Active => ConnectionStatus::Active,
            ConnectionTab::Pending => ConnectionStatus::Pending,
            ConnectionTab::Declined => ConnectionStatus::Declined,
        }
    }

    pub fn empty_message(self) -> &'static str {
        match self {
            ConnectionTab::Active => "No active connections yet.",
            ConnectionTab::Pending => "No pending connection requests.",
            ConnectionTab::Declined => "No declined connection requests in your history.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal,
    Medium,
    High,
}

impl Priority {
    pub fn from_waiting_days(waiting_days: Option<i64>) -> Self {
        match waiting_days.unwrap_or(0) {
            d if d >= 7 => Priority::High,
            d if d >= 3 => Priority::Medium,
            _ => Priority::Normal,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Priority::High => "High",
            Priority::Medium => "Medium",
            Priority::Normal => "Normal",
        }
    }
}

pub fn priority(connection: &Connection) -> Priority {
    Priority::from_waiting_days(connection.waiting_days)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    Share,
    Revoke,
    Decline,
    Reconsider,
    SendQuestionnaire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Affordance {
    pub action: ConnectionAction,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmDialog {
    Revoke { id: ConnectionId },
    Decline { id: ConnectionId, reason: String },
}

impl ConfirmDialog {
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            ConfirmDialog::Revoke { id } | ConfirmDialog::Decline { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastKind {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub kind: ToastKind,
    pub message: String,
}

impl Toast {
    fn success(message: impl Into<String>) -> Self {
        Self {
            kind: ToastKind::Success,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            kind: ToastKind::Error,
            message: message.into(),
        }
    }
}

/// One service call the view asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Share(ConnectionId),
    Revoke(ConnectionId),
    Decline {
        id: ConnectionId,
        reason: String,
    },
    Reconsider(ConnectionId),
    SendQuestionnaire {
        id: ConnectionId,
        questionnaire_id: QuestionnaireId,
    },
}

impl Intent {
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            Intent::Share(id)
            | Intent::Revoke(id)
            | Intent::Reconsider(id)
            | Intent::Decline { id, .. }
            | Intent::SendQuestionnaire { id, .. } => *id,
        }
    }

    fn success_message(&self) -> &'static str {
        match self {
            Intent::Share(_) => "Contact shared",
            Intent::Revoke(_) => "Access revoked",
            Intent::Decline { .. } => "Connection declined",
            Intent::Reconsider(_) => "Connection moved back to pending",
            Intent::SendQuestionnaire { .. } => "Questionnaire sent",
        }
    }

    async fn execute(&self, source: &dyn ConnectionSource) -> Result<()> {
        match self {
            Intent::Share(id) => source.share_contact(*id).await,
            Intent::Revoke(id) => source.revoke_access(*id).await,
            Intent::Decline { id, reason } => source.decline_connection(*id, reason).await,
            Intent::Reconsider(id) => source.reconsider_connection(*id).await,
            Intent::SendQuestionnaire {
                id,
                questionnaire_id,
            } => source
                .send_questionnaire(*id, *questionnaire_id)
                .await
                .map(|_| ()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub intent: Intent,
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkReport {
    pub succeeded: Vec<ConnectionId>,
    pub failed: Vec<(ConnectionId, String)>,
}

impl BulkReport {
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

#[derive(Clone, Default)]
struct BusyRows(Arc<Mutex<HashSet<ConnectionId>>>);

impl BusyRows {
    fn contains(&self, id: ConnectionId) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    /// `None` if the row is already busy.
    fn mark(&self, id: ConnectionId) -> Option<BusyGuard> {
        let inserted = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        inserted.then(|| BusyGuard {
            rows: self.clone(),
            id,
        })
    }
}

struct BusyGuard {
    rows: BusyRows,
    id: ConnectionId,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.rows
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// A single pending service call. The row stays busy until the ticket has
/// run or is dropped.
pub struct ActionTicket {
    intent: Intent,
    source: Arc<dyn ConnectionSource>,
    _busy: BusyGuard,
}

impl ActionTicket {
    pub fn intent(&self) -> &Intent {
        &self.intent
    }

    pub async fn run(self) -> ActionOutcome {
        let id = self.intent.connection_id();
        let error = match self.intent.execute(self.source.as_ref()).await {
            Ok(()) => {
                info!(connection_id = id.0, intent = ?self.intent, "view: action succeeded");
                None
            }
            Err(err) => {
                warn!(connection_id = id.0, intent = ?self.intent, error = %err, "view: action failed");
                Some(describe_failure(&err))
            }
        };
        ActionOutcome {
            intent: self.intent,
            error,
        }
    }
}

/// Sequential revoke of a selection. Each row is released as soon as its
/// own call completes; earlier successes are kept when a later one fails.
pub struct BulkTicket {
    rows: Vec<(ConnectionId, BusyGuard)>,
    source: Arc<dyn ConnectionSource>,
}

impl BulkTicket {
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.rows.iter().map(|(id, _)| *id).collect()
    }

    pub async fn run(self) -> BulkReport {
        let mut report = BulkReport::default();
        for (id, busy) in self.rows {
            match self.source.revoke_access(id).await {
                Ok(()) => report.succeeded.push(id),
                Err(err) => {
                    warn!(connection_id = id.0, error = %err, "view: bulk revoke item failed");
                    report.failed.push((id, describe_failure(&err)));
                }
            }
            drop(busy);
        }
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "view: bulk revoke finished"
        );
        report
    }
}

pub fn filter_by_tab<'a, I>(connections: I, tab: ConnectionTab) -> Vec<&'a Connection>
where
    I: IntoIterator<Item = &'a Connection>,
{
    let status = tab.status();
    connections
        .into_iter()
        .filter(|c| c.status == status)
        .collect()
}

/// Case-insensitive substring match on counterparty name, counterparty
/// company and opportunity title. A blank query matches everything.
pub fn filter_by_search<'a, I>(connections: I, query: &str) -> Vec<&'a Connection>
where
    I: IntoIterator<Item = &'a Connection>,
{
    let needle = query.trim().to_lowercase();
    connections
        .into_iter()
        .filter(|c| needle.is_empty() || matches_search(c, &needle))
        .collect()
}

fn matches_search(connection: &Connection, needle: &str) -> bool {
    let contains = |field: &str| field.to_lowercase().contains(needle);
    contains(&connection.counterparty.name)
        || connection.counterparty.company.as_deref().is_some_and(contains)
        || connection
            .opportunity
            .as_ref()
            .is_some_and(|o| contains(&o.title))
}

pub fn tab_label(tab: ConnectionTab, stats: &ConnectionStats) -> String {
    format!("{} ({})", tab.status().label(), stats.count(tab.status()))
}

pub struct ConnectionsView {
    source: Arc<dyn ConnectionSource>,
    policy: ReconsiderPolicy,
    tab: ConnectionTab,
    search: String,
    selection: BTreeSet<ConnectionId>,
    dialog: Option<ConfirmDialog>,
    busy: BusyRows,
    toasts: Vec<Toast>,
}

impl ConnectionsView {
    pub fn new(source: Arc<dyn ConnectionSource>, policy: ReconsiderPolicy) -> Self {
        Self {
            source,
            policy,
            tab: ConnectionTab::default(),
            search: String::new(),
            selection: BTreeSet::new(),
            dialog: None,
            busy: BusyRows::default(),
            toasts: Vec::new(),
        }
    }

    pub fn tab(&self) -> ConnectionTab {
        self.tab
    }

    pub fn set_tab(&mut self, tab: ConnectionTab) {
        if self.tab != tab {
            self.selection.clear();
            self.dialog = None;
        }
        self.tab = tab;
    }

    pub fn search(&self) -> &str {
        &self.search
    }

    pub fn set_search(&mut self, query: impl Into<String>) {
        self.search = query.into();
    }

    pub fn visible<'a>(&self, connections: &'a [Connection]) -> Vec<&'a Connection> {
        filter_by_search(filter_by_tab(connections, self.tab), &self.search)
    }

    pub fn tab_labels(&self, stats: &ConnectionStats) -> Vec<(ConnectionTab, String)> {
        ConnectionTab::ALL
            .into_iter()
            .map(|tab| (tab, tab_label(tab, stats)))
            .collect()
    }

    pub fn empty_message(&self) -> String {
        let query = self.search.trim();
        if query.is_empty() {
            self.tab.empty_message().to_string()
        } else {
            format!("No connections match \"{query}\".")
        }
    }

    /// Only active connections can be selected, and only from the Active tab.
    pub fn toggle_selected(&mut self, connection: &Connection) -> bool {
        if self.tab != ConnectionTab::Active || connection.status != ConnectionStatus::Active {
            return false;
        }
        if !self.selection.remove(&connection.id) {
            self.selection.insert(connection.id);
        }
        true
    }

    pub fn select_all_visible(&mut self, connections: &[Connection]) {
        if self.tab != ConnectionTab::Active {
            return;
        }
        let ids: Vec<ConnectionId> = self.visible(connections).iter().map(|c| c.id).collect();
        self.selection.extend(ids);
    }

    pub fn selection(&self) -> Vec<ConnectionId> {
        self.selection.iter().copied().collect()
    }

    pub fn is_selected(&self, id: ConnectionId) -> bool {
        self.selection.contains(&id)
    }

    /// Drops selected ids that are no longer active in `connections`.
    pub fn sync_selection(&mut self, connections: &[Connection]) {
        self.selection.retain(|id| {
            connections
                .iter()
                .any(|c| c.id == *id && c.status == ConnectionStatus::Active)
        });
    }

    pub fn is_busy(&self, id: ConnectionId) -> bool {
        self.busy.contains(id)
    }

    pub fn can_reconsider(&self, connection: &Connection) -> bool {
        connection.status == ConnectionStatus::Declined
            && self.policy.permits(connection.decline_reason.as_deref())
    }

    pub fn affordances(&self, connection: &Connection) -> Vec<Affordance> {
        let actions: &[ConnectionAction] = match connection.status {
            ConnectionStatus::Active => {
                &[ConnectionAction::Revoke, ConnectionAction::SendQuestionnaire]
            }
            ConnectionStatus::Pending => &[
                ConnectionAction::Share,
                ConnectionAction::Decline,
                ConnectionAction::SendQuestionnaire,
            ],
            ConnectionStatus::Declined if self.can_reconsider(connection) => {
                &[ConnectionAction::Reconsider]
            }
            ConnectionStatus::Declined => &[],
        };
        let enabled = !self.is_busy(connection.id);
        actions
            .iter()
            .map(|&action| Affordance { action, enabled })
            .collect()
    }

    pub fn dialog(&self) -> Option<&ConfirmDialog> {
        self.dialog.as_ref()
    }

    pub fn request_revoke(&mut self, id: ConnectionId) {
        self.dialog = Some(ConfirmDialog::Revoke { id });
    }

    pub fn request_decline(&mut self, id: ConnectionId) {
        self.dialog = Some(ConfirmDialog::Decline {
            id,
            reason: String::new(),
        });
    }

    pub fn set_decline_reason(&mut self, text: impl Into<String>) {
        if let Some(ConfirmDialog::Decline { reason, .. }) = self.dialog.as_mut() {
            *reason = text.into();
        }
    }

    pub fn cancel_dialog(&mut self) {
        self.dialog = None;
    }

    /// Closes the open dialog and hands out its call. `None` when no dialog
    /// is open or the row is already busy.
    pub fn confirm_dialog(&mut self) -> Option<ActionTicket> {
        let intent = match self.dialog.take()? {
            ConfirmDialog::Revoke { id } => Intent::Revoke(id),
            ConfirmDialog::Decline { id, reason } => Intent::Decline { id, reason },
        };
        self.ticket(intent)
    }

    pub fn share(&mut self, id: ConnectionId) -> Option<ActionTicket> {
        self.ticket(Intent::Share(id))
    }

    pub fn reconsider(&mut self, connection: &Connection) -> Option<ActionTicket> {
        if !self.can_reconsider(connection) {
            return None;
        }
        self.ticket(Intent::Reconsider(connection.id))
    }

    pub fn send_questionnaire(
        &mut self,
        id: ConnectionId,
        questionnaire_id: QuestionnaireId,
    ) -> Option<ActionTicket> {
        self.ticket(Intent::SendQuestionnaire {
            id,
            questionnaire_id,
        })
    }

    /// Revoke every selected connection that is still active in
    /// `connections`. Rows that are already busy are left out.
    pub fn bulk_revoke(&mut self, connections: &[Connection]) -> Option<BulkTicket> {
        self.sync_selection(connections);
        if self.tab != ConnectionTab::Active || self.selection.is_empty() {
            return None;
        }
        let rows: Vec<(ConnectionId, BusyGuard)> = self
            .selection
            .iter()
            .filter_map(|&id| self.busy.mark(id).map(|guard| (id, guard)))
            .collect();
        if rows.is_empty() {
            return None;
        }
        Some(BulkTicket {
            rows,
            source: Arc::clone(&self.source),
        })
    }

    fn ticket(&mut self, intent: Intent) -> Option<ActionTicket> {
        let busy = self.busy.mark(intent.connection_id())?;
        Some(ActionTicket {
            intent,
            source: Arc::clone(&self.source),
            _busy: busy,
        })
    }

    pub fn apply_outcome(&mut self, outcome: &ActionOutcome) -> &Toast {
        let toast = match &outcome.error {
            None => {
                if let Intent::Revoke(id) = &outcome.intent {
                    self.selection.remove(id);
                }
                Toast::success(outcome.intent.success_message())
            }
            Some(_) => Toast::error(GENERIC_ERROR_MESSAGE),
        };
        self.push_toast(toast)
    }

    pub fn apply_bulk_report(&mut self, report: &BulkReport) -> &Toast {
        for id in &report.succeeded {
            self.selection.remove(id);
        }
        let toast = if report.failed.is_empty() {
            Toast::success(format!(
                "Access revoked for {} connection{}",
                report.succeeded.len(),
                if report.succeeded.len() == 1 { "" } else { "s" }
            ))
        } else {
            Toast::error(format!(
                "Revoked {} of {} connections. {} failed.",
                report.succeeded.len(),
                report.attempted(),
                report.failed.len()
            ))
        };
        self.push_toast(toast)
    }

    /// Runs the ticket and applies its outcome in one go.
    pub async fn perform(&mut self, ticket: ActionTicket) -> ActionOutcome {
        let outcome = ticket.run().await;
        self.apply_outcome(&outcome);
        outcome
    }

    pub async fn perform_bulk_revoke(&mut self, connections: &[Connection]) -> Option<BulkReport> {
        let ticket = self.bulk_revoke(connections)?;
        let report = ticket.run().await;
        self.apply_bulk_report(&report);
        Some(report)
    }

    pub fn toasts(&self) -> &[Toast] {
        &self.toasts
    }

    pub fn take_toasts(&mut self) -> Vec<Toast> {
        std::mem::take(&mut self.toasts)
    }

    fn push_toast(&mut self, toast: Toast) -> &Toast {
        self.toasts.push(toast);
        &self.toasts[self.toasts.len() - 1]
    }
}

#[cfg(test)]
#[path = "tests/view_tests.rs"]
mod tests;
