use std::fmt::Write as _;

use client_core::{
    view::priority, Affordance, Connection, ConnectionAction, ConnectionsView, FeedPhase,
    FeedSnapshot, Toast, ToastKind,
};
use shared::protocol::ConnectionStats;

pub fn tabs_line(view: &ConnectionsView, stats: &ConnectionStats) -> String {
    view.tab_labels(stats)
        .into_iter()
        .map(|(tab, label)| {
            if tab == view.tab() {
                format!("[{label}]")
            } else {
                label
            }
        })
        .collect::<Vec<_>>()
        .join("  ")
}

fn action_name(action: ConnectionAction) -> &'static str {
    match action {
        ConnectionAction::Share => "share",
        ConnectionAction::Revoke => "revoke",
        ConnectionAction::Decline => "decline",
        ConnectionAction::Reconsider => "reconsider",
        ConnectionAction::SendQuestionnaire => "send-questionnaire",
    }
}

fn actions_cell(affordances: &[Affordance]) -> String {
    if affordances.is_empty() {
        return "-".to_string();
    }
    affordances
        .iter()
        .map(|a| {
            if a.enabled {
                action_name(a.action).to_string()
            } else {
                format!("({})", action_name(a.action))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

pub fn connection_row(view: &ConnectionsView, connection: &Connection) -> String {
    let company = connection.counterparty.company.as_deref().unwrap_or("-");
    let opportunity = connection
        .opportunity
        .as_ref()
        .map(|o| o.title.as_str())
        .unwrap_or("-");
    let waiting = match connection.waiting_days {
        Some(days) => format!("{days}d {}", priority(connection).label()),
        None => String::new(),
    };
    let mark = if view.is_selected(connection.id) { '*' } else { ' ' };
    let mut row = format!(
        "{mark}{:>5}  {:<24} {:<16} {:<24} {:<9} {:<12} {}",
        connection.id.0,
        connection.counterparty.name,
        company,
        opportunity,
        connection.status.label(),
        waiting,
        actions_cell(&view.affordances(connection)),
    );
    if let Some(reason) = connection.decline_reason.as_deref().filter(|r| !r.is_empty()) {
        let _ = write!(row, "\n       reason: {reason}");
    }
    row
}

pub fn screen(view: &ConnectionsView, snapshot: &FeedSnapshot) -> String {
    match snapshot.phase {
        FeedPhase::Uninitialized | FeedPhase::Loading if snapshot.generation == 0 => {
            return "Loading connections...".to_string();
        }
        FeedPhase::Error if snapshot.connections.is_empty() => {
            return format!(
                "Could not load connections: {}",
                snapshot.error.as_deref().unwrap_or("unknown error")
            );
        }
        _ => {}
    }

    let mut out = tabs_line(view, &snapshot.stats);
    out.push('\n');
    let visible = view.visible(&snapshot.connections);
    if visible.is_empty() {
        out.push_str(&view.empty_message());
        out.push('\n');
    }
    for connection in visible {
        out.push_str(&connection_row(view, connection));
        out.push('\n');
    }
    if let Some(error) = snapshot.error.as_deref() {
        let _ = write!(out, "(last refresh failed: {error})");
    }
    out.trim_end().to_string()
}

pub fn stats_block(stats: &ConnectionStats) -> String {
    format!(
        "active:   {}\npending:  {}\ndeclined: {}\ntotal:    {}",
        stats.active, stats.pending, stats.declined, stats.total
    )
}

pub fn toast(toast: &Toast) -> String {
    match toast.kind {
        ToastKind::Success => format!("ok: {}", toast.message),
        ToastKind::Error => format!("error: {}", toast.message),
    }
}
