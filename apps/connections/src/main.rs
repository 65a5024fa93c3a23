use std::{
    io::{self, BufRead, Write},
    sync::Arc,
};

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{
    ActionTicket, Connection, ConnectionFeed, ConnectionSource, ConnectionTab, ConnectionsView,
    FeedEvent, FeedSnapshot, RemoteSource, ToastKind,
};
use shared::domain::{ConnectionId, QuestionnaireId, ReconsiderPolicy, UserId};
use tracing::{info, warn};

mod render;

#[derive(Parser, Debug)]
#[command(about = "Manage connection requests from the terminal")]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    /// Viewer whose connections are shown.
    #[arg(long)]
    user_id: i64,
    /// Must match the server's setting so reconsider is offered correctly.
    #[arg(long, default_value = "allow_all", value_parser = parse_policy)]
    reconsider_policy: ReconsiderPolicy,
    /// Skip confirmation prompts.
    #[arg(long, short = 'y')]
    yes: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TabArg {
    Active,
    Pending,
    Declined,
}

impl From<TabArg> for ConnectionTab {
    fn from(value: TabArg) -> Self {
        match value {
            TabArg::Active => ConnectionTab::Active,
            TabArg::Pending => ConnectionTab::Pending,
            TabArg::Declined => ConnectionTab::Declined,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    List {
        #[arg(long, value_enum, default_value = "active")]
        tab: TabArg,
        #[arg(long, default_value = "")]
        search: String,
    },
    Stats,
    Share {
        connection_id: i64,
    },
    Revoke {
        connection_id: i64,
    },
    Decline {
        connection_id: i64,
        #[arg(long, default_value = "")]
        reason: String,
    },
    Reconsider {
        connection_id: i64,
    },
    SendQuestionnaire {
        connection_id: i64,
        questionnaire_id: i64,
    },
    /// Revoke several active connections one after another.
    BulkRevoke {
        #[arg(required = true)]
        connection_ids: Vec<i64>,
    },
    /// Keep the list on screen and redraw it on every change.
    Watch {
        #[arg(long, value_enum, default_value = "pending")]
        tab: TabArg,
        #[arg(long, default_value = "")]
        search: String,
    },
}

fn parse_policy(raw: &str) -> Result<ReconsiderPolicy, String> {
    ReconsiderPolicy::parse(raw)
        .ok_or_else(|| format!("unknown reconsider policy '{raw}' (allow_all | declined_only)"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();
    let args = Args::parse();

    let source: Arc<dyn ConnectionSource> = Arc::new(RemoteSource::new(&args.server_url)?);
    let viewer = UserId(args.user_id);
    let mut view = ConnectionsView::new(Arc::clone(&source), args.reconsider_policy);

    match args.command {
        Command::List { tab, search } => {
            let feed = ConnectionFeed::start(source, viewer).await?;
            view.set_tab(tab.into());
            view.set_search(search);
            println!("{}", render::screen(&view, &feed.snapshot().await));
        }
        Command::Stats => {
            let stats = source.connection_stats(viewer).await?;
            println!("{}", render::stats_block(&stats));
        }
        Command::Share { connection_id } => {
            let ticket = view.share(ConnectionId(connection_id));
            run_ticket(&mut view, ticket).await?;
        }
        Command::Revoke { connection_id } => {
            let id = ConnectionId(connection_id);
            view.request_revoke(id);
            if confirm(args.yes, &format!("Revoke access for connection {id}?"))? {
                let ticket = view.confirm_dialog();
                run_ticket(&mut view, ticket).await?;
            } else {
                view.cancel_dialog();
                println!("cancelled");
            }
        }
        Command::Decline {
            connection_id,
            reason,
        } => {
            let id = ConnectionId(connection_id);
            view.request_decline(id);
            view.set_decline_reason(reason);
            if confirm(args.yes, &format!("Decline connection {id}?"))? {
                let ticket = view.confirm_dialog();
                run_ticket(&mut view, ticket).await?;
            } else {
                view.cancel_dialog();
                println!("cancelled");
            }
        }
        Command::Reconsider { connection_id } => {
            let feed = ConnectionFeed::start(Arc::clone(&source), viewer).await?;
            let snapshot = feed.snapshot().await;
            let connection = find(&snapshot, ConnectionId(connection_id))?;
            if !view.can_reconsider(connection) {
                bail!("connection {connection_id} cannot be reconsidered");
            }
            let ticket = view.reconsider(connection);
            run_ticket(&mut view, ticket).await?;
        }
        Command::SendQuestionnaire {
            connection_id,
            questionnaire_id,
        } => {
            let ticket = view.send_questionnaire(
                ConnectionId(connection_id),
                QuestionnaireId(questionnaire_id),
            );
            run_ticket(&mut view, ticket).await?;
        }
        Command::BulkRevoke { connection_ids } => {
            bulk_revoke(&mut view, source, viewer, &connection_ids, args.yes).await?;
        }
        Command::Watch { tab, search } => {
            view.set_tab(tab.into());
            view.set_search(search);
            watch(&view, source, viewer).await?;
        }
    }

    Ok(())
}

fn find(snapshot: &FeedSnapshot, id: ConnectionId) -> Result<&Connection> {
    if let Some(error) = snapshot.error.as_deref() {
        bail!("could not load connections: {error}");
    }
    snapshot
        .connections
        .iter()
        .find(|c| c.id == id)
        .ok_or_else(|| anyhow!("connection {id} is not one of yours"))
}

fn confirm(assume_yes: bool, question: &str) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    print!("{question} [y/N] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

async fn run_ticket(view: &mut ConnectionsView, ticket: Option<ActionTicket>) -> Result<()> {
    let Some(ticket) = ticket else {
        bail!("nothing to do");
    };
    let outcome = view.perform(ticket).await;
    report_toasts(view);
    match outcome.error {
        None => Ok(()),
        Some(reason) => Err(anyhow!(reason)),
    }
}

fn report_toasts(view: &mut ConnectionsView) {
    for toast in view.take_toasts() {
        match toast.kind {
            ToastKind::Success => println!("{}", render::toast(&toast)),
            ToastKind::Error => eprintln!("{}", render::toast(&toast)),
        }
    }
}

async fn bulk_revoke(
    view: &mut ConnectionsView,
    source: Arc<dyn ConnectionSource>,
    viewer: UserId,
    ids: &[i64],
    assume_yes: bool,
) -> Result<()> {
    let feed = ConnectionFeed::start(source, viewer).await?;
    let snapshot = feed.snapshot().await;
    view.set_tab(ConnectionTab::Active);
    for &raw in ids {
        let connection = find(&snapshot, ConnectionId(raw))?;
        if !view.toggle_selected(connection) {
            bail!("connection {raw} is not active");
        }
    }
    if !confirm(
        assume_yes,
        &format!("Revoke access for {} connections?", view.selection().len()),
    )? {
        println!("cancelled");
        return Ok(());
    }

    let Some(report) = view.perform_bulk_revoke(&snapshot.connections).await else {
        bail!("nothing selected");
    };
    for (id, reason) in &report.failed {
        eprintln!("  {id}: {reason}");
    }
    report_toasts(view);
    if report.failed.is_empty() {
        Ok(())
    } else {
        bail!("{} of {} revokes failed", report.failed.len(), report.attempted())
    }
}

async fn watch(view: &ConnectionsView, source: Arc<dyn ConnectionSource>, viewer: UserId) -> Result<()> {
    let feed = ConnectionFeed::start(source, viewer).await?;
    let mut events = feed.events();
    println!("{}", render::screen(view, &feed.snapshot().await));
    info!(user_id = viewer.0, "watching connections; ctrl-c to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(FeedEvent::Updated { .. }) | Ok(FeedEvent::Failed { .. }) => {
                    println!();
                    println!("{}", render::screen(view, &feed.snapshot().await));
                }
                Ok(FeedEvent::Loading { .. }) => {}
                Ok(FeedEvent::SubscriptionEnded) => {
                    warn!("change stream closed by server");
                    break;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "missed feed events; redrawing");
                    println!("{}", render::screen(view, &feed.snapshot().await));
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    feed.stop();
    Ok(())
}
