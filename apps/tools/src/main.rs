use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use shared::domain::{ConnectionStatus, OpportunityId, RequestType, UserId};
use storage::{NewConnection, NewProfile, Storage};

/// Seeds a connection store with users, opportunities and requests.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/connections.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUser {
        username: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        avatar_url: Option<String>,
    },
    CreateOpportunity {
        owner_user_id: i64,
        title: String,
    },
    CreateQuestionnaire {
        owner_user_id: i64,
        title: String,
    },
    RequestConnection {
        requester_user_id: i64,
        responder_user_id: i64,
        #[arg(long)]
        opportunity_id: Option<i64>,
        /// direct | questionnaire
        #[arg(long)]
        request_type: Option<String>,
        /// Backdate the request, e.g. to exercise waiting-time priorities.
        #[arg(long, default_value_t = 0)]
        days_ago: i64,
        /// accepted | pending | rejected
        #[arg(long, default_value = "pending")]
        status: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUser {
            username,
            name,
            company,
            title,
            avatar_url,
        } => {
            let user_id = storage
                .create_user(&NewProfile {
                    username: &username,
                    display_name: name.as_deref(),
                    company: company.as_deref(),
                    title: title.as_deref(),
                    avatar_url: avatar_url.as_deref(),
                })
                .await?;
            println!("created user_id={user_id}");
        }
        Command::CreateOpportunity {
            owner_user_id,
            title,
        } => {
            let opportunity_id = storage
                .create_opportunity(UserId(owner_user_id), &title)
                .await?;
            println!("created opportunity_id={opportunity_id}");
        }
        Command::CreateQuestionnaire {
            owner_user_id,
            title,
        } => {
            let questionnaire_id = storage
                .create_questionnaire(UserId(owner_user_id), &title)
                .await?;
            println!("created questionnaire_id={questionnaire_id}");
        }
        Command::RequestConnection {
            requester_user_id,
            responder_user_id,
            opportunity_id,
            request_type,
            days_ago,
            status,
        } => {
            let request_type = match request_type.as_deref() {
                None => None,
                Some(raw) => match RequestType::from_store(raw) {
                    Some(kind) => Some(kind),
                    None => bail!("unknown request type '{raw}'"),
                },
            };
            if ConnectionStatus::from_store(&status).as_store() != status {
                bail!("unknown status '{status}'");
            }
            let connection_id = storage
                .create_connection(&NewConnection {
                    requester_id: UserId(requester_user_id),
                    responder_id: UserId(responder_user_id),
                    opportunity_id: opportunity_id.map(OpportunityId),
                    request_type,
                    created_at: Utc::now() - Duration::days(days_ago.max(0)),
                })
                .await?;
            if status != "pending" {
                storage.set_raw_status(connection_id, &status).await?;
            }
            println!("created connection_id={connection_id} status={status}");
        }
    }

    Ok(())
}
