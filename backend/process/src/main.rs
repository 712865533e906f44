use chrono::Utc;
use clap::{Parser, Subcommand};
use server::{config::Config, state::AppState};
use tracing_subscriber::{EnvFilter, fmt};

use process::utils::{hours_ago, minutes_ago};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Settle orders whose card payment finished without the webhook reaching us
    Pending {
        #[arg(long, default_value_t = 30)]
        older_than_minutes: u32,

        #[arg(long)]
        dry_run: bool,
    },

    /// Move abandoned drafts to error
    Drafts {
        #[arg(long, default_value_t = 24)]
        older_than_hours: u32,

        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let state = AppState::new(Config::load()?).await?;
    let now = Utc::now();

    let summary = match args.command {
        Command::Pending {
            older_than_minutes,
            dry_run,
        } => {
            process::reconcile_pending(
                state.store.as_ref(),
                state.payments.as_ref(),
                minutes_ago(now, older_than_minutes),
                dry_run,
            )
            .await?
        }
        Command::Drafts {
            older_than_hours,
            dry_run,
        } => process::expire_drafts(state.store.as_ref(), hours_ago(now, older_than_hours), dry_run).await?,
    };

    println!("\n{summary}");
    Ok(())
}
