//! `recall`: command-line front end over the review scheduler.

use std::error::Error;
use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand};
use recall_core::{Progress, ProgressStore, Quality, Scheduler, SessionConfig, plan_session};
use recall_store::{BackendConfig, Db};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod config;

use crate::config::{data_dir, load_config};

/// Spaced-repetition flashcard scheduler.
#[derive(Parser, Debug)]
#[command(name = "recall")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config.toml (defaults to the data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (use multiple times for more verbosity)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the schema for the configured backend
    Init,
    /// Manage flashcard sets
    #[command(subcommand)]
    Set(SetCommand),
    /// Manage cards
    #[command(subcommand)]
    Card(CardCommand),
    /// Show the cards to study now
    Due {
        #[arg(long)]
        user: String,
        #[arg(long)]
        set: Option<Uuid>,
    },
    /// Record a review (quality 0-5)
    Review {
        #[arg(long)]
        user: String,
        #[arg(long)]
        card: Uuid,
        #[arg(long, allow_hyphen_values = true)]
        quality: i64,
    },
    /// Show past reviews of a card, oldest first
    History {
        #[arg(long)]
        user: String,
        #[arg(long)]
        card: Uuid,
    },
    /// Forget all progress for a user
    Reset {
        #[arg(long)]
        user: String,
    },
}

#[derive(Subcommand, Debug)]
enum SetCommand {
    Create {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value_t = false)]
        public: bool,
    },
    List {
        #[arg(long)]
        user: String,
    },
}

#[derive(Subcommand, Debug)]
enum CardCommand {
    Add {
        #[arg(long)]
        set: Uuid,
        #[arg(long)]
        question: String,
        #[arg(long)]
        answer: String,
    },
    Delete {
        #[arg(long)]
        card: Uuid,
    },
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let data_dir = data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let config_path = cli.config.unwrap_or_else(|| data_dir.join("config.toml"));
    let config = load_config(&config_path)?;

    let backend = BackendConfig::from_env(&data_dir.join("recall.db"))?;
    debug!(config = %config_path.display(), "opening store");
    let db = backend.open()?;

    execute(&*db, cli.command, &config.session)
}

fn execute(
    db: &dyn Db,
    command: Command,
    session: &SessionConfig,
) -> Result<(), Box<dyn Error>> {
    let scheduler = Scheduler::new(db);
    match command {
        // Schema creation already ran when the backend was opened.
        Command::Init => println!("ready"),
        Command::Set(SetCommand::Create {
            owner,
            title,
            public,
        }) => {
            let set = db.create_set(&owner, &title, public)?;
            println!("{}", set.id);
        }
        Command::Set(SetCommand::List { user }) => {
            for set in db.list_sets(&user)? {
                let scope = if set.is_public { "public" } else { "private" };
                println!("{}  {:<8} {}  ({})", set.id, scope, set.title, set.owner_id);
            }
        }
        Command::Card(CardCommand::Add {
            set,
            question,
            answer,
        }) => {
            let card = db.add_card(set, &question, &answer)?;
            println!("{}", card.id);
        }
        Command::Card(CardCommand::Delete { card }) => {
            db.delete_card(card)?;
        }
        Command::Due { user, set } => {
            let due = scheduler.select_due(&user, set, Utc::now())?;
            if due.is_empty() {
                println!("nothing due");
            }
            for entry in plan_session(due, session) {
                let status = match &entry.progress {
                    Progress::New => "new".to_string(),
                    Progress::Existing(progress) => format!(
                        "rep {} / every {}d",
                        progress.repetitions, progress.interval_days
                    ),
                };
                println!("{}  {:<18} {}", entry.card.id, status, entry.card.question);
            }
        }
        Command::Review {
            user,
            card,
            quality,
        } => {
            let grade = Quality::new(quality)?.grade();
            let progress = scheduler.submit_review(&user, card, quality, Utc::now())?;
            let next = progress
                .next_review_date
                .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_default();
            println!(
                "{}: next review in {}d ({next}), ease {:.2}",
                grade.label(),
                progress.interval_days,
                progress.ease_factor
            );
        }
        Command::History { user, card } => {
            for entry in db.history(&user, card)? {
                println!(
                    "{}  q{}  {}d  ease {:.2}",
                    entry.reviewed_at.format("%Y-%m-%d %H:%M"),
                    entry.quality,
                    entry.interval_days,
                    entry.ease_factor
                );
            }
        }
        Command::Reset { user } => {
            let removed = db.delete_user_progress(&user)?;
            println!("removed {removed} progress rows");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use recall_store::MemoryStore;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn review_accepts_negative_quality_for_validation_downstream() {
        let cli = Cli::try_parse_from([
            "recall",
            "review",
            "--user",
            "u1",
            "--card",
            "67e55044-10b1-426f-9247-bb680e5fe0c8",
            "--quality",
            "-1",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Review { quality: -1, .. }));
    }

    #[test]
    fn malformed_card_id_is_rejected_by_parser() {
        let result = Cli::try_parse_from([
            "recall", "review", "--user", "u1", "--card", "nope", "--quality", "4",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn review_command_updates_progress() {
        let db = MemoryStore::new();
        let set = db.create_set("u1", "verbs", false).unwrap();
        let card = db.add_card(set.id, "lopen", "to walk").unwrap();
        let session = SessionConfig::default();

        let review = Command::Review {
            user: "u1".to_string(),
            card: card.id,
            quality: 5,
        };
        execute(&db, review, &session).unwrap();
        assert_eq!(db.get("u1", card.id).unwrap().repetitions(), 1);

        let bad = Command::Review {
            user: "u1".to_string(),
            card: card.id,
            quality: 9,
        };
        assert!(execute(&db, bad, &session).is_err());
        assert_eq!(db.history("u1", card.id).unwrap().len(), 1);
    }
}
