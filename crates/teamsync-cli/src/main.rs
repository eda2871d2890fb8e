//! TeamSync CLI - session status, sign-in, and cached reads from the terminal.
//!
//! Every command boots the same context a GUI would: restore the persisted
//! session, reconcile it with the stored credential, then act.

use std::io;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use teamsync_core::cache::Query;
use teamsync_core::models::ConnectionStatus;
use teamsync_core::utils::truncate_string;
use teamsync_core::{AppContext, Config};

const USAGE: &str = "\
Usage: teamsync <command>

Commands:
  status                 Show who is signed in
  login <email>          Sign in (prompts for the password)
  logout                 Sign out and forget stored credentials
  read <query> [arg]     Fetch through the cache and print JSON

Queries:
  connections [pending|accepted|rejected]
  pending | sent | stats
  teams | team <id> | members <team-id>
  projects [team-id] | project <id>
  feed | post <id> | comments <post-id>
  user <username>";

/// Characters of the bio shown by `status`
const BIO_PREVIEW_LEN: usize = 60;

/// Log file name prefix inside `log_dir`
const LOG_FILE_PREFIX: &str = "teamsync.log";

/// Initialize the tracing subscriber for logging.
///
/// Stderr always; a daily-rolling file as well when `log_dir` is set. The
/// returned guard flushes the file writer on drop.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let config = Config::load()?;
    let _guard = init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    info!(command = %command, "TeamSync CLI starting");
    let ctx = AppContext::from_config(config)?;
    let report = ctx.boot().await;
    if report.timed_out {
        eprintln!("Could not confirm the saved session in time; continuing signed out.");
    }

    match command.as_str() {
        "status" => status(&ctx),
        "login" => {
            let email = args.get(1).context("login needs an email address")?;
            login(&ctx, email).await
        }
        "logout" => {
            ctx.logout();
            println!("Signed out.");
            Ok(())
        }
        "read" => {
            let query = parse_query(&args[1..])?;
            read(&ctx, &query).await
        }
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
}

fn status(ctx: &AppContext) -> Result<()> {
    let state = ctx.session().state();
    match state.identity {
        Some(identity) if state.authenticated => {
            println!("Signed in as {} (@{})", identity.display_name(), identity.username);
            if let Some(bio) = identity.bio.as_deref().filter(|b| !b.is_empty()) {
                println!("  {}", truncate_string(bio, BIO_PREVIEW_LEN));
            }
            println!("Credential store: {}", ctx.session().credentials().backend_label());
        }
        _ => println!("Not signed in."),
    }
    Ok(())
}

async fn login(ctx: &AppContext, email: &str) -> Result<()> {
    let password = rpassword::prompt_password("Password: ")?;
    let identity = ctx.sign_in(email, &password).await?;
    println!("Signed in as {} (@{})", identity.display_name(), identity.username);
    Ok(())
}

async fn read(ctx: &AppContext, query: &Query) -> Result<()> {
    if !ctx.session().is_authenticated() {
        bail!("Not signed in. Run `teamsync login <email>` first.");
    }
    let value = ctx
        .query(query)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))
        .with_context(|| format!("Failed to read {}", query.key()))?;
    println!("{}", serde_json::to_string_pretty(value.as_ref())?);
    Ok(())
}

fn parse_query(args: &[String]) -> Result<Query> {
    let kind = args.first().map(String::as_str).context("read needs a query name")?;
    let arg = args.get(1).cloned();
    let required = |what: &str| arg.clone().with_context(|| format!("{} needs {}", kind, what));

    let query = match kind {
        "connections" => Query::Connections {
            status: match arg.as_deref() {
                None | Some("accepted") => ConnectionStatus::Accepted,
                Some("pending") => ConnectionStatus::Pending,
                Some("rejected") => ConnectionStatus::Rejected,
                Some(other) => bail!("Unknown connection status '{}'", other),
            },
            page: 1,
        },
        "pending" => Query::PendingRequests { page: 1 },
        "sent" => Query::SentRequests { page: 1 },
        "stats" => Query::ConnectionStats,
        "teams" => Query::Teams { page: 1 },
        "team" => Query::Team { id: required("a team id")? },
        "members" => Query::TeamMembers {
            team_id: required("a team id")?,
            page: 1,
        },
        "projects" => Query::Projects {
            team_id: arg.clone(),
            page: 1,
        },
        "project" => Query::Project { id: required("a project id")? },
        "feed" => Query::Feed { page: 1 },
        "post" => Query::Post { id: required("a post id")? },
        "comments" => Query::Comments {
            post_id: required("a post id")?,
            page: 1,
        },
        "user" => Query::UserProfile {
            username: required("a username")?,
        },
        other => bail!("Unknown query '{}'", other),
    };
    Ok(query)
}
