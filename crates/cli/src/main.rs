use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context as _, Result};
use clap::{ArgAction, Parser, Subcommand};
use strata_api::{HttpClient, StrataApi};
use strata_core::Context;
use tracing::info;

mod commands;
mod config;
mod table;

use commands::Output;
use config::{CliConfig, CliContext};

#[derive(Parser, Debug)]
#[command(name = "stratactl", version, about = "Strata command line client")]
struct Cli {
    /// Output format for `get`
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Config file (default: $STRATA_CONFIG or ~/.strata/config.yaml)
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply every object in a YAML or JSON file
    Apply {
        #[arg(short = 'f', long = "filename")]
        filename: PathBuf,
        /// Take ownership of fields other managers own
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
    },
    /// Delete the objects in a file, or one object by key
    Delete {
        #[arg(short = 'f', long = "filename")]
        filename: Option<PathBuf>,
        /// Full key, `group/version/kind/account/name`
        #[arg(short = 'k', long = "key")]
        key: Option<String>,
    },
    /// List objects: `kind` or `kind.name`
    Get {
        target: String,
        #[arg(long = "account")]
        account: Option<String>,
    },
    /// Manage server contexts
    Context {
        #[command(subcommand)]
        command: ContextCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ContextCommand {
    /// Add or replace a context
    Add {
        #[arg(long)]
        name: String,
        /// Server URL, e.g. http://127.0.0.1:8080
        #[arg(long)]
        url: String,
    },
    /// Print the current context
    Get,
    /// Switch the current context
    Set {
        #[arg(long = "current")]
        current: String,
    },
    /// Store a session token for a context and check it against the server
    Login {
        #[arg(long, env = "STRATA_TOKEN", hide_env_values = true)]
        token: String,
        /// Context to update (default: current)
        #[arg(long)]
        name: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("STRATA_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn client(ctx: &CliContext) -> HttpClient {
    let client = HttpClient::new(ctx.url.clone());
    match &ctx.session {
        Some(s) => client.with_session(s.clone()),
        None => client,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let path = match cli.config {
        Some(p) => p,
        None => config::default_path()?,
    };
    let mut cfg = CliConfig::load(&path)?;
    let ctx = Context::background();
    let mut out = std::io::stdout().lock();

    match cli.command {
        Commands::Apply { filename, force } => {
            let api = client(cfg.current()?);
            commands::apply(&api, &ctx, &filename, force, &mut out).await?;
        }
        Commands::Delete { filename, key } => {
            let api = client(cfg.current()?);
            commands::delete(&api, &ctx, filename.as_deref(), key.as_deref(), &mut out).await?;
        }
        Commands::Get { target, account } => {
            let api = client(cfg.current()?);
            commands::get(&api, &ctx, &target, account.as_deref(), cli.output, &mut out).await?;
        }
        Commands::Context { command } => match command {
            ContextCommand::Add { name, url } => {
                config::validate_context_name(&name)?;
                if url.is_empty() {
                    bail!("context url is required");
                }
                cfg.add(CliContext { name: name.clone(), url, session: None });
                cfg.save(&path)?;
                info!(context = %name, config = %path.display(), "context added");
            }
            ContextCommand::Get => {
                let current = cfg.current()?;
                writeln!(out, "{} {}", current.name, current.url)?;
            }
            ContextCommand::Set { current } => {
                if cfg.set_current(&current)? {
                    cfg.save(&path)?;
                }
            }
            ContextCommand::Login { token, name } => {
                let name = match name {
                    Some(n) => n,
                    None => cfg.current()?.name.clone(),
                };
                let entry = cfg.context_mut(&name)?;
                entry.session = Some(format!("Bearer {}", token.trim()));
                let api = client(entry);
                api.kinds(&ctx).await.with_context(|| format!("verifying session against {}", api.base()))?;
                cfg.save(&path)?;
                writeln!(out, "logged in to {name}")?;
            }
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
