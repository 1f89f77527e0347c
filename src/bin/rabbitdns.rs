use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use rabbitdns::RabbitDns;
use rabbitdns::config::{RuntimeConfig, default_config_path};
use rabbitdns::profile::ProfileError;
use rabbitdns::telemetry::{current_log_directory, init_tracing};
use serde_json::json;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "rabbitdns", version, about = "Caching DNS-over-HTTPS forwarder with per-profile block-lists", long_about = None)]
struct Args {
    /// Override path to the runtime config (rabbitdns.toml)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Increase logging verbosity
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the DoH proxy (default)
    Serve,
    /// Manage stored block-list profiles
    #[command(subcommand)]
    Profile(ProfileCommand),
}

#[derive(Subcommand, Debug)]
enum ProfileCommand {
    /// Store a profile document and print its id
    Create {
        /// JSON document path, or `-` for stdin
        #[arg(value_name = "FILE")]
        source: String,
    },
    /// Print a stored profile
    Show { id: String },
    /// Remove a stored profile
    Delete { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let config = RuntimeConfig::load_or_default(&config_path)?;
    init_tracing("rabbitdns", args.verbose, &config.logging)?;
    if let Some(directory) = current_log_directory() {
        info!(directory = %directory.display(), "Writing rolling logs");
    }

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            info!(config = %config_path.display(), "Starting rabbitdns");
            RabbitDns::from_config(config)?.serve().await
        }
        Command::Profile(command) => run_profile_command(&config, command).await,
    }
}

async fn run_profile_command(config: &RuntimeConfig, command: ProfileCommand) -> Result<()> {
    let store = rabbitdns::open_profile_store(config)?;
    match command {
        ProfileCommand::Create { source } => {
            let document = read_document(&source)?;
            match store.create(&document).await {
                Ok(profile) => {
                    println!("{}", profile.id());
                    Ok(())
                }
                Err(ProfileError::Invalid(reason)) => bail!("profile rejected: {reason}"),
                Err(err) => Err(err).context("failed to store profile"),
            }
        }
        ProfileCommand::Show { id } => {
            let Some(profile) = store.lookup(&id).await? else {
                bail!("profile {id} not found");
            };
            let blocked: Vec<&str> = profile.blocked().collect();
            let rendered = serde_json::to_string_pretty(&json!({
                "id": profile.id(),
                "blocked": blocked,
            }))?;
            println!("{rendered}");
            Ok(())
        }
        ProfileCommand::Delete { id } => {
            store.delete(&id).await?;
            println!("deleted {id}");
            Ok(())
        }
    }
}

fn read_document(source: &str) -> Result<Vec<u8>> {
    if source == "-" {
        let mut buffer = Vec::new();
        io::stdin()
            .read_to_end(&mut buffer)
            .context("failed to read profile from stdin")?;
        return Ok(buffer);
    }
    std::fs::read(source).with_context(|| format!("failed to read profile document {source}"))
}
