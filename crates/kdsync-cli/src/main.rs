//! kdsync CLI - command-line interface for kdsync
//!
//! Provides commands for:
//! - Adding, pausing and removing sync sessions
//! - Running a cycle on demand and viewing status
//! - Resolving conflicts and releasing blacklisted items
//! - Lite Sync placeholders, resource limits and large folders
//! - Reading the activity log and managing configuration

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod context;
mod output;

use commands::{
    activity::ActivityCommand,
    blacklist::BlacklistCommand,
    completions::CompletionsCommand,
    config::ConfigCommand,
    conflicts::ConflictsCommand,
    large_folder::LargeFolderCommand,
    litesync::{DehydrateCommand, HydrateCommand, LiteSyncCommand},
    resources::ResourcesCommand,
    sessions::SessionsCommand,
    status::StatusCommand,
    sync::SyncCommand,
};
use context::CommandContext;
use output::{get_formatter, OutputFormat};

#[derive(Debug, Parser)]
#[command(name = "kdsync", version, about = "Two-way folder synchronization")]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose logging (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<String>,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Manage sync sessions
    #[command(subcommand)]
    Sessions(SessionsCommand),
    /// Run a synchronization cycle now
    Sync(SyncCommand),
    /// Show sessions and item counts
    Status(StatusCommand),
    /// Manage synchronization conflicts
    #[command(subcommand)]
    Conflicts(ConflictsCommand),
    /// Manage blacklisted items
    #[command(subcommand)]
    Blacklist(BlacklistCommand),
    /// Switch Lite Sync on or off for a session
    LiteSync(LiteSyncCommand),
    /// Download a placeholder's content
    Hydrate(HydrateCommand),
    /// Release a file's local content, keeping a placeholder
    Dehydrate(DehydrateCommand),
    /// Show or change transfer limits
    Resources(ResourcesCommand),
    /// Manage remote folders held for confirmation
    #[command(subcommand)]
    LargeFolders(LargeFolderCommand),
    /// Show recent activity
    Activity(ActivityCommand),
    /// View and manage configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Generate shell completions
    Completions(CompletionsCommand),
}

fn log_level(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

async fn run(cli: Cli, ctx: &CommandContext) -> Result<()> {
    match cli.command {
        Commands::Sessions(cmd) => cmd.execute(ctx).await,
        Commands::Sync(cmd) => cmd.execute(ctx).await,
        Commands::Status(cmd) => cmd.execute(ctx).await,
        Commands::Conflicts(cmd) => cmd.execute(ctx).await,
        Commands::Blacklist(cmd) => cmd.execute(ctx).await,
        Commands::LiteSync(cmd) => cmd.execute(ctx).await,
        Commands::Hydrate(cmd) => cmd.execute(ctx).await,
        Commands::Dehydrate(cmd) => cmd.execute(ctx).await,
        Commands::Resources(cmd) => cmd.execute(ctx).await,
        Commands::LargeFolders(cmd) => cmd.execute(ctx).await,
        Commands::Activity(cmd) => cmd.execute(ctx).await,
        Commands::Config(cmd) => cmd.execute(ctx).await,
        Commands::Completions(cmd) => cmd.execute(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level(cli.verbose, cli.quiet)));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };
    let ctx = CommandContext::new(format, cli.config.as_deref());

    match run(cli, &ctx).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            get_formatter(format).error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_nested_commands() {
        let cli = Cli::try_parse_from([
            "kdsync", "--json", "conflicts", "resolve", "abc", "--policy", "keep_both",
        ])
        .unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::Conflicts(ConflictsCommand::Resolve { .. })
        ));

        let cli = Cli::try_parse_from(["kdsync", "lite-sync", "docs", "off", "--no-hydrate"]).unwrap();
        match cli.command {
            Commands::LiteSync(cmd) => assert!(cmd.no_hydrate),
            other => panic!("unexpected {other:?}"),
        }

        let cli = Cli::try_parse_from(["kdsync", "large-folders", "threshold", "500"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::LargeFolders(LargeFolderCommand::Threshold { mb: 500 })
        ));

        let cli = Cli::try_parse_from(["kdsync", "large-folders", "exclude", "photos"]).unwrap();
        match cli.command {
            Commands::LargeFolders(LargeFolderCommand::Exclude { folder }) => {
                assert_eq!(folder, "photos");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_log_levels() {
        assert_eq!(log_level(0, false), "warn");
        assert_eq!(log_level(2, false), "debug");
        assert_eq!(log_level(3, true), "error");
    }
}
