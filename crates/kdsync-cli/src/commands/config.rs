//! Config command - view, change and validate the configuration file
//!
//! `set` rewrites the whole file from the parsed configuration, so
//! comments in a hand-edited file are not kept.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::de::DeserializeOwned;
use tracing::info;

use kdsync_core::config::Config;

use crate::context::CommandContext;

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display the effective configuration
    Show,
    /// Set a value by dotted key, e.g. `resources.max_concurrent_actions 8`
    Set { key: String, value: String },
    /// Check the configuration file
    Validate,
    /// Print the configuration file location
    Path,
}

/// Keys accepted by `config set`
const KEYS: &[&str] = &[
    "sync.debounce_delay_ms",
    "sync.remote_poll_interval_secs",
    "sync.max_item_retries",
    "sync.retry_base_delay_ms",
    "sync.retry_max_attempts",
    "sync.max_upload_size_mb",
    "sync.large_folder_threshold_mb",
    "sync.database_path",
    "resources.max_concurrent_actions",
    "resources.bandwidth_limit_kbps",
    "conflicts.edit_edit_winner",
    "conflicts.auto_resolve",
    "blacklist.retry_interval_secs",
    "blacklist.clear_temporary_on_startup",
    "platform.target_os",
    "platform.max_name_length",
    "platform.max_path_length",
    "platform.case_insensitive",
    "litesync.hydration_concurrency",
    "remote.base_dir",
    "notifications.enabled",
    "notifications.flush_interval_ms",
    "notifications.record_activity",
    "logging.level",
    "logging.format",
];

impl ConfigCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        match self {
            ConfigCommand::Show => show(ctx),
            ConfigCommand::Set { key, value } => set(ctx, key, value),
            ConfigCommand::Validate => validate(ctx),
            ConfigCommand::Path => {
                let formatter = ctx.formatter();
                formatter.print_json(&serde_json::json!({
                    "config_path": ctx.config_path.display().to_string(),
                    "exists": ctx.config_path.exists(),
                }));
                formatter.info(&ctx.config_path.display().to_string());
                Ok(())
            }
        }
    }
}

fn show(ctx: &CommandContext) -> Result<()> {
    let formatter = ctx.formatter();
    let config = ctx.load_config()?;
    info!(config_path = %ctx.config_path.display(), "Showing configuration");

    formatter.print_json(&serde_json::to_value(&config).context("Failed to serialize configuration")?);
    formatter.success(&format!("Configuration ({})", ctx.config_path.display()));
    formatter.info("");
    let yaml = serde_yaml::to_string(&config).context("Failed to serialize configuration")?;
    for line in yaml.lines() {
        formatter.info(line);
    }
    Ok(())
}

fn set(ctx: &CommandContext, key: &str, value: &str) -> Result<()> {
    let formatter = ctx.formatter();
    let mut config = ctx.load_config()?;

    if let Err(e) = apply_config_value(&mut config, key, value) {
        formatter.info("Supported keys:");
        for key in KEYS {
            formatter.info(&format!("  {key}"));
        }
        return Err(e);
    }

    let errors = config.validate();
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        anyhow::bail!("Invalid value for '{key}': {}", messages.join("; "));
    }

    if let Some(parent) = ctx.config_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create configuration directory")?;
    }
    let yaml = serde_yaml::to_string(&config).context("Failed to serialize configuration")?;
    std::fs::write(&ctx.config_path, yaml).context("Failed to write configuration file")?;
    info!(key, value, "Configuration value set");

    formatter.print_json(&serde_json::json!({
        "success": true,
        "key": key,
        "value": value,
        "config_path": ctx.config_path.display().to_string(),
    }));
    formatter.success(&format!("Set {key} = {value}"));
    formatter.info(&format!("Saved to {}", ctx.config_path.display()));
    Ok(())
}

fn validate(ctx: &CommandContext) -> Result<()> {
    let formatter = ctx.formatter();
    if !ctx.config_path.exists() {
        formatter.print_json(&serde_json::json!({
            "valid": true,
            "config_path": ctx.config_path.display().to_string(),
            "exists": false,
        }));
        formatter.success("No configuration file, defaults apply");
        formatter.info(&format!("Expected at {}", ctx.config_path.display()));
        return Ok(());
    }

    let config = ctx.load_config()?;
    let errors = config.validate();
    let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
    formatter.print_json(&serde_json::json!({
        "valid": errors.is_empty(),
        "config_path": ctx.config_path.display().to_string(),
        "exists": true,
        "errors": messages,
    }));

    if errors.is_empty() {
        formatter.success("Configuration is valid");
        formatter.info(&format!("File: {}", ctx.config_path.display()));
        return Ok(());
    }
    formatter.info(&format!("File: {}", ctx.config_path.display()));
    for error in &errors {
        formatter.info(&format!("  {} - {}", error.field, error.message));
    }
    anyhow::bail!(
        "Configuration has {} error{}",
        errors.len(),
        if errors.len() == 1 { "" } else { "s" }
    )
}

fn number<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse::<T>()
        .with_context(|| format!("Expected a non-negative integer for {key}"))
}

fn flag(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "yes" | "on" => Ok(true),
        "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("Expected true or false for {key}"),
    }
}

/// Parses a snake_case enum value the way the file spells it
fn variant<T: DeserializeOwned>(key: &str, value: &str) -> Result<T> {
    serde_yaml::from_str(value).with_context(|| format!("Unknown value '{value}' for {key}"))
}

/// "auto" or an empty value clears an optional setting
fn optional(value: &str) -> Option<&str> {
    match value {
        "" | "auto" | "none" => None,
        other => Some(other),
    }
}

/// Applies a dotted key/value pair to the configuration
fn apply_config_value(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "sync.debounce_delay_ms" => config.sync.debounce_delay_ms = number(key, value)?,
        "sync.remote_poll_interval_secs" => {
            config.sync.remote_poll_interval_secs = number(key, value)?;
        }
        "sync.max_item_retries" => config.sync.max_item_retries = number(key, value)?,
        "sync.retry_base_delay_ms" => config.sync.retry_base_delay_ms = number(key, value)?,
        "sync.retry_max_attempts" => config.sync.retry_max_attempts = number(key, value)?,
        "sync.max_upload_size_mb" => config.sync.max_upload_size_mb = number(key, value)?,
        "sync.large_folder_threshold_mb" => {
            config.sync.large_folder_threshold_mb = number(key, value)?;
        }
        "sync.database_path" => config.sync.database_path = optional(value).map(PathBuf::from),

        "resources.max_concurrent_actions" => {
            config.resources.max_concurrent_actions = number(key, value)?;
        }
        "resources.bandwidth_limit_kbps" => {
            config.resources.bandwidth_limit_kbps = number(key, value)?;
        }

        "conflicts.edit_edit_winner" => config.conflicts.edit_edit_winner = variant(key, value)?,
        "conflicts.auto_resolve" => config.conflicts.auto_resolve = flag(key, value)?,

        "blacklist.retry_interval_secs" => {
            config.blacklist.retry_interval_secs = number(key, value)?;
        }
        "blacklist.clear_temporary_on_startup" => {
            config.blacklist.clear_temporary_on_startup = flag(key, value)?;
        }

        "platform.target_os" => config.platform.target_os = variant(key, value)?,
        "platform.max_name_length" => config.platform.max_name_length = number(key, value)?,
        "platform.max_path_length" => {
            config.platform.max_path_length = optional(value).map(|v| number(key, v)).transpose()?;
        }
        "platform.case_insensitive" => {
            config.platform.case_insensitive = optional(value).map(|v| flag(key, v)).transpose()?;
        }

        "litesync.hydration_concurrency" => {
            config.litesync.hydration_concurrency = number(key, value)?;
        }
        "remote.base_dir" => config.remote.base_dir = PathBuf::from(value),

        "notifications.enabled" => config.notifications.enabled = flag(key, value)?,
        "notifications.flush_interval_ms" => {
            config.notifications.flush_interval_ms = number(key, value)?;
        }
        "notifications.record_activity" => {
            config.notifications.record_activity = flag(key, value)?;
        }

        "logging.level" => config.logging.level = value.to_string(),
        "logging.format" => config.logging.format = variant(key, value)?,

        _ => anyhow::bail!("Unknown configuration key: '{key}'"),
    }
    Ok(())
}
