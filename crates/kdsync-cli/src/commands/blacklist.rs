//! Blacklist command - items the engine stopped retrying

use anyhow::Result;
use clap::Subcommand;

use kdsync_core::domain::BlacklistEntry;

use crate::context::CommandContext;
use crate::output::plural;

#[derive(Debug, Subcommand)]
pub enum BlacklistCommand {
    /// List blacklisted items
    List {
        /// Only this session (id or name)
        #[arg(long)]
        session: Option<String>,
    },
    /// Release an item so the next cycle retries it
    Clear {
        /// Item id or local path
        item_id: String,
    },
}

impl BlacklistCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let formatter = ctx.formatter();
        let engine = ctx.open_engine().await?;

        match self {
            BlacklistCommand::List { session } => {
                let filter = engine.session_filter(session.as_deref()).await?;
                let entries = engine.service.list_blacklist(filter.as_ref()).await?;
                let rows: Vec<serde_json::Value> = entries.iter().map(entry_json).collect();
                formatter.print_json(&serde_json::json!({
                    "count": entries.len(),
                    "entries": rows,
                }));

                if entries.is_empty() {
                    formatter.success("Nothing is blacklisted");
                } else {
                    formatter.success(&plural(entries.len(), "blacklisted item"));
                    for entry in &entries {
                        formatter.info("");
                        formatter.info(&format!("{} [{}]", entry.path(), entry.item_id()));
                        formatter.info(&format!(
                            "  {} ({}), {} attempt(s)",
                            entry.reason(),
                            entry.scope(),
                            entry.attempts()
                        ));
                        if let Some(retry_at) = entry.retry_at() {
                            formatter.info(&format!(
                                "  Retried after {}",
                                retry_at.format("%Y-%m-%d %H:%M:%S")
                            ));
                        }
                    }
                }
            }
            BlacklistCommand::Clear { item_id } => {
                let id = engine.resolve_item_id(item_id).await?;
                let released = engine.service.clear_blacklist(&id).await?;
                formatter.print_json(&serde_json::json!({
                    "success": true,
                    "item_id": id.to_string(),
                    "released": released,
                }));
                if released {
                    formatter.success("Item released; the next cycle retries it");
                } else {
                    formatter.warn("Item was not blacklisted");
                }
            }
        }

        engine.close().await;
        Ok(())
    }
}

fn entry_json(entry: &BlacklistEntry) -> serde_json::Value {
    serde_json::json!({
        "item_id": entry.item_id().to_string(),
        "session_id": entry.session_id().to_string(),
        "path": entry.path().to_string(),
        "reason": entry.reason().as_str(),
        "scope": entry.scope().as_str(),
        "attempts": entry.attempts(),
        "first_seen": entry.first_seen().to_rfc3339(),
        "retry_at": entry.retry_at().map(|t| t.to_rfc3339()),
    })
}
