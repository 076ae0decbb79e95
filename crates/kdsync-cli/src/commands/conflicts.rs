//! Conflicts command - list conflicts and record decisions
//!
//! A decision only marks the item for the next cycle, which applies the
//! chosen policy and closes the record.

use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Subcommand;
use tracing::info;

use kdsync_core::domain::{ConflictId, ConflictPolicy, ConflictRecord};

use crate::context::CommandContext;
use crate::output::{plural, short_id};

#[derive(Debug, Subcommand)]
pub enum ConflictsCommand {
    /// List conflicts, unresolved ones by default
    List {
        /// Only this session (id or name)
        #[arg(long)]
        session: Option<String>,
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
    },
    /// Decide how a conflict is resolved
    Resolve {
        /// Conflict id
        id: String,
        /// One of: rename_local_and_download_remote, keep_both,
        /// cancel_local_operation, restore_to_original_location,
        /// rescue_to_root, manual
        #[arg(long)]
        policy: String,
    },
}

impl ConflictsCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let formatter = ctx.formatter();

        match self {
            ConflictsCommand::List { session, all } => {
                let engine = ctx.open_engine().await?;
                let filter = engine.session_filter(session.as_deref()).await?;
                let conflicts = engine.service.list_conflicts(filter.as_ref(), !all).await?;
                engine.close().await;
                info!(count = conflicts.len(), "Listed conflicts");

                let rows: Vec<serde_json::Value> = conflicts.iter().map(conflict_json).collect();
                formatter.print_json(&serde_json::json!({
                    "count": conflicts.len(),
                    "conflicts": rows,
                }));

                if conflicts.is_empty() {
                    formatter.success("No unresolved conflicts");
                    return Ok(());
                }
                formatter.success(&plural(conflicts.len(), "conflict"));
                formatter.info("");
                formatter.info("ID        Kind                   Policy                            Path");
                formatter.info("--------  ---------------------  --------------------------------  ----");
                for conflict in &conflicts {
                    formatter.info(&conflict_row(conflict));
                }
                formatter.info("");
                formatter.info("Use 'kdsync conflicts resolve <id> --policy <policy>' to decide.");
            }
            ConflictsCommand::Resolve { id, policy } => {
                let policy = parse_policy(policy)?;
                let engine = ctx.open_engine().await?;
                let conflict_id = find_conflict_id(&engine, id).await?;
                let record = engine.service.resolve_conflict(&conflict_id, policy).await?;
                engine.close().await;

                formatter.print_json(&conflict_json(&record));
                formatter.success(&format!(
                    "Conflict on {} will be resolved with {}",
                    record.path(),
                    policy
                ));
                formatter.info("The next cycle applies the decision.");
            }
        }
        Ok(())
    }
}

fn parse_policy(raw: &str) -> Result<ConflictPolicy> {
    ConflictPolicy::from_str(raw).with_context(|| {
        let valid: Vec<&str> = ConflictPolicy::ALL.iter().map(|p| p.as_str()).collect();
        format!("Unknown policy '{raw}'. Valid policies: {}", valid.join(", "))
    })
}

/// Accepts a full id or a unique prefix of an unresolved conflict's id
async fn find_conflict_id(engine: &crate::context::Engine, raw: &str) -> Result<ConflictId> {
    if let Ok(id) = ConflictId::from_str(raw) {
        return Ok(id);
    }
    let candidates: Vec<ConflictId> = engine
        .service
        .list_conflicts(None, true)
        .await?
        .iter()
        .map(|c| *c.id())
        .filter(|id| id.to_string().starts_with(raw))
        .collect();
    match candidates.as_slice() {
        [id] => Ok(*id),
        [] => anyhow::bail!("No unresolved conflict matches '{raw}'"),
        _ => anyhow::bail!("'{raw}' matches {} conflicts, use more characters", candidates.len()),
    }
}

fn conflict_row(conflict: &ConflictRecord) -> String {
    let id = conflict.id().to_string();
    format!(
        "{:<8}  {:<21}  {:<32}  {}",
        short_id(&id, 8),
        conflict.kind().as_str(),
        conflict.policy().as_str(),
        conflict.path()
    )
}

fn conflict_json(conflict: &ConflictRecord) -> serde_json::Value {
    serde_json::json!({
        "id": conflict.id().to_string(),
        "session_id": conflict.session_id().to_string(),
        "item_id": conflict.item_id().to_string(),
        "path": conflict.path().to_string(),
        "kind": conflict.kind().as_str(),
        "policy": conflict.policy().as_str(),
        "copy_path": conflict.copy_path().map(ToString::to_string),
        "detected_at": conflict.detected_at().to_rfc3339(),
        "resolved_at": conflict.resolved_at().map(|t| t.to_rfc3339()),
        "awaits_user": conflict.awaits_user(),
    })
}
