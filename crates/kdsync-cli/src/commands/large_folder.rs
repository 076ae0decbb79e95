//! Large-folders command - folders held back until confirmed
//!
//! Covers remote folders above the size threshold and folders the user
//! excluded from sync.

use anyhow::Result;
use clap::Subcommand;

use crate::context::CommandContext;
use crate::output::plural;

#[derive(Debug, Subcommand)]
pub enum LargeFolderCommand {
    /// List folders waiting for confirmation
    List {
        /// Only this session (id or name)
        #[arg(long)]
        session: Option<String>,
    },
    /// Download a held folder
    Confirm {
        /// Item id of the folder
        folder: String,
    },
    /// Stop syncing a folder and remove its local copy; the remote copy stays
    Exclude {
        /// Item id or path of the folder
        folder: String,
    },
    /// Size above which new remote folders are held, 0 to never hold
    Threshold {
        /// Threshold in MiB
        mb: u64,
    },
}

impl LargeFolderCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let formatter = ctx.formatter();
        let engine = ctx.open_engine().await?;

        match self {
            LargeFolderCommand::List { session } => {
                let filter = engine.session_filter(session.as_deref()).await?;
                let folders = engine.service.held_folders(filter.as_ref()).await?;
                let rows: Vec<serde_json::Value> = folders
                    .iter()
                    .map(|f| {
                        serde_json::json!({
                            "item_id": f.id().to_string(),
                            "session_id": f.session_id().to_string(),
                            "path": f.remote_path().to_string(),
                        })
                    })
                    .collect();
                formatter.print_json(&serde_json::json!({
                    "count": folders.len(),
                    "folders": rows,
                }));

                if folders.is_empty() {
                    formatter.success("No folders are waiting");
                } else {
                    formatter.success(&plural(folders.len(), "folder"));
                    for folder in &folders {
                        formatter.info(&format!("{}  {}", folder.id(), folder.remote_path()));
                    }
                    formatter.info("");
                    formatter.info("Use 'kdsync large-folders confirm <id>' to download one.");
                }
            }
            LargeFolderCommand::Confirm { folder } => {
                let item_id = engine.resolve_item_id(folder).await?;
                let admitted = engine.service.confirm_large_folder(&item_id).await?;
                formatter.print_json(&serde_json::json!({
                    "item_id": item_id.to_string(),
                    "admitted": admitted,
                }));
                formatter.success(&format!(
                    "{} admitted; the next cycle downloads them",
                    plural(admitted, "item")
                ));
            }
            LargeFolderCommand::Exclude { folder } => {
                let item_id = engine.resolve_item_id(folder).await?;
                let excluded = engine.service.exclude_folder(&item_id).await?;
                formatter.print_json(&serde_json::json!({
                    "item_id": item_id.to_string(),
                    "excluded": excluded,
                }));
                formatter.success(&format!(
                    "{} excluded; the local copy was removed",
                    plural(excluded, "item")
                ));
                formatter.info("Use 'kdsync large-folders confirm <id>' to sync it again.");
            }
            LargeFolderCommand::Threshold { mb } => {
                engine.service.set_large_folder_threshold(*mb).await?;
                formatter.print_json(&serde_json::json!({ "large_folder_threshold_mb": mb }));
                if *mb == 0 {
                    formatter.success("New remote folders are never held");
                } else {
                    formatter.success(&format!("New remote folders above {mb} MiB are held"));
                }
            }
        }

        engine.close().await;
        Ok(())
    }
}
