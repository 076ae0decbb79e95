//! Sessions command - add, remove, pause, resume and list sync sessions
//!
//! Sessions are referenced by id or by name. A running daemon picks up
//! added and removed sessions on its next refresh.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use tracing::info;

use kdsync_core::domain::{RemotePath, SyncSession};

use crate::context::CommandContext;
use crate::output::{plural, short_id};

#[derive(Debug, Subcommand)]
pub enum SessionsCommand {
    /// Start synchronizing a local folder
    Add {
        /// Display name
        name: String,
        /// Local folder to synchronize
        path: PathBuf,
        /// Folder on the drive, absolute
        #[arg(long, default_value = "/")]
        remote: String,
        /// Create remote files as placeholders
        #[arg(long)]
        lite_sync: bool,
    },
    /// Stop synchronizing a folder and forget its state
    Remove {
        /// Session id or name
        session: String,
    },
    /// Pause a session after its running cycle
    Pause {
        /// Session id or name
        session: String,
        #[arg(long, default_value = "Paused by user")]
        reason: String,
    },
    /// Resume a paused session
    Resume {
        /// Session id or name
        session: String,
    },
    /// List sessions
    List,
}

impl SessionsCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let formatter = ctx.formatter();
        let engine = ctx.open_engine().await?;

        match self {
            SessionsCommand::Add {
                name,
                path,
                remote,
                lite_sync,
            } => {
                let remote = RemotePath::new(remote.clone()).context("Invalid remote folder")?;
                let session = engine
                    .service
                    .add_session(name, path, remote, *lite_sync)
                    .await?;
                info!(session_id = %session.id(), "Session added");
                formatter.print_json(&session_json(&session));
                formatter.success(&format!(
                    "Session '{}' added ({})",
                    session.name(),
                    session.id()
                ));
                formatter.info(&format!("{} <-> {}", session.local_root(), session.remote_root()));
            }
            SessionsCommand::Remove { session } => {
                let session = engine.find_session(session).await?;
                engine.service.remove_session(session.id()).await?;
                formatter.print_json(&serde_json::json!({
                    "success": true,
                    "removed": session.id().to_string(),
                }));
                formatter.success(&format!("Session '{}' removed", session.name()));
            }
            SessionsCommand::Pause { session, reason } => {
                let session = engine.find_session(session).await?;
                let session = engine.service.pause_session(session.id(), reason).await?;
                formatter.print_json(&session_json(&session));
                formatter.success(&format!("Session '{}' paused", session.name()));
            }
            SessionsCommand::Resume { session } => {
                let session = engine.find_session(session).await?;
                let session = engine.service.resume_session(session.id()).await?;
                formatter.print_json(&session_json(&session));
                formatter.success(&format!("Session '{}' resumed", session.name()));
            }
            SessionsCommand::List => {
                let sessions = engine.service.list_sessions().await?;
                let rows: Vec<serde_json::Value> = sessions.iter().map(session_json).collect();
                formatter.print_json(&serde_json::json!({
                    "count": sessions.len(),
                    "sessions": rows,
                }));

                if sessions.is_empty() {
                    formatter.success("No sessions configured");
                    formatter.info("Use 'kdsync sessions add <name> <path>' to add one.");
                } else {
                    formatter.success(&plural(sessions.len(), "session"));
                    formatter.info("");
                    formatter.info("ID        Name             Status    Lite  Local root");
                    formatter.info("--------  ---------------  --------  ----  ----------");
                    for session in &sessions {
                        let id = session.id().to_string();
                        formatter.info(&format!(
                            "{:<8}  {:<15}  {:<8}  {:<4}  {}",
                            short_id(&id, 8),
                            session.name(),
                            session.status().as_str(),
                            if session.lite_sync() { "on" } else { "off" },
                            session.local_root()
                        ));
                    }
                }
            }
        }

        engine.close().await;
        Ok(())
    }
}

pub(crate) fn session_json(session: &SyncSession) -> serde_json::Value {
    serde_json::json!({
        "id": session.id().to_string(),
        "name": session.name(),
        "local_root": session.local_root().to_string(),
        "remote_root": session.remote_root().to_string(),
        "status": session.status().to_string(),
        "status_detail": session.status_detail(),
        "lite_sync": session.lite_sync(),
        "created_at": session.created_at().to_rfc3339(),
        "last_cycle_at": session.last_cycle_at().map(|t| t.to_rfc3339()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::Scratch;
    use kdsync_core::domain::SessionStatus;

    #[tokio::test]
    async fn test_session_json_fields() {
        let scratch = Scratch::new().await;
        let root = scratch.folder("photos");
        let session = scratch
            .engine
            .service
            .add_session("photos", &root, RemotePath::root(), true)
            .await
            .unwrap();

        let json = session_json(&session);
        assert_eq!(json["name"], "photos");
        assert_eq!(json["lite_sync"], true);
        assert_eq!(json["remote_root"], "/");
        assert!(json["last_cycle_at"].is_null());

        scratch.engine.close().await;
    }

    #[tokio::test]
    async fn test_pause_and_resume_by_name() {
        let scratch = Scratch::new().await;
        let root = scratch.folder("work");
        scratch
            .engine
            .service
            .add_session("work", &root, RemotePath::root(), false)
            .await
            .unwrap();

        let session = scratch.engine.find_session("work").await.unwrap();
        let paused = scratch
            .engine
            .service
            .pause_session(session.id(), "Paused by user")
            .await
            .unwrap();
        assert_eq!(paused.status(), SessionStatus::Paused);
        let resumed = scratch.engine.service.resume_session(session.id()).await.unwrap();
        assert!(resumed.status().is_running());

        scratch.engine.close().await;
    }
}
