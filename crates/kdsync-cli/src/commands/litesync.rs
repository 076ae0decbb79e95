//! Lite Sync commands - placeholders instead of full downloads
//!
//! `lite-sync <session> off` queues every placeholder of the session and
//! hydrates the queue in this process. Interrupted or failed downloads
//! stay queued; the daemon resumes them at its next start.

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use tracing::info;

use crate::context::CommandContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Switch {
    On,
    Off,
}

#[derive(Debug, Args)]
pub struct LiteSyncCommand {
    /// Session id or name
    pub session: String,
    pub state: Switch,
    /// Only queue the downloads when switching off
    #[arg(long)]
    pub no_hydrate: bool,
}

impl LiteSyncCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let formatter = ctx.formatter();
        let engine = ctx.open_engine().await?;
        let session = engine.find_session(&self.session).await?;
        let placeholders = engine.service.placeholders();

        let enabled = self.state == Switch::On;
        let queued = placeholders.set_lite_sync(session.id(), enabled).await?;
        if enabled {
            formatter.success(&format!("Lite Sync enabled for '{}'", session.name()));
            formatter.info("New remote files will arrive as placeholders.");
            formatter.print_json(&serde_json::json!({
                "session_id": session.id().to_string(),
                "lite_sync": true,
            }));
            engine.close().await;
            return Ok(());
        }

        formatter.success(&format!(
            "Lite Sync disabled for '{}', {} placeholder(s) queued",
            session.name(),
            queued
        ));
        let mut report = serde_json::json!({
            "session_id": session.id().to_string(),
            "lite_sync": false,
            "queued": queued,
        });
        if !self.no_hydrate {
            let token = engine
                .service
                .session_token(session.id())
                .context("Session is not loaded")?;
            let pass = placeholders.resume_pending(session.id(), &token).await?;
            info!(hydrated = pass.hydrated, failed = pass.failed, "Hydration pass done");
            formatter.info(&format!(
                "{} hydrated, {} failed, {} still queued",
                pass.hydrated, pass.failed, pass.remaining
            ));
            report["hydrated"] = pass.hydrated.into();
            report["failed"] = pass.failed.into();
            report["remaining"] = pass.remaining.into();
        }
        formatter.print_json(&report);

        engine.close().await;
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct HydrateCommand {
    /// Item id or local path of a placeholder
    pub item: String,
}

impl HydrateCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let formatter = ctx.formatter();
        let engine = ctx.open_engine().await?;
        let item_id = engine.resolve_item_id(&self.item).await?;

        let bytes = engine.service.placeholders().hydrate(&item_id).await?;
        formatter.print_json(&serde_json::json!({
            "item_id": item_id.to_string(),
            "bytes": bytes,
        }));
        if bytes == 0 {
            formatter.success("Already hydrated");
        } else {
            formatter.success(&format!("Hydrated ({bytes} bytes)"));
        }

        engine.close().await;
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct DehydrateCommand {
    /// Item id or local path of a synced file
    pub item: String,
}

impl DehydrateCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let formatter = ctx.formatter();
        let engine = ctx.open_engine().await?;
        let item_id = engine.resolve_item_id(&self.item).await?;

        engine.service.dehydrate(&item_id).await?;
        formatter.print_json(&serde_json::json!({
            "item_id": item_id.to_string(),
            "dehydrated": true,
        }));
        formatter.success("Local content released; the file is now a placeholder");

        engine.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::Scratch;
    use kdsync_core::domain::{PlaceholderState, RemotePath};

    #[tokio::test]
    async fn test_dehydrate_then_hydrate_by_path() {
        let scratch = Scratch::new().await;
        let root = scratch.folder("music");
        std::fs::write(root.join("song.txt"), b"la la la").unwrap();
        let engine = &scratch.engine;
        let session = engine
            .service
            .add_session("music", &root, RemotePath::root(), false)
            .await
            .unwrap();
        engine.service.run_cycle(session.id()).await.unwrap();

        let local = session.local_root().as_path().join("song.txt");
        let id = engine
            .resolve_item_id(local.to_str().unwrap())
            .await
            .unwrap();
        engine.service.dehydrate(&id).await.unwrap();
        let item = engine.repository.get_item(&id).await.unwrap().unwrap();
        assert_eq!(item.placeholder(), PlaceholderState::Dehydrated);

        let bytes = engine.service.placeholders().hydrate(&id).await.unwrap();
        assert_eq!(bytes, 8);
        assert_eq!(std::fs::read(&local).unwrap(), b"la la la");

        scratch.engine.close().await;
    }

    #[tokio::test]
    async fn test_unknown_path_is_rejected() {
        let scratch = Scratch::new().await;
        let err = scratch
            .engine
            .resolve_item_id("/definitely/not/synced.txt")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not inside any session"));
        scratch.engine.close().await;
    }
}
