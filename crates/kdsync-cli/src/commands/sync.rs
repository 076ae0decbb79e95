//! Sync command - run one reconciliation cycle now
//!
//! The cycle runs in this process against the shared store and drive, so
//! use it when the daemon is stopped; a running daemon is asked for an
//! immediate cycle with SIGUSR1 instead.

use anyhow::Result;
use clap::Args;
use tracing::info;

use kdsync_core::domain::CycleSummary;

use crate::context::CommandContext;

#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Session id or name; every active session when omitted
    pub session: Option<String>,
}

impl SyncCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let formatter = ctx.formatter();
        let engine = ctx.open_engine().await?;

        let sessions = match &self.session {
            Some(reference) => vec![engine.find_session(reference).await?],
            None => engine
                .service
                .list_sessions()
                .await?
                .into_iter()
                .filter(|s| s.status().is_running())
                .collect(),
        };
        if sessions.is_empty() {
            formatter.success("No active sessions to synchronize");
            engine.close().await;
            return Ok(());
        }

        let mut results = Vec::new();
        let mut failed = 0usize;
        for session in &sessions {
            match engine.service.run_cycle(session.id()).await {
                Ok(summary) => {
                    info!(session_id = %session.id(), actions = summary.actions_planned, "Cycle finished");
                    formatter.success(&format!("{}: {}", session.name(), describe(&summary)));
                    results.push(serde_json::json!({
                        "session_id": session.id().to_string(),
                        "name": session.name(),
                        "summary": summary,
                    }));
                }
                Err(e) => {
                    failed += 1;
                    formatter.error(&format!("{}: {}", session.name(), e));
                    results.push(serde_json::json!({
                        "session_id": session.id().to_string(),
                        "name": session.name(),
                        "error": e.to_string(),
                    }));
                }
            }
        }
        formatter.print_json(&serde_json::json!({ "results": results }));

        engine.close().await;
        if failed > 0 {
            anyhow::bail!("{failed} of {} cycles failed", sessions.len());
        }
        Ok(())
    }
}

/// One-line summary of a cycle
fn describe(summary: &CycleSummary) -> String {
    if summary.actions_planned == 0 && summary.conflicts == 0 && summary.blacklisted == 0 {
        return "up to date".to_string();
    }
    let mut parts = vec![format!(
        "{}/{} actions done",
        summary.actions_succeeded, summary.actions_planned
    )];
    if summary.actions_failed > 0 {
        parts.push(format!("{} failed", summary.actions_failed));
    }
    if summary.actions_skipped > 0 {
        parts.push(format!("{} skipped", summary.actions_skipped));
    }
    if summary.conflicts > 0 {
        parts.push(format!("{} conflicts", summary.conflicts));
    }
    if summary.blacklisted > 0 {
        parts.push(format!("{} blacklisted", summary.blacklisted));
    }
    format!("{} in {} ms", parts.join(", "), summary.duration_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::Scratch;
    use kdsync_core::domain::RemotePath;

    #[test]
    fn test_describe_idle_cycle() {
        assert_eq!(describe(&CycleSummary::default()), "up to date");
    }

    #[test]
    fn test_describe_busy_cycle() {
        let summary = CycleSummary {
            actions_planned: 5,
            actions_succeeded: 3,
            actions_failed: 1,
            actions_skipped: 1,
            conflicts: 2,
            blacklisted: 0,
            duration_ms: 40,
        };
        assert_eq!(
            describe(&summary),
            "3/5 actions done, 1 failed, 1 skipped, 2 conflicts in 40 ms"
        );
    }

    #[tokio::test]
    async fn test_cycle_uploads_local_file() {
        let scratch = Scratch::new().await;
        let root = scratch.folder("notes");
        std::fs::write(root.join("todo.txt"), b"milk").unwrap();
        let session = scratch
            .engine
            .service
            .add_session("notes", &root, RemotePath::root(), false)
            .await
            .unwrap();

        let summary = scratch.engine.service.run_cycle(session.id()).await.unwrap();
        assert_eq!(summary.actions_failed, 0);
        assert_eq!(
            std::fs::read(scratch.dir.path().join("drive").join("todo.txt")).unwrap(),
            b"milk"
        );

        scratch.engine.close().await;
    }
}
