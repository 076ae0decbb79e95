//! Status command - sessions, item counts and engine limits

use anyhow::Result;
use clap::Args;

use kdsync_sync::{ServiceStatus, SessionReport};

use crate::context::CommandContext;
use crate::output::{plural, OutputFormatter};

#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Only this session (id or name)
    pub session: Option<String>,
}

impl StatusCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let formatter = ctx.formatter();
        let engine = ctx.open_engine().await?;

        let mut status = engine.service.status().await?;
        if let Some(id) = engine.session_filter(self.session.as_deref()).await? {
            status.sessions.retain(|s| s.session_id == id);
        }
        let drive = engine.config.remote.base_dir.display().to_string();
        engine.close().await;

        let mut json = serde_json::to_value(&status)?;
        json["drive"] = drive.clone().into();
        formatter.print_json(&json);
        print_human(&status, &*formatter);
        formatter.info(&format!("Drive:   {drive}"));
        Ok(())
    }
}

fn print_human(status: &ServiceStatus, formatter: &dyn OutputFormatter) {
    if status.sessions.is_empty() {
        formatter.success("No sessions configured");
    } else {
        formatter.success(&plural(status.sessions.len(), "session"));
        for report in &status.sessions {
            formatter.info("");
            for line in session_lines(report) {
                formatter.info(&line);
            }
        }
    }

    formatter.info("");
    let bandwidth = if status.bandwidth_limit_kbps == 0 {
        "unlimited".to_string()
    } else {
        format!("{} KiB/s", status.bandwidth_limit_kbps)
    };
    formatter.info(&format!(
        "Workers: {} max, {} busy   Bandwidth: {}",
        status.max_concurrent_actions, status.busy_items, bandwidth
    ));
    if status.large_folder_threshold_mb > 0 {
        formatter.info(&format!(
            "Folders above {} MiB wait for confirmation",
            status.large_folder_threshold_mb
        ));
    }
}

fn session_lines(report: &SessionReport) -> Vec<String> {
    let mut status = report.status.clone();
    if let Some(detail) = &report.status_detail {
        status = format!("{status} ({detail})");
    }
    let mut lines = vec![
        format!("{} [{}]", report.name, report.session_id),
        format!("  Folder:  {}", report.local_root),
        format!("  Status:  {status}"),
        format!(
            "  Items:   {} total, {} pending, {} conflicted, {} blacklisted, {} excluded",
            report.items, report.pending, report.conflicted, report.blacklisted, report.excluded
        ),
    ];
    if report.lite_sync || report.dehydrated > 0 {
        lines.push(format!(
            "  Lite Sync: {}, {} placeholder(s)",
            if report.lite_sync { "on" } else { "off" },
            report.dehydrated
        ));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdsync_core::domain::SessionId;

    fn report(lite_sync: bool, dehydrated: usize) -> SessionReport {
        SessionReport {
            session_id: SessionId::new(),
            name: "docs".into(),
            local_root: "/home/u/docs".into(),
            status: "paused".into(),
            status_detail: Some("Paused by user".into()),
            lite_sync,
            items: 10,
            pending: 2,
            conflicted: 1,
            blacklisted: 0,
            excluded: 3,
            dehydrated,
        }
    }

    #[test]
    fn test_session_lines() {
        let lines = session_lines(&report(false, 0));
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], "  Status:  paused (Paused by user)");
        assert_eq!(
            lines[3],
            "  Items:   10 total, 2 pending, 1 conflicted, 0 blacklisted, 3 excluded"
        );
    }

    #[test]
    fn test_lite_sync_line_only_when_relevant() {
        assert_eq!(session_lines(&report(true, 4)).len(), 5);
        assert_eq!(
            session_lines(&report(false, 2))[4],
            "  Lite Sync: off, 2 placeholder(s)"
        );
    }
}
