//! Activity command - recent entries of the activity log

use anyhow::Result;
use clap::Args;

use kdsync_activity::render;
use kdsync_core::domain::{Direction, SyncEvent};
use kdsync_core::ports::ActivityRecord;

use crate::context::CommandContext;

#[derive(Debug, Args)]
pub struct ActivityCommand {
    /// Only this session (id or name)
    #[arg(long)]
    pub session: Option<String>,
    /// Number of entries to show
    #[arg(short = 'n', long, default_value_t = 20)]
    pub limit: u32,
}

impl ActivityCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let formatter = ctx.formatter();
        let engine = ctx.open_engine().await?;
        let filter = engine.session_filter(self.session.as_deref()).await?;
        let records = engine
            .repository
            .recent_activity(filter.as_ref(), self.limit)
            .await?;
        engine.close().await;

        formatter.print_json(&serde_json::json!({
            "count": records.len(),
            "entries": records,
        }));
        if records.is_empty() {
            formatter.success("No activity recorded");
            return Ok(());
        }
        formatter.success("Recent activity, newest first");
        for record in &records {
            formatter.info(&line(record));
        }
        Ok(())
    }
}

fn line(record: &ActivityRecord) -> String {
    format!(
        "{}  {}",
        record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
        describe(&record.event)
    )
}

fn arrow(direction: Direction) -> &'static str {
    match direction {
        Direction::Up => "\u{2191} ",
        Direction::Down => "\u{2193} ",
        Direction::None => "",
    }
}

/// One-line description of a logged event
fn describe(event: &SyncEvent) -> String {
    if let Some(error) = event.error() {
        return format!("[{}] {}", error.code(), error.render());
    }
    match event {
        SyncEvent::ItemAdded { path, direction, .. }
        | SyncEvent::ItemRemoved { path, direction, .. }
        | SyncEvent::ItemUpdated { path, direction, .. } => match event.activity() {
            Some(kind) => format!("{}{}", arrow(*direction), render(kind, path, None, 1)),
            None => event.name().to_string(),
        },
        SyncEvent::ItemMoved {
            from, to, direction, ..
        } => match event.activity() {
            Some(kind) => format!("{}{}", arrow(*direction), render(kind, from, Some(to), 1)),
            None => event.name().to_string(),
        },
        SyncEvent::ConflictResolved { policy, .. } => format!("Conflict resolved with {policy}"),
        SyncEvent::BlacklistCleared { item_ids, .. } => {
            format!("{} item(s) released from the blacklist", item_ids.len())
        }
        SyncEvent::SessionAdded { local_root, .. } => format!("Session added for {local_root}"),
        SyncEvent::SessionRemoved { .. } => "Session removed".to_string(),
        SyncEvent::SessionPaused { reason, .. } => format!("Session paused: {reason}"),
        SyncEvent::SessionResumed { .. } => "Session resumed".to_string(),
        SyncEvent::HydrationCompleted { path, bytes, .. } => {
            format!("{path} downloaded ({bytes} bytes)")
        }
        SyncEvent::Dehydrated { path, .. } => format!("{path} is now a placeholder"),
        SyncEvent::LiteSyncToggled { enabled, .. } => {
            format!("Lite Sync {}", if *enabled { "enabled" } else { "disabled" })
        }
        SyncEvent::CycleCompleted { summary, .. } => format!(
            "Cycle: {}/{} actions, {} conflicts, {} blacklisted",
            summary.actions_succeeded, summary.actions_planned, summary.conflicts, summary.blacklisted
        ),
        other => other.name().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdsync_core::domain::{RelativePath, SessionId, UniqueId};

    fn path(s: &str) -> RelativePath {
        RelativePath::new(s).unwrap()
    }

    #[test]
    fn test_item_events_use_notification_sentences() {
        let session_id = SessionId::new();
        let added = SyncEvent::ItemAdded {
            session_id,
            item_id: UniqueId::new(),
            path: path("a.txt"),
            direction: Direction::Down,
        };
        assert_eq!(describe(&added), "\u{2193} a.txt has been added.");

        let moved = SyncEvent::ItemMoved {
            session_id,
            item_id: UniqueId::new(),
            from: path("a.txt"),
            to: path("b/a.txt"),
            direction: Direction::Up,
        };
        assert_eq!(describe(&moved), "\u{2191} a.txt has been moved to b/a.txt.");
    }

    #[test]
    fn test_session_events() {
        let session_id = SessionId::new();
        assert_eq!(
            describe(&SyncEvent::SessionPaused {
                session_id,
                reason: "Paused by user".into(),
            }),
            "Session paused: Paused by user"
        );
        assert_eq!(
            describe(&SyncEvent::LiteSyncToggled {
                session_id,
                enabled: false,
            }),
            "Lite Sync disabled"
        );
    }
}
