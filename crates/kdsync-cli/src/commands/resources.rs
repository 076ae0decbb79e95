//! Resources command - worker pool size and bandwidth cap
//!
//! Limits are stored with the sessions; a running daemon applies them at
//! its next session refresh.

use anyhow::Result;
use clap::Args;

use crate::context::CommandContext;

#[derive(Debug, Args)]
pub struct ResourcesCommand {
    /// Concurrent transfers across all sessions
    #[arg(long)]
    pub max_concurrent: Option<usize>,
    /// Transfer rate cap in KiB/s, 0 for none
    #[arg(long)]
    pub bandwidth_kbps: Option<u64>,
}

impl ResourcesCommand {
    pub async fn execute(&self, ctx: &CommandContext) -> Result<()> {
        let formatter = ctx.formatter();
        let engine = ctx.open_engine().await?;
        let current = engine.service.status().await?;

        let changed = self.max_concurrent.is_some() || self.bandwidth_kbps.is_some();
        let max_concurrent = self.max_concurrent.unwrap_or(current.max_concurrent_actions);
        let bandwidth_kbps = self.bandwidth_kbps.unwrap_or(current.bandwidth_limit_kbps);
        if max_concurrent == 0 {
            anyhow::bail!("--max-concurrent must be at least 1");
        }
        if changed {
            engine
                .service
                .set_resource_ceiling(max_concurrent, bandwidth_kbps)
                .await?;
        }
        engine.close().await;

        formatter.print_json(&serde_json::json!({
            "max_concurrent_actions": max_concurrent,
            "bandwidth_limit_kbps": bandwidth_kbps,
            "changed": changed,
        }));
        if changed {
            formatter.success("Resource limits updated");
        } else {
            formatter.success("Resource limits");
        }
        formatter.info(&format!("Concurrent transfers: {max_concurrent}"));
        if bandwidth_kbps == 0 {
            formatter.info("Bandwidth: unlimited");
        } else {
            formatter.info(&format!("Bandwidth: {bandwidth_kbps} KiB/s"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::context::testing::Scratch;

    #[tokio::test]
    async fn test_limits_persist_across_engines() {
        let scratch = Scratch::new().await;
        scratch
            .engine
            .service
            .set_resource_ceiling(7, 256)
            .await
            .unwrap();
        let config = scratch.engine.config.clone();
        scratch.engine.close().await;

        let reopened = crate::context::Engine::open(config).await.unwrap();
        let status = reopened.service.status().await.unwrap();
        assert_eq!(status.max_concurrent_actions, 7);
        assert_eq!(status.bandwidth_limit_kbps, 256);
        reopened.close().await;
    }
}
