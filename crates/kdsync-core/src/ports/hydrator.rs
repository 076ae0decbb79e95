//! Placeholder hydration port
//!
//! Lets the reconciliation engine materialize a dehydrated item before an
//! action that needs its content, without depending on the Lite Sync
//! crate.

use crate::domain::UniqueId;

#[async_trait::async_trait]
pub trait IPlaceholderHydrator: Send + Sync {
    /// Ensures the item's content is present locally
    ///
    /// Returns once the item is `Hydrated`. Concurrent calls for the same
    /// item share one download.
    async fn ensure_hydrated(&self, item_id: &UniqueId) -> anyhow::Result<()>;
}
