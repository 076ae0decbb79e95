//! kdsync Conflict - Conflict handling and the blacklist
//!
//! Provides:
//! - Classification of clashing local and remote deltas ([`ConflictDetector`])
//! - Policy selection with per-path glob rules ([`PolicyEngine`])
//! - Resolution plans for every policy ([`ResolutionPlanner`])
//! - Conflict copy and rescue naming ([`ConflictNamer`])
//! - Exclusion templates ([`ExclusionMatcher`])
//! - Blacklist admission, release and retry scheduling ([`BlacklistManager`])
//!
//! Everything except the blacklist manager is pure: it inspects items and
//! deltas and returns decisions. Applying them is left to the sync engine.

pub mod blacklist;
pub mod detector;
pub mod error;
pub mod exclusion;
pub mod namer;
pub mod policy;
pub mod resolver;

pub use blacklist::{BlacklistManager, FailureOutcome};
pub use detector::{ConflictDetector, DetectedConflict, TreeFacts};
pub use error::ConflictError;
pub use exclusion::{ExclusionKind, ExclusionMatch, ExclusionMatcher};
pub use namer::ConflictNamer;
pub use policy::{policy_applies, validate_rule, PolicyEngine};
pub use resolver::{OccupiedPaths, PlanRequest, ResolutionPlan, ResolutionPlanner};
