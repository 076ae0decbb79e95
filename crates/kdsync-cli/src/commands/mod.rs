//! Command implementations, one module per top-level command

pub mod activity;
pub mod blacklist;
pub mod completions;
pub mod config;
pub mod conflicts;
pub mod large_folder;
pub mod litesync;
pub mod resources;
pub mod sessions;
pub mod status;
pub mod sync;
