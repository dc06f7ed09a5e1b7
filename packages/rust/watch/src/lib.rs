//! Content source watchers.
//!
//! [`FolderWatcher`] turns write-stable files in watched folders into
//! `file` ingestion jobs; [`UrlMonitor`] polls monitored URLs and enqueues
//! `url` ingestion when the content hash changes. Both keep an explicit
//! registry of live handles keyed by source id, and stopping an unknown or
//! already-stopped id is a no-op.

mod folder;
mod monitor;

pub use folder::FolderWatcher;
pub use monitor::{CheckOutcome, UrlMonitor, is_ssrf_target, read_limited};
