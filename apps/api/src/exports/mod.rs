//! Resume PDF exports: request, render, store, deliver, expire.

pub mod email;
pub mod handlers;
pub mod service;
pub mod store;

pub use service::{spawn_expiry_sweep, ExportDeps, ExportService};
pub use store::{ExportStore, PgExportStore};
