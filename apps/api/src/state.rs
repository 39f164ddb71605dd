use std::sync::Arc;

use crate::billing::BillingService;
use crate::exports::ExportService;
use crate::storage::LocalDiskStorage;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub exports: Arc<ExportService>,
    pub billing: Arc<BillingService>,
    /// Present when exports live on local disk; backs the `/files/*key` route.
    pub local_files: Option<Arc<LocalDiskStorage>>,
}
