pub mod config;
pub mod enrollment;
pub mod provider;
pub mod reconciler;
pub mod repository;
pub mod resolver;
pub mod scheduler;
pub mod signature;
pub mod state_machine;
pub mod webhook;

use std::sync::Arc;

pub use enrollment::{DomainEvent, EnrollmentActivator};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use repository::{InMemoryRepository, Repository, SqliteRepository};
pub use resolver::ChargeResolver;
pub use scheduler::{ReconcileJob, RetryPolicy, Scheduler};

/// Shared state for the HTTP surface.
pub struct AppState {
    pub repository: Arc<dyn Repository>,
    pub scheduler: Scheduler,
    pub webhook_secret: String,
    pub signature_tolerance_secs: i64,
    pub deadletter_auth_token: Option<String>,
}
