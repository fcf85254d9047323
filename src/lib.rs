// casesync - Git synchronization for test-management project data
// Root library module

pub mod config;
pub mod error;
pub mod git;
pub mod http_server;
pub mod model;
pub mod observability;
pub mod store;
pub mod sync;
pub mod types;
pub mod validation;

// Re-export key types
pub use observability::{
    get_metrics, init_logging, init_logging_with_level, log_operation, with_trace_id, Operation,
    OperationContext, SyncMetrics,
};

pub use config::{AppConfig, DatabaseConfig, ServerConfig, SyncConfig};
pub use error::SyncError;

// Re-export validated types
pub use types::{SanitizedFileName, ValidatedBranchName, ValidatedProjectId, ValidatedRemoteUrl};

pub use model::{
    Attachment, EntityKind, GitSettings, GitSettingsUpdate, GitSettingsView, Project, RunResult,
    Section, TestCase, TestPlan, TestRun, TestStep,
};

// Re-export storage implementations
pub use store::{MemoryProjectStore, PgProjectStore, ProjectStore};

pub use git::{
    CommitAuthor, ConflictPolicy, ConflictReport, ConflictSide, ReconcileOutcome, RemoteSpec,
    RepoStatus, SyncRepository,
};

pub use sync::{
    ExportSummary, Exporter, ImportOptions, ImportSummary, Importer, Manifest, SyncReport,
    SyncService, SyncStatus, SyncTree,
};

pub use http_server::{create_server, start_server};
