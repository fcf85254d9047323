//! Moving project rows between the store and a git working directory.

pub mod exporter;
pub mod importer;
pub mod layout;
pub mod ordering;
pub mod report;
pub mod service;

#[cfg(test)]
pub(crate) mod test_support;

pub use exporter::Exporter;
pub use importer::{ImportOptions, Importer};
pub use layout::{Manifest, SyncTree, FORMAT_VERSION};
pub use ordering::order_sections;
pub use report::{ExportSummary, ImportSummary, SyncReport, SyncStatus};
pub use service::SyncService;
