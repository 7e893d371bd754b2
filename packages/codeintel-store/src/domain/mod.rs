//! Domain layer: models, lifecycle rules and port traits
//!
//! Nothing in this module performs I/O. Storage adapters live under
//! `crate::infrastructure`.

pub mod filters;
pub mod models;
pub mod ports;
pub mod ranking;
pub mod state;

pub use filters::{BulkUploadOptions, ListUploadsOptions};
pub use models::{
    ArtifactState, AuditOperation, AuditReason, CommitRefresh, DirtyRepository, Index, IndexId,
    Moniker, NewIndex, NewUpload, Package, PackageReference, Repository, RepositoryId,
    RequeueReport, SourcedCommits, TransitionColumn, Upload, UploadAuditLog, UploadId, UploadPage,
};
pub use ports::{
    authorize_repositories, AllowAll, AllowList, PackageReferenceScanner, ReferenceScan,
    RepositoryAuthorizer, UploadStore,
};
pub use ranking::{canonical_providers, ProviderCandidate};
pub use state::UploadStateMachine;
