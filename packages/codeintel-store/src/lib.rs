//! codeintel-store - Precise code-intelligence upload lifecycle
//!
//! Tracks uploaded indexes and auto-indexing jobs through their lifecycle,
//! keeps them consistent with the repositories they describe, and resolves
//! package monikers across repository boundaries.
//!
//! ## Core Principles
//!
//! 1. **Soft delete first**: completed uploads go `deleting → deleted` so
//!    derived package data can be reaped; anything earlier is deleted outright
//! 2. **Contention is not failure**: batch claims skip rows locked elsewhere
//! 3. **Visibility is derived**: tip/commit visibility is read through the
//!    commit-graph tables, never cached on the upload row
//!
//! ## Components
//!
//! - [`UploadStore`]: lifecycle storage port, with [`InMemoryUploadStore`] and
//!   (feature `postgres`) [`PostgresUploadStore`]
//! - [`StaleCommitJanitor`]: reconciles uploads against commits that vanished
//! - [`MonikerResolver`]: definition and reference lookup by package identity
//!
//! ## Usage
//!
//! ```rust,ignore
//! use codeintel_store::{AllowAll, InMemoryUploadStore, NewUpload, Repository, UploadStore};
//!
//! let store = InMemoryUploadStore::new();
//! store.upsert_repository(&Repository::new(1, "github.com/example/repo")).await?;
//!
//! let id = store.insert_upload(NewUpload::new(1, "deadbeef", "scip-go"), now).await?;
//! let upload = store.dequeue_upload(now).await?;   // queued → processing
//! store.mark_complete(id, now).await?;             // processing → completed
//!
//! let found = store.get_upload_by_id(id, &AllowAll).await?;
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod janitor;
pub mod monikers;
pub mod scanner;

pub use config::{
    ConfigError, DatabaseConfig, JanitorConfig, LifecycleConfig, MonikerConfig, StoreConfig,
};
pub use domain::{
    authorize_repositories, canonical_providers, AllowAll, AllowList, ArtifactState,
    AuditOperation, AuditReason, BulkUploadOptions, CommitRefresh, DirtyRepository, Index, IndexId,
    ListUploadsOptions, Moniker, NewIndex, NewUpload, Package, PackageReference,
    PackageReferenceScanner, ProviderCandidate, ReferenceScan, Repository, RepositoryAuthorizer,
    RepositoryId, RequeueReport, SourcedCommits, TransitionColumn, Upload, UploadAuditLog,
    UploadId, UploadPage, UploadStateMachine, UploadStore,
};
pub use error::{ErrorKind, Result, StorageError};
pub use infrastructure::InMemoryUploadStore;
#[cfg(feature = "postgres")]
pub use infrastructure::{PgReferenceScanner, PostgresUploadStore};
pub use janitor::{CommitResolver, JanitorReport, StaleCommitJanitor};
pub use monikers::{MonikerResolver, ReferencePage};
pub use scanner::SliceScanner;
