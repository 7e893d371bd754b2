//! Upload lifecycle state machine
//!
//! ```text
//! uploading → queued → processing → completed → deleting → deleted
//!                ↑          ↓
//!                └──── errored ──→ failed
//! ```
//!
//! Any state before `completed` goes straight to `deleted` on a delete
//! request since no derived data exists yet.

use chrono::{DateTime, Utc};

use crate::domain::models::{ArtifactState, Upload};
use crate::error::{Result, StorageError};

impl ArtifactState {
    pub fn can_transition_to(&self, next: ArtifactState) -> bool {
        use ArtifactState::*;
        matches!(
            (*self, next),
            (Uploading, Queued)
                | (Queued, Processing)
                | (Processing, Completed)
                | (Processing, Errored)
                | (Errored, Queued)
                | (Errored, Failed)
                | (Completed, Deleting)
                | (Deleting, Deleted)
                | (Uploading | Queued | Processing | Errored | Failed, Deleted)
        )
    }

    /// State a delete request moves this state to, or `None` if the row is
    /// already (soft-)deleted.
    pub fn delete_target(&self) -> Option<ArtifactState> {
        match self {
            ArtifactState::Completed => Some(ArtifactState::Deleting),
            ArtifactState::Deleting | ArtifactState::Deleted => None,
            _ => Some(ArtifactState::Deleted),
        }
    }
}

/// Checked transitions over a single upload row
pub struct UploadStateMachine<'a> {
    upload: &'a mut Upload,
}

impl<'a> UploadStateMachine<'a> {
    pub fn new(upload: &'a mut Upload) -> Self {
        Self { upload }
    }

    fn transition(&mut self, next: ArtifactState) -> Result<()> {
        if !self.upload.state.can_transition_to(next) {
            return Err(StorageError::illegal_transition(self.upload.state, next));
        }
        self.upload.state = next;
        Ok(())
    }

    /// Record an uploaded part; returns true once all parts are present and
    /// the upload moved to `queued`.
    pub fn add_part(&mut self, part: u32) -> Result<bool> {
        if self.upload.state != ArtifactState::Uploading {
            return Err(StorageError::illegal_transition(
                self.upload.state,
                ArtifactState::Uploading,
            ));
        }
        if part >= self.upload.num_parts {
            return Err(StorageError::new(
                crate::error::ErrorKind::IllegalStateTransition,
                format!(
                    "Part {} out of range for upload {} with {} parts",
                    part, self.upload.id, self.upload.num_parts
                ),
            ));
        }
        if !self.upload.uploaded_parts.contains(&part) {
            self.upload.uploaded_parts.push(part);
            self.upload.uploaded_parts.sort_unstable();
        }
        if self.upload.uploaded_parts.len() as u32 == self.upload.num_parts {
            self.transition(ArtifactState::Queued)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Transition: QUEUED → PROCESSING
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(ArtifactState::Processing)?;
        self.upload.started_at = Some(now);
        Ok(())
    }

    /// Transition: PROCESSING → COMPLETED
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(ArtifactState::Completed)?;
        self.upload.finished_at = Some(now);
        self.upload.failure_message = None;
        Ok(())
    }

    /// Transition: PROCESSING → ERRORED
    pub fn error(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(ArtifactState::Errored)?;
        self.upload.finished_at = Some(now);
        self.upload.failure_message = Some(message.into());
        self.upload.num_failures += 1;
        Ok(())
    }

    /// Transition: ERRORED → QUEUED, or ERRORED → FAILED once the retry
    /// budget is spent.
    pub fn requeue(&mut self, max_failures: u32) -> Result<ArtifactState> {
        let next = if self.upload.num_failures >= max_failures {
            ArtifactState::Failed
        } else {
            ArtifactState::Queued
        };
        self.transition(next)?;
        if next == ArtifactState::Queued {
            self.upload.started_at = None;
            self.upload.finished_at = None;
        }
        Ok(next)
    }

    /// Soft delete. Returns false if the row was already deleted.
    pub fn delete(&mut self) -> Result<bool> {
        match self.upload.state.delete_target() {
            Some(next) => {
                self.transition(next)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Transition: DELETING → DELETED
    pub fn reap(&mut self) -> Result<()> {
        self.transition(ArtifactState::Deleted)
    }
}
