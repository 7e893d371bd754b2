//! Materialized reference scanner
//!
//! Used by the in-memory store and for results that are known to be empty
//! without touching storage.

use std::collections::VecDeque;

use async_trait::async_trait;

use crate::domain::models::PackageReference;
use crate::domain::ports::PackageReferenceScanner;
use crate::error::Result;

#[derive(Debug, Default)]
pub struct SliceScanner {
    rows: VecDeque<PackageReference>,
    closed: bool,
}

impl SliceScanner {
    pub fn new(rows: Vec<PackageReference>) -> Self {
        Self {
            rows: rows.into(),
            closed: false,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl PackageReferenceScanner for SliceScanner {
    async fn next(&mut self) -> Result<Option<PackageReference>> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.rows.pop_front())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.rows.clear();
        Ok(())
    }
}
