//! GitTreeTranslator - position translation between commits of one file
//!
//! The translator is bound to a request's `(repository, commit, path)`.
//! Diffs are always fetched as `diff(request.commit, other)` and parsed
//! hunk lists are kept in a bounded LRU so repeated lookups against the
//! same commit pair skip both the diff call and the parse.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::hunk::{parse_hunks, Hunk};
use crate::translate::{translate_position, translate_range, Direction, Position, Range};

/// Provider of unified diff text (a git server client in production).
#[async_trait]
pub trait DiffSource: Send + Sync {
    /// Unified diff of `path` between `from` and `to`. An empty string means
    /// the file did not change.
    async fn diff(&self, repository: &str, from: &str, to: &str, path: &str) -> Result<String>;
}

/// The coordinate space a translator is anchored to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TranslationRequest {
    pub repository: String,
    pub commit: String,
    pub path: String,
}

impl TranslationRequest {
    pub fn new(
        repository: impl Into<String>,
        commit: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            commit: commit.into(),
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DiffKey {
    from: String,
    to: String,
    path: String,
}

pub const DEFAULT_HUNK_CACHE_CAPACITY: usize = 512;

pub struct GitTreeTranslator {
    source: Arc<dyn DiffSource>,
    request: TranslationRequest,
    cache: Mutex<LruCache<DiffKey, Arc<Vec<Hunk>>>>,
}

impl GitTreeTranslator {
    pub fn new(source: Arc<dyn DiffSource>, request: TranslationRequest) -> Self {
        Self::with_capacity(source, request, DEFAULT_HUNK_CACHE_CAPACITY)
    }

    pub fn with_capacity(
        source: Arc<dyn DiffSource>,
        request: TranslationRequest,
        capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            source,
            request,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn request(&self) -> &TranslationRequest {
        &self.request
    }

    /// Path of the request's file at `commit`. Renames are not tracked, so
    /// the path is returned as-is.
    pub fn target_path(&self, _commit: &str, path: &str) -> String {
        path.to_string()
    }

    /// Translate `pos` between the request commit and `commit`.
    ///
    /// Forward maps a position at the request commit onto `commit`; with
    /// `reverse` a position at `commit` is mapped back onto the request
    /// commit. `Ok(None)` means the line changed between the two commits.
    #[instrument(skip(self), fields(repository = %self.request.repository, path = %self.request.path))]
    pub async fn translate_position(
        &self,
        commit: &str,
        pos: Position,
        reverse: bool,
    ) -> Result<Option<Position>> {
        let hunks = self.hunks(commit, &self.request.path).await?;
        Ok(translate_position(&hunks, pos, Direction::from_reverse(reverse)))
    }

    #[instrument(skip(self), fields(repository = %self.request.repository))]
    pub async fn translate_range(
        &self,
        commit: &str,
        path: &str,
        range: Range,
        reverse: bool,
    ) -> Result<Option<Range>> {
        let hunks = self.hunks(commit, path).await?;
        Ok(translate_range(&hunks, range, Direction::from_reverse(reverse)))
    }

    async fn hunks(&self, commit: &str, path: &str) -> Result<Arc<Vec<Hunk>>> {
        if commit == self.request.commit {
            return Ok(Arc::new(Vec::new()));
        }

        let key = DiffKey {
            from: self.request.commit.clone(),
            to: commit.to_string(),
            path: path.to_string(),
        };
        if let Some(hunks) = self.cache.lock().get(&key) {
            return Ok(Arc::clone(hunks));
        }

        debug!(from = %key.from, to = %key.to, "hunk cache miss, fetching diff");
        let text = self
            .source
            .diff(&self.request.repository, &key.from, &key.to, path)
            .await?;
        let hunks = Arc::new(parse_hunks(&text)?);
        self.cache.lock().put(key, Arc::clone(&hunks));
        Ok(hunks)
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiffError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        text: String,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DiffSource for CountingSource {
        async fn diff(&self, _repo: &str, _from: &str, _to: &str, _path: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.text.clone())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl DiffSource for FailingSource {
        async fn diff(&self, _repo: &str, _from: &str, _to: &str, _path: &str) -> Result<String> {
            Err(DiffError::diff_source("repository not cloned"))
        }
    }

    fn request() -> TranslationRequest {
        TranslationRequest::new("github.com/example/repo", "deadbeef1", "/foo/bar.go")
    }

    #[tokio::test]
    async fn test_hunks_are_cached_per_commit_pair() {
        let source = Arc::new(CountingSource {
            text: "@@ -3,4 +3,3 @@\n a\n-b\n c\n d\n".to_string(),
            calls: AtomicUsize::new(0),
        });
        let translator = GitTreeTranslator::new(source.clone(), request());

        for _ in 0..3 {
            let out = translator
                .translate_position("deadbeef2", Position::new(10, 1), false)
                .await
                .unwrap();
            assert_eq!(out, Some(Position::new(9, 1)));
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(translator.cached_len(), 1);

        translator
            .translate_position("deadbeef3", Position::new(10, 1), false)
            .await
            .unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_same_commit_skips_diff() {
        let source = Arc::new(CountingSource {
            text: String::new(),
            calls: AtomicUsize::new(0),
        });
        let translator = GitTreeTranslator::new(source.clone(), request());
        let pos = Position::new(4, 2);
        let out = translator.translate_position("deadbeef1", pos, true).await.unwrap();
        assert_eq!(out, Some(pos));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_diff_source_error_propagates() {
        let translator = GitTreeTranslator::new(Arc::new(FailingSource), request());
        let err = translator
            .translate_position("deadbeef2", Position::new(0, 0), false)
            .await
            .unwrap_err();
        assert!(matches!(err, DiffError::DiffSource(_)));
    }

    #[tokio::test]
    async fn test_zero_capacity_still_caches_one_entry() {
        let source = Arc::new(CountingSource {
            text: String::new(),
            calls: AtomicUsize::new(0),
        });
        let translator = GitTreeTranslator::with_capacity(source, request(), 0);
        translator
            .translate_position("deadbeef2", Position::new(1, 1), false)
            .await
            .unwrap();
        assert_eq!(translator.cached_len(), 1);
    }

    #[test]
    fn test_target_path_is_unchanged() {
        let translator = GitTreeTranslator::new(Arc::new(FailingSource), request());
        assert_eq!(translator.target_path("deadbeef2", "/foo/bar.go"), "/foo/bar.go");
    }
}
