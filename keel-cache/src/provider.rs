//! Backing provider contract and an in-memory provider.
//!
//! The cache only consults a [`BackingProvider`] on a miss. Every cursor
//! it opens is closed exactly once, whether draining succeeded or not.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};

use keel_core::{
    DataAccessError, Identity, IndexDefinition, KeelError, KeelResult, KeyValue, Tuple,
};

/// Forward-only cursor over raw tuples.
pub trait Cursor: Send {
    /// Advance and return the next tuple, `None` once exhausted.
    fn next(&mut self) -> KeelResult<Option<Tuple>>;

    /// Release the cursor. Called exactly once by the cache.
    fn close(&mut self) -> KeelResult<()>;
}

/// Source of raw tuples for a key, consulted on cache miss.
pub trait BackingProvider: Send + Sync {
    fn fetch(&self, index: &IndexDefinition, key: &KeyValue) -> KeelResult<Box<dyn Cursor>>;
}

/// Drain a fresh cursor for `key`, closing it exactly once.
///
/// Provider errors come back wrapped with the index and key involved. A
/// close failure after a drain failure is logged and the drain failure wins.
pub(crate) fn read_all(
    provider: &dyn BackingProvider,
    index: &IndexDefinition,
    key: &KeyValue,
) -> KeelResult<Vec<Tuple>> {
    let with_context = |source: KeelError| -> KeelError {
        DataAccessError::FetchFailed {
            index: index.name().to_string(),
            key: key.to_string(),
            source: Box::new(source),
        }
        .into()
    };

    let mut cursor = provider.fetch(index, key).map_err(with_context)?;
    let mut rows = Vec::new();
    let drained = loop {
        match cursor.next() {
            Ok(Some(tuple)) => rows.push(tuple),
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        }
    };
    let closed = cursor.close();

    match (drained, closed) {
        (Ok(()), Ok(())) => Ok(rows),
        (Ok(()), Err(close_err)) => Err(DataAccessError::CloseFailed {
            index: index.name().to_string(),
            key: key.to_string(),
            reason: close_err.to_string(),
        }
        .into()),
        (Err(err), closed) => {
            if let Err(close_err) = closed {
                tracing::warn!(
                    index = index.name(),
                    key = %key,
                    error = %close_err,
                    "Cursor close failed after fetch error"
                );
            }
            Err(with_context(err))
        }
    }
}

// ============================================================================
// IN-MEMORY PROVIDER
// ============================================================================

/// Where an injected provider failure fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailurePoint {
    /// `fetch` itself fails; no cursor is opened.
    Open,
    /// The cursor fails after yielding this many rows.
    AfterRows(usize),
    /// Draining succeeds but `close` fails.
    Close,
}

#[derive(Debug, Default)]
struct ProviderCounters {
    fetches: AtomicUsize,
    closes: AtomicUsize,
}

/// In-memory table standing in for a backing store.
///
/// Rows are only changed by the test or host code that owns the provider,
/// never by the cache; that mirrors a durable store that learns about a
/// transaction's writes only after it commits.
#[derive(Debug, Default)]
pub struct MemoryBackingProvider {
    rows: RwLock<BTreeMap<Identity, Tuple>>,
    counters: Arc<ProviderCounters>,
    failure: Mutex<Option<(FailurePoint, String)>>,
}

impl MemoryBackingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider pre-loaded with `rows`.
    pub fn with_rows(rows: impl IntoIterator<Item = Tuple>) -> Self {
        Self {
            rows: RwLock::new(rows.into_iter().map(|row| (row.identity(), row)).collect()),
            ..Self::default()
        }
    }

    pub fn upsert(&self, tuple: Tuple) -> KeelResult<()> {
        self.write_rows()?.insert(tuple.identity(), tuple);
        Ok(())
    }

    pub fn remove(&self, identity: Identity) -> KeelResult<Option<Tuple>> {
        Ok(self.write_rows()?.remove(&identity))
    }

    pub fn row_count(&self) -> KeelResult<usize> {
        Ok(self
            .rows
            .read()
            .map_err(|_| KeelError::LockPoisoned("provider rows"))?
            .len())
    }

    /// Number of `fetch` calls served so far.
    pub fn fetch_count(&self) -> usize {
        self.counters.fetches.load(Ordering::SeqCst)
    }

    /// Number of cursors closed so far.
    pub fn close_count(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    /// Fail the next fetch at `point`. One-shot.
    pub fn fail_next(&self, point: FailurePoint, reason: impl Into<String>) -> KeelResult<()> {
        *self
            .failure
            .lock()
            .map_err(|_| KeelError::LockPoisoned("provider failure"))? = Some((point, reason.into()));
        Ok(())
    }

    fn write_rows(&self) -> KeelResult<RwLockWriteGuard<'_, BTreeMap<Identity, Tuple>>> {
        self.rows
            .write()
            .map_err(|_| KeelError::LockPoisoned("provider rows"))
    }

    fn take_failure(&self) -> KeelResult<Option<(FailurePoint, String)>> {
        Ok(self
            .failure
            .lock()
            .map_err(|_| KeelError::LockPoisoned("provider failure"))?
            .take())
    }
}

impl BackingProvider for MemoryBackingProvider {
    fn fetch(&self, index: &IndexDefinition, key: &KeyValue) -> KeelResult<Box<dyn Cursor>> {
        self.counters.fetches.fetch_add(1, Ordering::SeqCst);
        let failure = self.take_failure()?;
        if let Some((FailurePoint::Open, reason)) = &failure {
            return Err(DataAccessError::Provider {
                reason: reason.clone(),
            }
            .into());
        }
        let rows = self
            .rows
            .read()
            .map_err(|_| KeelError::LockPoisoned("provider rows"))?
            .values()
            .filter(|tuple| index.matches(tuple, key))
            .cloned()
            .collect::<Vec<_>>();
        Ok(Box::new(MemoryCursor {
            rows: rows.into_iter(),
            yielded: 0,
            failure,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct MemoryCursor {
    rows: std::vec::IntoIter<Tuple>,
    yielded: usize,
    failure: Option<(FailurePoint, String)>,
    counters: Arc<ProviderCounters>,
}

impl Cursor for MemoryCursor {
    fn next(&mut self) -> KeelResult<Option<Tuple>> {
        if let Some((FailurePoint::AfterRows(limit), reason)) = &self.failure {
            if self.yielded >= *limit {
                return Err(DataAccessError::Provider {
                    reason: reason.clone(),
                }
                .into());
            }
        }
        let next = self.rows.next();
        if next.is_some() {
            self.yielded += 1;
        }
        Ok(next)
    }

    fn close(&mut self) -> KeelResult<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        if let Some((FailurePoint::Close, reason)) = &self.failure {
            return Err(DataAccessError::Provider {
                reason: reason.clone(),
            }
            .into());
        }
        Ok(())
    }
}
