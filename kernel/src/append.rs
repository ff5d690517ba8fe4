// Conditional Appends
//
// Optimistic-concurrency appends wrapped in the retry layer. A
// conflict is a normal result; the revision expectation is what makes
// re-issuing a batch after a transient failure safe.

use tracing::{debug, warn};

use crate::log::store::LogStore;
use crate::log::{AppendOutcome, EntryData, ExpectedRevision, Revision, StoreError};
use crate::retry::{self, RetryPolicy};

/// Outcome of a retried conditional append.
///
/// `AlreadyApplied` is the lost-response case: an earlier attempt in
/// this same call succeeded server-side before its response was lost,
/// so the retry observed a conflict whose current revision is exactly
/// where this batch would have left the stream. It is reported only
/// when a retry actually happened; without one, the same arithmetic
/// could equally be a concurrent writer and stays a `Conflict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendReport {
    /// The batch was appended by this call.
    Appended { next_revision: Revision },
    /// The batch was appended by an earlier attempt of this call.
    AlreadyApplied { next_revision: Revision },
    /// The expectation did not match the stream's current revision.
    Conflict { current: Option<Revision> },
}

/// Appends batches under a revision expectation, absorbing transient
/// cluster failures.
pub struct ConditionalAppender<'a> {
    store: &'a dyn LogStore,
    policy: RetryPolicy,
}

impl<'a> ConditionalAppender<'a> {
    pub fn new(store: &'a dyn LogStore) -> Self {
        Self::with_policy(store, RetryPolicy::append_default())
    }

    pub fn with_policy(store: &'a dyn LogStore, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Append `entries` to `stream` iff `expected` matches, retrying
    /// transient failures. Conflicts are never retried.
    pub fn append(
        &self,
        stream: &str,
        expected: ExpectedRevision,
        entries: Vec<EntryData>,
    ) -> Result<AppendReport, StoreError> {
        let batch_len = entries.len() as u64;
        let mut retried = false;

        let outcome = retry::execute(
            &self.policy,
            || self.store.append(stream, expected, entries.clone()),
            StoreError::is_transient,
            |error, attempt, delay| {
                retried = true;
                warn!(%error, attempt, ?delay, stream, "append failed, retrying");
            },
        )?;

        match outcome {
            AppendOutcome::Success { next_revision } => {
                debug!(stream, next_revision, "batch appended");
                Ok(AppendReport::Appended { next_revision })
            }
            AppendOutcome::Conflict { current } => {
                match confirmed_revision(expected, batch_len, current) {
                    Some(next_revision) if retried => {
                        debug!(
                            stream,
                            next_revision, "conflict confirms an earlier lost-response success"
                        );
                        Ok(AppendReport::AlreadyApplied { next_revision })
                    }
                    _ => Ok(AppendReport::Conflict { current }),
                }
            }
        }
    }
}

/// The revision the stream would be at had `expected` + a batch of
/// `batch_len` already been applied; `Some` iff `current` is exactly
/// that.
fn confirmed_revision(
    expected: ExpectedRevision,
    batch_len: u64,
    current: Option<Revision>,
) -> Option<Revision> {
    let would_be = match expected {
        ExpectedRevision::Exact(revision) => revision + batch_len,
        ExpectedRevision::NoStream => batch_len.checked_sub(1)?,
        // Any never conflicts; StreamExists carries no arithmetic.
        ExpectedRevision::Any | ExpectedRevision::StreamExists => return None,
    };
    (current == Some(would_be)).then_some(would_be)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::store::LogStore;
    use crate::log::{InMemoryLogStore, ReadFrom, Source};
    use std::time::Duration;

    fn fast_appender(store: &InMemoryLogStore) -> ConditionalAppender<'_> {
        ConditionalAppender::with_policy(store, RetryPolicy::new(Duration::from_micros(50), 5))
    }

    fn data(entry_type: &str) -> EntryData {
        EntryData::new(entry_type, vec![])
    }

    fn seed(store: &InMemoryLogStore, stream: &str, count: usize) {
        let entries = (0..count).map(|i| data(&format!("E{i}"))).collect();
        store
            .append(stream, ExpectedRevision::NoStream, entries)
            .unwrap();
    }

    #[test]
    fn appends_then_reports_conflict_on_replayed_expectation() {
        let store = InMemoryLogStore::new();
        seed(&store, "S", 5);
        let appender = fast_appender(&store);

        let report = appender
            .append("S", ExpectedRevision::Exact(4), vec![data("E")])
            .unwrap();
        assert_eq!(report, AppendReport::Appended { next_revision: 5 });

        // No transient failure happened, so the equal arithmetic is
        // treated as a genuine conflict from another writer.
        let report = appender
            .append("S", ExpectedRevision::Exact(4), vec![data("E")])
            .unwrap();
        assert_eq!(report, AppendReport::Conflict { current: Some(5) });
    }

    #[test]
    fn conflicts_are_not_retried() {
        let store = InMemoryLogStore::new();
        seed(&store, "S", 2);
        let appender = fast_appender(&store);
        let calls_before = store.append_calls();

        let report = appender
            .append("S", ExpectedRevision::Exact(9), vec![data("A"), data("B")])
            .unwrap();

        assert_eq!(report, AppendReport::Conflict { current: Some(1) });
        assert_eq!(store.append_calls(), calls_before + 1);

        let page = store
            .read_forward(&Source::stream("S"), ReadFrom::Start, 100, false)
            .unwrap();
        assert_eq!(page.entries.len(), 2);
    }

    #[test]
    fn transient_failures_are_absorbed() {
        let store = InMemoryLogStore::new();
        store.inject_fault(StoreError::NotLeader);
        store.inject_fault(StoreError::Transport("reset".into()));
        let appender = fast_appender(&store);

        let report = appender
            .append("S", ExpectedRevision::NoStream, vec![data("A")])
            .unwrap();

        assert_eq!(report, AppendReport::Appended { next_revision: 0 });
        assert_eq!(store.append_calls(), 3);
    }

    #[test]
    fn fatal_failures_surface_without_retry() {
        let store = InMemoryLogStore::new();
        store.inject_fault(StoreError::AccessDenied);
        let appender = fast_appender(&store);

        let err = appender
            .append("S", ExpectedRevision::Any, vec![data("A")])
            .unwrap_err();

        assert_eq!(err, StoreError::AccessDenied);
        assert_eq!(store.append_calls(), 1);
    }

    #[test]
    fn lost_response_conflict_reports_already_applied() {
        let store = InMemoryLogStore::new();
        seed(&store, "S", 3);

        // The server applied an earlier attempt of this batch but the
        // response was lost: the stream is already at revision 4 and
        // the client's first visible attempt fails transiently.
        store
            .append("S", ExpectedRevision::Exact(2), vec![data("X"), data("Y")])
            .unwrap();
        store.inject_fault(StoreError::Transport("response lost".into()));

        let appender = fast_appender(&store);
        let report = appender
            .append("S", ExpectedRevision::Exact(2), vec![data("X"), data("Y")])
            .unwrap();

        assert_eq!(report, AppendReport::AlreadyApplied { next_revision: 4 });
    }

    #[test]
    fn lost_response_on_stream_creation() {
        let store = InMemoryLogStore::new();
        store
            .append("S", ExpectedRevision::NoStream, vec![data("A"), data("B")])
            .unwrap();
        store.inject_fault(StoreError::NotLeader);

        let appender = fast_appender(&store);
        let report = appender
            .append("S", ExpectedRevision::NoStream, vec![data("A"), data("B")])
            .unwrap();

        assert_eq!(report, AppendReport::AlreadyApplied { next_revision: 1 });
    }

    #[test]
    fn mismatched_arithmetic_stays_a_conflict_even_after_retry() {
        let store = InMemoryLogStore::new();
        seed(&store, "S", 5);
        store.inject_fault(StoreError::NotLeader);

        let appender = fast_appender(&store);
        let report = appender
            .append("S", ExpectedRevision::Exact(1), vec![data("X")])
            .unwrap();

        assert_eq!(report, AppendReport::Conflict { current: Some(4) });
    }
}
