// Log Store Abstraction
//
// Defines the contract for the external ordered-log service. The
// engine only consumes these traits; connection construction,
// credentials and the wire protocol live with the implementation.
//
// This module defines *interfaces only*.

use std::time::Duration;

use super::{
    AppendOutcome, Entry, EntryData, EntryFilter, ExpectedRevision, Page, ReadFrom, Source,
    StoreError,
};

/// An ordered, append-only log reachable over unreliable transport.
///
/// Properties required from implementations:
/// - Entries within a source are totally ordered and never reordered
/// - Positions and revisions are strictly increasing, never reused
/// - `append` compares the expectation against the current revision
///   atomically with the write; a batch lands whole or not at all
///
/// Implementations MAY fail any call with a transient error
/// ([`StoreError::is_transient`]); callers own retry and must only
/// re-issue idempotent or revision-guarded requests.
pub trait LogStore: Send + Sync {
    /// Read up to `limit` entries from `source` in log order,
    /// starting at `from` (inclusive).
    ///
    /// Absent streams are reported as [`StoreError::StreamNotFound`];
    /// derived sources are expected to hit this before first use.
    /// `resolve_links` asks the store to resolve link entries in
    /// derived streams to the entries they point at.
    fn read_forward(
        &self,
        source: &Source,
        from: ReadFrom,
        limit: usize,
        resolve_links: bool,
    ) -> Result<Page, StoreError>;

    /// Read up to `limit` entries from `source` newest-first,
    /// starting at `from` (the newest entry to include).
    fn read_backward(
        &self,
        source: &Source,
        from: ReadFrom,
        limit: usize,
        resolve_links: bool,
    ) -> Result<Page, StoreError>;

    /// Append `entries` to `stream` as one indivisible batch iff
    /// `expected` matches the stream's current revision.
    ///
    /// A mismatch is a normal [`AppendOutcome::Conflict`], never an
    /// `Err`; the log is unchanged in that case.
    fn append(
        &self,
        stream: &str,
        expected: ExpectedRevision,
        entries: Vec<EntryData>,
    ) -> Result<AppendOutcome, StoreError>;

    /// Open a live feed over `source` starting at `from`.
    ///
    /// Entries already in the log at or after `from` are delivered
    /// first, then every subsequent append, in order. The start is
    /// position-based and MAY be inclusive of the entry at `from`
    /// itself; consumers own deduplication at that boundary.
    fn subscribe(
        &self,
        source: &Source,
        from: ReadFrom,
        filter: Option<EntryFilter>,
    ) -> Result<Box<dyn LiveFeed>, StoreError>;
}

/// A cancellable stream of live entries.
///
/// Dropping the feed cancels the subscription.
pub trait LiveFeed: Send {
    /// Wait up to `wait` for the next entry.
    ///
    /// `Ok(None)` means the wait elapsed with nothing to deliver; the
    /// subscription is still healthy. A dropped subscription surfaces
    /// as [`StoreError::SubscriptionDropped`].
    fn next(&mut self, wait: Duration) -> Result<Option<Entry>, StoreError>;
}
