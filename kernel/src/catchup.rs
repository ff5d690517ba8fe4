// Catch-Up To Live Subscription
//
// One state machine owns the whole handoff: capture the current tail
// position, replay history up to it, then switch to a live feed. The
// boundary entry is delivered exactly once, during replay; anything
// the live feed replays at or before the checkpoint is discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::log::store::LogStore;
use crate::log::{Direction, Entry, EntryFilter, ReadFrom, Source, StoreError};
use crate::reader::{PageReader, DEFAULT_PAGE_SIZE};
use crate::retry::{self, RetryPolicy};

/// Phase of a coordinator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupState {
    CapturingTail,
    Replaying,
    Live,
    Closed,
}

/// Resumable cursor over a source: the ordinal of the last entry
/// delivered. Persist it between runs and feed it back through
/// [`Checkpoint::resume_from`] to continue without gaps or repeats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint(Option<u64>);

impl Checkpoint {
    /// Nothing delivered yet.
    pub fn start() -> Self {
        Self(None)
    }

    pub fn at(ordinal: u64) -> Self {
        Self(Some(ordinal))
    }

    pub fn advance(&mut self, ordinal: u64) {
        self.0 = Some(ordinal);
    }

    pub fn last(&self) -> Option<u64> {
        self.0
    }

    /// Where a new run should start reading.
    pub fn resume_from(&self) -> ReadFrom {
        match self.0 {
            Some(ordinal) => ReadFrom::At(ordinal + 1),
            None => ReadFrom::Start,
        }
    }
}

/// Cooperative cancellation shared between a coordinator and its
/// caller. Takes effect at the next delivery boundary, never
/// mid-entry.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct CatchupOptions {
    /// Entries per replay page.
    pub batch_size: usize,
    /// Retry policy for tail capture and replay reads.
    pub read_retry: RetryPolicy,
    /// Filter applied to deliveries in both phases.
    pub filter: Option<EntryFilter>,
    /// Resolve link entries in derived sources.
    pub resolve_links: bool,
    /// Poll granularity of the live loop; bounds cancellation latency.
    pub live_poll: Duration,
}

impl Default for CatchupOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_PAGE_SIZE,
            read_retry: RetryPolicy::read_default(),
            filter: None,
            resolve_links: false,
            live_poll: Duration::from_millis(50),
        }
    }
}

/// Receives every delivered entry plus the replay-to-live transition.
pub trait CatchupHandler {
    fn on_entry(&mut self, entry: &Entry);

    /// Called exactly once, after replay finished and before any live
    /// entry. Catch-up is not complete until this fires.
    fn on_live(&mut self, checkpoint: &Checkpoint) {
        let _ = checkpoint;
    }
}

impl<F: FnMut(&Entry)> CatchupHandler for F {
    fn on_entry(&mut self, entry: &Entry) {
        self(entry)
    }
}

/// Run-scoped delivery tally, one per coordinator run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchupStats {
    pub replayed: u64,
    pub live: u64,
}

impl CatchupStats {
    pub fn delivered(&self) -> u64 {
        self.replayed + self.live
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatchupError {
    #[error("failed to capture tail position: {0}")]
    CaptureTail(#[source] StoreError),

    #[error("replay read failed: {0}")]
    Replay(#[source] StoreError),

    #[error("live subscription dropped: {0}")]
    SubscriptionDropped(#[source] StoreError),
}

/// Drives one catch-up pass and one live feed over a single source.
///
/// A failed or cancelled run can always be restarted from the last
/// checkpoint: replay is idempotent given ordered, position-deduped
/// delivery.
pub struct CatchupCoordinator<'a> {
    store: &'a dyn LogStore,
    source: Source,
    options: CatchupOptions,
    state: CatchupState,
    checkpoint: Checkpoint,
}

impl<'a> CatchupCoordinator<'a> {
    pub fn new(store: &'a dyn LogStore, source: Source) -> Self {
        Self::with_options(store, source, CatchupOptions::default())
    }

    pub fn with_options(store: &'a dyn LogStore, source: Source, options: CatchupOptions) -> Self {
        Self {
            store,
            source,
            options,
            state: CatchupState::CapturingTail,
            checkpoint: Checkpoint::start(),
        }
    }

    pub fn state(&self) -> CatchupState {
        self.state
    }

    /// Last delivered ordinal; persist this to resume a later run.
    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint
    }

    /// Replay from `start` to the captured tail, hand off to a live
    /// feed, and deliver until `cancel` fires or the subscription
    /// drops.
    pub fn run<H: CatchupHandler>(
        &mut self,
        start: ReadFrom,
        handler: &mut H,
        cancel: &CancelToken,
    ) -> Result<CatchupStats, CatchupError> {
        let mut stats = CatchupStats::default();

        self.state = CatchupState::CapturingTail;
        let tail = self.capture_tail()?;
        info!(source = ?self.source, ?tail, "captured tail position");

        // Seed the cursor with what the caller considers already
        // delivered: everything below n for `At(n)`, all of history
        // for `End`. The live fence must hold even when replay has
        // nothing left to do.
        self.checkpoint = match start {
            ReadFrom::At(ordinal) if ordinal > 0 => Checkpoint::at(ordinal - 1),
            ReadFrom::End => tail.map_or(Checkpoint::start(), Checkpoint::at),
            _ => Checkpoint::start(),
        };

        if tail.is_some() {
            self.state = CatchupState::Replaying;
            self.replay(start, tail, handler, cancel, &mut stats)?;
            if cancel.is_cancelled() {
                self.state = CatchupState::Closed;
                return Ok(stats);
            }
        }

        self.state = CatchupState::Live;
        info!(
            source = ?self.source,
            replayed = stats.replayed,
            "caught up, switching to live feed"
        );
        handler.on_live(&self.checkpoint);

        let result = self.live(start, tail, handler, cancel, &mut stats);
        self.state = CatchupState::Closed;
        result.map(|()| stats)
    }

    /// One backward read of page size 1: the newest ordinal of the
    /// source, `None` if it is empty or absent.
    fn capture_tail(&self) -> Result<Option<u64>, CatchupError> {
        let reader = PageReader::new(self.store, self.source.clone())
            .page_size(1)
            .resolve_links(self.options.resolve_links);

        let page = retry::execute(
            &self.options.read_retry,
            || reader.read(Direction::Backward, ReadFrom::End),
            StoreError::is_transient,
            |error, attempt, delay| {
                warn!(%error, attempt, ?delay, "tail capture failed, retrying");
            },
        )
        .map_err(CatchupError::CaptureTail)?;

        Ok(page.entries.first().map(|e| e.ordinal(&self.source)))
    }

    fn replay<H: CatchupHandler>(
        &mut self,
        start: ReadFrom,
        tail: Option<u64>,
        handler: &mut H,
        cancel: &CancelToken,
        stats: &mut CatchupStats,
    ) -> Result<(), CatchupError> {
        let reader = PageReader::new(self.store, self.source.clone())
            .page_size(self.options.batch_size)
            .resolve_links(self.options.resolve_links);

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            // Resume from the last delivered entry, not the page
            // start, so a retried read never skips or repeats.
            let from = match self.checkpoint.last() {
                Some(ordinal) => ReadFrom::At(ordinal + 1),
                None => start,
            };
            let page = retry::execute(
                &self.options.read_retry,
                || reader.read(Direction::Forward, from),
                StoreError::is_transient,
                |error, attempt, delay| {
                    warn!(%error, attempt, ?delay, "replay read failed, retrying");
                },
            )
            .map_err(CatchupError::Replay)?;

            for entry in &page.entries {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                let ordinal = entry.ordinal(&self.source);
                if tail.is_some_and(|t| ordinal > t) {
                    // Appended after the tail was captured; the live
                    // feed owns everything past the fence.
                    return Ok(());
                }
                if self.deliver(entry, handler) {
                    stats.replayed += 1;
                }
                if tail == Some(ordinal) {
                    return Ok(());
                }
            }

            if page.is_end {
                return Ok(());
            }
            debug!(replayed = stats.replayed, "replay page consumed");
        }
    }

    fn live<H: CatchupHandler>(
        &mut self,
        start: ReadFrom,
        tail: Option<u64>,
        handler: &mut H,
        cancel: &CancelToken,
        stats: &mut CatchupStats,
    ) -> Result<(), CatchupError> {
        let from = match tail {
            Some(ordinal) => ReadFrom::At(ordinal),
            None => start,
        };
        let mut feed = self
            .store
            .subscribe(&self.source, from, self.options.filter.clone())
            .map_err(CatchupError::SubscriptionDropped)?;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match feed.next(self.options.live_poll) {
                Ok(Some(entry)) => {
                    let ordinal = entry.ordinal(&self.source);
                    // Subscription starts may be inclusive; the
                    // checkpoint fence drops the boundary duplicate.
                    if self.checkpoint.last().is_some_and(|seen| ordinal <= seen) {
                        continue;
                    }
                    if self.deliver(&entry, handler) {
                        stats.live += 1;
                    }
                }
                Ok(None) => continue,
                Err(error) => return Err(CatchupError::SubscriptionDropped(error)),
            }
        }
    }

    /// Hand `entry` to the handler if it passes the filter. Filtered
    /// entries still move the cursor; they are consumed either way.
    fn deliver<H: CatchupHandler>(&mut self, entry: &Entry, handler: &mut H) -> bool {
        let passes = self
            .options
            .filter
            .as_ref()
            .map_or(true, |f| f.matches(entry));
        if passes {
            handler.on_entry(entry);
        }
        self.checkpoint.advance(entry.ordinal(&self.source));
        passes
    }
}
