// Ordered Log Data Model
//
// Records exchanged with the log store: entries, pages, revision
// expectations and append outcomes. The store itself is an external
// collaborator reached through the traits in `store`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod memory;
pub mod store;

pub use memory::InMemoryLogStore;
pub use store::{LiveFeed, LogStore};

/// Per-stream revision number. The first entry of a stream is revision 0.
pub type Revision = u64;

/// Position of an entry in the global log.
///
/// Strictly increasing, never reused, totally ordered across streams.
pub type Position = u64;

/// What to read: one stream or the whole log.
///
/// Derived streams (`$ce-…`, `$et-…`, `$streams`) are ordinary stream
/// names from the engine's point of view; their only observable
/// difference is that they may not exist before first use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    /// The global log, ordered by [`Position`].
    All,
    /// A single named stream, ordered by [`Revision`].
    Stream(String),
}

impl Source {
    pub fn stream(name: impl Into<String>) -> Self {
        Source::Stream(name.into())
    }

    /// The by-category projection stream for `category`.
    pub fn category(category: &str) -> Self {
        Source::Stream(format!("$ce-{category}"))
    }

    /// The by-entry-type projection stream for `entry_type`.
    pub fn event_type(entry_type: &str) -> Self {
        Source::Stream(format!("$et-{entry_type}"))
    }

    /// The system stream listing every created stream.
    pub fn streams_index() -> Self {
        Source::Stream("$streams".to_string())
    }
}

/// Position argument for reads and subscriptions.
///
/// Forward reads treat `At(p)` as inclusive; backward reads treat it
/// as the newest entry to include. `Start` passed to a backward read
/// denotes "before the first entry" and yields an empty ended page,
/// which keeps [`Page::next`] a valid argument in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadFrom {
    Start,
    End,
    At(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Backward,
}

/// A writer-side entry: identity and payload, no position yet.
///
/// The store assigns stream, revision and position on append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryData {
    pub id: Uuid,
    pub entry_type: String,
    pub data: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
}

impl EntryData {
    pub fn new(entry_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entry_type: entry_type.into(),
            data,
            metadata: None,
        }
    }

    /// Serialize `payload` as JSON for the entry body.
    pub fn json<T: Serialize>(
        entry_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(entry_type, serde_json::to_vec(payload)?))
    }

    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// An entry as recorded in the log. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: Uuid,
    pub entry_type: String,
    pub data: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
    pub stream: String,
    pub revision: Revision,
    pub position: Position,
}

impl Entry {
    /// The ordering key of this entry within `source`: the global
    /// position for [`Source::All`], the stream revision otherwise.
    pub fn ordinal(&self, source: &Source) -> u64 {
        match source {
            Source::All => self.position,
            Source::Stream(_) => self.revision,
        }
    }
}

/// One page of an ordered read.
///
/// `next` is always a valid argument for the next read in the same
/// direction. `is_end` is a point-in-time signal: no further entries
/// existed beyond this page when the read was served.
#[derive(Debug, Clone)]
pub struct Page {
    pub entries: Vec<Entry>,
    pub direction: Direction,
    pub next: ReadFrom,
    pub is_end: bool,
}

impl Page {
    /// An empty page marking the end of data in `direction`.
    pub fn empty_end(direction: Direction, next: ReadFrom) -> Self {
        Self {
            entries: Vec::new(),
            direction,
            next,
            is_end: true,
        }
    }
}

/// The revision a conditional append expects the stream to be at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedRevision {
    /// The stream must not exist yet.
    NoStream,
    /// The stream must exist, at any revision.
    StreamExists,
    /// No check; the append always wins.
    Any,
    /// The stream's current revision must be exactly this.
    Exact(Revision),
}

/// Result of a single conditional append attempt.
///
/// A conflict is a normal value, not an error: the batch was checked
/// against the stream's current revision and rejected whole. Transport
/// failures travel as `Err(StoreError)` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// All entries were appended as one batch; `next_revision` is the
    /// revision of the last entry written.
    Success { next_revision: Revision },
    /// The expectation did not match. `current` is the stream's actual
    /// revision, `None` if the stream does not exist.
    Conflict { current: Option<Revision> },
}

/// Server-side filter for subscriptions.
///
/// Empty groups match everything; non-empty groups must all match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryFilter {
    pub stream_prefixes: Vec<String>,
    pub entry_types: Vec<String>,
}

impl EntryFilter {
    pub fn stream_prefixes<S: Into<String>>(prefixes: impl IntoIterator<Item = S>) -> Self {
        Self {
            stream_prefixes: prefixes.into_iter().map(Into::into).collect(),
            entry_types: Vec::new(),
        }
    }

    pub fn entry_types<S: Into<String>>(types: impl IntoIterator<Item = S>) -> Self {
        Self {
            stream_prefixes: Vec::new(),
            entry_types: types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        let stream_ok = self.stream_prefixes.is_empty()
            || self
                .stream_prefixes
                .iter()
                .any(|p| entry.stream.starts_with(p.as_str()));
        let type_ok =
            self.entry_types.is_empty() || self.entry_types.contains(&entry.entry_type);
        stream_ok && type_ok
    }
}

/// Errors surfaced by the log store.
///
/// `is_transient` is the single classification point used by the
/// retry layer: leader loss, transport failures and topology-change
/// rejections are worth retrying; everything else is not.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("node is not the leader")]
    NotLeader,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("operation invalid at this time: {0}")]
    InvalidOperation(String),

    #[error("access denied")]
    AccessDenied,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("subscription dropped: {0}")]
    SubscriptionDropped(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::NotLeader | StoreError::Transport(_) | StoreError::InvalidOperation(_)
        )
    }
}
