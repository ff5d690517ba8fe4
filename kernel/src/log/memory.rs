// In-Memory Log Store
//
// A complete `LogStore` over process memory: 0-based per-stream
// revisions, strictly increasing global positions, atomic conditional
// batch appends and position-based live subscriptions. Backs the test
// suite and the CLI; scripted faults stand in for cluster failures.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::store::{LiveFeed, LogStore};
use super::{
    AppendOutcome, Direction, Entry, EntryData, EntryFilter, ExpectedRevision, Page, ReadFrom,
    Source, StoreError,
};

#[derive(Default)]
pub struct InMemoryLogStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    log: Vec<Entry>,
    streams: HashMap<String, Vec<usize>>,
    subscribers: Vec<Subscriber>,
    faults: VecDeque<StoreError>,
    append_calls: u64,
}

struct Subscriber {
    source: Source,
    filter: Option<EntryFilter>,
    sender: Sender<Entry>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `error` to fail the next store call, whatever it is.
    ///
    /// Queued faults fire in order, one per call, before the call
    /// touches the log.
    pub fn inject_fault(&self, error: StoreError) {
        self.lock().faults.push_back(error);
    }

    /// Number of `append` calls served, including faulted and
    /// conflicting ones.
    pub fn append_calls(&self) -> u64 {
        self.lock().append_calls
    }

    /// Drop every live subscription server-side. Feeds observe
    /// [`StoreError::SubscriptionDropped`] once their backlog drains.
    pub fn disconnect_subscribers(&self) {
        self.lock().subscribers.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn take_fault(&mut self) -> Result<(), StoreError> {
        match self.faults.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Entries of `source` in ascending ordinal order.
    fn entries_of(&self, source: &Source) -> Result<Vec<&Entry>, StoreError> {
        match source {
            Source::All => Ok(self.log.iter().collect()),
            Source::Stream(name) => {
                let indices = self
                    .streams
                    .get(name)
                    .ok_or_else(|| StoreError::StreamNotFound(name.clone()))?;
                Ok(indices.iter().map(|&i| &self.log[i]).collect())
            }
        }
    }

    fn deliver(&mut self, entry: &Entry) {
        self.subscribers.retain(|sub| {
            let wanted = match &sub.source {
                Source::All => true,
                Source::Stream(name) => entry.stream == *name,
            };
            let passes = sub.filter.as_ref().map_or(true, |f| f.matches(entry));
            if wanted && passes {
                // A failed send means the feed was dropped.
                sub.sender.send(entry.clone()).is_ok()
            } else {
                true
            }
        });
    }
}

impl LogStore for InMemoryLogStore {
    fn read_forward(
        &self,
        source: &Source,
        from: ReadFrom,
        limit: usize,
        _resolve_links: bool,
    ) -> Result<Page, StoreError> {
        // No link entries exist in this store, so resolve_links is moot.
        let mut inner = self.lock();
        inner.take_fault()?;

        let entries = inner.entries_of(source)?;
        let start = match from {
            ReadFrom::Start => 0,
            ReadFrom::At(p) => p,
            ReadFrom::End => entries.last().map_or(0, |e| e.ordinal(source) + 1),
        };

        let matching: Vec<&&Entry> = entries
            .iter()
            .filter(|e| e.ordinal(source) >= start)
            .collect();
        let taken: Vec<Entry> = matching.iter().take(limit).map(|e| (**e).clone()).collect();

        let next = match taken.last() {
            Some(last) => ReadFrom::At(last.ordinal(source) + 1),
            None => ReadFrom::At(start),
        };
        Ok(Page {
            is_end: taken.len() == matching.len(),
            entries: taken,
            direction: Direction::Forward,
            next,
        })
    }

    fn read_backward(
        &self,
        source: &Source,
        from: ReadFrom,
        limit: usize,
        _resolve_links: bool,
    ) -> Result<Page, StoreError> {
        let mut inner = self.lock();
        inner.take_fault()?;

        let entries = inner.entries_of(source)?;
        let newest = match from {
            ReadFrom::End => match entries.last() {
                Some(e) => e.ordinal(source),
                None => return Ok(Page::empty_end(Direction::Backward, ReadFrom::Start)),
            },
            ReadFrom::At(p) => p,
            ReadFrom::Start => {
                return Ok(Page::empty_end(Direction::Backward, ReadFrom::Start))
            }
        };

        let matching: Vec<&&Entry> = entries
            .iter()
            .rev()
            .filter(|e| e.ordinal(source) <= newest)
            .collect();
        let taken: Vec<Entry> = matching.iter().take(limit).map(|e| (**e).clone()).collect();

        let next = match taken.last().map(|e| e.ordinal(source)) {
            Some(0) | None => ReadFrom::Start,
            Some(oldest) => ReadFrom::At(oldest - 1),
        };
        Ok(Page {
            is_end: taken.len() == matching.len(),
            entries: taken,
            direction: Direction::Backward,
            next,
        })
    }

    fn append(
        &self,
        stream: &str,
        expected: ExpectedRevision,
        entries: Vec<EntryData>,
    ) -> Result<AppendOutcome, StoreError> {
        let mut inner = self.lock();
        inner.append_calls += 1;
        inner.take_fault()?;

        if stream.starts_with('$') {
            return Err(StoreError::AccessDenied);
        }
        if entries.is_empty() {
            return Err(StoreError::MalformedRequest(
                "append requires at least one entry".to_string(),
            ));
        }

        let current = inner
            .streams
            .get(stream)
            .map(|indices| indices.len() as u64 - 1);
        let matched = match expected {
            ExpectedRevision::Any => true,
            ExpectedRevision::NoStream => current.is_none(),
            ExpectedRevision::StreamExists => current.is_some(),
            ExpectedRevision::Exact(revision) => current == Some(revision),
        };
        if !matched {
            return Ok(AppendOutcome::Conflict { current });
        }

        let mut next_revision = 0;
        for data in entries {
            let index = inner.log.len();
            let revision = inner
                .streams
                .get(stream)
                .map_or(0, |indices| indices.len() as u64);
            let entry = Entry {
                id: data.id,
                entry_type: data.entry_type,
                data: data.data,
                metadata: data.metadata,
                stream: stream.to_string(),
                revision,
                position: index as u64,
            };
            inner.log.push(entry.clone());
            inner
                .streams
                .entry(stream.to_string())
                .or_default()
                .push(index);
            inner.deliver(&entry);
            next_revision = revision;
        }

        Ok(AppendOutcome::Success { next_revision })
    }

    fn subscribe(
        &self,
        source: &Source,
        from: ReadFrom,
        filter: Option<EntryFilter>,
    ) -> Result<Box<dyn LiveFeed>, StoreError> {
        let mut inner = self.lock();
        inner.take_fault()?;

        // An absent stream is a valid subscription target; the feed
        // starts delivering once it is created.
        let backlog = inner.entries_of(source).unwrap_or_default();
        let start = match from {
            ReadFrom::Start => 0,
            ReadFrom::At(p) => p,
            ReadFrom::End => backlog.last().map_or(0, |e| e.ordinal(source) + 1),
        };

        let (sender, receiver) = mpsc::channel();
        for entry in backlog {
            if entry.ordinal(source) >= start
                && filter.as_ref().map_or(true, |f| f.matches(entry))
            {
                // The receiver cannot be gone yet; ignore send results.
                let _ = sender.send(entry.clone());
            }
        }
        inner.subscribers.push(Subscriber {
            source: source.clone(),
            filter,
            sender,
        });

        Ok(Box::new(MemoryLiveFeed { receiver }))
    }
}

struct MemoryLiveFeed {
    receiver: Receiver<Entry>,
}

impl LiveFeed for MemoryLiveFeed {
    fn next(&mut self, wait: Duration) -> Result<Option<Entry>, StoreError> {
        match self.receiver.recv_timeout(wait) {
            Ok(entry) => Ok(Some(entry)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(StoreError::SubscriptionDropped(
                "server closed the subscription".to_string(),
            )),
        }
    }
}
