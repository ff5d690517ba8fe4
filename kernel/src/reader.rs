// Paginated Log Reading
//
// Pulls an ordered sequence of entries in fixed-size pages, forward
// or backward, and exposes the loop-until-end consumption pattern.
// Absent streams read as empty, ended pages so derived sources can be
// polled before they exist.

use tracing::debug;

use crate::log::{Direction, Entry, Page, ReadFrom, Source, StoreError};
use crate::log::store::LogStore;

/// Default entries per page; bounds memory and per-call overhead.
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Reads one source in pages.
pub struct PageReader<'a> {
    store: &'a dyn LogStore,
    source: Source,
    page_size: usize,
    resolve_links: bool,
}

impl<'a> PageReader<'a> {
    pub fn new(store: &'a dyn LogStore, source: Source) -> Self {
        Self {
            store,
            source,
            page_size: DEFAULT_PAGE_SIZE,
            resolve_links: false,
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn resolve_links(mut self, resolve_links: bool) -> Self {
        self.resolve_links = resolve_links;
        self
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Read a single page starting at `from`.
    ///
    /// `page.next` is a valid `from` for the next call in the same
    /// direction; `page.is_end` means no further entries existed at
    /// call time. A missing stream yields an empty ended page; every
    /// other error propagates unchanged.
    pub fn read(&self, direction: Direction, from: ReadFrom) -> Result<Page, StoreError> {
        let result = match direction {
            Direction::Forward => {
                self.store
                    .read_forward(&self.source, from, self.page_size, self.resolve_links)
            }
            Direction::Backward => {
                self.store
                    .read_backward(&self.source, from, self.page_size, self.resolve_links)
            }
        };

        match result {
            Err(StoreError::StreamNotFound(stream)) => {
                debug!(%stream, "source does not exist yet, reporting end of data");
                let next = match direction {
                    Direction::Forward => from,
                    Direction::Backward => ReadFrom::Start,
                };
                Ok(Page::empty_end(direction, next))
            }
            other => other,
        }
    }

    /// Drive `read` from `from` until `is_end`, handing every entry
    /// to `handler` in order. Returns the number of entries seen.
    ///
    /// With no concurrent writer this observes exactly the entries
    /// present at the first call.
    pub fn consume<F>(
        &self,
        direction: Direction,
        from: ReadFrom,
        mut handler: F,
    ) -> Result<u64, StoreError>
    where
        F: FnMut(&Entry),
    {
        let mut from = from;
        let mut count = 0u64;
        loop {
            let page = self.read(direction, from)?;
            for entry in &page.entries {
                handler(entry);
                count += 1;
            }
            debug!(
                entries = page.entries.len(),
                is_end = page.is_end,
                "consumed page"
            );
            if page.is_end {
                return Ok(count);
            }
            from = page.next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::store::LogStore;
    use crate::log::{EntryData, ExpectedRevision, InMemoryLogStore};
    use proptest::prelude::*;

    fn seeded(stream: &str, count: usize) -> InMemoryLogStore {
        let store = InMemoryLogStore::new();
        if count > 0 {
            let entries = (0..count)
                .map(|i| EntryData::new(format!("E{i}"), vec![]))
                .collect();
            store
                .append(stream, ExpectedRevision::NoStream, entries)
                .unwrap();
        }
        store
    }

    #[test]
    fn forward_pages_preserve_order_and_resume() {
        let store = seeded("S", 7);
        let reader = PageReader::new(&store, Source::stream("S")).page_size(3);

        let page = reader.read(Direction::Forward, ReadFrom::Start).unwrap();
        assert_eq!(
            page.entries.iter().map(|e| e.revision).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(!page.is_end);
        assert_eq!(page.next, ReadFrom::At(3));

        let page = reader.read(Direction::Forward, page.next).unwrap();
        assert_eq!(
            page.entries.iter().map(|e| e.revision).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
        assert!(!page.is_end);

        let page = reader.read(Direction::Forward, page.next).unwrap();
        assert_eq!(
            page.entries.iter().map(|e| e.revision).collect::<Vec<_>>(),
            vec![6]
        );
        assert!(page.is_end);
    }

    #[test]
    fn missing_stream_reads_as_empty_end_page() {
        let store = InMemoryLogStore::new();
        let reader = PageReader::new(&store, Source::category("Account"));

        let page = reader.read(Direction::Forward, ReadFrom::Start).unwrap();
        assert!(page.entries.is_empty());
        assert!(page.is_end);

        let page = reader.read(Direction::Backward, ReadFrom::End).unwrap();
        assert!(page.entries.is_empty());
        assert!(page.is_end);

        let count = reader
            .consume(Direction::Forward, ReadFrom::Start, |_| {})
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn non_missing_errors_propagate_unchanged() {
        let store = seeded("S", 1);
        store.inject_fault(StoreError::AccessDenied);
        let reader = PageReader::new(&store, Source::stream("S"));

        let err = reader.read(Direction::Forward, ReadFrom::Start).unwrap_err();
        assert_eq!(err, StoreError::AccessDenied);
    }

    #[test]
    fn backward_tail_probe_returns_newest_entry() {
        let store = seeded("S", 5);
        let reader = PageReader::new(&store, Source::stream("S")).page_size(1);

        let page = reader.read(Direction::Backward, ReadFrom::End).unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].revision, 4);
    }

    proptest! {
        // Pagination completeness: any page size observes all N
        // entries exactly once, ascending forward and descending
        // backward.
        #[test]
        fn pagination_is_complete(n in 1usize..40, page_size in 1usize..50) {
            let store = seeded("S", n);
            let reader = PageReader::new(&store, Source::stream("S")).page_size(page_size);

            let mut forward = Vec::new();
            let count = reader
                .consume(Direction::Forward, ReadFrom::Start, |e| forward.push(e.revision))
                .unwrap();
            prop_assert_eq!(count, n as u64);
            prop_assert_eq!(&forward, &(0..n as u64).collect::<Vec<_>>());

            let mut backward = Vec::new();
            let count = reader
                .consume(Direction::Backward, ReadFrom::End, |e| backward.push(e.revision))
                .unwrap();
            prop_assert_eq!(count, n as u64);
            prop_assert_eq!(&backward, &(0..n as u64).rev().collect::<Vec<_>>());
        }
    }
}
