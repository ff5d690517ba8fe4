// Typed Event Folding
//
// Maps entry type tags to decode-and-fold functions applied against a
// caller-owned accumulator: a dispatch table instead of a switch over
// type strings, with one accumulator per run instead of globals.

use std::collections::HashMap;

use serde::de::DeserializeOwned;

use crate::log::Entry;

/// Returned when a registered folder cannot decode an entry payload.
#[derive(Debug, thiserror::Error)]
#[error("cannot decode `{entry_type}` payload: {source}")]
pub struct FoldError {
    pub entry_type: String,
    #[source]
    pub source: serde_json::Error,
}

type FoldFn<S> = Box<dyn FnMut(&mut S, &Entry) -> Result<(), FoldError> + Send>;

/// Registry of per-type fold functions over an accumulator `S`.
#[derive(Default)]
pub struct FoldRegistry<S> {
    folders: HashMap<String, FoldFn<S>>,
}

impl<S> FoldRegistry<S> {
    pub fn new() -> Self {
        Self {
            folders: HashMap::new(),
        }
    }

    /// Register a raw folder for `entry_type`.
    pub fn on<F>(&mut self, entry_type: impl Into<String>, mut fold: F) -> &mut Self
    where
        F: FnMut(&mut S, &Entry) + Send + 'static,
    {
        self.folders.insert(
            entry_type.into(),
            Box::new(move |state, entry| {
                fold(state, entry);
                Ok(())
            }),
        );
        self
    }

    /// Register a folder that decodes the payload as JSON into `T`
    /// before folding.
    pub fn on_json<T, F>(&mut self, entry_type: impl Into<String>, mut fold: F) -> &mut Self
    where
        T: DeserializeOwned,
        F: FnMut(&mut S, T) + Send + 'static,
    {
        self.folders.insert(
            entry_type.into(),
            Box::new(move |state, entry| {
                let payload: T =
                    serde_json::from_slice(&entry.data).map_err(|source| FoldError {
                        entry_type: entry.entry_type.clone(),
                        source,
                    })?;
                fold(state, payload);
                Ok(())
            }),
        );
        self
    }

    /// Fold `entry` into `state`. Returns whether a folder matched;
    /// unregistered types are skipped, not errors.
    pub fn apply(&mut self, state: &mut S, entry: &Entry) -> Result<bool, FoldError> {
        match self.folders.get_mut(&entry.entry_type) {
            Some(fold) => {
                fold(state, entry)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use uuid::Uuid;

    #[derive(Deserialize)]
    struct ReadEvent {
        value: i64,
    }

    #[derive(Deserialize)]
    struct ReadEvent2 {
        value: i64,
    }

    fn entry(entry_type: &str, data: &[u8], revision: u64) -> Entry {
        Entry {
            id: Uuid::new_v4(),
            entry_type: entry_type.to_string(),
            data: data.to_vec(),
            metadata: None,
            stream: "S".to_string(),
            revision,
            position: revision,
        }
    }

    #[test]
    fn folds_registered_types_into_the_accumulator() {
        let mut registry: FoldRegistry<i64> = FoldRegistry::new();
        registry
            .on_json("ReadEvent", |total, e: ReadEvent| *total += e.value)
            .on_json("ReadEvent2", |total, e: ReadEvent2| *total += e.value);

        let mut total = 0i64;
        let entries = [
            entry("ReadEvent", br#"{"value":1}"#, 0),
            entry("ReadEvent2", br#"{"value":2}"#, 1),
            entry("ReadEvent", br#"{"value":1}"#, 2),
        ];
        for e in &entries {
            assert!(registry.apply(&mut total, e).unwrap());
        }

        assert_eq!(total, 4);
    }

    #[test]
    fn unregistered_types_are_skipped() {
        let mut registry: FoldRegistry<u64> = FoldRegistry::new();
        registry.on("Known", |count, _| *count += 1);

        let mut count = 0u64;
        assert!(registry.apply(&mut count, &entry("Known", b"", 0)).unwrap());
        assert!(!registry
            .apply(&mut count, &entry("Unknown", b"", 1))
            .unwrap());
        assert_eq!(count, 1);
    }

    #[test]
    fn undecodable_payloads_surface_a_fold_error() {
        let mut registry: FoldRegistry<i64> = FoldRegistry::new();
        registry.on_json("ReadEvent", |total, e: ReadEvent| *total += e.value);

        let mut total = 0i64;
        let err = registry
            .apply(&mut total, &entry("ReadEvent", b"not json", 0))
            .unwrap_err();
        assert_eq!(err.entry_type, "ReadEvent");
        assert_eq!(total, 0);
    }
}
