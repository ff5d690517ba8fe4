use std::fs;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use tidemark_kernel::append::{AppendReport, ConditionalAppender};
use tidemark_kernel::catchup::{
    CancelToken, CatchupCoordinator, CatchupHandler, CatchupOptions, Checkpoint,
};
use tidemark_kernel::fold::FoldRegistry;
use tidemark_kernel::log::store::LogStore;
use tidemark_kernel::log::{
    Direction, Entry, EntryData, EntryFilter, ExpectedRevision, InMemoryLogStore, ReadFrom,
    Source,
};
use tidemark_kernel::reader::PageReader;
use tidemark_kernel::retry::{self, RetryPolicy};

mod events;

use events::{AccountCreated, AccountCredited, AccountDebited};

/// Tidemark log console
#[derive(Parser, Debug)]
#[command(name = "tidemark")]
#[command(about = "Read, append and tail an ordered event log", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write account fixture streams and save the log as JSON
    Seed {
        /// Output path for the log JSON
        #[arg(long)]
        out: String,

        /// Number of account streams
        #[arg(long, default_value_t = 4)]
        streams: usize,

        /// Conditional-append batches per stream
        #[arg(long, default_value_t = 10)]
        batches: usize,

        /// Entries per batch
        #[arg(long, default_value_t = 100)]
        batch_size: usize,
    },

    /// Page through a log JSON file and print read statistics
    Read {
        /// Path to the log JSON
        #[arg(long)]
        log: String,

        /// Read one stream instead of the whole log
        #[arg(long)]
        stream: Option<String>,

        /// Read newest-first
        #[arg(long)]
        backward: bool,

        #[arg(long, default_value_t = 200)]
        page_size: usize,
    },

    /// Catch up over a log JSON file and tally events by type
    Tail {
        /// Path to the log JSON
        #[arg(long)]
        log: String,

        /// Tail one stream instead of the whole log
        #[arg(long)]
        stream: Option<String>,

        /// Only deliver streams with one of these prefixes
        #[arg(long)]
        prefix: Vec<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Seed {
            out,
            streams,
            batches,
            batch_size,
        } => seed(&out, streams, batches, batch_size),
        Command::Read {
            log,
            stream,
            backward,
            page_size,
        } => read(&log, stream, backward, page_size),
        Command::Tail {
            log,
            stream,
            prefix,
        } => tail(&log, stream, prefix),
    }
}

fn source_for(stream: Option<String>) -> Source {
    match stream {
        Some(name) => Source::stream(name),
        None => Source::All,
    }
}

/// Rebuild an in-memory store from a saved log, preserving order.
fn load_store(path: &str) -> Result<InMemoryLogStore> {
    let data = fs::read_to_string(path).with_context(|| format!("cannot read {path}"))?;
    let entries: Vec<Entry> = serde_json::from_str(&data)?;

    let store = InMemoryLogStore::new();
    for entry in entries {
        let data = EntryData {
            id: entry.id,
            entry_type: entry.entry_type,
            data: entry.data,
            metadata: entry.metadata,
        };
        store
            .append(&entry.stream, ExpectedRevision::Any, vec![data])
            .map_err(|e| anyhow::anyhow!("cannot rebuild stream {}: {e}", entry.stream))?;
    }
    Ok(store)
}

fn save_store(store: &InMemoryLogStore, path: &str) -> Result<()> {
    let page = store.read_forward(&Source::All, ReadFrom::Start, usize::MAX, false)?;
    fs::write(path, serde_json::to_string_pretty(&page.entries)?)?;
    info!(path, entries = page.entries.len(), "log saved");
    Ok(())
}

fn seed(out: &str, streams: usize, batches: usize, batch_size: usize) -> Result<()> {
    let store = InMemoryLogStore::new();
    let appender = ConditionalAppender::new(&store);

    for i in 0..streams {
        let stream = format!("Account-{i}");
        let created = EntryData::json(
            "AccountCreated",
            &AccountCreated {
                account_number: format!("40{i}"),
            },
        )?;
        let report = appender.append(&stream, ExpectedRevision::NoStream, vec![created])?;
        if !matches!(report, AppendReport::Appended { .. }) {
            bail!("seeding {stream} failed: {report:?}");
        }

        for j in 0..batches {
            let mut batch = Vec::with_capacity(batch_size);
            for k in 0..batch_size {
                let amount = ((j * batch_size + k) % 100 + 1) as i64;
                let entry = if k % 2 == 0 {
                    EntryData::json(
                        "AccountDebited",
                        &AccountDebited {
                            amount,
                            description: format!("debit on account 40{i}"),
                        },
                    )?
                } else {
                    EntryData::json(
                        "AccountCredited",
                        &AccountCredited {
                            amount,
                            description: format!("credit on account 40{i}"),
                        },
                    )?
                };
                batch.push(entry);
            }

            let expected = ExpectedRevision::Exact((j * batch_size) as u64);
            let report = appender.append(&stream, expected, batch)?;
            match report {
                AppendReport::Appended { next_revision } => {
                    info!(%stream, next_revision, "batch appended");
                }
                other => bail!("seeding {stream} failed: {other:?}"),
            }
        }
    }

    save_store(&store, out)
}

fn read(log: &str, stream: Option<String>, backward: bool, page_size: usize) -> Result<()> {
    let store = load_store(log)?;
    let source = source_for(stream);
    let reader = PageReader::new(&store, source).page_size(page_size);

    let (direction, mut from) = if backward {
        (Direction::Backward, ReadFrom::End)
    } else {
        (Direction::Forward, ReadFrom::Start)
    };

    let policy = RetryPolicy::read_default();
    let mut total = 0u64;
    let mut pages = 0u64;
    loop {
        // `from` survives a retried page read, so a transient failure
        // resumes at the same position.
        let page = retry::execute_transient(&policy, || reader.read(direction, from))?;
        info!(
            entries = page.entries.len(),
            next = ?page.next,
            is_end = page.is_end,
            "page read"
        );
        total += page.entries.len() as u64;
        pages += 1;
        if page.is_end {
            break;
        }
        from = page.next;
    }

    println!("{}", serde_json::to_string_pretty(&ReadOutput { pages, total })?);
    Ok(())
}

/// Wrapper for JSON output
#[derive(Debug, Serialize)]
struct ReadOutput {
    pages: u64,
    total: u64,
}

#[derive(Debug, Default, Serialize)]
struct AccountTally {
    created: u64,
    credited: u64,
    debited: u64,
    amount_total: i64,
    decode_failures: u64,
}

struct TailHandler<'a> {
    registry: FoldRegistry<AccountTally>,
    tally: AccountTally,
    cancel: &'a CancelToken,
}

impl CatchupHandler for TailHandler<'_> {
    fn on_entry(&mut self, entry: &Entry) {
        if self.registry.apply(&mut self.tally, entry).is_err() {
            self.tally.decode_failures += 1;
        }
    }

    fn on_live(&mut self, checkpoint: &Checkpoint) {
        info!(checkpoint = ?checkpoint.last(), "caught up");
        // Nothing will go live against a file-backed store.
        self.cancel.cancel();
    }
}

fn tail(log: &str, stream: Option<String>, prefixes: Vec<String>) -> Result<()> {
    let store = load_store(log)?;
    let source = source_for(stream);

    let mut registry: FoldRegistry<AccountTally> = FoldRegistry::new();
    registry
        .on_json("AccountCreated", |t, _e: AccountCreated| t.created += 1)
        .on_json("AccountCredited", |t, e: AccountCredited| {
            t.credited += 1;
            t.amount_total += e.amount;
        })
        .on_json("AccountDebited", |t, e: AccountDebited| {
            t.debited += 1;
            t.amount_total -= e.amount;
        });

    let mut options = CatchupOptions::default();
    if !prefixes.is_empty() {
        options.filter = Some(EntryFilter::stream_prefixes(prefixes));
    }

    let cancel = CancelToken::new();
    let mut handler = TailHandler {
        registry,
        tally: AccountTally::default(),
        cancel: &cancel,
    };
    let mut coordinator = CatchupCoordinator::with_options(&store, source, options);
    let stats = coordinator.run(ReadFrom::Start, &mut handler, &cancel)?;

    info!(
        replayed = stats.replayed,
        live = stats.live,
        "tail finished"
    );
    println!("{}", serde_json::to_string_pretty(&handler.tally)?);
    Ok(())
}
