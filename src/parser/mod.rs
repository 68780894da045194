// Copyright 2024 Felix Engl
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The parallel line parser (C5): a reusable worker pool that turns a byte
//! stream into entries fed to a [`Collector`](crate::collector::Collector).
//! One reader task reads and batches lines; N worker tasks drain a shared
//! channel of batches and apply the caller's per-line transform.

use crate::entry::Entry;
use crate::shutdown::Shutdown;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

/// Maximum size of a single line (§4.3); a longer line is a reader error.
const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line exceeded the {MAX_LINE_BYTES} byte limit")]
    LineTooLong,
    #[error("failed to read from the underlying stream: {0}")]
    Io(#[from] std::io::Error),
    #[error("line was not valid utf-8")]
    InvalidUtf8,
}

/// The target a worker submits parsed entries to. Implemented by
/// [`crate::collector::Collector`]; factored out as a trait so the parser
/// has no dependency on the collector's internals.
#[async_trait]
pub trait EntrySink: Send + Sync {
    async fn submit(&self, source: &str, entry: Entry);
}

/// Per-line transform result: an entry to submit, `None` to skip a
/// comment/blank/invalid line, or an error to log and continue past (§4.3).
pub type LineResult = Result<Option<Entry>, String>;

/// Configuration knobs for [`run`], mirroring `collector.parser_workers`
/// and `collector.parser_batch_size`.
#[derive(Debug, Clone, Copy)]
pub struct ParserConfig {
    pub workers: usize,
    pub batch_size: usize,
}

impl ParserConfig {
    pub fn new(workers: Option<usize>, batch_size: usize) -> Self {
        Self {
            workers: workers.unwrap_or_else(num_cpus::get).max(1),
            batch_size: batch_size.max(1),
        }
    }
}

/// Parses `reader` line by line via `transform`, submitting resulting
/// entries tagged with `source` into `sink`. Returns the first reader-level
/// error, if any; per-line errors are logged and do not abort the run.
pub async fn run<R, F>(
    mut reader: R,
    source: &str,
    transform: F,
    sink: Arc<dyn EntrySink>,
    config: ParserConfig,
    shutdown: Shutdown,
) -> Result<(), ParseError>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    F: Fn(&str) -> LineResult + Send + Sync + Clone + 'static,
{
    let (batch_tx, batch_rx) = mpsc::channel::<Vec<String>>(config.workers * 2);
    let (error_tx, mut error_rx) = mpsc::channel::<ParseError>(1);
    let batch_rx = Arc::new(Mutex::new(batch_rx));

    let mut workers = JoinSet::new();
    for _ in 0..config.workers {
        let batch_rx = Arc::clone(&batch_rx);
        let sink = Arc::clone(&sink);
        let transform = transform.clone();
        let source = source.to_string();
        workers.spawn(async move {
            loop {
                let batch = {
                    let mut guard = batch_rx.lock().await;
                    guard.recv().await
                };
                let Some(batch) = batch else { break };
                for line in batch {
                    match transform(&line) {
                        Ok(Some(entry)) => sink.submit(&source, entry).await,
                        Ok(None) => {}
                        Err(message) => {
                            log::warn!("skipping unparsable line from {source}: {message}");
                        }
                    }
                }
            }
        });
    }

    let reader_shutdown = shutdown.clone();
    let reader_source = source.to_string();
    let reader_batch_size = config.batch_size;
    let reader = tokio::spawn(async move {
        if let Err(e) =
            read_batches(&mut reader, reader_batch_size, batch_tx, reader_shutdown).await
        {
            log::warn!("parser for {reader_source} stopped early: {e}");
            let _ = error_tx.send(e).await;
        }
    });

    let _ = reader.await;
    while workers.join_next().await.is_some() {}

    if let Ok(e) = error_rx.try_recv() {
        return Err(e);
    }
    Ok(())
}

async fn read_batches<R>(
    reader: &mut R,
    batch_size: usize,
    batch_tx: mpsc::Sender<Vec<String>>,
    shutdown: Shutdown,
) -> Result<(), ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut batch = Vec::with_capacity(batch_size);
    let mut raw = Vec::new();

    loop {
        raw.clear();
        let read = tokio::select! {
            biased;
            _ = shutdown.wait() => return Ok(()),
            read = reader.read_until(b'\n', &mut raw) => read?,
        };
        if read == 0 {
            break;
        }
        while raw.last() == Some(&b'\n') || raw.last() == Some(&b'\r') {
            raw.pop();
        }
        if raw.len() > MAX_LINE_BYTES {
            return Err(ParseError::LineTooLong);
        }
        let line = String::from_utf8(raw.clone()).map_err(|_| ParseError::InvalidUtf8)?;
        batch.push(line);

        if batch.len() >= batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            if batch_tx.send(full).await.is_err() {
                return Ok(());
            }
        }
    }

    if !batch.is_empty() {
        let _ = batch_tx.send(batch).await;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::url::NormalizedUrl;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::BufReader;
    use uuid::Uuid;

    struct CountingSink {
        count: AtomicUsize,
    }

    #[async_trait]
    impl EntrySink for CountingSink {
        async fn submit(&self, _source: &str, _entry: Entry) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn transform(line: &str) -> LineResult {
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        match NormalizedUrl::parse(line) {
            Ok(normalized) => Ok(Some(
                Entry::builder(normalized, "test-feed", Uuid::new_v4()).build(),
            )),
            Err(e) => Err(e.to_string()),
        }
    }

    #[tokio::test]
    async fn parses_plain_text_feed_skipping_comments_and_blanks() {
        let body = "example.com\n# a comment\n\nbad.example.com/path\n";
        let reader = BufReader::new(body.as_bytes());
        let sink = Arc::new(CountingSink {
            count: AtomicUsize::new(0),
        });
        let shutdown = Shutdown::new();

        run(
            reader,
            "test-feed",
            transform,
            sink.clone(),
            ParserConfig::new(Some(2), 10),
            shutdown,
        )
        .await
        .unwrap();

        assert_eq!(sink.count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn line_exactly_at_the_limit_is_parsed_successfully() {
        // Content is exactly MAX_LINE_BYTES; the trailing newline must not
        // count against the limit (§8.3: "1-MiB line => parsed
        // successfully").
        let exact = "a".repeat(MAX_LINE_BYTES);
        let body = format!("{exact}\n");
        let reader = BufReader::new(body.as_bytes());
        let sink = Arc::new(CountingSink {
            count: AtomicUsize::new(0),
        });
        let shutdown = Shutdown::new();

        fn passthrough(line: &str) -> LineResult {
            Ok(Some(Entry::builder(
                NormalizedUrl::parse(&format!("https://example.com/{}", line.len())).unwrap(),
                "test-feed",
                Uuid::new_v4(),
            )
            .build()))
        }

        let result = run(
            reader,
            "test-feed",
            passthrough,
            sink.clone(),
            ParserConfig::new(Some(1), 10),
            shutdown,
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(sink.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn line_over_limit_is_a_reader_error() {
        let huge = "a".repeat(MAX_LINE_BYTES + 10);
        let reader = BufReader::new(huge.as_bytes());
        let sink = Arc::new(CountingSink {
            count: AtomicUsize::new(0),
        });
        let shutdown = Shutdown::new();

        let result = run(
            reader,
            "test-feed",
            transform,
            sink,
            ParserConfig::new(Some(1), 10),
            shutdown,
        )
        .await;
        assert!(matches!(result, Err(ParseError::LineTooLong)));
    }

    #[tokio::test]
    async fn empty_stream_yields_no_entries() {
        let reader = BufReader::new("".as_bytes());
        let sink = Arc::new(CountingSink {
            count: AtomicUsize::new(0),
        });
        run(
            reader,
            "test-feed",
            transform,
            sink.clone(),
            ParserConfig::new(Some(3), 100),
            Shutdown::new(),
        )
        .await
        .unwrap();
        assert_eq!(sink.count.load(Ordering::SeqCst), 0);
    }
}
