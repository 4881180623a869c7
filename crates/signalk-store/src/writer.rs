//! Store writer: bus records in, batched inserts out.
//!
//! Records are spread round-robin over `workers` tasks, each with a bounded
//! channel of `channelSize`. A worker batches up to `batchFlushLength`
//! records or `batchFlushInterval` seconds, whichever comes first, and
//! writes the batch in one transaction. A failed batch is kept and retried
//! on the following flushes; after `maxRetries` failures it is dropped and
//! counted as lost.
//!
//! The dispatcher waits when a worker channel is full. The bus queues in
//! front of it drop oldest in that case, so the bus itself never blocks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use signalk_bus::Subscriber;
use signalk_core::SingleValueMapped;
use signalk_protocol::RawMessage;

use crate::buffer::BatchBuffer;
use crate::config::DatabaseConfig;
use crate::{StoreError, TimeRange, TimeSeriesStore};

/// One row for either table.
#[derive(Debug, Clone)]
pub enum Record {
    Raw(RawMessage),
    Mapped(SingleValueMapped),
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    written: AtomicU64,
    retries: AtomicU64,
    lost_batches: AtomicU64,
    lost_records: AtomicU64,
}

/// Snapshot of the writer counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub received: u64,
    pub written: u64,
    pub retries: u64,
    pub lost_batches: u64,
    pub lost_records: u64,
}

impl Counters {
    fn snapshot(&self) -> WriterStats {
        WriterStats {
            received: self.received.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            lost_batches: self.lost_batches.load(Ordering::Relaxed),
            lost_records: self.lost_records.load(Ordering::Relaxed),
        }
    }
}

struct Pending {
    records: Vec<Record>,
    attempts: u32,
}

struct Worker {
    id: usize,
    store: Arc<dyn TimeSeriesStore>,
    max_retries: u32,
    counters: Arc<Counters>,
    pending: Vec<Pending>,
}

async fn write_batch(
    store: Arc<dyn TimeSeriesStore>,
    records: Vec<Record>,
) -> (Vec<Record>, Result<(), StoreError>) {
    let result = tokio::task::spawn_blocking(move || {
        let mut raw = Vec::new();
        let mut mapped = Vec::new();
        for record in &records {
            match record {
                Record::Raw(r) => raw.push(r.clone()),
                Record::Mapped(m) => mapped.push(m.clone()),
            }
        }
        let result = (|| -> Result<(), StoreError> {
            if !raw.is_empty() {
                store.write_raw(&raw)?;
            }
            if !mapped.is_empty() {
                store.write_mapped(&mapped)?;
            }
            Ok(())
        })();
        (records, result)
    })
    .await;
    match result {
        Ok(done) => done,
        Err(e) => (Vec::new(), Err(StoreError::Task(e.to_string()))),
    }
}

impl Worker {
    /// Retry what is pending, then write `batch`.
    async fn flush(&mut self, batch: Vec<Record>) {
        let mut queue = std::mem::take(&mut self.pending);
        if !batch.is_empty() {
            queue.push(Pending {
                records: batch,
                attempts: 0,
            });
        }
        for p in queue {
            if let Some(p) = self.attempt(p).await {
                self.pending.push(p);
            }
        }
    }

    async fn attempt(&self, mut p: Pending) -> Option<Pending> {
        let count = p.records.len() as u64;
        let (records, result) = write_batch(self.store.clone(), p.records).await;
        p.records = records;
        match result {
            Ok(()) => {
                self.counters.written.fetch_add(count, Ordering::Relaxed);
                debug!(worker = self.id, records = count, "batch written");
                None
            }
            Err(e) => {
                p.attempts += 1;
                if p.attempts > self.max_retries || p.records.is_empty() {
                    self.counters.lost_batches.fetch_add(1, Ordering::Relaxed);
                    self.counters.lost_records.fetch_add(count, Ordering::Relaxed);
                    warn!(worker = self.id, records = count, error = %e, "dropping batch after retries");
                    None
                } else {
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        worker = self.id,
                        records = count,
                        attempt = p.attempts,
                        error = %e,
                        "batch insert failed, will retry"
                    );
                    Some(p)
                }
            }
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Record>, flush_length: usize, interval: Duration) {
        let mut buffer = BatchBuffer::new(flush_length, interval);
        let period = interval.clamp(Duration::from_millis(10), Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                record = rx.recv() => match record {
                    Some(record) => {
                        if let Some(batch) = buffer.add(record) {
                            self.flush(batch).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if buffer.should_flush() {
                        let batch = buffer.flush();
                        self.flush(batch).await;
                    } else if !self.pending.is_empty() {
                        self.flush(Vec::new()).await;
                    }
                }
            }
        }

        // drain: keep retrying until everything is written or dropped
        let batch = buffer.flush();
        self.flush(batch).await;
        while !self.pending.is_empty() {
            self.flush(Vec::new()).await;
        }
        debug!(worker = self.id, "store worker stopped");
    }
}

/// Handle to the worker pool.
pub struct StoreWriter {
    senders: Vec<mpsc::Sender<Record>>,
    next: usize,
    counters: Arc<Counters>,
    workers: Vec<JoinHandle<()>>,
}

impl StoreWriter {
    pub fn start(store: Arc<dyn TimeSeriesStore>, config: &DatabaseConfig) -> Self {
        let counters = Arc::new(Counters::default());
        let interval = Duration::from_secs(config.batch_flush_interval);
        let mut senders = Vec::with_capacity(config.workers);
        let mut workers = Vec::with_capacity(config.workers);
        for id in 0..config.workers.max(1) {
            let (tx, rx) = mpsc::channel(config.channel_size.max(1));
            let worker = Worker {
                id,
                store: store.clone(),
                max_retries: config.max_retries,
                counters: counters.clone(),
                pending: Vec::new(),
            };
            workers.push(tokio::spawn(worker.run(rx, config.batch_flush_length, interval)));
            senders.push(tx);
        }
        Self {
            senders,
            next: 0,
            counters,
            workers,
        }
    }

    /// Queue one record, waiting while the chosen worker is full.
    /// Returns false if the worker has gone away.
    pub async fn submit(&mut self, record: Record) -> bool {
        let index = self.next % self.senders.len();
        self.next = self.next.wrapping_add(1);
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        self.senders[index].send(record).await.is_ok()
    }

    pub fn stats(&self) -> WriterStats {
        self.counters.snapshot()
    }

    /// Close the channels and wait for every worker to drain.
    pub async fn shutdown(self) -> WriterStats {
        drop(self.senders);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "store worker panicked");
            }
        }
        self.counters.snapshot()
    }
}

/// Persist Raw and/or Mapped traffic until every input closes.
pub async fn run_store_writer(
    raw: Option<Subscriber>,
    mapped: Option<Subscriber>,
    store: Arc<dyn TimeSeriesStore>,
    config: &DatabaseConfig,
) -> WriterStats {
    let mut writer = StoreWriter::start(store, config);
    let mut raw_open = raw.is_some();
    let mut mapped_open = mapped.is_some();

    while raw_open || mapped_open {
        tokio::select! {
            msg = async { raw.as_ref()?.recv_raw().await }, if raw_open => match msg {
                Some(msg) => {
                    writer.submit(Record::Raw(msg)).await;
                }
                None => raw_open = false,
            },
            delta = async { mapped.as_ref()?.recv_delta().await }, if mapped_open => match delta {
                Some(delta) => {
                    for value in delta.single_values() {
                        writer.submit(Record::Mapped(value)).await;
                    }
                }
                None => mapped_open = false,
            },
        }
    }

    let stats = writer.shutdown().await;
    info!(
        received = stats.received,
        written = stats.written,
        retries = stats.retries,
        lost_batches = stats.lost_batches,
        lost_records = stats.lost_records,
        "store writer stopped"
    );
    stats
}

/// Delete rows older than `retention`, checking every `every`. Runs until
/// the task is aborted.
pub async fn run_retention(store: Arc<dyn TimeSeriesStore>, retention: Duration, every: Duration) {
    let Ok(retention) = chrono::Duration::from_std(retention) else {
        warn!("retention period out of range, pruning disabled");
        return;
    };
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let cutoff = Utc::now() - retention;
        let store = store.clone();
        match tokio::task::spawn_blocking(move || store.delete(TimeRange::before(cutoff))).await {
            Ok(Ok(0)) => {}
            Ok(Ok(deleted)) => info!(deleted, cutoff = %cutoff, "pruned old rows"),
            Ok(Err(e)) => warn!(error = %e, "retention delete failed"),
            Err(e) => warn!(error = %e, "retention task failed"),
        }
    }
}
