// weather_streams - Running per-station weather averages exported as Prometheus metrics
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::metrics::RecordMetrics;
use crate::pipeline::{Outcome, Pipeline, PipelineError};
use std::collections::hash_map::DefaultHasher;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::future;
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::Instrument;

const QUEUE_SIZE: usize = 1024;

#[derive(Debug)]
pub enum DispatchError {
    PartitionStopped(usize),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PartitionStopped(p) => write!(f, "partition {} is no longer processing records", p),
        }
    }
}

impl error::Error for DispatchError {}

#[derive(Debug)]
pub enum WorkerError {
    Pipeline { partition: usize, error: PipelineError },
    Join { partition: usize, error: JoinError },
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipeline { partition, error } => write!(f, "partition {} failed: {}", partition, error),
            Self::Join { partition, error } => write!(f, "partition {} did not complete: {}", partition, error),
        }
    }
}

impl error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Pipeline { error, .. } => Some(error),
            Self::Join { error, .. } => Some(error),
        }
    }
}

/// Pick the partition for a raw record based on its station field.
///
/// The station is everything before the first delimiter so records that fail to
/// parse are still routed deterministically.
pub fn partition_for(raw: &[u8], partitions: usize) -> usize {
    let key = raw.split(|b| *b == b',').next().unwrap_or(raw);
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

/// Routes records to a fixed set of worker tasks, one per partition.
///
/// Every record for a station lands on the same worker and each worker handles its
/// records one at a time, in the order they were dispatched.
#[derive(Debug)]
pub struct Dispatcher {
    queues: Vec<Sender<Vec<u8>>>,
    workers: Vec<JoinHandle<Result<u64, PipelineError>>>,
    failed: watch::Receiver<Option<usize>>,
}

impl Dispatcher {
    /// Spawn `partitions` workers (at least one) on the current tokio runtime.
    pub fn new(pipeline: Arc<Pipeline>, metrics: Arc<RecordMetrics>, partitions: usize) -> Self {
        let partitions = partitions.max(1);
        let mut queues = Vec::with_capacity(partitions);
        let mut workers = Vec::with_capacity(partitions);
        let (failed_tx, failed) = watch::channel(None);
        let failed_tx = Arc::new(failed_tx);

        for partition in 0..partitions {
            let (tx, rx) = mpsc::channel(QUEUE_SIZE);
            let task = run_partition(
                partition,
                Arc::clone(&pipeline),
                Arc::clone(&metrics),
                Arc::clone(&failed_tx),
                rx,
            )
            .instrument(tracing::info_span!("partition", partition = partition));

            queues.push(tx);
            workers.push(tokio::spawn(task));
        }

        Self {
            queues,
            workers,
            failed,
        }
    }

    pub fn partitions(&self) -> usize {
        self.queues.len()
    }

    /// Queue a raw record for its partition, waiting if the partition is backed up.
    pub async fn dispatch(&self, raw: impl Into<Vec<u8>>) -> Result<(), DispatchError> {
        let raw = raw.into();
        let partition = partition_for(&raw, self.queues.len());
        self.queues[partition]
            .send(raw)
            .await
            .map_err(|_| DispatchError::PartitionStopped(partition))
    }

    /// Resolve with the partition number once any worker has stopped because of a
    /// fatal error. Never resolves while every worker is healthy.
    pub async fn partition_failed(&self) -> usize {
        let mut failed = self.failed.clone();
        loop {
            if let Some(partition) = *failed.borrow_and_update() {
                return partition;
            }

            if failed.changed().await.is_err() {
                return future::pending().await;
            }
        }
    }

    /// Stop accepting records, wait for every queued record to be processed and
    /// return the first partition failure, if any.
    pub async fn shutdown(self) -> Result<u64, WorkerError> {
        drop(self.queues);

        let mut processed = 0;
        let mut first_err = None;
        for (partition, handle) in self.workers.into_iter().enumerate() {
            let res = match handle.await {
                Ok(Ok(n)) => {
                    processed += n;
                    continue;
                }
                Ok(Err(error)) => WorkerError::Pipeline { partition, error },
                Err(error) => WorkerError::Join { partition, error },
            };

            if first_err.is_none() {
                first_err = Some(res);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(processed),
        }
    }
}

async fn run_partition(
    partition: usize,
    pipeline: Arc<Pipeline>,
    metrics: Arc<RecordMetrics>,
    failed: Arc<watch::Sender<Option<usize>>>,
    mut rx: Receiver<Vec<u8>>,
) -> Result<u64, PipelineError> {
    tracing::debug!(message = "partition worker started", partition = partition);
    let mut processed = 0;

    while let Some(raw) = rx.recv().await {
        match pipeline.process(&raw).await {
            Ok(outcome) => {
                metrics.observe(&outcome);
                processed += 1;
            }
            Err(e) => {
                if let PipelineError::Sink { result, .. } = &e {
                    metrics.observe(&Outcome::Accepted(result.clone()));
                    metrics.sink_error();
                }

                tracing::error!(message = "stopping partition after fatal error", partition = partition, error = %e);
                failed.send_if_modified(|current| match current {
                    Some(_) => false,
                    None => {
                        *current = Some(partition);
                        true
                    }
                });
                return Err(e);
            }
        }
    }

    tracing::debug!(message = "partition worker finished", partition = partition, processed = processed);
    Ok(processed)
}
