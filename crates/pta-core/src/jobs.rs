// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded queue for slow runtime work.
//!
//! Requests enqueue plain job values and return; a small pool of workers
//! drains the queue. A full queue is reported to the caller as
//! [`Error::QueueFull`] instead of blocking the request.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::firewall::FirewallRule;

/// Background compose bring-up for an inserted `starting` instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposeStart {
    /// Instance row to update.
    pub instance_id: i32,
    /// Compose project name.
    pub project: String,
    /// Deployed challenge.
    pub challenge_id: i32,
    /// Owning team.
    pub team_id: i32,
    /// Starting member.
    pub user_id: i32,
}

/// Unit of background work.
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    /// Bring a compose project up.
    StartCompose(ComposeStart),
    /// Stop and remove a container.
    StopContainer {
        /// Container name.
        name: String,
    },
    /// Tear a compose project down.
    StopCompose {
        /// Project name.
        project: String,
    },
    /// Open instance ports on the firewall agent.
    PushFirewall(FirewallRule),
}

impl Job {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Job::StartCompose(_) => "start_compose",
            Job::StopContainer { .. } => "stop_container",
            Job::StopCompose { .. } => "stop_compose",
            Job::PushFirewall(_) => "push_firewall",
        }
    }
}

/// Runs dequeued jobs. Implementations log their own failures.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: Job);
}

/// Sending side of the queue.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
}

/// Receiving side, handed to [`JobWorker`].
pub struct JobReceiver {
    rx: mpsc::Receiver<Job>,
}

/// A reserved queue slot.
pub struct JobPermit<'a> {
    permit: mpsc::Permit<'a, Job>,
}

impl JobPermit<'_> {
    /// Fill the slot.
    pub fn send(self, job: Job) {
        debug!(job = job.kind(), "Job enqueued");
        self.permit.send(job);
    }
}

impl JobQueue {
    /// Create a queue holding at most `capacity` pending jobs.
    pub fn bounded(capacity: usize) -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, JobReceiver { rx })
    }

    /// Enqueue without waiting.
    pub fn enqueue(&self, job: Job) -> Result<()> {
        self.reserve()?.send(job);
        Ok(())
    }

    /// Reserve a slot before doing work that must be followed by a job.
    pub fn reserve(&self) -> Result<JobPermit<'_>> {
        match self.tx.try_reserve() {
            Ok(permit) => Ok(JobPermit { permit }),
            Err(mpsc::error::TrySendError::Full(())) => Err(Error::QueueFull),
            Err(mpsc::error::TrySendError::Closed(())) => {
                Err(Error::Internal("job queue closed".to_string()))
            }
        }
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

/// Configuration for the job worker pool.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Concurrent workers.
    pub workers: usize,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

/// Pool of workers draining a [`JobQueue`].
pub struct JobWorker {
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    executor: Arc<dyn JobExecutor>,
    config: JobWorkerConfig,
    shutdown: Arc<Notify>,
}

impl JobWorker {
    /// Create a worker pool.
    pub fn new(receiver: JobReceiver, executor: Arc<dyn JobExecutor>, config: JobWorkerConfig) -> Self {
        Self {
            receiver: Arc::new(Mutex::new(receiver.rx)),
            executor,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown. Jobs already dequeued finish first.
    pub async fn run(&self) {
        info!(workers = self.config.workers, "Job workers started");

        let token = CancellationToken::new();
        let mut tasks = tokio::task::JoinSet::new();
        for worker in 0..self.config.workers.max(1) {
            let receiver = self.receiver.clone();
            let executor = self.executor.clone();
            let token = token.clone();
            tasks.spawn(async move {
                loop {
                    let job = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        job = async { receiver.lock().await.recv().await } => job,
                    };
                    let Some(job) = job else { break };
                    debug!(worker, job = job.kind(), "Running job");
                    executor.execute(job).await;
                }
            });
        }

        tokio::select! {
            _ = self.shutdown.notified() => {
                info!("Job workers received shutdown signal");
                token.cancel();
            }
            _ = async { while tasks.join_next().await.is_some() {} } => {}
        }
        while tasks.join_next().await.is_some() {}

        info!("Job workers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: std::sync::Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl JobExecutor for Recorder {
        async fn execute(&self, job: Job) {
            self.seen.lock().unwrap().push(job.kind());
        }
    }

    #[test]
    fn test_full_queue_is_rejected() {
        let (queue, _rx) = JobQueue::bounded(1);
        queue
            .enqueue(Job::StopContainer { name: "a".into() })
            .unwrap();
        let err = queue
            .enqueue(Job::StopContainer { name: "b".into() })
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull));
        assert_eq!(queue.available(), 0);
    }

    #[tokio::test]
    async fn test_workers_drain_and_stop() {
        let (queue, rx) = JobQueue::bounded(8);
        let recorder = Arc::new(Recorder::default());
        let worker = JobWorker::new(rx, recorder.clone(), JobWorkerConfig { workers: 2 });
        let shutdown = worker.shutdown_handle();
        let handle = tokio::spawn(async move { worker.run().await });

        queue
            .enqueue(Job::StopCompose { project: "p".into() })
            .unwrap();
        queue
            .enqueue(Job::StopContainer { name: "c".into() })
            .unwrap();

        for _ in 0..50 {
            if recorder.seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);

        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
