//! Background indexing queue.
//!
//! Uploads reserve a slot with [`IndexQueue::try_reserve`], which never
//! waits: a full queue is reported as [`QueueError::Full`] so the caller can
//! reject the upload before writing anything. A fixed pool of tokio workers
//! drains the job channel. Each job runs in its own task, so a panicking
//! provider fails that session as `Aborted` and the worker carries on.
//! Outcomes are written back to the [`SessionStore`] as `Ready` (with a
//! freshly bound chain) or `Failed` (with the typed cause). Jobs are not
//! persisted and not retried.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::chain::Binder;
use crate::indexer::{IndexError, Indexer};
use crate::session::SessionStore;

/// One unit of indexing work.
#[derive(Debug, Clone)]
pub struct IndexJob {
    pub session_id: String,
    pub path: PathBuf,
    pub index_dir: PathBuf,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("indexing queue is full, try again later")]
    Full,
    #[error("indexing queue is closed")]
    Closed,
}

/// A reserved place in the queue. Dropping it releases the slot.
pub struct JobSlot<'a> {
    permit: mpsc::Permit<'a, IndexJob>,
}

impl JobSlot<'_> {
    /// Hand the job to the workers. Cannot fail or wait.
    pub fn submit(self, job: IndexJob) {
        self.permit.send(job);
    }
}

/// Handle for submitting jobs. Cheap to clone.
#[derive(Clone)]
pub struct IndexQueue {
    tx: mpsc::Sender<IndexJob>,
}

impl IndexQueue {
    /// Spawn `workers` tasks consuming a channel of `capacity` jobs.
    ///
    /// Workers exit once every `IndexQueue` clone has been dropped and the
    /// channel is drained.
    pub fn start(
        workers: usize,
        capacity: usize,
        indexer: Arc<Indexer>,
        binder: Arc<Binder>,
        sessions: Arc<SessionStore>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel::<IndexJob>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let indexer = indexer.clone();
                let binder = binder.clone();
                let sessions = sessions.clone();
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else {
                            break;
                        };
                        let session_id = job.session_id.clone();
                        let run = tokio::spawn(run_job(
                            worker,
                            job,
                            indexer.clone(),
                            binder.clone(),
                            sessions.clone(),
                        ));
                        if let Err(e) = run.await {
                            let reason = if e.is_panic() {
                                "indexing task panicked".to_string()
                            } else {
                                e.to_string()
                            };
                            tracing::error!(worker, session_id = %session_id, %reason, "indexing aborted");
                            sessions.mark_failed(&session_id, IndexError::Aborted(reason));
                        }
                    }
                    tracing::debug!(worker, "indexing worker stopped");
                })
            })
            .collect();

        (Self { tx }, handles)
    }

    /// Reserve capacity for one job without waiting.
    pub fn try_reserve(&self) -> Result<JobSlot<'_>, QueueError> {
        match self.tx.try_reserve() {
            Ok(permit) => Ok(JobSlot { permit }),
            Err(mpsc::error::TrySendError::Full(())) => Err(QueueError::Full),
            Err(mpsc::error::TrySendError::Closed(())) => Err(QueueError::Closed),
        }
    }
}

async fn run_job(
    worker: usize,
    job: IndexJob,
    indexer: Arc<Indexer>,
    binder: Arc<Binder>,
    sessions: Arc<SessionStore>,
) {
    let started = std::time::Instant::now();
    tracing::info!(worker, session_id = %job.session_id, path = %job.path.display(), "indexing started");

    match indexer.index_file(&job.session_id, &job.path).await {
        Ok(index) => {
            let chunks = index.len();
            let chain = Arc::new(binder.bind(Arc::new(index)));
            sessions.mark_ready(&job.session_id, job.index_dir.clone(), chain);
            tracing::info!(
                worker,
                session_id = %job.session_id,
                chunks,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "indexing finished"
            );
        }
        Err(e) => {
            tracing::error!(
                worker,
                session_id = %job.session_id,
                code = e.code(),
                error = %e,
                "indexing failed"
            );
            sessions.mark_failed(&job.session_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedding::Embedder;
    use crate::llm::DisabledChatModel;
    use crate::session::{SessionEntry, SessionState, SessionStatus};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;

    /// Panics on any text mentioning "boom".
    struct UnitEmbedder;

    #[async_trait]
    impl Embedder for UnitEmbedder {
        fn model_name(&self) -> &str {
            "unit"
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t.contains("boom")) {
                panic!("embedder exploded");
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn config(tmp: &Path) -> Config {
        let mut config = Config::default();
        config.storage.uploads_dir = tmp.join("uploads");
        config.storage.vectorstores_dir = tmp.join("vectorstores");
        config
    }

    fn start(config: &Config, workers: usize, capacity: usize) -> (IndexQueue, Arc<SessionStore>) {
        let embedder: Arc<dyn Embedder> = Arc::new(UnitEmbedder);
        let indexer = Arc::new(Indexer::new(config, embedder.clone()));
        let binder = Arc::new(Binder::new(config, embedder, Arc::new(DisabledChatModel)));
        let sessions = Arc::new(SessionStore::new());
        let (queue, _workers) =
            IndexQueue::start(workers, capacity, indexer, binder, sessions.clone());
        (queue, sessions)
    }

    async fn enqueue(
        queue: &IndexQueue,
        sessions: &SessionStore,
        config: &Config,
        id: &str,
        body: &str,
    ) {
        let path = config.storage.uploads_dir.join(format!("{}.txt", id));
        tokio::fs::create_dir_all(&config.storage.uploads_dir)
            .await
            .unwrap();
        tokio::fs::write(&path, body).await.unwrap();
        let index_dir = config.storage.index_dir(id);
        let slot = queue.try_reserve().unwrap();
        sessions.put(
            id,
            SessionEntry::processing(id.to_string(), path.clone(), index_dir.clone()),
        );
        slot.submit(IndexJob {
            session_id: id.to_string(),
            path,
            index_dir,
        });
    }

    async fn wait_for_status(sessions: &SessionStore, id: &str, want: SessionStatus) {
        for _ in 0..100 {
            if sessions.get(id).map(|e| e.state.status()) == Some(want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session {} never reached {:?}", id, want);
    }

    #[tokio::test]
    async fn jobs_resolve_to_ready_or_failed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = config(tmp.path());
        let (queue, sessions) = start(&config, 2, 4);

        enqueue(&queue, &sessions, &config, "good", "some useful text").await;
        enqueue(&queue, &sessions, &config, "bad", "").await;

        wait_for_status(&sessions, "good", SessionStatus::Ready).await;
        wait_for_status(&sessions, "bad", SessionStatus::Failed).await;
        assert!(sessions.chain("good").is_some());
    }

    #[tokio::test]
    async fn panicking_job_fails_session_and_worker_survives() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = config(tmp.path());
        let (queue, sessions) = start(&config, 1, 4);

        enqueue(&queue, &sessions, &config, "boom", "boom goes the parser").await;
        wait_for_status(&sessions, "boom", SessionStatus::Failed).await;
        match sessions.get("boom").unwrap().state {
            SessionState::Failed(e) => assert_eq!(e.code(), "aborted"),
            _ => panic!("expected failed state"),
        }

        // The only worker is still consuming jobs.
        enqueue(&queue, &sessions, &config, "after", "plain text").await;
        wait_for_status(&sessions, "after", SessionStatus::Ready).await;
    }

    #[tokio::test]
    async fn full_queue_rejects_without_waiting() {
        let (tx, _rx) = mpsc::channel(1);
        let queue = IndexQueue { tx };

        let held = queue.try_reserve().unwrap();
        assert_eq!(queue.try_reserve().err(), Some(QueueError::Full));
        drop(held);
        assert!(queue.try_reserve().is_ok());
    }

    #[tokio::test]
    async fn closed_queue_is_reported() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let queue = IndexQueue { tx };
        assert_eq!(queue.try_reserve().err(), Some(QueueError::Closed));
    }
}
