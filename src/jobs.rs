use crate::{
    models::{ComposeRequest, ComposeResponse},
    pipeline::Pipeline,
    security::AuthContext,
};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Background composition queue. One worker drains it in submission order.
/// Finished jobs stay queryable for `ttl`, then are evicted.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
    ttl: Duration,
}

struct JobEntry {
    state: JobState,
    finished_at: Option<Instant>,
}

impl JobEntry {
    fn pending(state: JobState) -> Self {
        Self {
            state,
            finished_at: None,
        }
    }

    fn expired(&self, ttl: Duration) -> bool {
        self.finished_at.is_some_and(|at| at.elapsed() >= ttl)
    }
}

struct Job {
    id: Uuid,
    request: ComposeRequest,
    context: AuthContext,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed {
        result: Box<ComposeResponse>,
    },
    Failed {
        error: String,
        stage: Option<String>,
    },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

#[derive(Debug, Error)]
#[error("job queue is closed")]
pub struct QueueClosed;

impl JobQueue {
    pub fn spawn(pipeline: Pipeline, capacity: usize, ttl: Duration) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        let statuses = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                statuses_bg
                    .lock()
                    .await
                    .insert(job.id, JobEntry::pending(JobState::Running));
                info!(target = "compose.jobs", job = %job.id, caller = %job.context.caller, "job started");

                let state = match pipeline.run(job.request).await {
                    Ok(resp) => JobState::Completed {
                        result: Box::new(resp),
                    },
                    Err(err) => {
                        warn!(target = "compose.jobs", job = %job.id, error = %err, "job failed");
                        JobState::Failed {
                            error: err.detail().to_string(),
                            stage: Some(err.stage().to_string()),
                        }
                    }
                };
                statuses_bg.lock().await.insert(
                    job.id,
                    JobEntry {
                        state,
                        finished_at: Some(Instant::now()),
                    },
                );
            }
        });

        (Self { tx, statuses, ttl }, handle)
    }

    pub async fn enqueue(
        &self,
        request: ComposeRequest,
        context: AuthContext,
    ) -> Result<Uuid, QueueClosed> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.statuses.lock().await;
            let ttl = self.ttl;
            guard.retain(|_, entry| !entry.expired(ttl));
            guard.insert(id, JobEntry::pending(JobState::Queued));
        }
        let job = Job {
            id,
            request,
            context,
        };
        if self.tx.send(job).await.is_err() {
            self.statuses.lock().await.remove(&id);
            return Err(QueueClosed);
        }
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let mut guard = self.statuses.lock().await;
        if guard.get(&id)?.expired(self.ttl) {
            guard.remove(&id);
            return None;
        }
        guard.get(&id).map(|entry| JobInfo {
            id: id.to_string(),
            state: entry.state.clone(),
        })
    }
}
