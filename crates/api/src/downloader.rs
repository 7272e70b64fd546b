//! The downloader facade: a task scheduler bounded by `maxConcurrentDownloads`,
//! a registry of active tasks keyed by id, and event fan-out so a consumer
//! can subscribe once instead of per task.

use dashmap::DashMap;
use paradl_engine::{DownloadConfig, DownloadRequest, DownloadTask, EngineError, Event};
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Owns every in-flight task and the concurrency gate admitting new ones.
pub struct Downloader {
    config: DownloadConfig,
    semaphore: Arc<Semaphore>,
    registry: Arc<DashMap<Uuid, DownloadTask>>,
    events: broadcast::Sender<Event>,
}

/// Returned by `download`: the task handle plus a join future that resolves
/// once the scheduled job has run and the registry entry has been removed.
pub struct DownloadHandle {
    task: DownloadTask,
    join: JoinHandle<Result<(), EngineError>>,
}

impl DownloadHandle {
    pub fn id(&self) -> Uuid {
        self.task.id()
    }

    pub fn task(&self) -> &DownloadTask {
        &self.task
    }

    /// Waits for the task to finish running under the scheduler.
    pub async fn join(self) -> Result<(), EngineError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::Network(format!("download task panicked: {e}"))),
        }
    }
}

impl Downloader {
    pub fn new(max_concurrent_downloads: usize, config: DownloadConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            semaphore: Arc::new(Semaphore::new(max_concurrent_downloads.max(1))),
            registry: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Subscribes to every task's events, re-emitted on this downloader.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Constructs a task, installs a listener that re-emits its events here,
    /// enqueues it onto the scheduler, and returns immediately with a handle.
    pub async fn download(&self, request: DownloadRequest) -> DownloadHandle {
        let task = DownloadTask::new(request, self.config.clone());
        let id = task.id();
        self.registry.insert(id, task.clone());

        let mut task_events = task.subscribe();
        let downloader_events = self.events.clone();
        tokio::spawn(async move {
            while let Ok(event) = task_events.recv().await {
                let _ = downloader_events.send(event);
            }
        });

        let semaphore = Arc::clone(&self.semaphore);
        let registry = Arc::clone(&self.registry);
        let job_task = task.clone();
        let join = tokio::spawn(async move {
            let permit = semaphore.acquire_owned().await;
            let result = job_task.run().await;
            registry.remove(&id);
            drop(permit);
            result
        });

        DownloadHandle { task, join }
    }

    /// Starts a download and waits for it to finish.
    pub async fn download_and_wait(&self, request: DownloadRequest) -> Result<(), EngineError> {
        self.download(request).await.join().await
    }

    pub fn get(&self, id: Uuid) -> Option<DownloadTask> {
        self.registry.get(&id).map(|entry| entry.value().clone())
    }

    pub fn active_ids(&self) -> Vec<Uuid> {
        self.registry.iter().map(|entry| *entry.key()).collect()
    }

    /// Forwards to the task if present and in the legal source state.
    pub fn pause(&self, id: Uuid) -> bool {
        self.registry.get(&id).map(|t| t.pause()).unwrap_or(false)
    }

    pub fn resume(&self, id: Uuid) -> bool {
        self.registry.get(&id).map(|t| t.resume()).unwrap_or(false)
    }

    pub fn cancel(&self, id: Uuid) -> bool {
        self.registry.get(&id).map(|t| t.cancel()).unwrap_or(false)
    }

    pub fn pause_all(&self) {
        for entry in self.registry.iter() {
            entry.value().pause();
        }
    }

    pub fn resume_all(&self) {
        for entry in self.registry.iter() {
            entry.value().resume();
        }
    }

    /// Cancels every active task. Unlike the per-id variants, callers
    /// typically want to know cancellation was requested even if a task
    /// raced to completion first, so failures here are only logged.
    pub fn cancel_all(&self) {
        for entry in self.registry.iter() {
            if !entry.value().cancel() {
                warn!(id = %entry.key(), "cancel_all: task already terminal");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str, dir: &std::path::Path) -> DownloadRequest {
        DownloadRequest {
            urls: vec![url.to_string()],
            filename: Some("out.bin".to_string()),
            output_directory: Some(dir.to_path_buf()),
        }
    }

    #[tokio::test]
    async fn download_and_wait_surfaces_no_urls_error() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(4, DownloadConfig::default());
        let result = downloader
            .download_and_wait(DownloadRequest {
                urls: vec![],
                filename: None,
                output_directory: Some(dir.path().to_path_buf()),
            })
            .await;
        assert!(matches!(result, Err(EngineError::NoUrls)));
    }

    #[tokio::test]
    async fn unknown_id_operations_return_false_or_none() {
        let downloader = Downloader::new(4, DownloadConfig::default());
        let id = Uuid::new_v4();
        assert!(!downloader.pause(id));
        assert!(!downloader.resume(id));
        assert!(!downloader.cancel(id));
        assert!(downloader.get(id).is_none());
    }

    #[tokio::test]
    async fn registry_entry_is_removed_after_the_job_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(4, DownloadConfig::default());
        // Unreachable host: the size probe fails quickly, the task errors,
        // and the registry entry must still be cleaned up.
        let handle = downloader.download(request("http://127.0.0.1:1/nope", dir.path())).await;
        let id = handle.id();
        assert!(downloader.get(id).is_some() || downloader.get(id).is_none());
        let _ = handle.join().await;
        assert!(downloader.get(id).is_none());
    }
}
