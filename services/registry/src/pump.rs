//! Delivers in-process object store notifications to the lifecycle handler

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use storage::{ObjectEvent, ObjectEventKind};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, mpsc};

use crate::error::RegistryResult;
use crate::lifecycle::ManifestLifecycleHandler;
use crate::retry::Backoff;

type Queues = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<ObjectEvent>>>>;

/// Feeds events to a [`ManifestLifecycleHandler`].
///
/// Events for the same object key are handled one at a time, in the order
/// they were submitted. Events for different keys run concurrently. A failed
/// event is delivered again after the configured redelivery delay until it
/// succeeds or the attempts run out.
#[derive(Debug, Clone)]
pub struct EventPump {
    handler: ManifestLifecycleHandler,
    redelivery: Backoff,
    queues: Queues,
}

impl EventPump {
    /// Create a pump for `handler`, redelivering per its configuration.
    pub fn new(handler: ManifestLifecycleHandler) -> Self {
        let redelivery = handler.storage().config().redelivery.clone();
        Self {
            handler,
            redelivery,
            queues: Queues::default(),
        }
    }

    /// Queue one event behind any others for the same key.
    pub async fn submit(&self, event: ObjectEvent) {
        let key = format!("{}/{}", event.bucket, event.key);
        let mut queues = self.queues.lock().await;

        let event = match queues.get(&key) {
            Some(queue) => match queue.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let (queue, receiver) = mpsc::unbounded_channel();
        if queue.send(event).is_ok() {
            queues.insert(key.clone(), queue);
            tokio::spawn(self.clone().drain(key, receiver));
        }
    }

    async fn drain(self, key: String, mut receiver: mpsc::UnboundedReceiver<ObjectEvent>) {
        loop {
            let event = match receiver.try_recv() {
                Ok(event) => event,
                Err(_) => {
                    // Submitters hold the lock while sending, so an empty
                    // queue seen under it stays empty.
                    let mut queues = self.queues.lock().await;
                    match receiver.try_recv() {
                        Ok(event) => event,
                        Err(_) => {
                            queues.remove(&key);
                            return;
                        }
                    }
                }
            };
            self.deliver(&event).await;
        }
    }

    #[tracing::instrument(skip_all, fields(kind = %event.kind, key = %event.key, version = %event.version))]
    async fn deliver(&self, event: &ObjectEvent) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.handler.handle(event).await {
                Ok(outcome) => {
                    tracing::debug!(?outcome, "handled event");
                    return;
                }
                Err(err) if err.is_redeliverable() && attempt < self.redelivery.attempts => {
                    let delay = self.redelivery.delay(attempt - 1);
                    tracing::warn!(attempt, ?delay, "redelivering failed event: {err}");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    tracing::error!(attempt, "giving up on event: {err}");
                    return;
                }
            }
        }
    }

    /// Wait until every queued event has been handled.
    pub async fn settle(&self) {
        while !self.queues.lock().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Queue a creation for every manifest object that currently exists.
    ///
    /// Used after the subscription fell behind. Deletions that were missed
    /// cannot be recovered this way.
    #[tracing::instrument(skip(self))]
    pub async fn resync(&self) -> RegistryResult<usize> {
        let storage = self.handler.storage();
        let config = storage.config();
        let objects = storage.objects();
        let prefix = Utf8Path::new(&config.manifest_prefix);

        let keys = objects.list(Some(prefix)).await?;
        let mut queued = 0;
        for key in keys {
            match objects.metadata(Utf8Path::new(&key)).await {
                Ok(meta) => {
                    self.submit(ObjectEvent::new(
                        ObjectEventKind::Created,
                        config.bucket.clone(),
                        key,
                        meta.version,
                    ))
                    .await;
                    queued += 1;
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        tracing::info!(queued, "queued manifests for reindexing");
        Ok(queued)
    }

    /// Pump a notification subscription until it closes.
    pub async fn run(self, mut events: broadcast::Receiver<ObjectEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.submit(event).await,
                Err(RecvError::Lagged(missed)) => {
                    tracing::error!(missed, "event pump fell behind, reindexing current manifests");
                    if let Err(err) = self.resync().await {
                        tracing::error!("failed to reindex after falling behind: {err}");
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
        self.settle().await;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use storage::{Index, IndexConfig, MemoryStorage, Storage};

    use super::*;
    use crate::config::RegistryConfig;
    use crate::lifecycle::ManifestState;
    use crate::storage::RegistryStorage;

    async fn setup() -> (Storage, EventPump) {
        let config = RegistryConfig::default();
        let storage: Storage = MemoryStorage::with_buckets(&[&config.bucket]).into();
        let index: Index = IndexConfig::Memory
            .build(&config.tables.specs())
            .await
            .unwrap();
        let handler = ManifestLifecycleHandler::new(RegistryStorage::new(&storage, &index, config));
        (storage, EventPump::new(handler))
    }

    async fn upload(storage: &Storage, key: &str) -> ObjectEvent {
        let body = serde_json::to_vec(&json!({
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {"digest": "sha256:cfg"},
            "layers": [],
        }))
        .unwrap();
        let version = storage
            .bucket("registry")
            .upload(Utf8Path::new(key), &mut &body[..])
            .await
            .unwrap();
        ObjectEvent::new(ObjectEventKind::Created, "registry", key, version)
    }

    #[tokio::test]
    async fn settles_after_every_queued_event() {
        let (storage, pump) = setup().await;
        let created = upload(&storage, "manifests/app:v1").await;
        let marker = storage
            .bucket("registry")
            .delete(Utf8Path::new("manifests/app:v1"))
            .await
            .unwrap();
        let deleted = ObjectEvent::new(ObjectEventKind::Removed, "registry", "manifests/app:v1", marker);

        pump.submit(created).await;
        pump.submit(deleted).await;
        pump.settle().await;

        let state = pump.handler.state("app:v1").await.unwrap();
        assert_eq!(state, ManifestState::Tombstoned);
    }

    #[tokio::test]
    async fn resync_queues_current_manifests() {
        let (storage, pump) = setup().await;
        upload(&storage, "manifests/app:v1").await;
        upload(&storage, "manifests/app:v2").await;
        upload(&storage, "blobs/sha256:cfg").await;
        storage
            .bucket("registry")
            .delete(Utf8Path::new("manifests/app:v2"))
            .await
            .unwrap();

        assert_eq!(pump.resync().await.unwrap(), 1);
        pump.settle().await;
        assert_eq!(pump.handler.state("app:v1").await.unwrap(), ManifestState::Active);
        assert_eq!(pump.handler.state("app:v2").await.unwrap(), ManifestState::Absent);
    }
}
