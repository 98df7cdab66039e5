use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    db::{Cache, CacheKey},
    error::{AppError, AppResult},
    models::{PersonalityProfile, Track, TrackId},
    services::{
        catalog::CatalogSource,
        learning::{FeedbackContext, FeedbackKind, FeedbackOutcome, LearningEngine},
        profiles::ProfileStore,
        recommendations::invalidate_recommendations,
    },
};

/// One feedback event as received at the boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub user_id: String,
    pub track_id: TrackId,
    pub kind: FeedbackKind,
    #[serde(default)]
    pub context: FeedbackContext,
    pub received_at: DateTime<Utc>,
}

/// Turns a feedback event into a learning episode
#[derive(Clone)]
pub struct FeedbackProcessor {
    catalog: Arc<dyn CatalogSource>,
    profiles: Arc<dyn ProfileStore>,
    learning: LearningEngine,
    cache: Cache,
}

impl FeedbackProcessor {
    pub fn new(
        catalog: Arc<dyn CatalogSource>,
        profiles: Arc<dyn ProfileStore>,
        learning: LearningEngine,
        cache: Cache,
    ) -> Self {
        Self {
            catalog,
            profiles,
            learning,
            cache,
        }
    }

    /// Resolves the track, preferring the identity cache filled by candidate
    /// generation over a catalog lookup
    async fn resolve_track(&self, id: &TrackId) -> AppResult<Track> {
        let key = CacheKey::Track(id.to_string());
        if let Some(track) = self.cache.get_from_cache::<Track>(&key).await {
            return Ok(track);
        }

        let track = self
            .catalog
            .track(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Track {} not found", id)))?;
        self.cache.set_in_background(&key, &track);
        Ok(track)
    }

    async fn personality(&self, user_id: &str) -> PersonalityProfile {
        match self.profiles.profile(user_id).await {
            Ok(Some(profile)) => profile.personality,
            Ok(None) => PersonalityProfile::default(),
            Err(e) => {
                tracing::warn!(error = %e, user_id = %user_id, "Failed to load profile, using defaults");
                PersonalityProfile::default()
            }
        }
    }

    pub async fn process(&self, event: &FeedbackEvent) -> AppResult<FeedbackOutcome> {
        let track = self.resolve_track(&event.track_id).await?;
        let profile = self.personality(&event.user_id).await;

        let outcome = self
            .learning
            .process_feedback(&event.user_id, &profile, &track, event.kind, &event.context)
            .await;

        // cached rankings predate this feedback
        invalidate_recommendations(&self.cache, &event.user_id).await;

        Ok(outcome)
    }
}

/// Front of the bounded feedback queue
#[derive(Clone)]
pub struct FeedbackIngestor {
    tx: mpsc::Sender<FeedbackEvent>,
}

/// Handle for gracefully shutting down the feedback worker
pub struct FeedbackWorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl FeedbackWorkerHandle {
    /// Stops accepting events, processes what is queued, then waits for
    /// the worker to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        tracing::info!("Feedback worker shutdown signal sent");
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Feedback worker task failed during shutdown");
        }
    }
}

impl FeedbackIngestor {
    pub fn new(capacity: usize, processor: FeedbackProcessor) -> (Self, FeedbackWorkerHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let task = tokio::spawn(async move {
            Self::worker(processor, rx, shutdown_rx).await;
        });

        (Self { tx }, FeedbackWorkerHandle { shutdown_tx, task })
    }

    /// Queues an event without waiting; false when the queue is full or closed
    pub fn submit(&self, event: FeedbackEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                tracing::warn!(user_id = %event.user_id, track_id = %event.track_id, "Feedback queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(event)) => {
                tracing::error!(user_id = %event.user_id, "Feedback worker stopped, dropping event");
                false
            }
        }
    }

    async fn handle(processor: &FeedbackProcessor, event: FeedbackEvent) {
        if let Err(e) = processor.process(&event).await {
            tracing::warn!(
                error = %e,
                user_id = %event.user_id,
                track_id = %event.track_id,
                feedback = event.kind.as_str(),
                "Dropped feedback event"
            );
        }
    }

    async fn worker(
        processor: FeedbackProcessor,
        mut rx: mpsc::Receiver<FeedbackEvent>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        tracing::info!("Feedback worker started");

        loop {
            tokio::select! {
                Some(event) = rx.recv() => {
                    Self::handle(&processor, event).await;
                }
                _ = shutdown_rx.recv() => {
                    rx.close();
                    let mut drained = 0usize;
                    while let Some(event) = rx.recv().await {
                        Self::handle(&processor, event).await;
                        drained += 1;
                    }

                    tracing::info!(drained, "Feedback worker stopped");
                    break;
                }
            }
        }
    }
}
