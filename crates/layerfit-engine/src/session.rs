//! The session state machine: owns `SessionState`, drives detection and
//! composition, and hands every change to the persister.

use std::sync::Arc;

use anyhow::Result;
use layerfit_contracts::events::SlotChange;
use layerfit_contracts::image::{HandleStore, ImageRef, InlineImage};
use layerfit_contracts::layers::{capacity_of, Category, SlotPosition};
use layerfit_contracts::models::{ModelRegistry, ModelSelector, Task};
use layerfit_contracts::session::{SessionState, Status};
use layerfit_contracts::store::{session_key, LocalCache};
use thiserror::Error;

use crate::codec::{resolve_image, ImageFetcher, SessionCodec};
use crate::composition::Composer;
use crate::config::EngineConfig;
use crate::detection::{DetectionReport, Detector};
use crate::fallback::Attempt;
use crate::persistence::{PersistReport, PersistenceGateway, Persister, RemoteStore};
use crate::provider::ProviderRegistry;

/// Presentation hook. `render` sees every state change; `notify` gets the
/// structured events behind them.
pub trait SessionObserver: Send + Sync {
    fn render(&self, state: &SessionState);

    fn notify(&self, _event: &SessionEvent) {}
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StatusChanged {
        from: Status,
        to: Status,
        error: Option<String>,
    },
    SlotChanged {
        position: SlotPosition,
        change: SlotChange,
    },
    DetectionFinished(DetectionReport),
    CompositionFinished {
        model: Option<String>,
        layers: Vec<SlotPosition>,
        attempts: Vec<Attempt>,
        error: Option<String>,
    },
    StateRestored {
        status: Status,
    },
    StateReset,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("{category} has no slot {index}")]
    InvalidSlot { category: Category, index: usize },

    #[error("session is busy ({status}); wait for the current step to finish")]
    Busy { status: Status },
}

/// Raw photo bytes as received from the user.
#[derive(Debug, Clone)]
pub struct PhotoUpload {
    pub bytes: Vec<u8>,
    pub media_type: Option<String>,
}

impl PhotoUpload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            media_type: None,
        }
    }

    /// Checks the bytes decode as an image and settles the media type,
    /// sniffing it when the caller did not supply one.
    fn into_inline(self) -> Result<InlineImage, String> {
        if self.bytes.is_empty() {
            return Err("the file is empty".to_string());
        }
        let format = image::guess_format(&self.bytes).map_err(|err| err.to_string())?;
        image::load_from_memory_with_format(&self.bytes, format).map_err(|err| err.to_string())?;
        let media_type = self
            .media_type
            .filter(|value| value.starts_with("image/"))
            .unwrap_or_else(|| format.to_mime_type().to_string());
        Ok(InlineImage::new(media_type, self.bytes))
    }
}

/// Collaborators the machine is built from.
pub struct EngineServices {
    pub providers: Arc<ProviderRegistry>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub cache: Arc<dyn LocalCache>,
    pub remote: Option<Arc<dyn RemoteStore>>,
    pub handles: HandleStore,
}

pub struct SessionMachine {
    state: SessionState,
    detector: Detector,
    composer: Composer,
    codec: SessionCodec,
    gateway: Arc<PersistenceGateway>,
    persister: Persister,
    fetcher: Arc<dyn ImageFetcher>,
    handles: HandleStore,
    observers: Vec<Arc<dyn SessionObserver>>,
}

impl SessionMachine {
    /// Builds the machine and spawns its persist worker, so it must be
    /// called inside a tokio runtime. Starts `Empty`; call [`restore`]
    /// to pick up saved state.
    ///
    /// [`restore`]: SessionMachine::restore
    pub fn new(
        config: &EngineConfig,
        services: EngineServices,
        models: Option<ModelRegistry>,
    ) -> Result<Self> {
        let selector = ModelSelector::new(models);
        let detect = config.rank(&selector, Task::Detect)?;
        let compose = config.rank(&selector, Task::Compose)?;
        tracing::debug!(detect = ?detect.names(), compose = ?compose.names(), "candidates ranked");

        let key = session_key(services.cache.as_ref());
        let detector = Detector::new(
            services.providers.clone(),
            services.fetcher.clone(),
            detect.candidates,
            config.detect_timeout,
        );
        let composer = Composer::new(
            services.providers.clone(),
            services.fetcher.clone(),
            services.handles.clone(),
            compose.candidates,
            config.compose_timeout,
        );
        let codec = SessionCodec::new(
            services.handles.clone(),
            services.fetcher.clone(),
            config.compression,
        );
        let gateway = Arc::new(PersistenceGateway::new(
            services.cache,
            services.remote,
            key,
            config.cache_ceiling_bytes,
        ));
        let persister = Persister::spawn(codec.clone(), gateway.clone(), config.persist_debounce);

        Ok(Self {
            state: SessionState::new(),
            detector,
            composer,
            codec,
            gateway,
            persister,
            fetcher: services.fetcher,
            handles: services.handles,
            observers: Vec::new(),
        })
    }

    pub fn add_observer(&mut self, observer: Arc<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn handles(&self) -> &HandleStore {
        &self.handles
    }

    pub fn session_key(&self) -> &str {
        self.gateway.session_key()
    }

    /// Bytes of the composite, if one is showing.
    pub async fn composite_image(&self) -> Option<InlineImage> {
        let image = self.state.visible_composite()?;
        match resolve_image(image, &self.handles, self.fetcher.as_ref()).await {
            Ok(inline) => Some(inline),
            Err(err) => {
                tracing::warn!(error = %err, "composite could not be resolved");
                None
            }
        }
    }

    /// Starts a new session from a photo. Everything derived from the
    /// previous photo is dropped before analysis; the prompt is kept.
    pub async fn upload_photo(&mut self, upload: PhotoUpload) -> Result<(), SessionError> {
        self.ensure_idle()?;
        let prompt = std::mem::take(&mut self.state.prompt);
        self.release_all_handles();
        self.state.clear();
        self.state.prompt = prompt;

        let photo = match upload.into_inline() {
            Ok(photo) => photo,
            Err(reason) => {
                tracing::warn!(%reason, "uploaded photo rejected");
                self.transition(
                    Status::Error,
                    Some(format!("Failed to read the uploaded photo: {reason}")),
                );
                return Ok(());
            }
        };

        let base = self.handles.insert(photo.clone());
        self.state.replace_base_image(base);
        self.transition(Status::Analyzing, None);

        let report = self.detector.detect_all(&photo).await;
        tracing::info!(found = report.found_count(), "photo analyzed");
        self.state.baseline_outfit = report.baseline.clone();
        self.emit(SessionEvent::DetectionFinished(report));
        self.transition(Status::Ready, None);
        Ok(())
    }

    /// Overrides one garment layer and recomposes when a photo is loaded.
    pub async fn replace_slot(
        &mut self,
        category: Category,
        index: usize,
        image: ImageRef,
    ) -> Result<(), SessionError> {
        self.ensure_idle()?;
        let position = checked_position(category, index)?;
        let previous = self
            .state
            .user_slots
            .set(position, Some(image))
            .map_err(|_| SessionError::InvalidSlot { category, index })?;
        self.release_if_orphaned(previous);
        self.emit(SessionEvent::SlotChanged {
            position,
            change: SlotChange::Replaced,
        });

        let can_compose = self.state.base_image.is_some()
            && matches!(self.state.status, Status::Ready | Status::Done | Status::Error);
        if can_compose {
            self.recompose().await;
        } else {
            self.publish();
        }
        Ok(())
    }

    /// Clears one user override. With no overrides left the composite is
    /// dropped; otherwise the outfit is recomposed from the base photo.
    pub async fn remove_slot(&mut self, category: Category, index: usize) -> Result<(), SessionError> {
        self.ensure_idle()?;
        let position = checked_position(category, index)?;
        let previous = self
            .state
            .user_slots
            .set(position, None)
            .map_err(|_| SessionError::InvalidSlot { category, index })?;
        self.release_if_orphaned(previous);
        self.emit(SessionEvent::SlotChanged {
            position,
            change: SlotChange::Removed,
        });

        if self.state.base_image.is_none() {
            self.publish();
        } else if self.state.user_slots.is_empty() {
            self.state.composed_image = None;
            self.transition(Status::Ready, None);
        } else {
            self.recompose().await;
        }
        Ok(())
    }

    pub fn set_prompt(&mut self, text: &str) -> Result<(), SessionError> {
        self.ensure_idle()?;
        self.state.prompt = text.trim().to_string();
        self.publish();
        Ok(())
    }

    /// Recomposes the current effective outfit.
    pub async fn retry(&mut self) -> Result<(), SessionError> {
        self.ensure_idle()?;
        self.recompose().await;
        Ok(())
    }

    /// Drops the whole session, prompt included.
    pub fn reset(&mut self) {
        self.release_all_handles();
        self.state.clear();
        self.emit(SessionEvent::StateReset);
        self.transition(Status::Empty, None);
    }

    /// Replaces the in-memory session with the saved one, if any. Returns
    /// whether saved state was found.
    pub async fn restore(&mut self) -> Result<bool> {
        let Some(stored) = self.gateway.read().await? else {
            tracing::debug!("no saved session");
            return Ok(false);
        };
        self.release_all_handles();
        self.state = self.codec.decode(&stored);
        tracing::info!(status = %self.state.status, "session restored");
        self.emit(SessionEvent::StateRestored {
            status: self.state.status,
        });
        self.publish();
        Ok(true)
    }

    /// Writes any pending snapshot now.
    pub async fn flush(&self) -> Option<PersistReport> {
        self.persister.flush().await
    }

    /// Stops the persist worker after its final write.
    pub async fn shutdown(self) {
        self.persister.shutdown().await;
    }

    async fn recompose(&mut self) {
        self.transition(Status::Generating, None);
        match self.composer.compose(&self.state).await {
            Ok(composition) => {
                tracing::info!(model = %composition.model, layers = composition.layers.len(), "outfit composed");
                self.state.composed_image = Some(ImageRef::InlineData(composition.image));
                self.emit(SessionEvent::CompositionFinished {
                    model: Some(composition.model),
                    layers: composition.layers,
                    attempts: composition.attempts,
                    error: None,
                });
                self.transition(Status::Done, None);
            }
            Err(err) => {
                let message = err.to_string();
                tracing::warn!(error = %message, "composition failed");
                self.state.composed_image = None;
                self.emit(SessionEvent::CompositionFinished {
                    model: None,
                    layers: Vec::new(),
                    attempts: Vec::new(),
                    error: Some(message.clone()),
                });
                self.transition(Status::Error, Some(message));
            }
        }
    }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        if self.state.status.is_busy() {
            return Err(SessionError::Busy {
                status: self.state.status,
            });
        }
        Ok(())
    }

    fn transition(&mut self, to: Status, error: Option<String>) {
        let from = self.state.status;
        self.state.status = to;
        self.state.error_message = if to == Status::Error {
            error.clone()
        } else {
            None
        };
        tracing::debug!(%from, %to, "status changed");
        self.emit(SessionEvent::StatusChanged { from, to, error });
        self.publish();
    }

    fn publish(&self) {
        for observer in &self.observers {
            observer.render(&self.state);
        }
        self.persister.save(&self.state);
    }

    fn emit(&self, event: SessionEvent) {
        for observer in &self.observers {
            observer.notify(&event);
        }
    }

    fn release_all_handles(&self) {
        for image in self.state.image_refs() {
            if let ImageRef::LocalHandle(id) = image {
                self.handles.release(id);
            }
        }
    }

    fn release_if_orphaned(&self, image: Option<ImageRef>) {
        let Some(image) = image else {
            return;
        };
        if let ImageRef::LocalHandle(id) = &image {
            if !self.state.image_refs().contains(&&image) {
                self.handles.release(id);
            }
        }
    }
}

fn checked_position(category: Category, index: usize) -> Result<SlotPosition, SessionError> {
    if index >= capacity_of(category) {
        return Err(SessionError::InvalidSlot { category, index });
    }
    Ok(SlotPosition::new(category, index))
}
