pub mod codec;
pub mod composition;
pub mod config;
pub mod detection;
pub mod fallback;
pub mod persistence;
pub mod provider;
pub mod session;

#[cfg(test)]
mod testing;

pub use codec::{HttpFetcher, ImageFetcher, SessionCodec, StoredSession};
pub use config::EngineConfig;
pub use persistence::{DirectoryStore, MemoryStore, PersistReport, RemoteStore, RestStore};
pub use provider::{default_provider_registry, GenerationService, ProviderError, ProviderRegistry};
pub use session::{
    EngineServices, PhotoUpload, SessionError, SessionEvent, SessionMachine, SessionObserver,
};
