use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use imgpress_core::{
    Config, ConversionService, Converter, ImageEncoder, MetadataStore, ObjectStore,
    ProgressTracker,
};

/// Conversion service as wired by the server, with metadata behind a trait object.
pub type Service<S, E> = ConversionService<S, E, dyn MetadataStore>;

/// Shared application state
pub struct AppState<S, E>
where
    S: ObjectStore + 'static,
    E: ImageEncoder + 'static,
{
    config: Config,
    service: Arc<Service<S, E>>,
    progress: ProgressTracker,
    shutdown: CancellationToken,
}

impl<S, E> AppState<S, E>
where
    S: ObjectStore + 'static,
    E: ImageEncoder + 'static,
{
    pub fn new(config: Config, service: Arc<Service<S, E>>, progress: ProgressTracker) -> Self {
        Self {
            config,
            service,
            progress,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn service(&self) -> &Arc<Service<S, E>> {
        &self.service
    }

    pub fn converter(&self) -> &Arc<Converter<S, E>> {
        self.service.converter()
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Token cancelled when the server starts shutting down. Background
    /// jobs run under a child of it.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}
