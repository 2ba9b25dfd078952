use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cache_error::CacheError;
use crate::config::{BackendKind, CacheConfig};

use super::{
    Backend, BackendCallback, BackendFactory, BackendPoll, CompletionMode, FileBackend,
    MemoryBackend,
};

/// The factory for the backends that ship with this crate.
#[derive(Debug, Clone)]
pub struct DefaultBackend {
    kind: BackendKind,
    path: Option<PathBuf>,
    max_bytes: u64,
    completion: CompletionMode,
}

impl DefaultBackend {
    pub fn new(kind: BackendKind, path: Option<PathBuf>, max_bytes: u64) -> Self {
        Self {
            kind,
            path,
            max_bytes,
            completion: CompletionMode::Sync,
        }
    }

    /// An in-memory backend of the given size.
    pub fn in_memory(max_bytes: u64) -> Self {
        Self::new(BackendKind::Memory, None, max_bytes)
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let completion = if config.async_completion {
            CompletionMode::Async
        } else {
            CompletionMode::Sync
        };
        Self::new(config.backend, config.cache_dir.clone(), config.max_bytes)
            .with_completion(completion)
    }

    /// Controls how both the factory and the backend it creates complete their operations.
    pub fn with_completion(mut self, completion: CompletionMode) -> Self {
        self.completion = completion;
        self
    }

    fn build(&self) -> Result<Box<dyn Backend>, CacheError> {
        match self.kind {
            BackendKind::Memory => Ok(Box::new(MemoryBackend::new(
                self.max_bytes,
                self.completion,
            ))),
            BackendKind::Disk => {
                let Some(path) = self.path.as_ref() else {
                    tracing::error!("disk cache backend requires a `cache_dir`");
                    return Err(CacheError::Failed);
                };
                let backend = FileBackend::open(path, self.max_bytes, self.completion)?;
                Ok(Box::new(backend))
            }
        }
    }
}

impl BackendFactory for DefaultBackend {
    fn create_backend(&mut self, callback: BackendCallback) -> BackendPoll<Box<dyn Backend>> {
        let result = self.build();
        if let Err(err) = &result {
            tracing::warn!(error = %err, kind = ?self.kind, "failed to create cache backend");
        }
        self.completion.finish(callback, result)
    }
}

/// A factory that hands out a backend that was constructed up front.
///
/// It counts its invocations, which lets tests verify that a coordinator builds its backend
/// only once.
pub struct PrebuiltBackend {
    backend: Option<Box<dyn Backend>>,
    completion: CompletionMode,
    invocations: Arc<AtomicUsize>,
}

impl PrebuiltBackend {
    pub fn new(backend: impl Backend + 'static, completion: CompletionMode) -> Self {
        Self {
            backend: Some(Box::new(backend)),
            completion,
            invocations: Default::default(),
        }
    }

    pub fn invocations(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.invocations)
    }
}

impl BackendFactory for PrebuiltBackend {
    fn create_backend(&mut self, callback: BackendCallback) -> BackendPoll<Box<dyn Backend>> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let result = self.backend.take().ok_or(CacheError::Failed);
        self.completion.finish(callback, result)
    }
}
