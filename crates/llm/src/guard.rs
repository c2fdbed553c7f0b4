//! Non-blocking generation guard.
//!
//! The queue already runs one generation at a time. Callers that reach the
//! backend directly go through [`GuardedTextBackend`], which refuses a
//! second concurrent generation with [`BackendError::Busy`] instead of
//! waiting for the first to finish.

use async_trait::async_trait;
use tokio::sync::Mutex;

use genqueue_core::backend::{BackendError, TextBackend, TextGeneration};
use genqueue_core::payload::InferenceParams;

pub struct GuardedTextBackend<B> {
    inner: B,
    generating: Mutex<()>,
}

impl<B: TextBackend> GuardedTextBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            generating: Mutex::new(()),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Whether a generation currently holds the guard.
    pub fn is_generating(&self) -> bool {
        self.generating.try_lock().is_err()
    }
}

#[async_trait]
impl<B: TextBackend> TextBackend for GuardedTextBackend<B> {
    async fn is_loaded(&self) -> bool {
        self.inner.is_loaded().await
    }

    async fn load(&self) -> Result<(), BackendError> {
        self.inner.load().await
    }

    async fn unload(&self) -> Result<(), BackendError> {
        self.inner.unload().await
    }

    async fn generate_streaming(
        &self,
        prompt: &str,
        params: &InferenceParams,
        on_token: &mut (dyn for<'t> FnMut(&'t str) + Send),
    ) -> Result<TextGeneration, BackendError> {
        let Ok(_guard) = self.generating.try_lock() else {
            tracing::warn!("Rejected concurrent generation request");
            return Err(BackendError::Busy);
        };
        self.inner.generate_streaming(prompt, params, on_token).await
    }
}
