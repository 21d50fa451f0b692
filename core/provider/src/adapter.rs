use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use tokio::sync::watch;

use atelier_model::{GenerateParams, ProviderDescriptor};

use crate::error::ProviderError;
use crate::Result;

/// Call context every upstream invocation runs under: the caller's
/// cancellation handle plus the provider's configured deadline.
#[derive(Clone)]
pub struct CallCtx {
    pub cancel: watch::Receiver<bool>,
    pub timeout: Duration,
    // Keeps the paired sender alive for detached contexts.
    _guard: Option<std::sync::Arc<watch::Sender<bool>>>,
}

impl CallCtx {
    pub fn new(cancel: watch::Receiver<bool>, timeout: Duration) -> Self {
        CallCtx {
            cancel,
            timeout,
            _guard: None,
        }
    }

    /// A context that can only expire, never be canceled.
    pub fn detached(timeout: Duration) -> Self {
        let (tx, rx) = watch::channel(false);
        CallCtx {
            cancel: rx,
            timeout,
            _guard: Some(std::sync::Arc::new(tx)),
        }
    }
}

/// One image produced by an upstream call, already sniffed as a
/// supported pixel format.
#[derive(Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub ext: String,
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Debug for GeneratedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedImage")
            .field("mime", &self.mime)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

#[derive(Clone, Debug, Default)]
pub struct GenerateOutput {
    pub images: Vec<GeneratedImage>,
    pub meta: serde_json::Value,
}

/// Uniform contract over heterogeneous upstream services. The capability
/// set is deliberately small: name, validate, generate, plus the prompt
/// rewriting path the UI exposes.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Stable registry identifier.
    fn name(&self) -> &str;

    fn descriptor(&self) -> ProviderDescriptor;

    /// Deadline applied to every upstream call.
    fn call_timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    /// Pure parameter check, run before anything is persisted.
    fn validate(&self, params: &GenerateParams) -> Result<()>;

    /// Submits to the upstream and returns raw image bytes plus metadata.
    /// Transient failures are retried internally up to the configured
    /// retry budget; cancellation interrupts in-flight I/O.
    async fn generate(&self, ctx: &CallCtx, params: &GenerateParams) -> Result<GenerateOutput>;

    /// Rewrites a prompt through the upstream's text path.
    async fn optimize_prompt(
        &self,
        ctx: &CallCtx,
        model: &str,
        prompt: &str,
        response_format: Option<&str>,
    ) -> Result<String>;
}

/// Field checks shared by every adapter.
pub fn validate_common(params: &GenerateParams) -> Result<()> {
    if params.prompt.trim().is_empty() {
        return Err(ProviderError::InvalidParams("prompt is empty".into()));
    }
    if params.model_id.trim().is_empty() {
        return Err(ProviderError::InvalidParams("model_id is empty".into()));
    }
    if params.count < atelier_model::MIN_COUNT || params.count > atelier_model::MAX_COUNT {
        return Err(ProviderError::InvalidParams(format!(
            "count {} outside [{}, {}]",
            params.count,
            atelier_model::MIN_COUNT,
            atelier_model::MAX_COUNT
        )));
    }
    Ok(())
}

/// Resolves when the caller flips the cancellation flag. A dropped
/// sender is not a cancellation.
pub async fn canceled(mut cancel: watch::Receiver<bool>) {
    if *cancel.borrow() {
        return;
    }
    loop {
        if cancel.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
        if *cancel.borrow() {
            return;
        }
    }
}

/// Drives one upstream attempt under the context's deadline and
/// cancellation handle.
pub async fn guarded<T, F>(ctx: &CallCtx, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = canceled(ctx.cancel.clone()) => Err(ProviderError::Canceled),
        outcome = tokio::time::timeout(ctx.timeout, fut) => match outcome {
            Ok(inner) => inner,
            Err(_) => Err(ProviderError::Timeout(ctx.timeout)),
        },
    }
}

fn retry_backoff() -> backoff::ExponentialBackoff {
    let mut backoff = backoff::ExponentialBackoff::default();
    backoff.initial_interval = Duration::from_millis(500);
    backoff.current_interval = backoff.initial_interval;
    backoff.multiplier = 2.0;
    backoff.max_interval = Duration::from_secs(10);
    backoff.max_elapsed_time = None;
    backoff
}

/// Repeats `op` on classified-transient failures with jittered
/// exponential delays, at most `max_retries` extra attempts. Cancellation
/// interrupts the delay as well as the attempt itself.
pub async fn retrying<T, F, Fut>(ctx: &CallCtx, max_retries: u32, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = retry_backoff();
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Err(error) if error.is_transient() && attempt < max_retries => {
                attempt += 1;
                let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                log::warn!(
                    "[{}] transient upstream failure (attempt {}/{}): {}. Retrying in {:?}.",
                    label,
                    attempt,
                    max_retries,
                    error,
                    delay
                );
                tokio::select! {
                    biased;
                    _ = canceled(ctx.cancel.clone()) => return Err(ProviderError::Canceled),
                    _ = tokio::time::sleep(delay) => (),
                }
            }
            outcome => return outcome,
        }
    }
}
