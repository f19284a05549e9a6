use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore, TryAcquireError};
use tokio_stream::Stream;

use crate::binary::CliBinary;
use crate::config::{AdmissionPolicy, BridgeConfig};
use crate::error::BridgeError;
use crate::process::CliProcess;
use crate::response::{collect_completion, completion_chunks, ResponseContext, StreamFrame};
use crate::server::{create_router, AppState};
use crate::translate::{translate_request, InvocationDescriptor};
use crate::types::{ChatCompletionRequest, ChatCompletionResponse};

/// Entry point for running chat requests through the claude CLI.
///
/// Cheap to clone; clones share the resolved binary and the admission limit.
#[derive(Debug, Clone)]
pub struct BridgeManager {
    config: Arc<BridgeConfig>,
    binary: Arc<RwLock<Option<CliBinary>>>,
    permits: Arc<Semaphore>,
}

impl BridgeManager {
    pub fn new(config: BridgeConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config: Arc::new(config),
            binary: Arc::new(RwLock::new(None)),
            permits,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Admission slots currently free.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Resolve the CLI binary, caching it after the first success.
    pub async fn ensure_binary(&self) -> Result<CliBinary, BridgeError> {
        let read_lock = self.binary.read().await;
        if let Some(binary) = read_lock.as_ref() {
            return Ok(binary.clone());
        }
        drop(read_lock);

        let mut write_lock = self.binary.write().await;
        if let Some(binary) = write_lock.as_ref() {
            return Ok(binary.clone());
        }

        let binary = CliBinary::resolve(&self.config.cli_path)?;
        *write_lock = Some(binary.clone());
        Ok(binary)
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit, BridgeError> {
        let limit = self.config.max_concurrent;
        match self.config.admission {
            AdmissionPolicy::Reject => match self.permits.clone().try_acquire_owned() {
                Ok(permit) => Ok(permit),
                Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                    tracing::warn!(limit, "Rejecting request, concurrency limit reached");
                    Err(BridgeError::Overloaded(limit))
                }
            },
            AdmissionPolicy::Queue => {
                if self.permits.available_permits() == 0 {
                    tracing::debug!(limit, "Concurrency limit reached, queueing request");
                }
                self.permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| BridgeError::Overloaded(limit))
            }
        }
    }

    /// Spawn one CLI process for `descriptor` once admission allows it.
    pub async fn invoke(&self, descriptor: InvocationDescriptor) -> Result<CliProcess, BridgeError> {
        let binary = self.ensure_binary().await?;
        let permit = self.admit().await?;
        CliProcess::spawn(&binary, descriptor, &self.config, Some(permit))
    }

    fn prepare(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<(InvocationDescriptor, ResponseContext), BridgeError> {
        if request.messages.is_empty() {
            return Err(BridgeError::InvalidRequest(
                "'messages' must contain at least one message".to_string(),
            ));
        }

        let descriptor = translate_request(request);
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| descriptor.model.canonical_id().to_string());

        tracing::debug!(
            requested_model = request.model.as_deref().unwrap_or(""),
            resolved_model = %descriptor.model,
            message_count = request.messages.len(),
            prompt_length = descriptor.prompt.len(),
            "Translated chat request"
        );

        Ok((descriptor, ResponseContext::new(model)))
    }

    /// Run a request to completion and return the buffered response.
    pub async fn run_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, BridgeError> {
        let (descriptor, ctx) = self.prepare(request)?;
        let process = self.invoke(descriptor).await?;
        collect_completion(&ctx, process).await
    }

    /// Start a request and return its chunk frames as they are produced.
    ///
    /// Errors before the subprocess starts are returned directly; later
    /// failures arrive as a terminating [`StreamFrame::Error`].
    pub async fn run_completion_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<impl Stream<Item = StreamFrame> + Send + 'static, BridgeError> {
        let (descriptor, ctx) = self.prepare(request)?;
        tracing::info!(completion_id = %ctx.id, model = %ctx.model, "Starting streaming completion");
        let process = self.invoke(descriptor).await?;
        Ok(completion_chunks(ctx, process))
    }

    pub async fn serve(&self, addr: SocketAddr) -> anyhow::Result<()> {
        tracing::info!("Starting server on {}", addr);

        match self.ensure_binary().await {
            Ok(binary) => match binary.version().await {
                Ok(version) => tracing::info!(
                    path = %binary.path().display(),
                    version = %version,
                    "Claude CLI ready"
                ),
                Err(e) => tracing::warn!(error = %e, "Claude CLI found but version check failed"),
            },
            Err(e) => tracing::warn!(error = %e, "Claude CLI not available yet; requests will fail until it is installed"),
        }

        let app = create_router(AppState {
            manager: Arc::new(self.clone()),
        });

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        tracing::info!("Server listening on http://{}", addr);
        tracing::info!("OpenAI-compatible endpoint: http://{}/v1/chat/completions", addr);
        tracing::info!(
            max_concurrent = self.config.max_concurrent,
            admission = ?self.config.admission,
            timeout_secs = self.config.timeout.as_secs(),
            "Invocation limits"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Server error")?;

        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
