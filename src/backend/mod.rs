//! Backend abstraction over the upstream inference services.
//!
//! The HTTP layer depends on the [`FraudClassifier`] trait instead of a
//! concrete client, so tests can swap in mock backends without any
//! process-wide state.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::formats::TextLabel;

pub mod openai_compat;

/// Lazily produced audio analysis fragments.
///
/// Finite and not restartable. The last item is always a label fragment.
pub type FragmentStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Reachability of a single backend.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Healthy,
    Unhealthy,
}

/// Probe outcome for one backend.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct BackendHealth {
    pub status: BackendState,
    pub error: Option<String>,
}

impl BackendHealth {
    pub fn healthy() -> Self {
        Self {
            status: BackendState::Healthy,
            error: None,
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            status: BackendState::Unhealthy,
            error: Some(error.into()),
        }
    }
}

/// Aggregate service state derived from all backends.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallState {
    Healthy,
    Degraded,
}

/// Per-backend health keyed by backend name.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct HealthReport {
    pub backends: BTreeMap<String, BackendHealth>,
}

impl HealthReport {
    pub fn insert(&mut self, name: impl Into<String>, health: BackendHealth) {
        self.backends.insert(name.into(), health);
    }

    /// `Healthy` only if every backend is healthy.
    pub fn overall(&self) -> OverallState {
        if self
            .backends
            .values()
            .all(|b| b.status == BackendState::Healthy)
        {
            OverallState::Healthy
        } else {
            OverallState::Degraded
        }
    }
}

/// Uniform prediction interface over both upstream backends.
///
/// Upstream failures never escape these methods: they are logged and mapped
/// to the backend's fail-safe "normal" label.
#[async_trait]
pub trait FraudClassifier: Send + Sync {
    /// Classifies a conversation transcript. Never fails.
    async fn classify_text(&self, text: &str) -> TextLabel;

    /// Streams the audio backend's analysis of an uploaded recording.
    async fn classify_audio_stream(&self, audio: Vec<u8>, filename: &str) -> FragmentStream;

    /// Probes every backend. `Err` means the probes themselves could not run.
    async fn health_check(&self) -> Result<HealthReport, AppError>;
}

/// Builds the production adapter for the configured backends.
pub fn build_backend(cfg: &AppConfig) -> Result<Arc<dyn FraudClassifier>, AppError> {
    Ok(Arc::new(openai_compat::OpenAiCompatBackend::new(cfg)?))
}
