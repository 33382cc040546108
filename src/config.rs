//! Configuration loading from environment variables.
//!
//! Values are read once at startup. Malformed numbers fail fast, but backend
//! URLs left at their loopback defaults only produce a warning so the
//! service still starts without production settings.

use std::env;
use std::time::Duration;

use tracing::warn;

use crate::error::AppError;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 5;
pub const MAX_HEALTH_TIMEOUT_SECS: u64 = 60;

/// Identifier of the text (completions) backend.
pub const TEXT_BACKEND_NAME: &str = "sailor2";
/// Identifier of the audio (streaming chat) backend.
pub const AUDIO_BACKEND_NAME: &str = "qwen2";

const DEFAULT_TEXT_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_AUDIO_BASE_URL: &str = "http://localhost:8001";
const DEFAULT_TEXT_MODEL: &str = "fauzanazz/sailor2-fraud-indo-8b-merged";
const DEFAULT_AUDIO_MODEL: &str = "fauzanazz/qwen2-audio-indo-fraud-7b-merged";

/// Connection settings for one upstream inference backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Stable backend identifier used in health output and logs.
    pub name: &'static str,
    /// Base URL without trailing slash, for example `http://10.0.0.5:8000`.
    pub base_url: String,
    /// Model identifier sent in every upstream request.
    pub model: String,
    /// Timeout applied to inference calls.
    pub timeout: Duration,
}

impl BackendConfig {
    /// Returns `base_url` joined with an OpenAI-style `/v1/...` path.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn is_loopback(&self) -> bool {
        let host = self
            .base_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.base_url);
        host.starts_with("localhost") || host.starts_with("127.0.0.1") || host.starts_with("[::1]")
    }
}

/// Runtime configuration for the HTTP server and both backends.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Host interface to bind.
    pub host: String,
    /// TCP port to bind.
    pub port: u16,
    /// Text classification backend.
    pub text_backend: BackendConfig,
    /// Audio classification backend.
    pub audio_backend: BackendConfig,
    /// Timeout applied to each health probe.
    pub health_timeout: Duration,
}

impl AppConfig {
    /// Builds configuration from environment variables.
    ///
    /// Variables:
    /// - `HOST` (default `0.0.0.0`)
    /// - `PORT` (default `8000`)
    /// - `SAILOR2_BASE_URL` (default `http://localhost:8000`)
    /// - `SAILOR2_MODEL_NAME`
    /// - `QWEN2_BASE_URL` (default `http://localhost:8001`)
    /// - `QWEN2_MODEL_NAME`
    /// - `REQUEST_TIMEOUT_SECS` (default `60`, min `1`, max `600`)
    /// - `HEALTH_TIMEOUT_SECS` (default `5`, min `1`, max `60`)
    pub fn from_env() -> Result<Self, AppError> {
        let host = env_str("HOST", "0.0.0.0");
        let port = env_u16("PORT", 8000)?;
        let request_timeout = Duration::from_secs(env_u64_bounded(
            "REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
            1,
            MAX_REQUEST_TIMEOUT_SECS,
        )?);
        let health_timeout = Duration::from_secs(env_u64_bounded(
            "HEALTH_TIMEOUT_SECS",
            DEFAULT_HEALTH_TIMEOUT_SECS,
            1,
            MAX_HEALTH_TIMEOUT_SECS,
        )?);

        let text_backend = BackendConfig {
            name: TEXT_BACKEND_NAME,
            base_url: parse_base_url(
                "SAILOR2_BASE_URL",
                &env_str("SAILOR2_BASE_URL", DEFAULT_TEXT_BASE_URL),
            )?,
            model: env_str("SAILOR2_MODEL_NAME", DEFAULT_TEXT_MODEL),
            timeout: request_timeout,
        };
        let audio_backend = BackendConfig {
            name: AUDIO_BACKEND_NAME,
            base_url: parse_base_url(
                "QWEN2_BASE_URL",
                &env_str("QWEN2_BASE_URL", DEFAULT_AUDIO_BASE_URL),
            )?,
            model: env_str("QWEN2_MODEL_NAME", DEFAULT_AUDIO_MODEL),
            timeout: request_timeout,
        };

        Ok(Self {
            host,
            port,
            text_backend,
            audio_backend,
            health_timeout,
        })
    }

    /// Logs a warning for every backend still pointing at a loopback address.
    ///
    /// Returns the names of the environment variables that were flagged.
    pub fn warn_on_loopback_defaults(&self) -> Vec<&'static str> {
        let mut flagged = Vec::new();
        if self.text_backend.is_loopback() {
            flagged.push("SAILOR2_BASE_URL");
        }
        if self.audio_backend.is_loopback() {
            flagged.push("QWEN2_BASE_URL");
        }
        if !flagged.is_empty() {
            warn!(
                variables = %flagged.join(", "),
                "using localhost defaults; set these variables for production deployment"
            );
        }
        flagged
    }
}

/// Trimmed value of `name`; unset and blank values both count as absent.
fn env_nonempty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_str(name: &str, default: &str) -> String {
    env_nonempty(name).unwrap_or_else(|| default.to_string())
}

fn env_u16(name: &str, default: u16) -> Result<u16, AppError> {
    match env_nonempty(name) {
        Some(raw) => parse_port(name, &raw),
        None => Ok(default),
    }
}

fn parse_port(name: &str, raw: &str) -> Result<u16, AppError> {
    match raw.trim().parse::<u16>() {
        Ok(0) => Err(AppError::internal(format!(
            "invalid {name}={raw:?}; expected > 0"
        ))),
        Ok(port) => Ok(port),
        Err(_) => Err(AppError::internal(format!(
            "invalid {name}={raw:?}; expected integer 1-65535"
        ))),
    }
}

fn env_u64_bounded(name: &str, default: u64, min: u64, max: u64) -> Result<u64, AppError> {
    match env_nonempty(name) {
        Some(raw) => parse_u64_bounded(name, &raw, min, max),
        None => Ok(default),
    }
}

fn parse_u64_bounded(name: &str, raw: &str, min: u64, max: u64) -> Result<u64, AppError> {
    let parsed = raw.trim().parse::<u64>().map_err(|_| {
        AppError::internal(format!(
            "invalid {name}={raw:?}; expected integer in range [{min}, {max}]"
        ))
    })?;
    if parsed < min || parsed > max {
        return Err(AppError::internal(format!(
            "invalid {name}={raw:?}; expected integer in range [{min}, {max}]"
        )));
    }
    Ok(parsed)
}

fn parse_base_url(name: &str, raw: &str) -> Result<String, AppError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(AppError::internal(format!(
            "invalid {name}={raw:?}; expected an http:// or https:// URL"
        )));
    }
    Ok(trimmed.to_string())
}
