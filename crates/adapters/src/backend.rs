use std::time::Duration;

use bookgen_core::{BackendKind, ChatModel};
use log::warn;
use reqwest::blocking::{Client, Response};

use crate::error::AdapterError;

pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a connectivity probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeReport {
    pub models: Vec<String>,
    pub model_available: bool,
}

/// A configured chat backend that can also be probed for the models it serves.
pub trait ChatBackend: ChatModel {
    fn kind(&self) -> BackendKind;

    fn base_url(&self) -> &str;

    fn model_name(&self) -> &str;

    fn available_models(&self) -> Result<Vec<String>, AdapterError>;

    fn as_chat_model(&self) -> &dyn ChatModel;

    fn check_connection(&self) -> Result<ProbeReport, AdapterError> {
        let models = self.available_models()?;
        let model_available = models.iter().any(|name| name == self.model_name());
        Ok(ProbeReport {
            models,
            model_available,
        })
    }
}

pub(crate) fn build_client(timeout_secs: u64) -> Result<Client, AdapterError> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()?)
}

/// Body of a successful response; any other status becomes `HttpStatus`.
pub(crate) fn read_body(response: Response) -> Result<String, AdapterError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        warn!("backend answered {status}: {body}");
        return Err(AdapterError::HttpStatus { status, body });
    }
    Ok(response.text()?)
}

pub(crate) fn require_model_name(model_name: &str) -> Result<String, AdapterError> {
    let trimmed = model_name.trim();
    if trimmed.is_empty() {
        return Err(AdapterError::invalid_config("model_name must not be empty"));
    }
    Ok(trimmed.to_string())
}
