mod backend;
mod base_url;
mod error;
mod ollama;
mod openai;

pub use backend::{ChatBackend, ProbeReport};
pub use base_url::{ollama_base_url, openai_base_url};
pub use error::AdapterError;
pub use ollama::OllamaChat;
pub use openai::OpenAiChat;

use bookgen_core::{BackendConfig, BackendKind, Config};

pub fn create_chat_backend(profile: &BackendConfig) -> Result<Box<dyn ChatBackend>, AdapterError> {
    Ok(match profile.kind {
        BackendKind::Ollama => Box::new(OllamaChat::new(profile)?),
        BackendKind::OpenAi => Box::new(OpenAiChat::new(profile)?),
    })
}

/// Resolves a profile by name (or the last used / default one) and builds its backend.
pub fn create_chat_backend_from_config(
    config: &Config,
    name: Option<&str>,
) -> Result<(String, Box<dyn ChatBackend>), AdapterError> {
    let (name, profile) = config.resolve_backend(name).ok_or_else(|| {
        AdapterError::invalid_config(format!(
            "unknown backend profile `{}`",
            name.unwrap_or_default()
        ))
    })?;
    let backend = create_chat_backend(&profile)?;
    Ok((name, backend))
}
