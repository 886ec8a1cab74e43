use bookgen_core::{BackendConfig, BackendKind, ChatError, ChatModel, Conversation, Message};
use log::debug;
use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::backend::{build_client, read_body, require_model_name, ChatBackend, PROBE_TIMEOUT};
use crate::base_url::ollama_base_url;
use crate::error::AdapterError;

pub struct OllamaChat {
    client: Client,
    base_url: String,
    model_name: String,
    options: Option<Value>,
}

impl OllamaChat {
    pub fn new(profile: &BackendConfig) -> Result<Self, AdapterError> {
        Ok(Self {
            client: build_client(profile.timeout)?,
            base_url: ollama_base_url(&profile.base_url),
            model_name: require_model_name(&profile.model_name)?,
            options: merged_options(profile)?,
        })
    }

    pub fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    pub fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url)
    }

    fn send_once(&self, conversation: &Conversation) -> Result<String, AdapterError> {
        let body = OllamaChatRequest {
            model: &self.model_name,
            messages: conversation.messages(),
            stream: false,
            options: self.options.as_ref(),
        };
        debug!(
            "POST {} ({} messages)",
            self.chat_url(),
            conversation.len()
        );
        let response = self.client.post(self.chat_url()).json(&body).send()?;
        parse_chat_reply(&read_body(response)?)
    }
}

impl ChatModel for OllamaChat {
    fn send(&self, conversation: &Conversation) -> Result<String, ChatError> {
        self.send_once(conversation).map_err(ChatError::from)
    }
}

impl ChatBackend for OllamaChat {
    fn kind(&self) -> BackendKind {
        BackendKind::Ollama
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn available_models(&self) -> Result<Vec<String>, AdapterError> {
        let response = self
            .client
            .get(self.tags_url())
            .timeout(PROBE_TIMEOUT)
            .send()?;
        parse_model_names(&read_body(response)?)
    }

    fn as_chat_model(&self) -> &dyn ChatModel {
        self
    }
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<&'a Value>,
}

fn merged_options(profile: &BackendConfig) -> Result<Option<Value>, AdapterError> {
    let mut options = match &profile.options {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            return Err(AdapterError::invalid_config(format!(
                "ollama options must be an object, got {other}"
            )))
        }
    };
    if let Some(temperature) = profile.temperature {
        options
            .entry("temperature")
            .or_insert_with(|| Value::from(f64::from(temperature)));
    }
    if let Some(max_tokens) = profile.max_tokens {
        options
            .entry("num_predict")
            .or_insert_with(|| Value::from(max_tokens));
    }
    Ok((!options.is_empty()).then_some(Value::Object(options)))
}

/// Reply text from `message.content`, falling back to a top-level `response` string.
pub fn parse_chat_reply(body: &str) -> Result<String, AdapterError> {
    let value: Value = serde_json::from_str(body)?;
    if let Some(content) = value
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
    {
        return Ok(content.to_string());
    }
    if let Some(response) = value.get("response").and_then(Value::as_str) {
        return Ok(response.to_string());
    }
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return Err(AdapterError::UnexpectedFormat(format!("ollama error: {error}")));
    }
    Err(AdapterError::UnexpectedFormat(
        "no message content in ollama reply".to_string(),
    ))
}

pub fn parse_model_names(body: &str) -> Result<Vec<String>, AdapterError> {
    let value: Value = serde_json::from_str(body)?;
    let models = value
        .get("models")
        .and_then(Value::as_array)
        .ok_or_else(|| AdapterError::UnexpectedFormat("missing `models` list".to_string()))?;
    Ok(models
        .iter()
        .filter_map(|entry| entry.get("name").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn profile() -> BackendConfig {
        BackendConfig {
            base_url: "http://gpu:11434/".into(),
            model_name: "llama3".into(),
            ..BackendConfig::default()
        }
    }

    #[test]
    fn reads_message_content_then_response() {
        let reply = parse_chat_reply(r#"{"message":{"role":"assistant","content":"Hi"},"done":true}"#);
        assert_eq!(reply.unwrap(), "Hi");
        assert_eq!(parse_chat_reply(r#"{"response":"Old style"}"#).unwrap(), "Old style");
        assert!(matches!(
            parse_chat_reply(r#"{"error":"model not found"}"#),
            Err(AdapterError::UnexpectedFormat(message)) if message.contains("model not found")
        ));
        assert!(matches!(parse_chat_reply("<html>"), Err(AdapterError::Json(_))));
    }

    #[test]
    fn lists_model_names() {
        let body = r#"{"models":[{"name":"llama3"},{"name":"mistral:7b"},{"size":1}]}"#;
        assert_eq!(parse_model_names(body).unwrap(), ["llama3", "mistral:7b"]);
        assert!(parse_model_names("{}").is_err());
    }

    #[test]
    fn request_body_matches_chat_api() {
        let conversation: Conversation = [Message::system("rules"), Message::user("!t")]
            .into_iter()
            .collect();
        let options = json!({"num_ctx": 4096});
        let body = OllamaChatRequest {
            model: "llama3",
            messages: conversation.messages(),
            stream: false,
            options: Some(&options),
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "model": "llama3",
                "messages": [
                    {"role": "system", "content": "rules"},
                    {"role": "user", "content": "!t"}
                ],
                "stream": false,
                "options": {"num_ctx": 4096}
            })
        );
    }

    #[test]
    fn profile_values_fill_options() {
        let mut profile = profile();
        profile.temperature = Some(0.5);
        profile.max_tokens = Some(512);
        profile.options = Some(json!({"temperature": 0.2}));
        let options = merged_options(&profile).unwrap().unwrap();
        assert_eq!(options, json!({"temperature": 0.2, "num_predict": 512}));

        assert_eq!(merged_options(&BackendConfig::default()).unwrap(), None);
        profile.options = Some(json!([1, 2]));
        assert!(matches!(
            merged_options(&profile),
            Err(AdapterError::InvalidConfig(_))
        ));
    }

    #[test]
    fn endpoints_derive_from_base_url() {
        let chat = OllamaChat::new(&profile()).unwrap();
        assert_eq!(chat.chat_url(), "http://gpu:11434/api/chat");
        assert_eq!(chat.tags_url(), "http://gpu:11434/api/tags");
        assert_eq!(chat.kind(), BackendKind::Ollama);

        let missing_model = BackendConfig::default();
        assert!(OllamaChat::new(&missing_model).is_err());
    }
}
