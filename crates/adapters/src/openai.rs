use bookgen_core::{BackendConfig, BackendKind, ChatError, ChatModel, Conversation, Message};
use log::debug;
use reqwest::blocking::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use crate::backend::{build_client, read_body, require_model_name, ChatBackend, PROBE_TIMEOUT};
use crate::base_url::openai_base_url;
use crate::error::AdapterError;

/// Chat against an OpenAI-style `/chat/completions` endpoint.
pub struct OpenAiChat {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model_name: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl OpenAiChat {
    pub fn new(profile: &BackendConfig) -> Result<Self, AdapterError> {
        Ok(Self {
            client: build_client(profile.timeout)?,
            base_url: openai_base_url(&profile.base_url),
            api_key: Some(profile.api_key.trim().to_string()).filter(|key| !key.is_empty()),
            model_name: require_model_name(&profile.model_name)?,
            temperature: profile.temperature,
            max_tokens: profile.max_tokens.filter(|tokens| *tokens > 0),
        })
    }

    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    pub fn models_url(&self) -> String {
        format!("{}/models", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn send_once(&self, conversation: &Conversation) -> Result<String, AdapterError> {
        let body = ChatCompletionRequest {
            model: &self.model_name,
            messages: conversation.messages(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        debug!(
            "POST {} ({} messages)",
            self.completions_url(),
            conversation.len()
        );
        let request = self.authorize(self.client.post(self.completions_url()));
        let response = request.json(&body).send()?;
        parse_completion(&read_body(response)?)
    }
}

impl ChatModel for OpenAiChat {
    fn send(&self, conversation: &Conversation) -> Result<String, ChatError> {
        self.send_once(conversation).map_err(ChatError::from)
    }
}

impl ChatBackend for OpenAiChat {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenAi
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn available_models(&self) -> Result<Vec<String>, AdapterError> {
        let request = self.authorize(self.client.get(self.models_url()));
        let response = request.timeout(PROBE_TIMEOUT).send()?;
        parse_model_ids(&read_body(response)?)
    }

    fn as_chat_model(&self) -> &dyn ChatModel {
        self
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// First non-blank `choices[].message.content` (or legacy `choices[].text`).
pub fn parse_completion(body: &str) -> Result<String, AdapterError> {
    let parsed: ChatCompletionResponse = serde_json::from_str(body)?;
    parsed
        .choices
        .into_iter()
        .flat_map(|choice| [choice.message.and_then(|m| m.content), choice.text])
        .flatten()
        .find(|content| !content.trim().is_empty())
        .ok_or(AdapterError::EmptyResponse)
}

/// Model ids listed by `GET /models`.
pub fn parse_model_ids(body: &str) -> Result<Vec<String>, AdapterError> {
    let list: ModelList = serde_json::from_str(body)?;
    Ok(list.data.into_iter().map(|entry| entry.id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn picks_first_non_blank_choice() {
        let body = r#"{"choices":[
            {"index":0,"message":{"role":"assistant","content":"  "}},
            {"index":1,"message":{"role":"assistant","content":"The Hive"}}
        ]}"#;
        assert_eq!(parse_completion(body).unwrap(), "The Hive");
        assert_eq!(
            parse_completion(r#"{"choices":[{"text":"legacy"}]}"#).unwrap(),
            "legacy"
        );
        assert!(matches!(
            parse_completion(r#"{"choices":[]}"#),
            Err(AdapterError::EmptyResponse)
        ));
    }

    #[test]
    fn lists_model_ids() {
        let body = r#"{"object":"list","data":[{"id":"gpt-4o-mini","object":"model"},{"id":"gpt-4o"}]}"#;
        assert_eq!(parse_model_ids(body).unwrap(), ["gpt-4o-mini", "gpt-4o"]);
        assert!(matches!(parse_model_ids("{}"), Err(AdapterError::Json(_))));
    }

    #[test]
    fn request_body_skips_unset_sampling() {
        let conversation: Conversation = [Message::user("!s")].into_iter().collect();
        let body = ChatCompletionRequest {
            model: "gpt-4o-mini",
            messages: conversation.messages(),
            temperature: None,
            max_tokens: Some(256),
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "user", "content": "!s"}],
                "max_tokens": 256
            })
        );
    }

    #[test]
    fn endpoints_and_credentials() {
        let profile = BackendConfig {
            kind: BackendKind::OpenAi,
            base_url: "https://llm.example.com".into(),
            api_key: "  ".into(),
            model_name: "gpt-4o-mini".into(),
            max_tokens: Some(0),
            ..BackendConfig::default()
        };
        let chat = OpenAiChat::new(&profile).unwrap();
        assert_eq!(chat.completions_url(), "https://llm.example.com/v1/chat/completions");
        assert_eq!(chat.models_url(), "https://llm.example.com/v1/models");
        assert!(chat.api_key.is_none());
        assert!(chat.max_tokens.is_none());
    }
}
