//! Processor that asks an OpenAI-compatible chat endpoint for a reply.
//!
//! For each conversation a two-message request is sent: the configured
//! system prompt and a user prompt rendered from a `${var}` template. The
//! reply is appended to a copy of the conversation as an assistant message
//! and the token usage is stored under the `usage` metadata key.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::{Captures, Regex};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::{config, ApiConfig};
use crate::error::LlmError;
use crate::task::processor::{Outcome, Processor};
use crate::types::{Conversation, Message};

/// Default system prompt.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Default user prompt template: the last user message verbatim.
pub const DEFAULT_USER_TEMPLATE: &str = "${content}";

const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Metadata key receiving the token usage reported by the API.
pub const USAGE_METADATA_KEY: &str = "usage";

/// Generates an assistant reply for each conversation.
#[derive(Debug, Clone)]
pub struct LlmProcessor {
    client: Client,
    system_prompt: String,
    user_template: String,
    model: Option<String>,
    temperature: f64,
    api: Option<ApiConfig>,
}

impl Default for LlmProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmProcessor {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            user_template: DEFAULT_USER_TEMPLATE.to_string(),
            model: None,
            temperature: DEFAULT_TEMPERATURE,
            api: None,
        }
    }

    /// Uses a preconfigured HTTP client (proxies, TLS roots, pooling).
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Sets the user prompt template.
    ///
    /// `${content}` expands to the last user message; any other `${key}`
    /// expands to the conversation metadata value under `key`. Unknown
    /// variables are left as written.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.user_template = template.into();
        self
    }

    /// Uses `model` instead of `api.model` from the active context.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Pins the API settings instead of reading them from the active context.
    pub fn with_api_config(mut self, api: ApiConfig) -> Self {
        self.api = Some(api);
        self
    }

    /// API settings in effect for a call made now.
    pub fn api_config(&self) -> ApiConfig {
        match &self.api {
            Some(api) => api.clone(),
            None => config().settings().api.clone(),
        }
    }

    /// Builds the request body for `conversation`.
    pub fn build_request(&self, conversation: &Conversation, api: &ApiConfig) -> ChatRequest {
        let mut variables = Map::new();
        let content = conversation
            .last_user_message()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        variables.insert("content".to_string(), Value::String(content));
        for (key, value) in &conversation.metadata {
            variables.insert(key.clone(), value.clone());
        }

        ChatRequest {
            model: self.model.clone().unwrap_or_else(|| api.model.clone()),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: self.system_prompt.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: render_template(&self.user_template, &variables),
                },
            ],
            temperature: self.temperature,
            stream: false,
        }
    }

    /// Calls the API and returns the conversation extended with the reply.
    pub async fn complete(&self, conversation: &Conversation) -> Result<Conversation, LlmError> {
        let api = self.api_config();
        let request = self.build_request(conversation, &api);
        let url = format!("{}/chat/completions", api.openai_base_url.trim_end_matches('/'));

        let mut builder = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(api.request_timeout_secs))
            .json(&request);
        if !api.openai_api_key.is_empty() {
            builder = builder.bearer_auth(&api.openai_api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            let message = serde_json::from_str::<ApiErrorResponse>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);

            if status_code == 429 {
                return Err(LlmError::RateLimited(message));
            }
            return Err(LlmError::ApiError {
                code: status_code,
                message,
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ParseError(format!("Failed to parse API response: {}", e)))?;

        let reply = body
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| LlmError::ParseError("Response contains no choices".to_string()))?;

        debug!(model = %request.model, reply_chars = reply.len(), "LLM call completed");

        let mut extended = conversation.clone();
        extended.messages.push(Message::assistant(reply));
        extended.metadata.insert(
            USAGE_METADATA_KEY.to_string(),
            body.usage.unwrap_or_else(|| Value::Object(Map::new())),
        );
        Ok(extended)
    }
}

#[async_trait]
impl Processor<Conversation> for LlmProcessor {
    async fn process(&self, item: &Conversation) -> Outcome<Conversation> {
        self.complete(item).await.map(Some).into()
    }

    fn name(&self) -> &str {
        "llm"
    }
}

/// Replaces `${name}` placeholders with values from `variables`.
///
/// String values are inserted as-is, other JSON values in their JSON form.
/// Placeholders without a value are kept verbatim.
pub fn render_template(template: &str, variables: &Map<String, Value>) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| Regex::new(r"\$\{(.*?)\}").expect("Invalid placeholder regex"));

    re.replace_all(template, |caps: &Captures| match variables.get(&caps[1]) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => caps[0].to_string(),
    })
    .into_owned()
}

/// Request body of `POST /chat/completions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub stream: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigOverrides, ContextRef};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn vars(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    /// Serves one HTTP response and returns the raw request it received.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if raw.len() >= split + 4 + length || n == 0 {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&raw).to_string()
        });

        (base_url, handle)
    }

    fn local_processor(base_url: &str) -> LlmProcessor {
        let client = Client::builder().no_proxy().build().unwrap();
        LlmProcessor::new().with_client(client).with_api_config(api(base_url))
    }

    fn api(base_url: &str) -> ApiConfig {
        ApiConfig {
            openai_base_url: base_url.to_string(),
            openai_api_key: "sk-test".to_string(),
            ..ApiConfig::default()
        }
    }

    #[test]
    fn test_render_template() {
        let variables = vars(&[
            ("content", Value::from("What is Rust?")),
            ("lang", Value::from("fr")),
            ("level", Value::from(3)),
        ]);

        assert_eq!(
            render_template("[${lang}/${level}] ${content} ${missing}", &variables),
            "[fr/3] What is Rust? ${missing}"
        );
        assert_eq!(render_template("no placeholders", &variables), "no placeholders");
    }

    #[test]
    fn test_build_request() {
        let conv = Conversation::new(vec![
            Message::user("first"),
            Message::assistant("ok"),
            Message::user("translate me"),
        ])
        .with_metadata("lang", "German");

        let processor = LlmProcessor::new()
            .with_system_prompt("You translate.")
            .with_template("Into ${lang}: ${content}");
        let request = processor.build_request(&conv, &ApiConfig::default());

        assert_eq!(request.model, "gpt-3.5-turbo");
        assert!(!request.stream);
        assert_eq!(request.messages[0].content, "You translate.");
        assert_eq!(request.messages[1].role, "user");
        assert_eq!(request.messages[1].content, "Into German: translate me");

        let pinned = processor.with_model("local-llama");
        assert_eq!(pinned.build_request(&conv, &ApiConfig::default()).model, "local-llama");
    }

    #[tokio::test]
    async fn test_api_config_follows_active_context() {
        let processor = LlmProcessor::new();
        let overrides = ConfigOverrides::new().set("api.model", "ctx-model");

        let model = config()
            .switch(ContextRef::Current, &overrides, async { processor.api_config().model })
            .await
            .unwrap();
        assert_eq!(model, "ctx-model");

        let pinned = LlmProcessor::new().with_api_config(ApiConfig {
            model: "pinned".to_string(),
            ..ApiConfig::default()
        });
        let model = config()
            .switch(ContextRef::Current, &overrides, async { pinned.api_config().model })
            .await
            .unwrap();
        assert_eq!(model, "pinned");
    }

    #[tokio::test]
    async fn test_complete_appends_reply_and_usage() {
        let (base_url, server) = serve_once(
            "200 OK",
            r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"Hello back"}}],"usage":{"total_tokens":12}}"#,
        )
        .await;

        let processor = local_processor(&base_url);
        let conv = Conversation::new(vec![Message::user("Hello")]);
        let out = processor.complete(&conv).await.unwrap();

        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.messages[1], Message::assistant("Hello back"));
        assert_eq!(out.metadata["usage"]["total_tokens"], 12);
        assert_eq!(conv.messages.len(), 1);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /chat/completions"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer sk-test"));
        assert!(request.contains(r#""stream":false"#));
    }

    #[tokio::test]
    async fn test_rate_limited_response() {
        let (base_url, _server) = serve_once(
            "429 Too Many Requests",
            r#"{"error":{"message":"slow down"}}"#,
        )
        .await;

        let processor = local_processor(&base_url);
        let err = processor
            .complete(&Conversation::new(vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::RateLimited(ref m) if m == "slow down"));
    }

    #[tokio::test]
    async fn test_api_error_becomes_failed_outcome() {
        let (base_url, _server) = serve_once("500 Internal Server Error", "upstream exploded").await;

        let processor = local_processor(&base_url);
        let outcome = processor
            .process(&Conversation::new(vec![Message::user("hi")]))
            .await;

        match outcome {
            Outcome::Failed(e) => match e.downcast_ref::<LlmError>() {
                Some(LlmError::ApiError { code, message }) => {
                    assert_eq!(*code, 500);
                    assert_eq!(message, "upstream exploded");
                }
                other => panic!("unexpected error: {other:?}"),
            },
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
