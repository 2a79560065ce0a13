// src/model.rs

use crate::config::ResolvedEndpoint;
use crate::error::ScanError;
use crate::prompts::REPAIR_SYSTEM_PROMPT;
use crate::types::TokenUsage;
use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{info, warn};

/// At most this many characters of a malformed response are sent back
/// to the model for the single repair attempt.
pub const REPAIR_SNIPPET_LIMIT: usize = 8_000;

/// What gets sent alongside the instruction.
#[derive(Debug, Clone)]
pub enum ModelPayload {
    /// Plain text (delimited samples, repair snippets).
    Text(String),
    /// Raw document bytes for the multimodal model, passed untouched.
    Document {
        instruction: String,
        bytes: Vec<u8>,
        media_type: String,
    },
}

/// One model response: raw text plus token counters.
#[derive(Debug, Clone)]
pub struct ModelReply {
    pub text: String,
    pub usage: TokenUsage,
}

/// The document-understanding model, abstracted for testing. Untrusted
/// with respect to output shape; trusted with respect to availability
/// (transport errors propagate).
#[async_trait]
pub trait DocumentModel: Send + Sync {
    async fn generate(&self, system: &str, payload: &ModelPayload) -> Result<ModelReply, ScanError>;

    /// Model name for usage records and logs.
    fn name(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    // String for plain text, an array of content parts for documents.
    content: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// OpenAI-compatible chat-completions client. All calls run at zero
/// sampling temperature with an independent timeout budget.
pub struct ChatModel {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    timeout: Duration,
}

impl ChatModel {
    pub fn from_endpoint(endpoint: &ResolvedEndpoint) -> Self {
        Self {
            client: Client::new(),
            base_url: endpoint.base_url.clone(),
            model: endpoint.model.clone(),
            api_key: endpoint.api_key.clone(),
            timeout: Duration::from_secs(endpoint.timeout_secs),
        }
    }

    /// Check if the Ollama server is reachable. The health endpoint is
    /// at the root, not under /v1.
    pub async fn check_health(&self) -> bool {
        let health_url = self
            .base_url
            .trim_end_matches("/v1")
            .trim_end_matches("/v1/");

        match self
            .client
            .get(health_url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
        {
            Ok(resp) => {
                if resp.status().is_success() {
                    info!("Model server is reachable");
                    true
                } else {
                    warn!(status = %resp.status(), "Model server returned non-OK status");
                    false
                }
            }
            Err(e) => {
                warn!(error = %e, "Model server not reachable");
                false
            }
        }
    }

    fn user_content(payload: &ModelPayload) -> Value {
        match payload {
            ModelPayload::Text(text) => Value::String(text.clone()),
            ModelPayload::Document {
                instruction,
                bytes,
                media_type,
            } => {
                let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
                json!([
                    { "type": "text", "text": instruction },
                    {
                        "type": "image_url",
                        "image_url": { "url": format!("data:{media_type};base64,{b64}") }
                    }
                ])
            }
        }
    }
}

#[async_trait]
impl DocumentModel for ChatModel {
    async fn generate(&self, system: &str, payload: &ModelPayload) -> Result<ModelReply, ScanError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: Value::String(system.to_string()),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: Self::user_content(payload),
                },
            ],
            temperature: 0.0,
        };

        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ScanError::ModelApi { status, body });
        }

        let chat_response: ChatResponse = response.json().await?;
        let text = chat_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or(ScanError::ModelApi {
                status: 200,
                body: "empty choices in model response".to_string(),
            })?;

        let usage = chat_response
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        info!(
            model = %self.model,
            chars = text.len(),
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "Model reply received"
        );

        Ok(ModelReply { text, usage })
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Outcome of the resilient parse ladder. `Unusable` is still a valid,
/// returnable outcome; callers substitute their minimal default.
#[derive(Debug)]
pub enum ParsedModelJson {
    Parsed(Value),
    Unusable { warning: String },
}

/// Invoke the model once and parse its output as structured JSON.
///
/// Failure handling, in order: one repair call with the leading slice
/// of the malformed response, then a degraded `Unusable` marker. A
/// malformed response never surfaces as an error past this point;
/// transport and API failures do propagate.
pub async fn invoke_structured(
    model: &dyn DocumentModel,
    system: &str,
    payload: &ModelPayload,
) -> Result<(ParsedModelJson, TokenUsage), ScanError> {
    let reply = model.generate(system, payload).await?;
    let mut usage = reply.usage;

    match parse_reply(&reply.text) {
        ReplyParse::Value(value) => return Ok((ParsedModelJson::Parsed(value), usage)),
        // Valid JSON with nothing in it (empty array). Repairing
        // well-formed output would be a wasted call.
        ReplyParse::EmptyShape => {
            return Ok((
                ParsedModelJson::Unusable {
                    warning: "model returned an empty result".to_string(),
                },
                usage,
            ));
        }
        ReplyParse::NotJson => {}
    }

    warn!(
        chars = reply.text.len(),
        "Model reply not parseable, issuing one repair call"
    );

    let snippet = leading_chars(&reply.text, REPAIR_SNIPPET_LIMIT);
    let repair_reply = model
        .generate(REPAIR_SYSTEM_PROMPT, &ModelPayload::Text(snippet.to_string()))
        .await?;
    usage.prompt_tokens += repair_reply.usage.prompt_tokens;
    usage.completion_tokens += repair_reply.usage.completion_tokens;

    match parse_reply(&repair_reply.text) {
        ReplyParse::Value(value) => {
            info!("Repair call produced parseable JSON");
            Ok((ParsedModelJson::Parsed(value), usage))
        }
        _ => {
            warn!("Repair call also unparseable, degrading to minimal result");
            Ok((
                ParsedModelJson::Unusable {
                    warning: "model output could not be parsed as structured data, even after a repair attempt".to_string(),
                },
                usage,
            ))
        }
    }
}

enum ReplyParse {
    Value(Value),
    /// Parsed as JSON but carries no record (e.g. an empty array).
    EmptyShape,
    NotJson,
}

/// Parse a raw model reply into a normalized JSON object, tolerating
/// fences, prefixed commentary, array wrapping and nested wrappers.
fn parse_reply(text: &str) -> ReplyParse {
    let Some(candidate) = extract_json_value(strip_fences(text)) else {
        return ReplyParse::NotJson;
    };
    let Ok(value) = serde_json::from_str::<Value>(candidate) else {
        return ReplyParse::NotJson;
    };
    match normalize_shape(value) {
        Some(v) => ReplyParse::Value(v),
        None => ReplyParse::EmptyShape,
    }
}

/// Strip markdown fences if the model added them despite instructions.
fn strip_fences(text: &str) -> &str {
    text.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Slice the outermost JSON value from a string that may contain
/// surrounding text (e.g. thinking tokens or commentary).
fn extract_json_value(s: &str) -> Option<&str> {
    let obj_start = s.find('{');
    let arr_start = s.find('[');

    let (start, close) = match (obj_start, arr_start) {
        (Some(o), Some(a)) if a < o => (a, ']'),
        (Some(o), _) => (o, '}'),
        (None, Some(a)) => (a, ']'),
        (None, None) => return None,
    };

    let end = s.rfind(close)?;
    if end <= start {
        return None;
    }
    Some(&s[start..=end])
}

/// Normalize the shape-shifting output the model is known to produce.
///
/// - An array becomes its first element; an empty array is unusable.
/// - Fields nested under a `details` wrapper, or under an `extraction`
///   wrapper with a sibling `quality`/`metadata` block, are flattened
///   into the top level so downstream code sees one flat record.
///
/// This is the single place shape tolerance lives; consumers never
/// need defensive checks of their own.
fn normalize_shape(value: Value) -> Option<Value> {
    let value = match value {
        Value::Array(items) => items.into_iter().next()?,
        other => other,
    };

    let Value::Object(mut map) = value else {
        return Some(value);
    };

    for wrapper in ["details", "extraction"] {
        if map.get(wrapper).is_some_and(Value::is_object) {
            if let Some(Value::Object(inner)) = map.remove(wrapper) {
                for (k, v) in inner {
                    map.entry(k).or_insert(v);
                }
            }
        }
    }
    for sidecar in ["quality", "metadata"] {
        if map.get(sidecar).is_some_and(Value::is_object) {
            if let Some(Value::Object(inner)) = map.remove(sidecar) {
                for (k, v) in inner {
                    map.entry(k).or_insert(v);
                }
            }
        }
    }

    Some(Value::Object(map))
}

/// Leading slice of at most `limit` bytes, cut on a char boundary.
fn leading_chars(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut cut = limit;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// A model stub that replays a scripted sequence of replies and
    /// records every call it receives.
    pub struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String, String>>>,
        pub calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedModel {
        pub fn new(replies: Vec<Result<&str, &str>>) -> Self {
            Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(String::from).map_err(String::from))
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DocumentModel for ScriptedModel {
        async fn generate(
            &self,
            system: &str,
            payload: &ModelPayload,
        ) -> Result<ModelReply, ScanError> {
            let user = match payload {
                ModelPayload::Text(t) => t.clone(),
                ModelPayload::Document { instruction, .. } => instruction.clone(),
            };
            self.calls
                .lock()
                .unwrap()
                .push((system.to_string(), user));

            let next = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted model ran out of replies");
            match next {
                Ok(text) => Ok(ModelReply {
                    text,
                    usage: TokenUsage {
                        prompt_tokens: 10,
                        completion_tokens: 5,
                    },
                }),
                Err(body) => Err(ScanError::ModelApi { status: 500, body }),
            }
        }

        fn name(&self) -> &str {
            "scripted-model"
        }
    }
}
