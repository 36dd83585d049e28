//! Shared provider for OpenAI-compatible chat-completions APIs (OpenAI, xAI).
//!
//! The two differ only in base URL and model list, so one provider is
//! parameterised by both rather than duplicating the wire logic.

use std::collections::HashMap;

use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tarsy_core::{Message, MessageRole};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::provider::{LlmError, LlmProvider, LlmResult, LlmStream};
use crate::types::{LlmRequest, StreamDelta, Usage};

pub struct OpenAiCompatProvider {
    client: Client,
    api_key: String,
    base_url: String,
    provider_name: &'static str,
    models: Vec<&'static str>,
}

impl OpenAiCompatProvider {
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1/chat/completions".to_string(),
            provider_name: "openai",
            models: vec!["gpt-4o", "gpt-4o-mini", "o3-mini"],
        }
    }

    pub fn xai(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.x.ai/v1/chat/completions".to_string(),
            provider_name: "xai",
            models: vec!["grok-2-latest"],
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        self.provider_name
    }

    fn models(&self) -> &[&str] {
        &self.models
    }

    async fn complete_stream(
        &self,
        request: LlmRequest,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<LlmStream> {
        let mut messages: Vec<OpenAiMessage> = Vec::new();
        if let Some(system) = &request.system {
            messages.push(OpenAiMessage {
                role: "system".to_string(),
                content: Some(system.clone()),
                tool_calls: None,
                tool_call_id: None,
            });
        }
        messages.extend(request.messages.iter().map(to_openai_message));

        let body = OpenAiRequest {
            model: request.model.clone(),
            messages,
            stream: true,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            tools: request.tools.as_ref().map(|tools| {
                tools
                    .iter()
                    .map(|t| OpenAiTool {
                        kind: "function".to_string(),
                        function: OpenAiFunction {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.input_schema.clone(),
                        },
                    })
                    .collect()
            }),
        };

        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(provider = self.provider_name, %status, "request failed: {error_text}");
            return Err(match status.as_u16() {
                401 => LlmError::AuthFailed(error_text),
                429 => LlmError::RateLimited { retry_after_ms: 60000 },
                _ => LlmError::RequestFailed(format!("{status}: {error_text}")),
            });
        }

        Ok(Box::pin(parse_sse_stream(response.bytes_stream(), cancel)))
    }
}

fn to_openai_message(message: &Message) -> OpenAiMessage {
    let role = match message.role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    };
    OpenAiMessage {
        role: role.to_string(),
        content: Some(message.content.clone()),
        tool_calls: message.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|c| OpenAiToolCall {
                    id: c.id.clone(),
                    kind: "function".to_string(),
                    function: OpenAiFunctionCall {
                        name: c.name.clone(),
                        arguments: c.arguments.clone(),
                    },
                })
                .collect()
        }),
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn parse_sse_stream(
    bytes_stream: impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    cancel: Option<CancellationToken>,
) -> impl futures::Stream<Item = LlmResult<StreamDelta>> + Send {
    async_stream::stream! {
        let mut buffer = String::new();
        let mut tool_call_names: HashMap<u32, String> = HashMap::new();
        tokio::pin!(bytes_stream);

        loop {
            let chunk_result = if let Some(token) = &cancel {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        yield Err(LlmError::Cancelled);
                        return;
                    }
                    next = bytes_stream.next() => next,
                }
            } else {
                bytes_stream.next().await
            };

            let Some(chunk_result) = chunk_result else { break };
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    yield Err(LlmError::StreamError(e.to_string()));
                    continue;
                }
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim().to_string();
                buffer = buffer[line_end + 1..].to_string();

                let Some(data) = line.strip_prefix("data: ") else { continue };
                if data == "[DONE]" {
                    yield Ok(StreamDelta::Done { stop_reason: Some("stop".to_string()), usage: None });
                    continue;
                }

                let chunk: OpenAiStreamChunk = match serde_json::from_str(data) {
                    Ok(c) => c,
                    Err(_) => continue,
                };

                let Some(choice) = chunk.choices.into_iter().next() else { continue };
                if let Some(content) = choice.delta.content {
                    yield Ok(StreamDelta::Text(content));
                }
                for tool_call in choice.delta.tool_calls.unwrap_or_default() {
                    let id = tool_call.id.clone().unwrap_or_else(|| {
                        tool_call_names
                            .get(&tool_call.index)
                            .cloned()
                            .unwrap_or_else(|| format!("call_{}", tool_call.index))
                    });
                    if let Some(function) = &tool_call.function {
                        if let Some(name) = &function.name {
                            tool_call_names.insert(tool_call.index, id.clone());
                            yield Ok(StreamDelta::ToolCallStart { id: id.clone(), name: name.clone() });
                        }
                        if let Some(arguments) = &function.arguments {
                            yield Ok(StreamDelta::ToolCallDelta { id: id.clone(), arguments: arguments.clone() });
                        }
                    }
                }
                if let Some(usage) = chunk.usage {
                    yield Ok(StreamDelta::Done {
                        stop_reason: choice.finish_reason,
                        usage: Some(Usage {
                            input_tokens: usage.prompt_tokens,
                            output_tokens: usage.completion_tokens,
                        }),
                    });
                } else if choice.finish_reason.is_some() {
                    yield Ok(StreamDelta::Done { stop_reason: choice.finish_reason, usage: None });
                }
            }
        }
    }
}

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
}

#[derive(Serialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "tool_call_id")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: OpenAiFunctionCall,
}

#[derive(Serialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    kind: String,
    function: OpenAiFunction,
}

#[derive(Serialize)]
struct OpenAiFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiStreamToolCall>>,
}

#[derive(Deserialize)]
struct OpenAiStreamToolCall {
    index: u32,
    id: Option<String>,
    function: Option<OpenAiStreamFunction>,
}

#[derive(Deserialize)]
struct OpenAiStreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_message_carries_its_tool_call_id() {
        let message = Message::tool_result("call_7", "done");
        let converted = to_openai_message(&message);
        assert_eq!(converted.role, "tool");
        assert_eq!(converted.tool_call_id.as_deref(), Some("call_7"));
    }
}
