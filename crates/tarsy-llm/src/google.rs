//! Google Gemini provider, used for the native-thinking iteration strategy.
//!
//! Function declarations use the `"{server}__{tool}"` naming convention
//! (see [`crate::types::join_server_tool_name`]) because Gemini function
//! names can't contain the separators the rest of the engine uses. Thinking
//! continuity is carried via a `thoughtSignature` field Gemini attaches to
//! function-call parts; callers thread it back in on the next turn through
//! `Message::thought_signature`.

use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tarsy_core::{Message, MessageRole, ToolCall};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::provider::{LlmError, LlmProvider, LlmResult, LlmStream};
use crate::types::{LlmRequest, StreamDelta};

const GOOGLE_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GoogleProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GoogleProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: GOOGLE_API_BASE.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }

    fn models(&self) -> &[&str] {
        &["gemini-2.0-flash", "gemini-1.5-pro"]
    }

    async fn complete_stream(
        &self,
        request: LlmRequest,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<LlmStream> {
        let system_instruction = request.system.clone().map(|text| GoogleContent {
            role: "user".to_string(),
            parts: vec![GooglePart::Text { text }],
        });

        let contents = to_google_contents(&request.messages);

        let tools = request.tools.as_ref().map(|tools| {
            vec![GoogleToolSet {
                function_declarations: tools
                    .iter()
                    .map(|t| GoogleFunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.input_schema.clone(),
                    })
                    .collect(),
            }]
        });

        let body = GoogleRequest {
            contents,
            system_instruction,
            tools,
            generation_config: GoogleGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            },
        };

        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, request.model, self.api_key
        );

        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Google error {}: {}", status, error_text);
            return Err(match status.as_u16() {
                401 | 403 => LlmError::AuthFailed(error_text),
                429 => LlmError::RateLimited { retry_after_ms: 60000 },
                _ => LlmError::RequestFailed(format!("{status}: {error_text}")),
            });
        }

        Ok(Box::pin(parse_sse_stream(response.bytes_stream(), cancel)))
    }
}

fn to_google_contents(messages: &[Message]) -> Vec<GoogleContent> {
    let mut call_names: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    for message in messages {
        if let Some(calls) = &message.tool_calls {
            for call in calls {
                call_names.insert(call.id.clone(), call.name.clone());
            }
        }
    }

    messages
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .map(|message| {
            let role = match message.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "model",
                MessageRole::Tool => "user",
                MessageRole::System => unreachable!("filtered above"),
            };

            let parts = if let Some(tool_call_id) = &message.tool_call_id {
                let name = call_names
                    .get(tool_call_id)
                    .cloned()
                    .unwrap_or_else(|| tool_call_id.clone());
                vec![GooglePart::function_response(
                    name,
                    serde_json::json!({ "result": message.content }),
                )]
            } else if let Some(calls) = &message.tool_calls {
                calls
                    .iter()
                    .map(|call: &ToolCall| {
                        GooglePart::function_call(
                            call.name.clone(),
                            serde_json::from_str(&call.arguments).unwrap_or(serde_json::Value::Null),
                            message.thought_signature.clone(),
                        )
                    })
                    .collect()
            } else {
                vec![GooglePart::Text {
                    text: message.content.clone(),
                }]
            };

            GoogleContent {
                role: role.to_string(),
                parts,
            }
        })
        .collect()
}

fn parse_sse_stream(
    bytes_stream: impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    cancel: Option<CancellationToken>,
) -> impl futures::Stream<Item = LlmResult<StreamDelta>> + Send {
    async_stream::stream! {
        let mut buffer = String::new();
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

            while let Some(event_end) = buffer.find("\n\n") {
                let event_str = buffer[..event_end].to_string();
                buffer = buffer[event_end + 2..].to_string();

                let Some(data) = event_str.lines().find_map(|l| l.strip_prefix("data: ")) else {
                    continue;
                };

                let response: GoogleStreamResponse = match serde_json::from_str(data) {
                    Ok(r) => r,
                    Err(e) => {
                        yield Err(LlmError::StreamError(e.to_string()));
                        continue;
                    }
                };

                let Some(candidate) = response.candidates.into_iter().next() else { continue };
                for part in candidate.content.parts {
                    match part {
                        GooglePart::Text { text } => yield Ok(StreamDelta::Text(text)),
                        GooglePart::FunctionCallPart { function_call, thought_signature } => {
                            let id = uuid::Uuid::new_v4().to_string();
                            yield Ok(StreamDelta::ToolCallStart { id: id.clone(), name: function_call.name });
                            yield Ok(StreamDelta::ToolCallDelta {
                                id: id.clone(),
                                arguments: function_call.args.to_string(),
                            });
                            yield Ok(StreamDelta::ToolCallEnd { id });
                            if let Some(sig) = thought_signature {
                                yield Ok(StreamDelta::ThoughtSignature(sig));
                            }
                        }
                        GooglePart::FunctionResponsePart { .. } => {}
                    }
                }
                if let Some(reason) = candidate.finish_reason {
                    let usage = response.usage_metadata.map(|u| crate::types::Usage {
                        input_tokens: u.prompt_token_count.unwrap_or(0),
                        output_tokens: u.candidates_token_count.unwrap_or(0),
                    });
                    yield Ok(StreamDelta::Done { stop_reason: Some(reason), usage });
                }
            }
        }
    }
}

#[derive(Serialize)]
struct GoogleRequest {
    contents: Vec<GoogleContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GoogleContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GoogleToolSet>>,
    generation_config: GoogleGenerationConfig,
}

#[derive(Serialize)]
struct GoogleGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "maxOutputTokens")]
    max_output_tokens: Option<u32>,
}

#[derive(Serialize)]
struct GoogleToolSet {
    #[serde(rename = "functionDeclarations")]
    function_declarations: Vec<GoogleFunctionDeclaration>,
}

#[derive(Serialize)]
struct GoogleFunctionDeclaration {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct GoogleContent {
    role: String,
    parts: Vec<GooglePart>,
}

#[derive(Serialize, Deserialize)]
struct GoogleFunctionCallBody {
    name: String,
    args: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct GoogleFunctionResponseBody {
    name: String,
    response: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum GooglePart {
    Text {
        text: String,
    },
    FunctionCallPart {
        #[serde(rename = "functionCall")]
        function_call: GoogleFunctionCallBody,
        #[serde(rename = "thoughtSignature", skip_serializing_if = "Option::is_none")]
        thought_signature: Option<String>,
    },
    FunctionResponsePart {
        #[serde(rename = "functionResponse")]
        function_response: GoogleFunctionResponseBody,
    },
}

impl GooglePart {
    fn function_call(name: String, args: serde_json::Value, thought_signature: Option<String>) -> Self {
        GooglePart::FunctionCallPart {
            function_call: GoogleFunctionCallBody { name, args },
            thought_signature,
        }
    }

    fn function_response(name: String, response: serde_json::Value) -> Self {
        GooglePart::FunctionResponsePart {
            function_response: GoogleFunctionResponseBody { name, response },
        }
    }
}

#[derive(Deserialize)]
struct GoogleStreamResponse {
    candidates: Vec<GoogleCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GoogleUsage>,
}

#[derive(Deserialize)]
struct GoogleCandidate {
    content: GoogleContent,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GoogleUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u32>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_maps_to_a_function_response_part() {
        let messages = vec![
            Message {
                role: MessageRole::Assistant,
                content: String::new(),
                tool_calls: Some(vec![ToolCall {
                    id: "call_1".into(),
                    name: "kubernetes__get_pods".into(),
                    arguments: "{}".into(),
                }]),
                tool_call_id: None,
                thought_signature: Some("sig-abc".into()),
            },
            Message::tool_result("call_1", "3 pods running"),
        ];
        let contents = to_google_contents(&messages);
        assert_eq!(contents.len(), 2);
        matches!(
            &contents[1].parts[0],
            GooglePart::FunctionResponsePart { function_response } if function_response.name == "kubernetes__get_pods"
        );
    }
}
