use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ChatMessage, ChatResponse, ChatRole, EventStream, LlmClient, LlmError, StreamEvent, ToolCall, ToolSchema};
use crate::config::LlmConfig;
use crate::conversation::MessageContent;

/// OpenAI 兼容的 chat/completions 客户端
#[derive(Clone)]
pub struct OpenAiChat {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool<'a>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: ChatRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

impl<'a> From<&'a ChatMessage> for ApiMessage<'a> {
    fn from(message: &'a ChatMessage) -> Self {
        Self {
            role: message.role,
            content: message.content.as_ref(),
            tool_calls: message
                .tool_calls
                .as_ref()
                .map(|calls| calls.iter().map(ApiToolCall::from).collect()),
            tool_call_id: message.tool_call_id.as_deref(),
            name: message.name.as_deref(),
        }
    }
}

#[derive(Serialize)]
struct ApiTool<'a> {
    r#type: &'static str,
    function: &'a ToolSchema,
}

#[derive(Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

impl From<&ToolCall> for ApiToolCall {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            r#type: "function".to_string(),
            function: ApiFunction {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        }
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ApiToolCall>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallFragment>,
}

#[derive(Deserialize, Debug)]
struct ToolCallFragment {
    index: u32,
    id: Option<String>,
    function: Option<FunctionFragment>,
}

#[derive(Deserialize, Debug)]
struct FunctionFragment {
    name: Option<String>,
    arguments: Option<String>,
}

/// 一条 SSE 数据解析后的结果
#[derive(Debug)]
enum StreamData {
    Done,
    Delta {
        content: Option<String>,
        tool_calls: Vec<ToolCallFragment>,
    },
}

fn parse_stream_data(data: &str) -> Result<StreamData, LlmError> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(StreamData::Done);
    }
    let chunk: StreamChunk =
        serde_json::from_str(data).map_err(|e| LlmError::Malformed(format!("{}: {}", e, data)))?;
    let delta = chunk.choices.into_iter().next().map(|c| c.delta).unwrap_or_default();
    Ok(StreamData::Delta {
        content: delta.content,
        tool_calls: delta.tool_calls,
    })
}

/// 按 index 拼接流式返回的工具调用片段
#[derive(Default)]
struct ToolCallAssembler {
    calls: BTreeMap<u32, ToolCall>,
}

impl ToolCallAssembler {
    fn push(&mut self, fragments: Vec<ToolCallFragment>) {
        for fragment in fragments {
            let call = self.calls.entry(fragment.index).or_insert_with(|| ToolCall {
                id: String::new(),
                name: String::new(),
                arguments: String::new(),
            });
            if let Some(id) = fragment.id {
                call.id = id;
            }
            if let Some(function) = fragment.function {
                if let Some(name) = function.name {
                    call.name.push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    call.arguments.push_str(&arguments);
                }
            }
        }
    }

    fn finish(self) -> Option<Vec<ToolCall>> {
        if self.calls.is_empty() {
            None
        } else {
            Some(self.calls.into_values().collect())
        }
    }
}

/// 把 SSE 响应转换为增量文本事件，工具调用片段在流结束时整体给出
fn event_stream(response: reqwest::Response) -> impl Stream<Item = Result<StreamEvent, LlmError>> + Send {
    try_stream! {
        let mut events = Box::pin(response.bytes_stream().eventsource());
        let mut assembler = ToolCallAssembler::default();
        let mut done = false;
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| LlmError::Stream(e.to_string()))?;
            match parse_stream_data(&event.data)? {
                StreamData::Done => {
                    done = true;
                    break;
                }
                StreamData::Delta { content, tool_calls } => {
                    assembler.push(tool_calls);
                    if let Some(text) = content.filter(|text| !text.is_empty()) {
                        yield StreamEvent::Delta(text);
                    }
                }
            }
        }
        // 连接在 [DONE] 之前关闭说明输出被截断，已拼出的工具调用也不可信
        if !done {
            Err::<(), _>(LlmError::Stream("响应流在 [DONE] 之前结束".to_string()))?;
        }
        if let Some(calls) = assembler.finish() {
            yield StreamEvent::ToolCalls(calls);
        }
    }
}

impl OpenAiChat {
    pub fn new(config: &LlmConfig, api_key: Option<String>) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|key| !key.is_empty()),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    /// 使用不同采样参数的副本，共享底层连接池
    pub fn with_sampling(&self, max_tokens: Option<u32>, temperature: Option<f32>) -> Self {
        Self {
            max_tokens: max_tokens.unwrap_or(self.max_tokens),
            temperature: temperature.unwrap_or(self.temperature),
            ..self.clone()
        }
    }

    fn request<'a>(&'a self, messages: &'a [ChatMessage], tools: &'a [ToolSchema], stream: bool) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: messages.iter().map(ApiMessage::from).collect(),
            max_tokens: Some(self.max_tokens),
            temperature: Some(self.temperature),
            tools: tools
                .iter()
                .map(|schema| ApiTool {
                    r#type: "function",
                    function: schema,
                })
                .collect(),
            stream,
        }
    }

    async fn post(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response, LlmError> {
        let api_key = self.api_key.as_deref().ok_or(LlmError::MissingApiKey)?;
        let res = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            warn!("模型接口返回错误状态 {}: {}", status, body);
            return Err(LlmError::Status { status, body });
        }
        Ok(res)
    }
}

#[async_trait]
impl LlmClient for OpenAiChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage], tools: &[ToolSchema]) -> Result<ChatResponse, LlmError> {
        let body = self.request(messages, tools, false);
        debug!("发送补全请求，消息数 {}，工具数 {}", messages.len(), tools.len());
        let resp: CompletionResponse = self
            .post(&body)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;
        let message = resp
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| LlmError::Malformed("响应中没有 choices".to_string()))?;

        if !message.tool_calls.is_empty() {
            let calls = message
                .tool_calls
                .into_iter()
                .map(|call| ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments,
                })
                .collect();
            return Ok(ChatResponse::ToolCalls(calls));
        }
        Ok(ChatResponse::Content(message.content.unwrap_or_default()))
    }

    async fn stream(&self, messages: &[ChatMessage], tools: &[ToolSchema]) -> Result<EventStream, LlmError> {
        let body = self.request(messages, tools, true);
        debug!("发送流式请求，消息数 {}，工具数 {}", messages.len(), tools.len());
        let response = self.post(&body).await?;
        Ok(Box::pin(event_stream(response)))
    }
}
