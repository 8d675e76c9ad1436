use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::prompt::{strategy_for, PromptStrategy};
use super::tools::Tool;
use super::{ConversationContext, ConversationError, ConversationMode, Message, MessageContent, Role};
use crate::knowledge::Corpus;
use crate::llm::{ChatMessage, ChatResponse, LlmClient, LlmError, StreamEvent, ToolCall, ToolSchema};

/// 自动命名时追加在历史后的指令
const RENAME_PROMPT: &str =
    "Summarize this conversation in 5 words or less. Reply with the title only, without quotes or punctuation.";
const MAX_NAME_CHARS: usize = 60;
/// 流式自主模式下相邻两轮输出之间的分隔
const ROUND_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Created,
    Active,
    Ended,
}

/// 流式对话输出的文本增量，流结束后本轮才会写入存储
pub type ChatStream<'a> = Pin<Box<dyn Stream<Item = Result<String, ConversationError>> + Send + 'a>>;

/// 一个多轮对话
///
/// 同一个对话的所有轮次必须串行执行，调用方持有 `&mut` 即可保证这一点。
pub struct Conversation {
    id: Option<i32>,
    user_name: String,
    mode: ConversationMode,
    name: Option<String>,
    history: Vec<Message>,
    state: ConversationState,
    ctx: ConversationContext,
    strategy: Box<dyn PromptStrategy>,
}

impl Conversation {
    /// 新对话，`start` 时在存储中创建
    pub fn new(ctx: ConversationContext, user_name: impl Into<String>, mode: ConversationMode) -> Self {
        let strategy = strategy_for(mode, &ctx.settings, ctx.knowledge.clone());
        Self {
            id: None,
            user_name: user_name.into(),
            mode,
            name: None,
            history: Vec::new(),
            state: ConversationState::Created,
            ctx,
            strategy,
        }
    }

    /// 已有对话，`start` 时从存储读取
    pub fn with_id(ctx: ConversationContext, id: i32) -> Self {
        let mut conversation = Self::new(ctx, String::new(), ConversationMode::Rag);
        conversation.id = Some(id);
        conversation
    }

    pub fn id(&self) -> Option<i32> {
        self.id
    }

    pub fn corpus(&self) -> Corpus {
        self.ctx.knowledge.corpus()
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn mode(&self) -> ConversationMode {
        self.mode
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    /// 完整历史，包括带错误标记的消息
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// 展示给用户的历史，不含系统消息
    pub fn visible_history(&self) -> Vec<Message> {
        self.history
            .iter()
            .filter(|message| message.role() != Role::System)
            .cloned()
            .collect()
    }

    /// 进入 ACTIVE：新对话写入存储，已有对话读回历史
    pub async fn start(&mut self) -> Result<i32, ConversationError> {
        if self.state != ConversationState::Created {
            return Err(ConversationError::InvalidState("对话已经开始".to_string()));
        }
        match self.id {
            None => {
                let metadata = json!({
                    "corpus": self.corpus(),
                    "model": self.ctx.llm.model_name(),
                });
                let id = self.ctx.store.create(&self.user_name, self.mode, metadata).await?;
                self.id = Some(id);
                self.state = ConversationState::Active;
                info!("创建对话 {}（{}，用户 {}，模式 {}）", id, self.corpus(), self.user_name, self.mode);
                Ok(id)
            }
            Some(id) => {
                let record = self.ctx.store.read(id).await?;
                self.user_name = record.user_name;
                self.name = record.name;
                self.history = record.history;
                if record.mode != self.mode {
                    self.mode = record.mode;
                    self.strategy = strategy_for(self.mode, &self.ctx.settings, self.ctx.knowledge.clone());
                }
                self.state = if record.ended_at.is_some() {
                    ConversationState::Ended
                } else {
                    ConversationState::Active
                };
                debug!("载入对话 {}，历史 {} 条", id, self.history.len());
                Ok(id)
            }
        }
    }

    fn active_id(&self) -> Result<i32, ConversationError> {
        match (self.state, self.id) {
            (ConversationState::Active, Some(id)) => Ok(id),
            (ConversationState::Ended, _) => Err(ConversationError::ended()),
            _ => Err(ConversationError::InvalidState("对话尚未开始".to_string())),
        }
    }

    fn started_id(&self) -> Result<i32, ConversationError> {
        match (self.state, self.id) {
            (ConversationState::Created, _) | (_, None) => {
                Err(ConversationError::InvalidState("对话尚未开始".to_string()))
            }
            (_, Some(id)) => Ok(id),
        }
    }

    async fn persist(&self, id: i32) -> Result<(), ConversationError> {
        self.ctx.store.write(id, &self.history).await?;
        Ok(())
    }

    /// 记录一轮失败：用户消息带上错误标记后保存，存储失败只记日志
    async fn record_failure(&mut self, id: i32, user: Message, error: &LlmError) {
        self.history.push(user.with_error(error.to_string()));
        if let Err(e) = self.persist(id).await {
            warn!("保存对话 {} 的失败记录时出错: {}", id, e);
        }
    }

    /// 非流式对话，返回完整回复
    pub async fn chat(&mut self, content: impl Into<MessageContent>) -> Result<String, ConversationError> {
        let id = self.active_id()?;
        let user = Message::user(content);
        let mut messages = self.strategy.build_messages(&self.history, &user).await;
        let tools = self.strategy.tools();
        debug!("对话 {} 发送 {} 条消息，工具 {} 个", id, messages.len(), tools.len());

        let result = complete_with_tools(
            self.ctx.llm.as_ref(),
            &mut messages,
            &tools,
            self.ctx.settings.max_tool_rounds,
        )
        .await;
        match result {
            Ok(answer) => {
                self.history.push(user);
                self.history.push(Message::assistant(answer.clone()));
                self.persist(id).await?;
                Ok(answer)
            }
            Err(e) => {
                warn!("对话 {} 调用模型失败: {}", id, e);
                self.record_failure(id, user, &e).await;
                Err(ConversationError::LlmInvocation(e))
            }
        }
    }

    /// 流式对话
    ///
    /// 返回的流必须被消费到结束，本轮才会写入存储。`cancel` 触发后停止读取模型输出，
    /// 已收到的部分作为 assistant 消息保存，流以 `StreamInterrupted` 结束。
    pub async fn chat_stream(
        &mut self,
        content: impl Into<MessageContent>,
        cancel: CancellationToken,
    ) -> Result<ChatStream<'_>, ConversationError> {
        let id = self.active_id()?;
        let user = Message::user(content);
        let messages = self.strategy.build_messages(&self.history, &user).await;
        let tools = self.strategy.tools();
        debug!("对话 {} 开始流式输出，工具 {} 个", id, tools.len());
        Ok(Box::pin(stream_turn(self, id, user, messages, tools, cancel)))
    }

    async fn finish_stream_turn(
        &mut self,
        id: i32,
        user: Message,
        answer: String,
        failure: Option<LlmError>,
    ) -> Result<(), ConversationError> {
        match failure {
            None => {
                self.history.push(user);
                self.history.push(Message::assistant(answer));
                self.persist(id).await
            }
            Some(e) if answer.is_empty() => {
                warn!("对话 {} 调用模型失败: {}", id, e);
                self.record_failure(id, user, &e).await;
                Err(ConversationError::LlmInvocation(e))
            }
            Some(e) => {
                warn!("对话 {} 流式输出中断，保存已收到的 {} 个字符: {}", id, answer.chars().count(), e);
                self.history.push(user);
                self.history.push(Message::assistant(answer.clone()));
                if let Err(store_err) = self.persist(id).await {
                    warn!("保存对话 {} 的部分回复时出错: {}", id, store_err);
                }
                Err(ConversationError::StreamInterrupted {
                    partial: answer,
                    source: e,
                })
            }
        }
    }

    pub async fn end(&mut self) -> Result<(), ConversationError> {
        match self.state {
            ConversationState::Ended => Ok(()),
            ConversationState::Created => Err(ConversationError::InvalidState("对话尚未开始".to_string())),
            ConversationState::Active => {
                let id = self.started_id()?;
                self.ctx.store.end(id).await?;
                self.state = ConversationState::Ended;
                info!("对话 {} 已结束", id);
                Ok(())
            }
        }
    }

    pub async fn rename(&mut self, name: &str) -> Result<(), ConversationError> {
        let id = self.started_id()?;
        self.ctx.store.rename(id, name).await?;
        self.name = Some(name.to_string());
        Ok(())
    }

    /// 让模型根据历史生成一个标题，失败时不修改任何状态
    pub async fn auto_rename(&mut self) -> Result<String, ConversationError> {
        let id = self.started_id()?;
        let mut messages = vec![ChatMessage::system(
            "You are a helpful assistant that names conversations.",
        )];
        messages.extend(
            self.history
                .iter()
                .filter(|message| message.role() != Role::System && message.error().is_none())
                .map(Message::to_wire),
        );
        messages.push(ChatMessage::user(RENAME_PROMPT));

        let response = self
            .ctx
            .llm
            .complete(&messages, &[])
            .await
            .map_err(|e| ConversationError::Rename(e.to_string()))?;
        let name = match response {
            ChatResponse::Content(text) => clean_name(&text),
            ChatResponse::ToolCalls(_) => String::new(),
        };
        if name.is_empty() {
            return Err(ConversationError::Rename("模型返回了空名称".to_string()));
        }
        self.ctx
            .store
            .rename(id, &name)
            .await
            .map_err(|e| ConversationError::Rename(e.to_string()))?;
        info!("对话 {} 自动命名为 {}", id, name);
        self.name = Some(name.clone());
        Ok(name)
    }
}

/// 去掉引号和多余空白，只保留第一行并限制长度
fn clean_name(raw: &str) -> String {
    const QUOTES: &[char] = &['"', '\'', '`', '“', '”', '‘', '’', '「', '」', '《', '》'];
    let line = raw.trim().lines().next().unwrap_or_default();
    let name: String = line
        .trim()
        .trim_matches(|c: char| QUOTES.contains(&c) || c.is_whitespace())
        .chars()
        .take(MAX_NAME_CHARS)
        .collect();
    name.trim().to_string()
}

/// 执行模型请求的工具调用，并把结果追加到消息列表
async fn invoke_tools(tools: &[Arc<dyn Tool>], calls: &[ToolCall], messages: &mut Vec<ChatMessage>) {
    messages.push(ChatMessage::assistant_tool_calls(calls.to_vec()));
    for call in calls {
        let output = match tools.iter().find(|tool| tool.name() == call.name) {
            None => format!("Unknown tool: {}", call.name),
            Some(tool) => {
                let arguments = if call.arguments.trim().is_empty() {
                    Ok(Value::Object(Default::default()))
                } else {
                    serde_json::from_str::<Value>(&call.arguments)
                };
                match arguments {
                    Err(e) => format!("Invalid arguments: {}", e),
                    Ok(arguments) => {
                        info!("调用工具 {}，参数 {}", call.name, arguments);
                        match tool.invoke(&arguments).await {
                            Ok(output) => output,
                            Err(e) => {
                                warn!("工具 {} 执行失败: {:#}", call.name, e);
                                format!("Tool execution error: {:#}", e)
                            }
                        }
                    }
                }
            }
        };
        messages.push(ChatMessage::tool_result(call, output));
    }
}

/// 非流式的工具调用循环，超过轮次上限后不再提供工具
async fn complete_with_tools(
    llm: &dyn LlmClient,
    messages: &mut Vec<ChatMessage>,
    tools: &[Arc<dyn Tool>],
    max_rounds: usize,
) -> Result<String, LlmError> {
    let schemas: Vec<ToolSchema> = tools.iter().map(|tool| tool.schema()).collect();
    let mut round = 0;
    loop {
        let offered: &[ToolSchema] = if round < max_rounds { &schemas } else { &[] };
        round += 1;
        match llm.complete(messages, offered).await? {
            ChatResponse::Content(text) => return Ok(text),
            ChatResponse::ToolCalls(calls) if !offered.is_empty() => {
                debug!("第 {} 轮模型请求调用 {} 个工具", round, calls.len());
                invoke_tools(tools, &calls, messages).await;
            }
            ChatResponse::ToolCalls(_) => {
                return Err(LlmError::Malformed("未提供工具时模型仍然请求了工具调用".to_string()));
            }
        }
    }
}

fn stream_turn<'a>(
    conversation: &'a mut Conversation,
    id: i32,
    user: Message,
    mut messages: Vec<ChatMessage>,
    tools: Vec<Arc<dyn Tool>>,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<String, ConversationError>> + Send + 'a {
    stream! {
        let llm = conversation.ctx.llm.clone();
        let max_rounds = conversation.ctx.settings.max_tool_rounds;
        let schemas: Vec<ToolSchema> = tools.iter().map(|tool| tool.schema()).collect();
        let mut answer = String::new();
        let mut failure: Option<LlmError> = None;
        let mut round = 0;
        // 工具调用前已输出过文本时，下一轮的文本另起一段
        let mut separate_next = false;

        'turn: loop {
            let offered: &[ToolSchema] = if round < max_rounds { &schemas } else { &[] };
            round += 1;
            let mut events = match llm.stream(&messages, offered).await {
                Ok(events) => events,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };

            let mut requested = Vec::new();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        failure = Some(LlmError::Stream("客户端已断开连接".to_string()));
                        break 'turn;
                    }
                    next = events.next() => next,
                };
                match next {
                    None => break,
                    Some(Ok(StreamEvent::Delta(delta))) => {
                        if delta.is_empty() {
                            continue;
                        }
                        if separate_next {
                            separate_next = false;
                            answer.push_str(ROUND_SEPARATOR);
                            yield Ok(ROUND_SEPARATOR.to_string());
                        }
                        answer.push_str(&delta);
                        yield Ok(delta);
                    }
                    Some(Ok(StreamEvent::ToolCalls(calls))) => requested.extend(calls),
                    Some(Err(e)) => {
                        failure = Some(e);
                        break 'turn;
                    }
                }
            }

            if requested.is_empty() {
                break;
            }
            if offered.is_empty() {
                failure = Some(LlmError::Malformed("未提供工具时模型仍然请求了工具调用".to_string()));
                break;
            }
            debug!("第 {} 轮模型请求调用 {} 个工具", round, requested.len());
            invoke_tools(&tools, &requested, &mut messages).await;
            separate_next = !answer.is_empty();
        }

        if let Err(e) = conversation.finish_stream_turn(id, user, answer, failure).await {
            yield Err(e);
        }
    }
}
