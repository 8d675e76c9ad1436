use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Extension, Json, Path};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utoipa::OpenApi;

use crate::api::error::InnerApiError;
use crate::api::request::{
    ChatRequest, ConversationRequest, CreateConversationRequest, LoadKnowledgeBaseRequest, PromptRequest,
    RenameConversationRequest, UserConversationsRequest,
};
use crate::api::response::{
    ChatResponse, CreateConversationResponse, HealthResponse, KnowledgeStatus, LoadKnowledgeBaseResponse,
    PromptResponse, RenameConversationResponse, StatusResponse,
};
use crate::api::state::{AppState, ConversationLease, LeasedConversation};
use crate::api::wrapper::{ApiError, ApiResponse};
use crate::conversation::{Conversation, ConversationError, ConversationMode, ConversationState, Message, MessageContent};
use crate::knowledge::Corpus;
use crate::llm::{ChatMessage, LlmClient};
use crate::storage::{ConversationRecord, StoreError};

const PROMPT_SYSTEM_MESSAGE: &str = "You are a helpful assistant that helps customers answer questions.";

#[derive(OpenApi)]
#[openapi(
    paths(
        create_conversation,
        chat,
        get_history,
        get_conversation,
        get_all_conversations,
        get_all_conversation_ids,
        rename_conversation,
        auto_rename_conversation,
        end_conversation,
        load_knowledge_base,
        ping,
        health,
        llm_prompt
    ),
    tags(
        (name = "conversation", description = "基于知识库的多轮对话"),
        (name = "status", description = "服务状态")
    )
)]
pub struct ApiDoc;

/// 请求中的模式必须与对话创建时一致
fn check_mode(conversation: &Conversation, requested: Option<ConversationMode>) -> Result<(), InnerApiError> {
    match requested {
        Some(mode) if mode != conversation.mode() => Err(InnerApiError::BadRequest(format!(
            "对话模式为 {}，请求的模式为 {}",
            conversation.mode(),
            mode
        ))),
        _ => Ok(()),
    }
}

async fn open_conversation(
    state: &AppState,
    corpus: Corpus,
    id: i32,
    mode: Option<ConversationMode>,
) -> Result<ConversationLease, ApiError> {
    let lease = state.conversation(corpus, id).await?;
    check_mode(&*lease.lock().await, mode)?;
    Ok(lease)
}

/// SSE 的 data 字段不能包含 '\r'
fn sse_data(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn error_event(message: &str) -> Event {
    Event::default().event("error").data(sse_data(message))
}

/// 创建对话
#[utoipa::path(
    post,
    path = "/v1/{domain}/create",
    tag = "conversation",
    params(("domain" = Corpus, Path, description = "知识库种类")),
    request_body = CreateConversationRequest,
    responses(
        (status = 200, body = ApiResponse<CreateConversationResponse>),
    )
)]
pub async fn create_conversation(
    Path(corpus): Path<Corpus>,
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<CreateConversationRequest>,
) -> Result<ApiResponse<CreateConversationResponse>, ApiError> {
    if request.user_name.trim().is_empty() {
        return Err(InnerApiError::BadRequest("user_name 不能为空".to_string()).into());
    }
    let (conversation_id, lease) = state
        .create_conversation(corpus, &request.user_name, request.mode)
        .await?;
    let chat_history = lease.lock().await.visible_history();
    Ok(ApiResponse::ok(CreateConversationResponse {
        conversation_id,
        chat_history,
    }))
}

/// 发送一条消息，`stream` 为真时以 SSE 返回文本增量
#[utoipa::path(
    post,
    path = "/v1/{domain}/chat",
    tag = "conversation",
    params(("domain" = Corpus, Path, description = "知识库种类")),
    request_body = ChatRequest,
    responses(
        (status = 200, body = ApiResponse<ChatResponse>, description = "非流式回复；流式时为 text/event-stream，以 done 或 error 事件结束"),
        (status = 500, body = ApiResponse<ChatResponse>, description = "本轮失败"),
    )
)]
pub async fn chat(
    Path(corpus): Path<Corpus>,
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let conversation_id = request.conversation_id;
    let lease = open_conversation(&state, corpus, conversation_id, request.mode).await?;
    let mut conversation = lease.lock_owned().await;
    match conversation.state() {
        ConversationState::Active => {}
        ConversationState::Ended => return Err(ConversationError::ended().into()),
        ConversationState::Created => {
            return Err(ConversationError::InvalidState("对话尚未开始".to_string()).into());
        }
    }

    if request.stream {
        let (tx, mut rx) = mpsc::channel(32);
        tokio::spawn(drive_chat_stream(conversation, request.message, tx));
        let events = async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield Ok::<_, Infallible>(event);
            }
        };
        return Ok(Sse::new(events).keep_alive(KeepAlive::default()).into_response());
    }

    let response = match conversation.chat(request.message).await {
        Ok(answer) => ApiResponse::ok(ChatResponse {
            conversation_id,
            response: Some(answer),
            error: None,
        }),
        Err(e) => ApiResponse::internal_server_error(ChatResponse {
            conversation_id,
            response: None,
            error: Some(e.to_string()),
        }),
    };
    Ok(response.into_response())
}

/// 在后台消费整轮流式输出，保证客户端断开后本轮依然会被保存
async fn drive_chat_stream(
    mut conversation: LeasedConversation,
    message: MessageContent,
    tx: mpsc::Sender<Event>,
) {
    let cancel = CancellationToken::new();
    let mut deltas = match conversation.chat_stream(message, cancel.clone()).await {
        Ok(deltas) => deltas,
        Err(e) => {
            let _ = tx.send(error_event(&e.to_string())).await;
            return;
        }
    };

    let mut failure = None;
    while let Some(item) = deltas.next().await {
        match item {
            Ok(delta) => {
                if cancel.is_cancelled() {
                    continue;
                }
                if tx.send(Event::default().data(sse_data(&delta))).await.is_err() {
                    debug!("客户端已断开，停止读取模型输出");
                    cancel.cancel();
                }
            }
            Err(e) => failure = Some(e),
        }
    }
    drop(deltas);

    let last = match failure {
        Some(e) => error_event(&e.to_string()),
        None => Event::default().event("done").data("[DONE]"),
    };
    let _ = tx.send(last).await;
}

/// 对话历史，对话不存在时返回空列表
#[utoipa::path(
    post,
    path = "/v1/{domain}/history",
    tag = "conversation",
    params(("domain" = Corpus, Path, description = "知识库种类")),
    request_body = ConversationRequest,
    responses(
        (status = 200, body = ApiResponse<Vec<Message>>),
    )
)]
pub async fn get_history(
    Path(corpus): Path<Corpus>,
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<ConversationRequest>,
) -> Result<ApiResponse<Vec<Message>>, ApiError> {
    let lease = match state.conversation(corpus, request.conversation_id).await {
        Ok(lease) => lease,
        Err(ConversationError::NotFound(_)) => return Ok(ApiResponse::ok(Vec::new())),
        Err(e) => return Err(e.into()),
    };
    let conversation = lease.lock().await;
    check_mode(&conversation, request.mode)?;
    Ok(ApiResponse::ok(conversation.visible_history()))
}

/// 对话记录，不存在时为 null
#[utoipa::path(
    post,
    path = "/v1/{domain}/get",
    tag = "conversation",
    params(("domain" = Corpus, Path, description = "知识库种类")),
    request_body = ConversationRequest,
    responses(
        (status = 200, body = ApiResponse<Option<ConversationRecord>>),
    )
)]
pub async fn get_conversation(
    Path(corpus): Path<Corpus>,
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<ConversationRequest>,
) -> Result<ApiResponse<Option<ConversationRecord>>, ApiError> {
    let record = match state.store(corpus).read(request.conversation_id).await {
        Ok(record) => record,
        Err(StoreError::NotFound(_)) => return Ok(ApiResponse::ok(None)),
        Err(e) => return Err(e.into()),
    };
    if let Some(mode) = request.mode {
        if mode != record.mode {
            return Err(InnerApiError::BadRequest(format!("对话模式为 {}，请求的模式为 {}", record.mode, mode)).into());
        }
    }
    Ok(ApiResponse::ok(Some(record)))
}

/// 用户的全部对话，按创建时间倒序
#[utoipa::path(
    post,
    path = "/v1/{domain}/get-all",
    tag = "conversation",
    params(("domain" = Corpus, Path, description = "知识库种类")),
    request_body = UserConversationsRequest,
    responses(
        (status = 200, body = ApiResponse<Vec<ConversationRecord>>),
    )
)]
pub async fn get_all_conversations(
    Path(corpus): Path<Corpus>,
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<UserConversationsRequest>,
) -> Result<ApiResponse<Vec<ConversationRecord>>, ApiError> {
    Ok(ApiResponse::ok(state.store(corpus).list(&request.user_name).await?))
}

#[utoipa::path(
    post,
    path = "/v1/{domain}/get-all-ids",
    tag = "conversation",
    params(("domain" = Corpus, Path, description = "知识库种类")),
    request_body = UserConversationsRequest,
    responses(
        (status = 200, body = ApiResponse<Vec<i32>>),
    )
)]
pub async fn get_all_conversation_ids(
    Path(corpus): Path<Corpus>,
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<UserConversationsRequest>,
) -> Result<ApiResponse<Vec<i32>>, ApiError> {
    Ok(ApiResponse::ok(state.store(corpus).list_ids(&request.user_name).await?))
}

#[utoipa::path(
    post,
    path = "/v1/{domain}/rename",
    tag = "conversation",
    params(("domain" = Corpus, Path, description = "知识库种类")),
    request_body = RenameConversationRequest,
    responses(
        (status = 200, body = ApiResponse<RenameConversationResponse>),
    )
)]
pub async fn rename_conversation(
    Path(corpus): Path<Corpus>,
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<RenameConversationRequest>,
) -> Result<ApiResponse<RenameConversationResponse>, ApiError> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(InnerApiError::BadRequest("名称不能为空".to_string()).into());
    }
    let lease = open_conversation(&state, corpus, request.conversation_id, request.mode).await?;
    lease.lock().await.rename(name).await?;
    Ok(ApiResponse::ok(RenameConversationResponse {
        name: Some(name.to_string()),
        conversation_id: request.conversation_id,
    }))
}

/// 由模型生成名称，生成失败时返回原名称
#[utoipa::path(
    post,
    path = "/v1/{domain}/autorename",
    tag = "conversation",
    params(("domain" = Corpus, Path, description = "知识库种类")),
    request_body = ConversationRequest,
    responses(
        (status = 200, body = ApiResponse<RenameConversationResponse>),
    )
)]
pub async fn auto_rename_conversation(
    Path(corpus): Path<Corpus>,
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<ConversationRequest>,
) -> Result<ApiResponse<RenameConversationResponse>, ApiError> {
    let lease = open_conversation(&state, corpus, request.conversation_id, request.mode).await?;
    let mut conversation = lease.lock().await;
    let name = match conversation.auto_rename().await {
        Ok(name) => Some(name),
        Err(ConversationError::Rename(reason)) => {
            warn!("对话 {} 自动命名失败，保留原名称: {}", request.conversation_id, reason);
            conversation.name().map(str::to_string)
        }
        Err(e) => return Err(e.into()),
    };
    Ok(ApiResponse::ok(RenameConversationResponse {
        name,
        conversation_id: request.conversation_id,
    }))
}

/// 结束对话，返回结束后的记录，不存在时为 null
#[utoipa::path(
    post,
    path = "/v1/{domain}/end",
    tag = "conversation",
    params(("domain" = Corpus, Path, description = "知识库种类")),
    request_body = ConversationRequest,
    responses(
        (status = 200, body = ApiResponse<Option<ConversationRecord>>),
    )
)]
pub async fn end_conversation(
    Path(corpus): Path<Corpus>,
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<ConversationRequest>,
) -> Result<ApiResponse<Option<ConversationRecord>>, ApiError> {
    let id = request.conversation_id;
    let lease = match state.conversation(corpus, id).await {
        Ok(lease) => lease,
        Err(ConversationError::NotFound(_)) => return Ok(ApiResponse::ok(None)),
        Err(e) => return Err(e.into()),
    };
    {
        let mut conversation = lease.lock().await;
        check_mode(&conversation, request.mode)?;
        conversation.end().await?;
    }
    // 租约释放后已结束的对话离开常驻表
    drop(lease);
    Ok(ApiResponse::ok(Some(state.store(corpus).read(id).await?)))
}

/// 加载知识库，请求体可以为空
#[utoipa::path(
    post,
    path = "/v1/{domain}/load-knowledge-base",
    tag = "conversation",
    params(("domain" = Corpus, Path, description = "知识库种类")),
    request_body = LoadKnowledgeBaseRequest,
    responses(
        (status = 200, body = ApiResponse<LoadKnowledgeBaseResponse>),
    )
)]
pub async fn load_knowledge_base(
    Path(corpus): Path<Corpus>,
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<ApiResponse<LoadKnowledgeBaseResponse>, ApiError> {
    let request: LoadKnowledgeBaseRequest = if body.iter().all(u8::is_ascii_whitespace) {
        LoadKnowledgeBaseRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| InnerApiError::BadRequest(e.to_string()))?
    };
    info!("加载知识库 {}，recreate = {}", corpus, request.recreate);
    let report = state.knowledge(corpus).load(request.recreate).await?;
    let message = if report.skipped {
        "Knowledge base already loaded"
    } else {
        "Knowledge base loaded"
    };
    Ok(ApiResponse::ok(LoadKnowledgeBaseResponse {
        message: message.to_string(),
        documents: report.documents,
        chunks: report.chunks,
        skipped: report.skipped,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/ping",
    tag = "status",
    responses(
        (status = 200, body = ApiResponse<StatusResponse>),
    )
)]
pub async fn ping() -> Result<ApiResponse<StatusResponse>, ApiError> {
    Ok(ApiResponse::ok(StatusResponse {
        status: "success".to_string(),
        router: "status".to_string(),
        path: "/v1/ping".to_string(),
        utc: Utc::now(),
    }))
}

/// 服务、数据库与各知识库的状态
#[utoipa::path(
    get,
    path = "/v1/health",
    tag = "status",
    responses(
        (status = 200, body = ApiResponse<HealthResponse>),
    )
)]
pub async fn health(Extension(state): Extension<Arc<AppState>>) -> Result<ApiResponse<HealthResponse>, ApiError> {
    let database = match state.db().ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!("数据库连接检查失败: {}", e);
            false
        }
    };
    let knowledge = Corpus::ALL
        .into_iter()
        .map(|corpus| KnowledgeStatus {
            corpus,
            state: state.knowledge(corpus).load_state(),
        })
        .collect();
    Ok(ApiResponse::ok(HealthResponse {
        status: StatusResponse {
            status: if database { "success" } else { "degraded" }.to_string(),
            router: "status".to_string(),
            path: "/v1/health".to_string(),
            utc: Utc::now(),
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        database,
        knowledge,
    }))
}

/// 不关联对话的单次补全
#[utoipa::path(
    post,
    path = "/v1/llm/prompt",
    tag = "status",
    request_body = PromptRequest,
    responses(
        (status = 200, body = ApiResponse<PromptResponse>),
    )
)]
pub async fn llm_prompt(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<PromptRequest>,
) -> Result<ApiResponse<PromptResponse>, ApiError> {
    let Some(llm) = state.prompt_llm() else {
        return Err(anyhow::anyhow!("未配置模型服务").into());
    };
    let llm = llm.with_sampling(request.max_tokens, request.temperature);
    let messages = [ChatMessage::system(PROMPT_SYSTEM_MESSAGE), ChatMessage::user(request.query)];
    debug!("单次补全请求: {:?}", messages);
    let output = match llm.complete(&messages, &[]).await? {
        crate::llm::ChatResponse::Content(text) => text,
        crate::llm::ChatResponse::ToolCalls(_) => String::new(),
    };
    Ok(ApiResponse::ok(PromptResponse { output }))
}
