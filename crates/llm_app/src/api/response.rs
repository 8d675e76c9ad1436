use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::conversation::Message;
use crate::knowledge::{Corpus, LoadState};

#[derive(Serialize, ToSchema)]
pub struct CreateConversationResponse {
    pub conversation_id: i32,
    pub chat_history: Vec<Message>,
}

/// 非流式对话的结果，失败时 `response` 为空、`error` 为失败原因
#[derive(Serialize, ToSchema)]
pub struct ChatResponse {
    pub conversation_id: i32,
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct RenameConversationResponse {
    pub name: Option<String>,
    pub conversation_id: i32,
}

#[derive(Serialize, ToSchema)]
pub struct LoadKnowledgeBaseResponse {
    pub message: String,
    pub documents: usize,
    pub chunks: usize,
    pub skipped: bool,
}

#[derive(Serialize, ToSchema)]
pub struct PromptResponse {
    pub output: String,
}

#[derive(Serialize, ToSchema)]
pub struct StatusResponse {
    pub status: String,
    pub router: String,
    pub path: String,
    pub utc: DateTime<Utc>,
}

#[derive(Serialize, ToSchema)]
pub struct KnowledgeStatus {
    pub corpus: Corpus,
    pub state: LoadState,
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    #[serde(flatten)]
    pub status: StatusResponse,
    pub version: String,
    pub database: bool,
    pub knowledge: Vec<KnowledgeStatus>,
}
