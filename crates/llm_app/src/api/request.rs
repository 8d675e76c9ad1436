use serde::Deserialize;
use utoipa::ToSchema;

use crate::conversation::{ConversationMode, MessageContent};

fn default_mode() -> ConversationMode {
    ConversationMode::Rag
}

fn default_stream() -> bool {
    true
}

fn default_prompt_query() -> String {
    "Write a story about an AI named Phi.".to_string()
}

#[derive(Deserialize, ToSchema)]
pub struct CreateConversationRequest {
    pub user_name: String,
    #[serde(default = "default_mode", alias = "conversation_type")]
    pub mode: ConversationMode,
}

#[derive(Deserialize, ToSchema)]
pub struct ChatRequest {
    pub conversation_id: i32,
    /// 纯文本，或 OpenAI 格式的多模态片段数组
    #[schema(value_type = Object)]
    pub message: MessageContent,
    #[serde(default = "default_stream")]
    pub stream: bool,
    /// 给出时必须与对话创建时的模式一致
    #[serde(default, alias = "conversation_type")]
    pub mode: Option<ConversationMode>,
}

/// history / get / autorename / end 共用
#[derive(Deserialize, ToSchema)]
pub struct ConversationRequest {
    pub conversation_id: i32,
    #[serde(default, alias = "conversation_type")]
    pub mode: Option<ConversationMode>,
}

#[derive(Deserialize, ToSchema)]
pub struct UserConversationsRequest {
    pub user_name: String,
}

#[derive(Deserialize, ToSchema)]
pub struct RenameConversationRequest {
    pub conversation_id: i32,
    pub name: String,
    #[serde(default, alias = "conversation_type")]
    pub mode: Option<ConversationMode>,
}

#[derive(Deserialize, ToSchema, Default)]
pub struct LoadKnowledgeBaseRequest {
    #[serde(default)]
    pub recreate: bool,
}

#[derive(Deserialize, ToSchema)]
pub struct PromptRequest {
    #[serde(default = "default_prompt_query")]
    pub query: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: CreateConversationRequest = serde_json::from_value(json!({"user_name": "alice"})).unwrap();
        assert_eq!(request.mode, ConversationMode::Rag);

        let request: ChatRequest =
            serde_json::from_value(json!({"conversation_id": 1, "message": "hi", "conversation_type": "AUTO"}))
                .unwrap();
        assert!(request.stream);
        assert_eq!(request.mode, Some(ConversationMode::Autonomous));
        assert_eq!(request.message, MessageContent::Text("hi".to_string()));

        let request: PromptRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(request.query, "Write a story about an AI named Phi.");
        assert_eq!(request.max_tokens, None);
    }
}
