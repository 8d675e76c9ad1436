mod engine;
mod message;
mod prompt;
mod tools;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

pub use engine::{Conversation, ConversationState};
pub use message::{ContentPart, Message, MessageContent, Role};

use crate::knowledge::KnowledgeAdapter;
use crate::llm::{LlmClient, LlmError};
use crate::storage::{ConversationStorage, StoreError};

/// 对话模式，创建后不可修改
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema, strum::Display, strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum ConversationMode {
    /// 每轮先检索知识库，把结果拼进提示词
    #[serde(rename = "RAG")]
    #[strum(serialize = "RAG")]
    Rag,
    /// 由模型通过工具调用自行检索
    #[serde(rename = "AUTO", alias = "AUTONOMOUS", alias = "Autonomous")]
    #[strum(to_string = "AUTO", serialize = "AUTONOMOUS")]
    Autonomous,
}

#[derive(Error, Debug)]
pub enum ConversationError {
    #[error("{0}")]
    InvalidState(String),
    #[error("对话 {0} 不存在")]
    NotFound(i32),
    #[error(transparent)]
    Store(StoreError),
    #[error("调用模型失败: {0}")]
    LlmInvocation(#[source] LlmError),
    #[error("流式输出中断（已保存 {} 个字符）: {source}", partial.chars().count())]
    StreamInterrupted {
        partial: String,
        #[source]
        source: LlmError,
    },
    #[error("自动命名失败: {0}")]
    Rename(String),
}

impl ConversationError {
    pub fn ended() -> Self {
        ConversationError::InvalidState("conversation has ended".to_string())
    }
}

impl From<StoreError> for ConversationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ConversationError::NotFound(id),
            other => ConversationError::Store(other),
        }
    }
}

/// 单个对话引擎的行为参数
#[derive(Debug, Clone)]
pub struct ConversationSettings {
    /// 为空时按知识库种类和模式使用内置的系统提示词
    pub system_prompt: Option<String>,
    /// RAG 模式每轮检索的段落数，也是检索工具返回的段落数
    pub num_documents: usize,
    pub add_history_to_messages: bool,
    /// 自主模式下每轮最多的工具调用轮次
    pub max_tool_rounds: usize,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            system_prompt: None,
            num_documents: 3,
            add_history_to_messages: true,
            max_tool_rounds: 5,
        }
    }
}

/// 创建对话引擎所需的共享依赖，每个知识库一份
#[derive(Clone)]
pub struct ConversationContext {
    pub settings: ConversationSettings,
    pub llm: Arc<dyn LlmClient>,
    pub knowledge: Arc<dyn KnowledgeAdapter>,
    pub store: Arc<dyn ConversationStorage>,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_mode_wire_names() {
        assert_eq!(ConversationMode::Rag.to_string(), "RAG");
        assert_eq!(ConversationMode::Autonomous.to_string(), "AUTO");
        assert_eq!(serde_json::to_value(ConversationMode::Autonomous).unwrap(), "AUTO");
        for raw in ["\"AUTO\"", "\"AUTONOMOUS\"", "\"Autonomous\""] {
            assert_eq!(
                serde_json::from_str::<ConversationMode>(raw).unwrap(),
                ConversationMode::Autonomous
            );
        }
        assert_eq!(ConversationMode::from_str("rag").unwrap(), ConversationMode::Rag);
        assert_eq!(ConversationMode::from_str("autonomous").unwrap(), ConversationMode::Autonomous);
        assert!(ConversationMode::from_str("chat").is_err());
    }

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        assert!(matches!(
            ConversationError::from(StoreError::NotFound(7)),
            ConversationError::NotFound(7)
        ));
        assert_eq!(ConversationError::ended().to_string(), "conversation has ended");
    }
}
