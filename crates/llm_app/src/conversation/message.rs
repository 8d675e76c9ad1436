use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::llm::{ChatMessage, ChatRole};

/// 对话中的一轮消息的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl From<Role> for ChatRole {
    fn from(role: Role) -> Self {
        match role {
            Role::System => ChatRole::System,
            Role::User => ChatRole::User,
            Role::Assistant => ChatRole::Assistant,
        }
    }
}

/// 消息内容：纯文本，或者文本 / 图片混合的多模态片段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl MessageContent {
    /// 拼接所有文本片段，图片片段被忽略
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<String> for MessageContent {
    fn from(value: String) -> Self {
        MessageContent::Text(value)
    }
}

impl From<&str> for MessageContent {
    fn from(value: &str) -> Self {
        MessageContent::Text(value.to_string())
    }
}

/// 对话中的一条消息，创建后不可修改
///
/// `error` 标记本轮调用模型失败的用户消息，这类消息会被持久化，但不会再发送给模型。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Message {
    role: Role,
    #[schema(value_type = Object)]
    content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
            error: None,
        }
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// 返回带有错误标记的副本
    pub fn with_error(self, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..self
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &MessageContent {
        &self.content
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn text(&self) -> String {
        self.content.text()
    }

    /// 转换为调用模型所需的 `{role, content}` 结构
    pub fn to_wire(&self) -> ChatMessage {
        ChatMessage::new(self.role.into(), self.content.clone())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_message_wire_shape() {
        let message = Message::user("你好").with_error("upstream timeout");
        let wire = serde_json::to_value(message.to_wire()).unwrap();
        assert_eq!(wire, json!({"role": "user", "content": "你好"}));
    }

    #[test]
    fn test_multimodal_content() {
        let raw = json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "这张图里有什么？"},
                {"type": "image_url", "image_url": {"url": "https://example.com/a.png"}}
            ]
        });
        let message: Message = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(message.role(), Role::User);
        assert_eq!(message.text(), "这张图里有什么？");
        assert_eq!(serde_json::to_value(&message).unwrap(), raw);
        assert_eq!(serde_json::to_value(message.to_wire()).unwrap(), raw);
    }

    #[test]
    fn test_invalid_role_rejected() {
        let raw = json!({"role": "tool", "content": "x"});
        assert!(serde_json::from_value::<Message>(raw).is_err());
        let raw = json!({"role": "user", "content": null});
        assert!(serde_json::from_value::<Message>(raw).is_err());
    }

    #[test]
    fn test_error_marker_persisted() {
        let message = Message::user("hi").with_error("boom");
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["error"], "boom");
        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back.error(), Some("boom"));
    }
}
