use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::tools::{tools_for, Tool};
use super::{ContentPart, ConversationMode, ConversationSettings, Message, MessageContent, Role};
use crate::knowledge::{Corpus, KnowledgeAdapter, Passage};
use crate::llm::ChatMessage;

const GUIDELINES: &str = "Remember the following guidelines:
- If you don't know the answer, say 'I don't know'.
- Do not use phrases like 'based on the information provided' or 'according to the information provided' in your answer.
- You can ask follow up questions if needed.
- Use bullet points where possible.
- Use markdown to format your answers.
- Keep your answers short and concise, under 5 sentences.";

/// 内置的系统提示词
pub fn default_system_prompt(corpus: Corpus, mode: ConversationMode) -> String {
    let access = match (mode, corpus) {
        (ConversationMode::Rag, _) => {
            "You will be provided with information from a knowledge base that you can use to answer questions."
        }
        (ConversationMode::Autonomous, Corpus::Pdf) => {
            "You have access to a knowledge base of PDF documents that you can search to answer questions."
        }
        (ConversationMode::Autonomous, Corpus::Arxiv) => {
            "You have access to the arxiv knowledge base that you can search to answer questions."
        }
        (ConversationMode::Autonomous, Corpus::Website) => {
            "You have access to website contents in a knowledge base that you can search to answer questions."
        }
    };
    format!(
        "You are a chatbot named 'Phi' designed to help users.\n{}\n\n{}",
        access, GUIDELINES
    )
}

fn rag_user_prompt(references: &str, message: &str) -> String {
    format!(
        "Start and end your answers with a polite greeting.

Use the following information from the knowledge base if it helps.
START OF KNOWLEDGE BASE
```
{references}
```
END OF KNOWLEDGE BASE

Your task is to respond to the following message:
USER: {message}
ASSISTANT:"
    )
}

fn autonomous_user_prompt(message: &str) -> String {
    format!(
        "Start and end your answers with a polite greeting.
Your task is to respond to the following message:
USER: {message}
ASSISTANT:"
    )
}

/// 把用户消息中的文本替换为组装好的提示词，图片片段原样保留
fn wrap_content(content: &MessageContent, prompt: String) -> MessageContent {
    match content {
        MessageContent::Text(_) => MessageContent::Text(prompt),
        MessageContent::Parts(parts) => {
            let mut wrapped = vec![ContentPart::Text { text: prompt }];
            wrapped.extend(
                parts
                    .iter()
                    .filter(|part| matches!(part, ContentPart::ImageUrl { .. }))
                    .cloned(),
            );
            MessageContent::Parts(wrapped)
        }
    }
}

/// 系统提示词加上可以重放给模型的历史消息
///
/// 系统消息不持久化，每次重新生成；带错误标记的消息不会发送给模型。
fn prior_messages(system_prompt: &str, history: &[Message], add_history: bool) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(system_prompt)];
    if add_history {
        messages.extend(
            history
                .iter()
                .filter(|message| message.role() != Role::System && message.error().is_none())
                .map(Message::to_wire),
        );
    }
    messages
}

fn format_references(passages: &[Passage]) -> String {
    passages
        .iter()
        .map(|passage| passage.content.trim())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// 按对话模式组装每轮发送给模型的消息
#[async_trait]
pub trait PromptStrategy: Send + Sync {
    fn mode(&self) -> ConversationMode;

    /// `history` 为本轮之前的历史，不含 `user_message`
    async fn build_messages(&self, history: &[Message], user_message: &Message) -> Vec<ChatMessage>;

    /// 本轮提供给模型的工具
    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        Vec::new()
    }
}

pub struct RagStrategy {
    system_prompt: String,
    knowledge: Arc<dyn KnowledgeAdapter>,
    num_documents: usize,
    add_history: bool,
}

impl RagStrategy {
    pub fn new(system_prompt: String, knowledge: Arc<dyn KnowledgeAdapter>, settings: &ConversationSettings) -> Self {
        Self {
            system_prompt,
            knowledge,
            num_documents: settings.num_documents,
            add_history: settings.add_history_to_messages,
        }
    }
}

#[async_trait]
impl PromptStrategy for RagStrategy {
    fn mode(&self) -> ConversationMode {
        ConversationMode::Rag
    }

    async fn build_messages(&self, history: &[Message], user_message: &Message) -> Vec<ChatMessage> {
        let query = user_message.text();
        let passages = match self.knowledge.search(&query, self.num_documents).await {
            Ok(passages) => passages,
            Err(e) => {
                // 检索失败不影响本轮对话
                warn!("检索知识库 {} 失败，本轮不附带参考资料: {}", self.knowledge.corpus(), e);
                Vec::new()
            }
        };
        debug!("检索到 {} 段参考资料", passages.len());

        let prompt = rag_user_prompt(&format_references(&passages), &query);
        let mut messages = prior_messages(&self.system_prompt, history, self.add_history);
        messages.push(ChatMessage::user(wrap_content(user_message.content(), prompt)));
        messages
    }
}

pub struct AutonomousStrategy {
    system_prompt: String,
    tools: Vec<Arc<dyn Tool>>,
    add_history: bool,
}

impl AutonomousStrategy {
    pub fn new(system_prompt: String, knowledge: Arc<dyn KnowledgeAdapter>, settings: &ConversationSettings) -> Self {
        Self {
            system_prompt,
            tools: tools_for(knowledge, settings.num_documents),
            add_history: settings.add_history_to_messages,
        }
    }
}

#[async_trait]
impl PromptStrategy for AutonomousStrategy {
    fn mode(&self) -> ConversationMode {
        ConversationMode::Autonomous
    }

    async fn build_messages(&self, history: &[Message], user_message: &Message) -> Vec<ChatMessage> {
        let prompt = autonomous_user_prompt(&user_message.text());
        let mut messages = prior_messages(&self.system_prompt, history, self.add_history);
        messages.push(ChatMessage::user(wrap_content(user_message.content(), prompt)));
        messages
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.clone()
    }
}

pub fn strategy_for(
    mode: ConversationMode,
    settings: &ConversationSettings,
    knowledge: Arc<dyn KnowledgeAdapter>,
) -> Box<dyn PromptStrategy> {
    let system_prompt = settings
        .system_prompt
        .clone()
        .unwrap_or_else(|| default_system_prompt(knowledge.corpus(), mode));
    match mode {
        ConversationMode::Rag => Box::new(RagStrategy::new(system_prompt, knowledge, settings)),
        ConversationMode::Autonomous => Box::new(AutonomousStrategy::new(system_prompt, knowledge, settings)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::message::ImageUrl;
    use crate::llm::ChatRole;

    #[test]
    fn test_system_prompt_per_mode() {
        let rag = default_system_prompt(Corpus::Pdf, ConversationMode::Rag);
        assert!(rag.starts_with("You are a chatbot named 'Phi'"));
        assert!(rag.contains("provided with information from a knowledge base"));
        assert!(rag.contains("under 5 sentences"));

        let auto = default_system_prompt(Corpus::Arxiv, ConversationMode::Autonomous);
        assert!(auto.contains("arxiv knowledge base that you can search"));
    }

    #[test]
    fn test_rag_prompt_contains_fenced_references() {
        let prompt = rag_user_prompt("Doc A says X.", "What is in the knowledge base?");
        assert!(prompt.contains("START OF KNOWLEDGE BASE\n```\nDoc A says X.\n```\nEND OF KNOWLEDGE BASE"));
        assert!(prompt.contains("USER: What is in the knowledge base?\nASSISTANT:"));
    }

    #[test]
    fn test_prior_messages_skip_failed_turns() {
        let history = vec![
            Message::user("first"),
            Message::assistant("answer"),
            Message::user("second").with_error("timeout"),
        ];
        let messages = prior_messages("sys", &history, true);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, ChatRole::System);
        assert_eq!(messages[2].text(), "answer");

        let messages = prior_messages("sys", &history, false);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_wrap_multimodal_keeps_images() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "what is this".to_string(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "https://example.com/a.png".to_string(),
                    detail: None,
                },
            },
        ]);
        let MessageContent::Parts(parts) = wrap_content(&content, "PROMPT".to_string()) else {
            panic!("expected parts");
        };
        assert_eq!(parts.len(), 2);
        assert_eq!(
            parts[0],
            ContentPart::Text {
                text: "PROMPT".to_string()
            }
        );
        assert!(matches!(parts[1], ContentPart::ImageUrl { .. }));
    }
}
