pub use super::config_item::Entity as ConfigItem;
pub use super::conversation::Entity as Conversation;
pub use super::knowledge_chunk::Entity as KnowledgeChunk;
