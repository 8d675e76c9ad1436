pub mod prelude;

pub mod config_item;
pub mod conversation;
pub mod knowledge_chunk;
