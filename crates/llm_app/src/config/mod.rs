mod args;
mod manager;

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

pub use args::{Args, ARGS};
pub use manager::ConfigManager;

use crate::conversation::ConversationSettings;
use crate::knowledge::TextChunker;

/// 配置目录，数据库默认也放在这里
pub static CONFIG_DIR: Lazy<PathBuf> = Lazy::new(|| {
    ARGS.config_dir
        .clone()
        .or_else(|| dirs::config_dir().map(|dir| dir.join("llm-app")))
        .unwrap_or_else(|| PathBuf::from("./config"))
});

/// 当前生效的配置，读取无锁，重新加载时整体替换
pub static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

pub fn reload_config() -> Arc<Config> {
    CONFIG.load_full()
}

pub fn set_config(config: Config) {
    CONFIG.store(Arc::new(config));
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub knowledge: KnowledgeConfig,
}

impl Config {
    /// 命令行 / 环境变量中显式给出的值覆盖数据库中的配置
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(bind_address) = &args.bind_address {
            self.server.bind_address = bind_address.clone();
        }
    }

    pub fn conversation_settings(&self) -> ConversationSettings {
        ConversationSettings {
            system_prompt: None,
            num_documents: self.knowledge.num_documents,
            add_history_to_messages: self.knowledge.add_history_to_messages,
            max_tool_rounds: self.knowledge.max_tool_rounds,
        }
    }

    pub fn chunker(&self) -> TextChunker {
        TextChunker::new(
            self.knowledge.chunk_size,
            self.knowledge.chunk_overlap,
            self.knowledge.min_chunk_size,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9090".to_string(),
            cors_origins: vec!["http://localhost:9095".to_string(), "http://localhost:3000".to_string()],
        }
    }
}

/// 模型与向量化服务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI 兼容接口地址
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_seconds: u64,
    pub embedding_model: String,
    pub embedding_batch_size: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4".to_string(),
            max_tokens: 1024,
            temperature: 0.0,
            timeout_seconds: 120,
            embedding_model: "text-embedding-ada-002".to_string(),
            embedding_batch_size: 64,
        }
    }
}

/// 知识源、切分参数和对话检索参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub pdf_path: String,
    pub arxiv_queries: Vec<String>,
    pub arxiv_max_results: usize,
    pub website_urls: Vec<String>,
    pub max_depth: usize,
    pub max_links: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
    pub num_documents: usize,
    pub add_history_to_messages: bool,
    pub max_tool_rounds: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            pdf_path: "data/pdfs".to_string(),
            arxiv_queries: Vec::new(),
            arxiv_max_results: 5,
            website_urls: vec!["https://www.phidata.com/".to_string()],
            max_depth: 3,
            max_links: 10,
            chunk_size: 1000,
            chunk_overlap: 200,
            min_chunk_size: 20,
            num_documents: 3,
            add_history_to_messages: true,
            max_tool_rounds: 5,
        }
    }
}
