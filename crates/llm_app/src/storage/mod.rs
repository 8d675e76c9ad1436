mod db;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::DbErr;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use utoipa::ToSchema;

pub use db::DbConversationStorage;

use crate::conversation::{ConversationMode, Message};
use crate::knowledge::Corpus;

/// 持久化的一条对话记录
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ConversationRecord {
    pub id: i32,
    pub corpus: Corpus,
    pub user_name: String,
    pub mode: ConversationMode,
    pub name: Option<String>,
    pub history: Vec<Message>,
    #[schema(value_type = Object)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("写入对话存储失败: {0}")]
    Write(#[source] DbErr),
    #[error("读取对话存储失败: {0}")]
    Read(#[source] DbErr),
    #[error("对话 {0} 不存在")]
    NotFound(i32),
    #[error("对话数据无法解析: {0}")]
    Corrupt(String),
}

/// 对话存储
///
/// 每轮对话读出后整体覆盖写回 history，不做乐观锁；同一对话的并发写入需要调用方串行化。
#[async_trait]
pub trait ConversationStorage: Send + Sync {
    /// 分配新 id 并写入空历史
    async fn create(&self, user_name: &str, mode: ConversationMode, metadata: Value) -> Result<i32, StoreError>;

    async fn read(&self, id: i32) -> Result<ConversationRecord, StoreError>;

    /// 整体替换 history，后写者覆盖先写者
    async fn write(&self, id: i32, history: &[Message]) -> Result<(), StoreError>;

    async fn rename(&self, id: i32, name: &str) -> Result<(), StoreError>;

    async fn end(&self, id: i32) -> Result<(), StoreError>;

    /// 按创建时间倒序
    async fn list_ids(&self, user_name: &str) -> Result<Vec<i32>, StoreError>;

    /// 按创建时间倒序
    async fn list(&self, user_name: &str) -> Result<Vec<ConversationRecord>, StoreError>;
}
