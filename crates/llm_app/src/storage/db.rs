use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use llm_app_entity::entities::{conversation, prelude::Conversation};
use llm_app_migration::{Expr, SimpleExpr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde_json::Value;
use tracing::debug;

use super::{ConversationRecord, ConversationStorage, StoreError};
use crate::conversation::{ConversationMode, Message};
use crate::knowledge::Corpus;

/// 基于 conversation 表的对话存储，每个实例只能看到自己知识库下的对话
#[derive(Clone)]
pub struct DbConversationStorage {
    db: Arc<DatabaseConnection>,
    corpus: Corpus,
}

impl DbConversationStorage {
    pub fn new(db: Arc<DatabaseConnection>, corpus: Corpus) -> Self {
        Self { db, corpus }
    }

    fn scoped(&self) -> sea_orm::Select<Conversation> {
        Conversation::find().filter(conversation::Column::Corpus.eq(self.corpus.to_string()))
    }

    fn to_record(&self, model: conversation::Model) -> Result<ConversationRecord, StoreError> {
        let history: Vec<Message> = serde_json::from_str(&model.history)
            .map_err(|e| StoreError::Corrupt(format!("对话 {} 的历史记录: {}", model.id, e)))?;
        let metadata: Value = serde_json::from_str(&model.metadata)
            .map_err(|e| StoreError::Corrupt(format!("对话 {} 的元数据: {}", model.id, e)))?;
        let mode = ConversationMode::from_str(&model.mode)
            .map_err(|_| StoreError::Corrupt(format!("对话 {} 的模式 {}", model.id, model.mode)))?;
        Ok(ConversationRecord {
            id: model.id,
            corpus: self.corpus,
            user_name: model.user_name,
            mode,
            name: model.name,
            history,
            metadata,
            created_at: model.created_at,
            updated_at: model.updated_at,
            ended_at: model.ended_at,
        })
    }

    /// 更新本知识库下的一行，不存在时返回 NotFound
    async fn update_columns(&self, id: i32, columns: Vec<(conversation::Column, SimpleExpr)>) -> Result<(), StoreError> {
        let mut update = Conversation::update_many()
            .col_expr(conversation::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(conversation::Column::Id.eq(id))
            .filter(conversation::Column::Corpus.eq(self.corpus.to_string()));
        for (column, value) in columns {
            update = update.col_expr(column, value);
        }
        let result = update.exec(self.db.as_ref()).await.map_err(StoreError::Write)?;
        if result.rows_affected == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStorage for DbConversationStorage {
    async fn create(&self, user_name: &str, mode: ConversationMode, metadata: Value) -> Result<i32, StoreError> {
        let now = Utc::now();
        let model = conversation::ActiveModel {
            corpus: Set(self.corpus.to_string()),
            user_name: Set(user_name.to_string()),
            mode: Set(mode.to_string()),
            name: Set(None),
            history: Set("[]".to_string()),
            metadata: Set(metadata.to_string()),
            created_at: Set(now),
            updated_at: Set(now),
            ended_at: Set(None),
            ..Default::default()
        };
        let model = model.insert(self.db.as_ref()).await.map_err(StoreError::Write)?;
        debug!("创建对话 {}（{}，用户 {}，模式 {}）", model.id, self.corpus, user_name, mode);
        Ok(model.id)
    }

    async fn read(&self, id: i32) -> Result<ConversationRecord, StoreError> {
        let model = self
            .scoped()
            .filter(conversation::Column::Id.eq(id))
            .one(self.db.as_ref())
            .await
            .map_err(StoreError::Read)?
            .ok_or(StoreError::NotFound(id))?;
        self.to_record(model)
    }

    async fn write(&self, id: i32, history: &[Message]) -> Result<(), StoreError> {
        let history = serde_json::to_string(history).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.update_columns(id, vec![(conversation::Column::History, Expr::value(history))])
            .await
    }

    async fn rename(&self, id: i32, name: &str) -> Result<(), StoreError> {
        self.update_columns(id, vec![(conversation::Column::Name, Expr::value(name))])
            .await
    }

    async fn end(&self, id: i32) -> Result<(), StoreError> {
        self.update_columns(id, vec![(conversation::Column::EndedAt, Expr::value(Utc::now()))])
            .await
    }

    async fn list_ids(&self, user_name: &str) -> Result<Vec<i32>, StoreError> {
        self.scoped()
            .select_only()
            .column(conversation::Column::Id)
            .filter(conversation::Column::UserName.eq(user_name))
            .order_by_desc(conversation::Column::CreatedAt)
            .order_by_desc(conversation::Column::Id)
            .into_tuple::<i32>()
            .all(self.db.as_ref())
            .await
            .map_err(StoreError::Read)
    }

    async fn list(&self, user_name: &str) -> Result<Vec<ConversationRecord>, StoreError> {
        let models = self
            .scoped()
            .filter(conversation::Column::UserName.eq(user_name))
            .order_by_desc(conversation::Column::CreatedAt)
            .order_by_desc(conversation::Column::Id)
            .all(self.db.as_ref())
            .await
            .map_err(StoreError::Read)?;
        models.into_iter().map(|model| self.to_record(model)).collect()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::conversation::MessageContent;
    use crate::database::setup_test_database;

    #[tokio::test]
    async fn test_create_and_read_empty() {
        let store = DbConversationStorage::new(setup_test_database().await, Corpus::Pdf);
        let id = store
            .create("alice", ConversationMode::Rag, json!({"corpus": "pdf"}))
            .await
            .unwrap();
        let record = store.read(id).await.unwrap();
        assert_eq!(record.user_name, "alice");
        assert_eq!(record.mode, ConversationMode::Rag);
        assert_eq!(record.corpus, Corpus::Pdf);
        assert!(record.history.is_empty());
        assert_eq!(record.name, None);
        assert_eq!(record.metadata, json!({"corpus": "pdf"}));
        assert!(record.ended_at.is_none());
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let store = DbConversationStorage::new(setup_test_database().await, Corpus::Website);
        let id = store.create("bob", ConversationMode::Autonomous, json!({})).await.unwrap();
        let history = vec![
            Message::user("What is phidata?"),
            Message::assistant("A framework for **AI assistants**."),
            Message::user(MessageContent::Parts(vec![])).with_error("rate limited"),
        ];
        store.write(id, &history).await.unwrap();
        assert_eq!(store.read(id).await.unwrap().history, history);

        // 后写者覆盖
        store.write(id, &history[..1]).await.unwrap();
        assert_eq!(store.read(id).await.unwrap().history, history[..1].to_vec());
    }

    #[tokio::test]
    async fn test_missing_conversation() {
        let db = setup_test_database().await;
        let pdf = DbConversationStorage::new(db.clone(), Corpus::Pdf);
        let arxiv = DbConversationStorage::new(db, Corpus::Arxiv);
        let id = pdf.create("alice", ConversationMode::Rag, json!({})).await.unwrap();

        assert_matches!(arxiv.read(id).await, Err(StoreError::NotFound(missing)) if missing == id);
        assert_matches!(pdf.read(999).await, Err(StoreError::NotFound(999)));
        assert_matches!(pdf.write(999, &[]).await, Err(StoreError::NotFound(999)));
        assert_matches!(pdf.rename(999, "x").await, Err(StoreError::NotFound(999)));
        assert_matches!(arxiv.end(id).await, Err(StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rename_and_end() {
        let store = DbConversationStorage::new(setup_test_database().await, Corpus::Pdf);
        let id = store.create("alice", ConversationMode::Rag, json!({})).await.unwrap();
        store.rename(id, "Rust 学习笔记").await.unwrap();
        store.end(id).await.unwrap();
        let record = store.read(id).await.unwrap();
        assert_eq!(record.name.as_deref(), Some("Rust 学习笔记"));
        assert!(record.ended_at.is_some());
        assert_eq!(record.mode, ConversationMode::Rag);
    }

    #[tokio::test]
    async fn test_listing_most_recent_first() {
        let store = DbConversationStorage::new(setup_test_database().await, Corpus::Pdf);
        let first = store.create("alice", ConversationMode::Rag, json!({})).await.unwrap();
        let _other = store.create("bob", ConversationMode::Rag, json!({})).await.unwrap();
        let second = store.create("alice", ConversationMode::Autonomous, json!({})).await.unwrap();

        assert_eq!(store.list_ids("alice").await.unwrap(), vec![second, first]);
        let records = store.list("alice").await.unwrap();
        assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second, first]);
        assert_eq!(records[0].mode, ConversationMode::Autonomous);
        assert!(store.list_ids("carol").await.unwrap().is_empty());
    }
}
