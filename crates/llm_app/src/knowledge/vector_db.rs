use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use llm_app_entity::entities::{knowledge_chunk, prelude::KnowledgeChunk};
use sea_orm::{
    ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde_json::Value;
use tracing::debug;

use super::Passage;

/// 单次 insert 的行数上限，避免超出 SQLite 绑定参数数量
const INSERT_BATCH: usize = 100;

/// 已向量化、等待写入索引的文本块
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub document_name: String,
    pub chunk_index: i32,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: Value,
}

/// 向量索引，每个集合（collection）对应一个知识库
#[async_trait]
pub trait VectorDb: Send + Sync {
    async fn count(&self, collection: &str) -> Result<u64>;

    /// 原子地用新内容替换整个集合
    async fn replace(&self, collection: &str, chunks: Vec<EmbeddedChunk>) -> Result<()>;

    async fn append(&self, collection: &str, chunks: Vec<EmbeddedChunk>) -> Result<()>;

    /// 按相似度降序返回至多 k 条，相似度相同时先写入的在前
    async fn search(&self, collection: &str, embedding: &[f32], k: usize) -> Result<Vec<Passage>>;
}

/// 基于 knowledge_chunk 表的向量索引，在进程内做精确的余弦相似度排序
pub struct DbVectorStore {
    db: Arc<DatabaseConnection>,
}

impl DbVectorStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn insert_chunks(txn: &DatabaseTransaction, collection: &str, chunks: Vec<EmbeddedChunk>) -> Result<()> {
        let now = Utc::now();
        let mut models = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            models.push(knowledge_chunk::ActiveModel {
                collection: Set(collection.to_string()),
                document_name: Set(chunk.document_name),
                chunk_index: Set(chunk.chunk_index),
                content: Set(chunk.content),
                embedding: Set(serde_json::to_string(&chunk.embedding)?),
                metadata: Set(chunk.metadata.to_string()),
                created_at: Set(now),
                ..Default::default()
            });
        }
        // 保持写入顺序，检索时依赖自增 id 决定并列名次
        let mut models = models.into_iter().peekable();
        while models.peek().is_some() {
            let batch: Vec<_> = models.by_ref().take(INSERT_BATCH).collect();
            KnowledgeChunk::insert_many(batch).exec(txn).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl VectorDb for DbVectorStore {
    async fn count(&self, collection: &str) -> Result<u64> {
        let count = KnowledgeChunk::find()
            .filter(knowledge_chunk::Column::Collection.eq(collection))
            .count(self.db.as_ref())
            .await?;
        Ok(count)
    }

    async fn replace(&self, collection: &str, chunks: Vec<EmbeddedChunk>) -> Result<()> {
        let total = chunks.len();
        let txn = self.db.begin().await?;
        KnowledgeChunk::delete_many()
            .filter(knowledge_chunk::Column::Collection.eq(collection))
            .exec(&txn)
            .await?;
        Self::insert_chunks(&txn, collection, chunks).await?;
        txn.commit().await?;
        debug!("集合 {} 已重建，共 {} 个文本块", collection, total);
        Ok(())
    }

    async fn append(&self, collection: &str, chunks: Vec<EmbeddedChunk>) -> Result<()> {
        let txn = self.db.begin().await?;
        Self::insert_chunks(&txn, collection, chunks).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn search(&self, collection: &str, embedding: &[f32], k: usize) -> Result<Vec<Passage>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let rows = KnowledgeChunk::find()
            .filter(knowledge_chunk::Column::Collection.eq(collection))
            .order_by_asc(knowledge_chunk::Column::Id)
            .all(self.db.as_ref())
            .await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in rows {
            let vector: Vec<f32> = serde_json::from_str(&row.embedding)
                .with_context(|| format!("解析文本块 {} 的向量失败", row.id))?;
            scored.push((cosine_similarity(embedding, &vector), row));
        }
        // sort_by 是稳定排序，行已按 id 升序
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(score, row)| Passage {
                document_name: row.document_name,
                content: row.content,
                score,
                metadata: serde_json::from_str(&row.metadata).unwrap_or(Value::Null),
            })
            .collect())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
