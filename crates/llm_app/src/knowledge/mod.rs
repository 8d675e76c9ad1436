mod chunker;
pub mod source;
mod vector_db;

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::TryStreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use utoipa::ToSchema;

pub use chunker::TextChunker;
use source::{KnowledgeSource, KnowledgeSourceEnum};
pub use vector_db::{DbVectorStore, EmbeddedChunk, VectorDb};

use crate::llm::Embedder;

/// 知识库种类，同时也是 HTTP 路由中的 `{domain}`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Corpus {
    Pdf,
    Arxiv,
    Website,
}

impl Corpus {
    pub const ALL: [Corpus; 3] = [Corpus::Pdf, Corpus::Arxiv, Corpus::Website];

    /// 向量索引中的集合名
    pub fn collection(&self) -> &'static str {
        match self {
            Corpus::Pdf => "pdf_documents",
            Corpus::Arxiv => "arxiv_documents",
            Corpus::Website => "website_documents",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    NotLoaded,
    Loading,
    Loaded,
}

/// 检索到的一段文本
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    pub document_name: String,
    pub content: String,
    pub score: f32,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl Passage {
    pub fn new(document_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            document_name: document_name.into(),
            content: content.into(),
            score: 0.0,
            metadata: Value::Null,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct LoadReport {
    pub documents: usize,
    pub chunks: usize,
    /// 索引已有内容、本次未做任何工作
    pub skipped: bool,
}

#[derive(Error, Debug)]
pub enum KnowledgeError {
    #[error("加载知识库 {collection} 失败: {source:#}")]
    SourceLoad {
        collection: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("检索知识库失败: {0:#}")]
    Search(#[source] anyhow::Error),
    #[error("知识库 {0} 不支持追加新的知识源")]
    Unsupported(&'static str),
}

/// 一个可检索的语料库
///
/// 同一种类的所有对话共享一个实例：`search` 可以并发，`load` 重建期间独占。
#[async_trait]
pub trait KnowledgeAdapter: Send + Sync {
    fn corpus(&self) -> Corpus;

    fn load_state(&self) -> LoadState;

    /// 索引中是否已有该语料的内容
    async fn exists(&self) -> Result<bool, KnowledgeError>;

    /// `recreate` 为 false 且索引已有内容时不做任何事，否则重新读取、切分、向量化并替换索引
    async fn load(&self, recreate: bool) -> Result<LoadReport, KnowledgeError>;

    /// 按相似度返回至多 k 段文本，索引为空时返回空列表
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Passage>, KnowledgeError>;

    fn supports_add_source(&self) -> bool {
        false
    }

    /// 从新的网址或检索词追加知识
    async fn add_source(&self, _locator: &str) -> Result<LoadReport, KnowledgeError> {
        Err(KnowledgeError::Unsupported(self.corpus().collection()))
    }
}

/// 由知识源、切分器、向量化服务和向量索引组成的知识库
pub struct KnowledgeBase {
    corpus: Corpus,
    source: KnowledgeSourceEnum,
    chunker: TextChunker,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorDb>,
    state: Mutex<LoadState>,
    /// 串行化加载与追加，耗时的读取和向量化在此锁内完成
    load_lock: tokio::sync::Mutex<()>,
    /// 只在替换或追加索引时短暂持有写锁，检索不会等待整个加载过程
    index_lock: RwLock<()>,
}

impl KnowledgeBase {
    pub fn new(
        corpus: Corpus,
        source: impl Into<KnowledgeSourceEnum>,
        chunker: TextChunker,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorDb>,
    ) -> Self {
        Self {
            corpus,
            source: source.into(),
            chunker,
            embedder,
            index,
            state: Mutex::new(LoadState::NotLoaded),
            load_lock: tokio::sync::Mutex::new(()),
            index_lock: RwLock::new(()),
        }
    }

    fn set_state(&self, state: LoadState) -> LoadState {
        std::mem::replace(&mut *self.state.lock(), state)
    }

    fn load_error(&self, source: anyhow::Error) -> KnowledgeError {
        KnowledgeError::SourceLoad {
            collection: self.corpus.collection(),
            source,
        }
    }

    /// 读取全部文档并切分、向量化，不修改索引
    async fn ingest(&self, source: &KnowledgeSourceEnum) -> anyhow::Result<(usize, Vec<EmbeddedChunk>)> {
        let mut documents = source.documents();
        let mut document_count = 0;
        let mut pending = Vec::new();
        while let Some(document) = documents.try_next().await? {
            document_count += 1;
            let pieces = self.chunker.chunk(&document.content);
            debug!("文档 {} 切分为 {} 块", document.name, pieces.len());
            for (index, content) in pieces.into_iter().enumerate() {
                pending.push((document.name.clone(), index as i32, content, document.metadata.clone()));
            }
        }

        let texts: Vec<String> = pending.iter().map(|(_, _, content, _)| content.clone()).collect();
        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            self.embedder.embed(&texts).await?
        };
        if vectors.len() != pending.len() {
            return Err(anyhow!("向量数量 {} 与文本块数量 {} 不一致", vectors.len(), pending.len()));
        }

        let chunks = pending
            .into_iter()
            .zip(vectors)
            .map(|((document_name, chunk_index, content, metadata), embedding)| EmbeddedChunk {
                document_name,
                chunk_index,
                content,
                embedding,
                metadata,
            })
            .collect();
        Ok((document_count, chunks))
    }
}

#[async_trait]
impl KnowledgeAdapter for KnowledgeBase {
    fn corpus(&self) -> Corpus {
        self.corpus
    }

    fn load_state(&self) -> LoadState {
        *self.state.lock()
    }

    async fn exists(&self) -> Result<bool, KnowledgeError> {
        let count = self
            .index
            .count(self.corpus.collection())
            .await
            .map_err(KnowledgeError::Search)?;
        if count > 0 && self.load_state() == LoadState::NotLoaded {
            // 上次运行留下的索引
            self.set_state(LoadState::Loaded);
        }
        Ok(count > 0)
    }

    async fn load(&self, recreate: bool) -> Result<LoadReport, KnowledgeError> {
        let _loading = self.load_lock.lock().await;
        let collection = self.corpus.collection();

        if !recreate {
            let count = self.index.count(collection).await.map_err(|e| self.load_error(e))?;
            if count > 0 {
                self.set_state(LoadState::Loaded);
                info!("知识库 {} 已存在 {} 个文本块，跳过加载", collection, count);
                return Ok(LoadReport {
                    skipped: true,
                    ..Default::default()
                });
            }
        }

        let prior = self.set_state(LoadState::Loading);
        info!("开始加载知识库 {}：{}", collection, self.source.describe());
        let result = async {
            let (documents, chunks) = self.ingest(&self.source).await?;
            let total = chunks.len();
            let _guard = self.index_lock.write().await;
            self.index.replace(collection, chunks).await?;
            anyhow::Ok(LoadReport {
                documents,
                chunks: total,
                skipped: false,
            })
        }
        .await;

        match result {
            Ok(report) => {
                self.set_state(LoadState::Loaded);
                info!(
                    "知识库 {} 加载完成，文档 {} 篇，文本块 {} 个",
                    collection, report.documents, report.chunks
                );
                Ok(report)
            }
            Err(e) => {
                self.set_state(prior);
                error!("知识库 {} 加载失败: {:#}", collection, e);
                Err(self.load_error(e))
            }
        }
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<Passage>, KnowledgeError> {
        let _guard = self.index_lock.read().await;
        let collection = self.corpus.collection();
        if k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let count = self.index.count(collection).await.map_err(KnowledgeError::Search)?;
        if count == 0 {
            debug!("知识库 {} 为空，检索 {:?} 返回空结果", collection, query);
            return Ok(Vec::new());
        }

        let embedding = self
            .embedder
            .embed(&[query.to_string()])
            .await
            .map_err(|e| KnowledgeError::Search(e.into()))?
            .into_iter()
            .next()
            .ok_or_else(|| KnowledgeError::Search(anyhow!("向量化服务没有返回结果")))?;
        self.index
            .search(collection, &embedding, k)
            .await
            .map_err(KnowledgeError::Search)
    }

    fn supports_add_source(&self) -> bool {
        self.source.accepts_locator()
    }

    async fn add_source(&self, locator: &str) -> Result<LoadReport, KnowledgeError> {
        let Some(source) = self.source.for_locator(locator) else {
            return Err(KnowledgeError::Unsupported(self.corpus.collection()));
        };
        let _loading = self.load_lock.lock().await;
        let collection = self.corpus.collection();
        info!("向知识库 {} 追加：{}", collection, source.describe());

        let (documents, chunks) = self.ingest(&source).await.map_err(|e| self.load_error(e))?;
        let total = chunks.len();
        let _guard = self.index_lock.write().await;
        self.index
            .append(collection, chunks)
            .await
            .map_err(|e| self.load_error(e))?;
        if total > 0 {
            self.set_state(LoadState::Loaded);
        }
        Ok(LoadReport {
            documents,
            chunks: total,
            skipped: false,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use assert_matches::assert_matches;
    use tokio::sync::Notify;

    use super::source::{Document, TextSource};
    use super::*;
    use crate::database::setup_test_database;
    use crate::llm::LlmError;

    const KEYWORDS: [&str; 3] = ["rust", "python", "sql"];

    /// 按关键词出现情况生成向量，并统计调用次数
    #[derive(Default)]
    pub(crate) struct KeywordEmbedder {
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(LlmError::Malformed("embedding service down".to_string()));
            }
            Ok(texts
                .iter()
                .map(|text| {
                    let lower = text.to_lowercase();
                    let mut vector: Vec<f32> = KEYWORDS
                        .iter()
                        .map(|kw| if lower.contains(kw) { 1.0 } else { 0.0 })
                        .collect();
                    vector.push(0.1);
                    vector
                })
                .collect())
        }
    }

    /// 进入向量化后等待放行，用来观察加载过程中的并发行为
    #[derive(Default)]
    struct GatedEmbedder {
        entered: Notify,
        release: Notify,
        inner: KeywordEmbedder,
    }

    #[async_trait]
    impl Embedder for GatedEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.embed(texts).await
        }
    }

    fn corpus_documents() -> Vec<Document> {
        vec![
            Document::new("rust.md", "Rust is a systems programming language focused on safety."),
            Document::new("python.md", "Python is a dynamic language popular for data science."),
            Document::new("sql.md", "SQL is the language used to query relational databases."),
        ]
    }

    async fn knowledge_base(embedder: Arc<dyn Embedder>) -> KnowledgeBase {
        let index = Arc::new(DbVectorStore::new(setup_test_database().await));
        KnowledgeBase::new(
            Corpus::Pdf,
            TextSource::new(corpus_documents()),
            TextChunker::default(),
            embedder,
            index,
        )
    }

    #[test]
    fn test_corpus_names() {
        assert_eq!(Corpus::Arxiv.to_string(), "arxiv");
        assert_eq!("website".parse::<Corpus>().unwrap(), Corpus::Website);
        assert_eq!(serde_json::to_value(Corpus::Pdf).unwrap(), "pdf");
        assert_eq!(Corpus::Website.collection(), "website_documents");
    }

    #[tokio::test]
    async fn test_load_is_idempotent_unless_recreate() {
        let embedder = Arc::new(KeywordEmbedder::default());
        let kb = knowledge_base(embedder.clone()).await;
        assert_eq!(kb.load_state(), LoadState::NotLoaded);
        assert!(!kb.exists().await.unwrap());

        let report = kb.load(false).await.unwrap();
        assert_eq!(report.documents, 3);
        assert_eq!(report.chunks, 3);
        assert_eq!(kb.load_state(), LoadState::Loaded);
        assert!(kb.exists().await.unwrap());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

        let report = kb.load(false).await.unwrap();
        assert!(report.skipped);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

        let report = kb.load(true).await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.chunks, 3);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_search_unloaded_returns_empty() {
        let embedder = Arc::new(KeywordEmbedder::default());
        let kb = knowledge_base(embedder.clone()).await;
        assert!(kb.search("rust", 3).await.unwrap().is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_search_returns_most_similar_first() {
        let kb = knowledge_base(Arc::new(KeywordEmbedder::default())).await;
        kb.load(false).await.unwrap();

        let passages = kb.search("Tell me about Rust", 2).await.unwrap();
        assert_eq!(passages.len(), 2);
        assert_eq!(passages[0].document_name, "rust.md");

        let passages = kb.search("anything", 10).await.unwrap();
        assert_eq!(passages.len(), 3);
        // 相似度相同，按写入顺序
        let names: Vec<_> = passages.iter().map(|p| p.document_name.as_str()).collect();
        assert_eq!(names, vec!["rust.md", "python.md", "sql.md"]);
    }

    #[tokio::test]
    async fn test_failed_load_keeps_prior_state() {
        let embedder = Arc::new(KeywordEmbedder {
            fail: true,
            ..Default::default()
        });
        let kb = knowledge_base(embedder).await;
        let result = kb.load(true).await;
        assert_matches!(result, Err(KnowledgeError::SourceLoad { collection: "pdf_documents", .. }));
        assert_eq!(kb.load_state(), LoadState::NotLoaded);
        assert!(!kb.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_search_not_blocked_by_load() {
        let embedder = Arc::new(GatedEmbedder::default());
        let kb = Arc::new(knowledge_base(embedder.clone()).await);
        let load = tokio::spawn({
            let kb = kb.clone();
            async move { kb.load(false).await }
        });

        embedder.entered.notified().await;
        assert_eq!(kb.load_state(), LoadState::Loading);
        let passages = tokio::time::timeout(Duration::from_secs(1), kb.search("rust", 3))
            .await
            .expect("加载期间检索不应等待")
            .unwrap();
        assert!(passages.is_empty());

        embedder.release.notify_one();
        let report = load.await.unwrap().unwrap();
        assert_eq!(report.chunks, 3);
        assert_eq!(kb.load_state(), LoadState::Loaded);
        assert!(kb.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_add_source_unsupported_for_static_corpus() {
        let kb = knowledge_base(Arc::new(KeywordEmbedder::default())).await;
        assert!(!kb.supports_add_source());
        assert_matches!(
            kb.add_source("https://example.com").await,
            Err(KnowledgeError::Unsupported("pdf_documents"))
        );
    }
}
