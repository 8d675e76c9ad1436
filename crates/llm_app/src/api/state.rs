use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use sea_orm::DatabaseConnection;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info};

use crate::config::Config;
use crate::conversation::{Conversation, ConversationContext, ConversationError, ConversationMode, ConversationState};
use crate::knowledge::source::{ArxivSource, PdfSource, WebsiteSource};
use crate::knowledge::{Corpus, DbVectorStore, KnowledgeAdapter, KnowledgeBase, VectorDb};
use crate::llm::{Embedder, LlmClient, OpenAiChat, OpenAiEmbedder};
use crate::storage::{ConversationStorage, DbConversationStorage};

/// 每种知识库各一份
pub struct ByCorpus<T> {
    pdf: T,
    arxiv: T,
    website: T,
}

impl<T> ByCorpus<T> {
    pub fn build(mut make: impl FnMut(Corpus) -> T) -> Self {
        Self {
            pdf: make(Corpus::Pdf),
            arxiv: make(Corpus::Arxiv),
            website: make(Corpus::Website),
        }
    }

    pub fn get(&self, corpus: Corpus) -> &T {
        match corpus {
            Corpus::Pdf => &self.pdf,
            Corpus::Arxiv => &self.arxiv,
            Corpus::Website => &self.website,
        }
    }
}

type SharedConversation = Arc<Mutex<Conversation>>;

type Registry = DashMap<(Corpus, i32), SharedConversation>;

/// 对一个常驻对话的使用权
///
/// 常驻表只保存正在被请求使用的对话。最后一个租约释放时对话从表中移除，
/// 之后的请求从存储重新载入。
pub struct ConversationLease {
    key: (Corpus, i32),
    shared: SharedConversation,
    live: Arc<Registry>,
}

impl ConversationLease {
    /// 获取对话锁，锁与租约一起交给调用方，可以跨任务持有
    pub async fn lock_owned(self) -> LeasedConversation {
        let guard = self.shared.clone().lock_owned().await;
        LeasedConversation { guard, _lease: self }
    }
}

impl Deref for ConversationLease {
    type Target = Mutex<Conversation>;

    fn deref(&self) -> &Self::Target {
        &self.shared
    }
}

impl Drop for ConversationLease {
    fn drop(&mut self) {
        // 只剩常驻表和本租约两份引用时没有其他使用者
        self.live
            .remove_if(&self.key, |_, shared| Arc::ptr_eq(shared, &self.shared) && Arc::strong_count(shared) == 2);
    }
}

/// 已加锁的对话，先释放锁再释放租约
pub struct LeasedConversation {
    guard: OwnedMutexGuard<Conversation>,
    _lease: ConversationLease,
}

impl Deref for LeasedConversation {
    type Target = Conversation;

    fn deref(&self) -> &Conversation {
        &self.guard
    }
}

impl DerefMut for LeasedConversation {
    fn deref_mut(&mut self) -> &mut Conversation {
        &mut self.guard
    }
}

/// 路由共享的服务状态
///
/// 同一个 `(corpus, id)` 在进程内同时只有一个 `Conversation`，所有操作都先获取它的锁，
/// 因此同一对话的轮次严格串行。
pub struct AppState {
    db: Arc<DatabaseConnection>,
    prompt_llm: Option<Arc<OpenAiChat>>,
    contexts: ByCorpus<ConversationContext>,
    live: Arc<Registry>,
}

impl AppState {
    pub fn new(db: Arc<DatabaseConnection>, config: &Config, api_key: Option<String>) -> Result<Self> {
        let chat = Arc::new(OpenAiChat::new(&config.llm, api_key.clone())?);
        let embedder: Arc<dyn Embedder> = Arc::new(OpenAiEmbedder::new(&config.llm, api_key)?);
        let index: Arc<dyn VectorDb> = Arc::new(DbVectorStore::new(db.clone()));
        let client = reqwest::Client::builder()
            .user_agent(concat!("llm-app/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.llm.timeout_seconds))
            .build()?;

        let knowledge = &config.knowledge;
        let llm: Arc<dyn LlmClient> = chat.clone();
        let contexts = ByCorpus::build(|corpus| {
            let base = match corpus {
                Corpus::Pdf => KnowledgeBase::new(
                    corpus,
                    PdfSource::new(&knowledge.pdf_path),
                    config.chunker(),
                    embedder.clone(),
                    index.clone(),
                ),
                Corpus::Arxiv => KnowledgeBase::new(
                    corpus,
                    ArxivSource::new(
                        client.clone(),
                        knowledge.arxiv_queries.clone(),
                        knowledge.arxiv_max_results,
                    ),
                    config.chunker(),
                    embedder.clone(),
                    index.clone(),
                ),
                Corpus::Website => KnowledgeBase::new(
                    corpus,
                    WebsiteSource::new(
                        client.clone(),
                        knowledge.website_urls.clone(),
                        knowledge.max_depth,
                        knowledge.max_links,
                    ),
                    config.chunker(),
                    embedder.clone(),
                    index.clone(),
                ),
            };
            ConversationContext {
                settings: config.conversation_settings(),
                llm: llm.clone(),
                knowledge: Arc::new(base),
                store: Arc::new(DbConversationStorage::new(db.clone(), corpus)),
            }
        });
        Ok(Self::with_contexts(db, Some(chat), contexts))
    }

    pub fn with_contexts(
        db: Arc<DatabaseConnection>,
        prompt_llm: Option<Arc<OpenAiChat>>,
        contexts: ByCorpus<ConversationContext>,
    ) -> Self {
        Self {
            db,
            prompt_llm,
            contexts,
            live: Arc::new(DashMap::new()),
        }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn prompt_llm(&self) -> Option<&OpenAiChat> {
        self.prompt_llm.as_deref()
    }

    pub fn context(&self, corpus: Corpus) -> &ConversationContext {
        self.contexts.get(corpus)
    }

    pub fn knowledge(&self, corpus: Corpus) -> &Arc<dyn KnowledgeAdapter> {
        &self.context(corpus).knowledge
    }

    pub fn store(&self, corpus: Corpus) -> &Arc<dyn ConversationStorage> {
        &self.context(corpus).store
    }

    fn lease(&self, key: (Corpus, i32), shared: SharedConversation) -> ConversationLease {
        ConversationLease {
            key,
            shared,
            live: self.live.clone(),
        }
    }

    /// 创建并开始一个新对话
    pub async fn create_conversation(
        &self,
        corpus: Corpus,
        user_name: &str,
        mode: ConversationMode,
    ) -> Result<(i32, ConversationLease), ConversationError> {
        let mut conversation = Conversation::new(self.context(corpus).clone(), user_name, mode);
        let id = conversation.start().await?;
        let shared = Arc::new(Mutex::new(conversation));
        self.live.insert((corpus, id), shared.clone());
        Ok((id, self.lease((corpus, id), shared)))
    }

    /// 取出进程内的对话，不在内存中时从存储载入
    pub async fn conversation(&self, corpus: Corpus, id: i32) -> Result<ConversationLease, ConversationError> {
        let key = (corpus, id);
        if let Some(shared) = self.live.get(&key).map(|entry| entry.clone()) {
            return Ok(self.lease(key, shared));
        }
        let mut conversation = Conversation::with_id(self.context(corpus).clone(), id);
        conversation.start().await?;
        if conversation.state() == ConversationState::Ended {
            // 已结束的对话只读，不进入常驻表
            return Ok(self.lease(key, Arc::new(Mutex::new(conversation))));
        }
        // 并发载入时保留先插入的那一份
        let shared = self
            .live
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(conversation)))
            .clone();
        Ok(self.lease(key, shared))
    }

    /// 依次加载（不重建）所有知识库，失败只记录日志
    pub async fn load_all_knowledge(&self) {
        for corpus in Corpus::ALL {
            match self.knowledge(corpus).load(false).await {
                Ok(report) if report.skipped => info!("知识库 {} 已存在，跳过", corpus),
                Ok(report) => info!("知识库 {} 已加载：文档 {} 篇，文本块 {} 个", corpus, report.documents, report.chunks),
                Err(e) => error!("知识库 {} 加载失败: {}", corpus, e),
            }
        }
    }
}
