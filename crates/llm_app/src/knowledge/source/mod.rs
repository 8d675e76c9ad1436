mod arxiv;
mod pdf;
mod text;
mod website;

use std::pin::Pin;

use anyhow::Result;
use enum_dispatch::enum_dispatch;
use futures::Stream;
use serde_json::Value;

pub use arxiv::ArxivSource;
pub use pdf::PdfSource;
pub use text::TextSource;
pub use website::{html_to_text, WebsiteSource};

/// 从知识源读取出的一篇文档
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub name: String,
    pub content: String,
    pub metadata: Value,
}

impl Document {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            metadata: Value::Null,
        }
    }
}

pub type DocumentStream<'a> = Pin<Box<dyn Stream<Item = Result<Document>> + Send + 'a>>;

#[enum_dispatch]
pub enum KnowledgeSourceEnum {
    PdfSource,
    ArxivSource,
    WebsiteSource,
    TextSource,
}

#[enum_dispatch(KnowledgeSourceEnum)]
pub trait KnowledgeSource {
    /// 用于日志输出的描述
    fn describe(&self) -> String;

    /// 惰性读取全部文档
    fn documents(&self) -> DocumentStream<'_>;

    /// 是否支持从新位置（网址、检索词）追加知识
    fn accepts_locator(&self) -> bool {
        false
    }

    /// 以同样的抓取参数构造一个指向新位置的知识源
    fn for_locator(&self, _locator: &str) -> Option<KnowledgeSourceEnum> {
        None
    }
}
