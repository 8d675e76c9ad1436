use futures::stream;

use super::{Document, DocumentStream, KnowledgeSource};

/// 内存中的文档列表
pub struct TextSource {
    documents: Vec<Document>,
}

impl TextSource {
    pub fn new(documents: Vec<Document>) -> Self {
        Self { documents }
    }
}

impl KnowledgeSource for TextSource {
    fn describe(&self) -> String {
        format!("内存文本（{} 篇）", self.documents.len())
    }

    fn documents(&self) -> DocumentStream<'_> {
        Box::pin(stream::iter(self.documents.iter().cloned().map(Ok)))
    }
}
