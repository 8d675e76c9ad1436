use anyhow::{Context, Result};
use async_stream::try_stream;
use futures::Stream;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::json;
use tracing::debug;

use super::{Document, DocumentStream, KnowledgeSource, KnowledgeSourceEnum};

pub const ARXIV_API_URL: &str = "https://export.arxiv.org/api/query";

/// arXiv 论文检索，每条结果（标题、作者、摘要）作为一篇文档
#[derive(Clone)]
pub struct ArxivSource {
    client: reqwest::Client,
    api_url: String,
    queries: Vec<String>,
    max_results: usize,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ArxivEntry {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub authors: Vec<String>,
    pub published: String,
    pub pdf_url: Option<String>,
}

impl ArxivEntry {
    /// 从 `http://arxiv.org/abs/2401.00001v1` 形式的 id 中取出编号
    pub fn short_id(&self) -> &str {
        self.id.rsplit("/abs/").next().unwrap_or(&self.id)
    }

    fn into_document(self) -> Document {
        let content = format!(
            "Title: {}\nAuthors: {}\nPublished: {}\n\n{}",
            self.title,
            self.authors.join(", "),
            self.published,
            self.summary
        );
        Document {
            name: self.short_id().to_string(),
            metadata: json!({
                "arxiv_id": self.short_id(),
                "title": self.title,
                "pdf_url": self.pdf_url,
                "published": self.published,
            }),
            content,
        }
    }
}

impl ArxivSource {
    pub fn new(client: reqwest::Client, queries: Vec<String>, max_results: usize) -> Self {
        Self {
            client,
            api_url: ARXIV_API_URL.to_string(),
            queries,
            max_results,
        }
    }

    async fn search(&self, query: &str) -> Result<Vec<ArxivEntry>> {
        let body = self
            .client
            .get(&self.api_url)
            .query(&[
                ("search_query", format!("all:{}", query)),
                ("start", "0".to_string()),
                ("max_results", self.max_results.to_string()),
            ])
            .send()
            .await
            .with_context(|| format!("请求 arXiv 检索 {} 失败", query))?
            .error_for_status()?
            .text()
            .await?;
        parse_atom_feed(&body)
    }
}

fn search_all(source: &ArxivSource) -> impl Stream<Item = Result<Document>> + Send + '_ {
    try_stream! {
        for query in &source.queries {
            let entries = source.search(query).await?;
            debug!("arXiv 检索 {} 返回 {} 条结果", query, entries.len());
            for entry in entries {
                yield entry.into_document();
            }
        }
    }
}

impl KnowledgeSource for ArxivSource {
    fn describe(&self) -> String {
        format!("arXiv 检索 {:?}", self.queries)
    }

    fn documents(&self) -> DocumentStream<'_> {
        Box::pin(search_all(self))
    }

    fn accepts_locator(&self) -> bool {
        true
    }

    fn for_locator(&self, locator: &str) -> Option<KnowledgeSourceEnum> {
        Some(
            Self {
                queries: vec![locator.to_string()],
                ..self.clone()
            }
            .into(),
        )
    }
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 解析 arXiv API 返回的 Atom feed
pub fn parse_atom_feed(xml: &str) -> Result<Vec<ArxivEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<ArxivEntry> = None;
    let mut field: Option<Vec<u8>> = None;

    loop {
        match reader.read_event().context("解析 arXiv 响应失败")? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                if name == b"entry" {
                    current = Some(ArxivEntry::default());
                } else {
                    field = Some(name);
                }
            }
            Event::Empty(e) => {
                let Some(entry) = current.as_mut() else {
                    continue;
                };
                if e.local_name().as_ref() != b"link" {
                    continue;
                }
                let mut href = None;
                let mut is_pdf = false;
                for attr in e.attributes().flatten() {
                    match attr.key.local_name().as_ref() {
                        b"href" => href = Some(attr.unescape_value()?.into_owned()),
                        b"title" => is_pdf = attr.value.as_ref() == b"pdf",
                        _ => {}
                    }
                }
                if is_pdf {
                    entry.pdf_url = href;
                }
            }
            Event::Text(t) => {
                let (Some(entry), Some(name)) = (current.as_mut(), field.as_deref()) else {
                    continue;
                };
                let text = t.unescape()?;
                match name {
                    b"id" => entry.id = text.trim().to_string(),
                    b"title" => entry.title = normalize_whitespace(&text),
                    b"summary" => entry.summary = normalize_whitespace(&text),
                    b"published" => entry.published = text.trim().to_string(),
                    b"name" => entry.authors.push(text.trim().to_string()),
                    _ => {}
                }
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"entry" {
                    entries.extend(current.take());
                }
                field = None;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(entries)
}
