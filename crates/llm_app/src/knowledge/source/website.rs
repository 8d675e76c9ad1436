use std::collections::{HashSet, VecDeque};

use anyhow::{Context, Result};
use async_stream::try_stream;
use futures::Stream;
use reqwest::Url;
use scraper::{ElementRef, Html, Node, Selector};
use serde_json::json;
use tracing::{debug, warn};

use super::{Document, DocumentStream, KnowledgeSource, KnowledgeSourceEnum};

/// 整个子树都忽略的标签
const SKIP_TAGS: [&str; 4] = ["script", "style", "noscript", "svg"];

/// 从种子网址出发按广度优先抓取同域页面
#[derive(Clone)]
pub struct WebsiteSource {
    client: reqwest::Client,
    urls: Vec<String>,
    max_depth: usize,
    max_links: usize,
}

impl WebsiteSource {
    pub fn new(client: reqwest::Client, urls: Vec<String>, max_depth: usize, max_links: usize) -> Self {
        Self {
            client,
            urls,
            max_depth,
            max_links,
        }
    }

    async fn fetch(&self, url: &Url) -> Result<String> {
        let html = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("请求页面 {} 失败", url))?
            .error_for_status()?
            .text()
            .await?;
        Ok(html)
    }
}

fn crawl(source: &WebsiteSource) -> impl Stream<Item = Result<Document>> + Send + '_ {
    try_stream! {
        let mut queue: VecDeque<(Url, usize)> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();
        for raw in &source.urls {
            let url = Url::parse(raw).with_context(|| format!("无效的网址 {}", raw))?;
            if visited.insert(normalize_url(&url)) {
                queue.push_back((url, 0));
            }
        }

        let mut fetched = 0;
        while let Some((url, depth)) = queue.pop_front() {
            if fetched >= source.max_links {
                break;
            }
            let result = source.fetch(&url).await;
            // 种子页面失败视为整个知识源加载失败，子页面失败只跳过
            if depth > 0 {
                if let Err(e) = &result {
                    warn!("抓取 {} 失败，已跳过: {:#}", url, e);
                    continue;
                }
            }
            let html = result?;
            fetched += 1;

            if depth < source.max_depth {
                for link in extract_links(&html, &url) {
                    if visited.insert(normalize_url(&link)) {
                        queue.push_back((link, depth + 1));
                    }
                }
            }

            let text = html_to_text(&html);
            if text.is_empty() {
                debug!("页面 {} 没有正文，已跳过", url);
                continue;
            }
            yield Document {
                name: url.to_string(),
                content: text,
                metadata: json!({"url": url.as_str(), "depth": depth}),
            };
        }
    }
}

impl KnowledgeSource for WebsiteSource {
    fn describe(&self) -> String {
        format!("网站 {:?}（深度 {}，最多 {} 页）", self.urls, self.max_depth, self.max_links)
    }

    fn documents(&self) -> DocumentStream<'_> {
        Box::pin(crawl(self))
    }

    fn accepts_locator(&self) -> bool {
        true
    }

    fn for_locator(&self, locator: &str) -> Option<KnowledgeSourceEnum> {
        Some(
            Self {
                urls: vec![locator.to_string()],
                ..self.clone()
            }
            .into(),
        )
    }
}

fn normalize_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.as_str().trim_end_matches('/').to_string()
}

/// 提取页面中与 base 同域的 http(s) 链接，保持出现顺序
pub fn extract_links(html: &str, base: &Url) -> Vec<Url> {
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let document = Html::parse_document(html);
    let mut links = Vec::new();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let Ok(mut url) = base.join(href) else {
            continue;
        };
        if !matches!(url.scheme(), "http" | "https") || url.host_str() != base.host_str() {
            continue;
        }
        url.set_fragment(None);
        links.push(url);
    }
    links
}

/// 提取 HTML 正文，跳过脚本、样式等标签并压缩空白
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let body = Selector::parse("body")
        .ok()
        .and_then(|selector| document.select(&selector).next());
    let root = body.unwrap_or_else(|| document.root_element());

    let mut parts = Vec::new();
    collect_text(root, &mut parts);
    clean_whitespace(&parts.join(" "))
}

fn collect_text(element: ElementRef, parts: &mut Vec<String>) {
    if SKIP_TAGS.contains(&element.value().name()) {
        return;
    }
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                let text = text.trim();
                if !text.is_empty() {
                    parts.push(text.to_string());
                }
            }
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    collect_text(child, parts);
                }
            }
            _ => {}
        }
    }
}

fn clean_whitespace(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut prev_was_whitespace = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !prev_was_whitespace {
                result.push(' ');
            }
            prev_was_whitespace = true;
        } else {
            result.push(ch);
            prev_was_whitespace = false;
        }
    }
    result.trim().to_string()
}
