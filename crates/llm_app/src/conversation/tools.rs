use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::knowledge::{Corpus, KnowledgeAdapter};
use crate::llm::ToolSchema;

/// 提供给模型调用的工具
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数的 JSON Schema
    fn parameters(&self) -> Value;

    /// 返回交给模型的文本结果
    async fn invoke(&self, arguments: &Value) -> Result<String>;

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

fn string_parameter(name: &str, description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            name: {"type": "string", "description": description}
        },
        "required": [name]
    })
}

fn string_argument<'a>(arguments: &'a Value, name: &str) -> Result<&'a str> {
    arguments
        .get(name)
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| anyhow!("缺少参数 {}", name))
}

/// `search_knowledge_base(query)`
pub struct SearchKnowledgeBaseTool {
    knowledge: Arc<dyn KnowledgeAdapter>,
    num_documents: usize,
}

impl SearchKnowledgeBaseTool {
    pub fn new(knowledge: Arc<dyn KnowledgeAdapter>, num_documents: usize) -> Self {
        Self {
            knowledge,
            num_documents,
        }
    }
}

#[async_trait]
impl Tool for SearchKnowledgeBaseTool {
    fn name(&self) -> &str {
        "search_knowledge_base"
    }

    fn description(&self) -> &str {
        "Search the knowledge base for information about a query. Returns a JSON list of relevant passages."
    }

    fn parameters(&self) -> Value {
        string_parameter("query", "The query to search for.")
    }

    async fn invoke(&self, arguments: &Value) -> Result<String> {
        let query = string_argument(arguments, "query")?;
        let passages = self.knowledge.search(query, self.num_documents).await?;
        if passages.is_empty() {
            return Ok("No documents found".to_string());
        }
        Ok(serde_json::to_string(&passages)?)
    }
}

/// 向知识库追加新的网页或 arXiv 检索结果
pub struct AddSourceTool {
    knowledge: Arc<dyn KnowledgeAdapter>,
    name: &'static str,
    description: &'static str,
    argument: &'static str,
    argument_description: &'static str,
}

impl AddSourceTool {
    /// 只有网站和 arXiv 知识库支持追加
    pub fn for_corpus(knowledge: Arc<dyn KnowledgeAdapter>) -> Option<Self> {
        if !knowledge.supports_add_source() {
            return None;
        }
        match knowledge.corpus() {
            Corpus::Website => Some(Self {
                knowledge,
                name: "add_website_to_knowledge_base",
                description: "Crawl a website and add its contents to the knowledge base.",
                argument: "url",
                argument_description: "The url of the website to add.",
            }),
            Corpus::Arxiv => Some(Self {
                knowledge,
                name: "search_arxiv_and_add_to_knowledge_base",
                description: "Search arXiv for a topic and add the matching papers to the knowledge base.",
                argument: "query",
                argument_description: "The topic to search arXiv for.",
            }),
            Corpus::Pdf => None,
        }
    }
}

#[async_trait]
impl Tool for AddSourceTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn parameters(&self) -> Value {
        string_parameter(self.argument, self.argument_description)
    }

    async fn invoke(&self, arguments: &Value) -> Result<String> {
        let locator = string_argument(arguments, self.argument)?;
        let report = self.knowledge.add_source(locator).await?;
        Ok(format!(
            "Added {} documents ({} chunks) to the knowledge base.",
            report.documents, report.chunks
        ))
    }
}

/// 自主模式下某个知识库可用的全部工具
pub fn tools_for(knowledge: Arc<dyn KnowledgeAdapter>, num_documents: usize) -> Vec<Arc<dyn Tool>> {
    let mut tools: Vec<Arc<dyn Tool>> = vec![Arc::new(SearchKnowledgeBaseTool::new(knowledge.clone(), num_documents))];
    if let Some(tool) = AddSourceTool::for_corpus(knowledge) {
        tools.push(Arc::new(tool));
    }
    tools
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_argument() {
        let args = json!({"query": "rust", "empty": " "});
        assert_eq!(string_argument(&args, "query").unwrap(), "rust");
        assert!(string_argument(&args, "empty").is_err());
        assert!(string_argument(&args, "url").is_err());
    }

    #[test]
    fn test_parameter_schema() {
        let schema = string_parameter("url", "The url.");
        assert_eq!(schema["required"], json!(["url"]));
        assert_eq!(schema["properties"]["url"]["type"], "string");
    }
}
