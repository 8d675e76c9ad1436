use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_stream::try_stream;
use futures::Stream;
use serde_json::json;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{Document, DocumentStream, KnowledgeSource};

const SUPPORTED_EXTENSIONS: [&str; 3] = ["pdf", "txt", "md"];

/// 本地目录中的 PDF / 文本文件
pub struct PdfSource {
    path: PathBuf,
}

impl PdfSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// 按路径排序列出目录下所有受支持的文件
fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        bail!("文档目录 {} 不存在", root.display());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("遍历目录 {} 失败", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let supported = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
            .unwrap_or(false);
        if supported {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn read_document(path: &Path) -> Result<String> {
    let is_pdf = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
    if is_pdf {
        pdf_extract::extract_text(path).with_context(|| format!("解析 PDF {} 失败", path.display()))
    } else {
        std::fs::read_to_string(path).with_context(|| format!("读取文件 {} 失败", path.display()))
    }
}

impl KnowledgeSource for PdfSource {
    fn describe(&self) -> String {
        format!("本地文档目录 {}", self.path.display())
    }

    fn documents(&self) -> DocumentStream<'_> {
        Box::pin(read_directory(self.path.clone()))
    }
}

fn read_directory(root: PathBuf) -> impl Stream<Item = Result<Document>> + Send {
    try_stream! {
        let files = {
            let root = root.clone();
            tokio::task::spawn_blocking(move || collect_files(&root)).await??
        };
        debug!("在 {} 中找到 {} 个文档", root.display(), files.len());

        for file in files {
            let name = file
                .strip_prefix(&root)
                .unwrap_or(&file)
                .to_string_lossy()
                .into_owned();
            let path = file.clone();
            let content = tokio::task::spawn_blocking(move || read_document(&path)).await??;
            if content.trim().is_empty() {
                warn!("文档 {} 没有可提取的文本，已跳过", name);
                continue;
            }
            yield Document {
                metadata: json!({"path": file.to_string_lossy()}),
                name,
                content,
            };
        }
    }
}
