/// 按字符长度切分文档，块之间保留重叠部分
///
/// 切分点优先落在段落、句子、换行、空格处，且总在 UTF-8 字符边界上。
#[derive(Debug, Clone)]
pub struct TextChunker {
    chunk_size: usize,
    chunk_overlap: usize,
    min_chunk_size: usize,
}

/// 在理想切分点之前最多回看的字节数
const BREAK_SEARCH_WINDOW: usize = 200;

impl Default for TextChunker {
    fn default() -> Self {
        Self::new(1000, 200, 20)
    }
}

impl TextChunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize, min_chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            // 重叠不能吞掉整个块，否则无法前进
            chunk_overlap: chunk_overlap.min(chunk_size / 2),
            min_chunk_size,
        }
    }

    pub fn chunk(&self, text: &str) -> Vec<String> {
        let text = text.trim();
        if text.len() <= self.chunk_size {
            if text.len() < self.min_chunk_size || text.is_empty() {
                return Vec::new();
            }
            return vec![text.to_string()];
        }

        let mut chunks = Vec::new();
        let mut start = 0;

        while start < text.len() {
            let end = snap_to_char_boundary(text, start + self.chunk_size);
            let end = if end < text.len() {
                self.find_break_point(text, start, end)
            } else {
                end
            };

            let piece = text[start..end].trim();
            if piece.len() >= self.min_chunk_size && !piece.is_empty() {
                chunks.push(piece.to_string());
            }
            if end >= text.len() {
                break;
            }

            let step = (end - start).saturating_sub(self.chunk_overlap).max(1);
            let mut next = start + step;
            while next < text.len() && !text.is_char_boundary(next) {
                next += 1;
            }
            start = next;
        }

        chunks
    }

    fn find_break_point(&self, text: &str, start: usize, preferred_end: usize) -> usize {
        let search_start = snap_to_char_boundary(text, preferred_end.saturating_sub(BREAK_SEARCH_WINDOW).max(start));
        // 切分点要越过重叠区，保证下一块能前进
        let min_end = start + self.chunk_overlap + 1;
        let region = &text[search_start..preferred_end];

        for pattern in ["\n\n", ". ", ".\n", "\n", " "] {
            if let Some(pos) = region.rfind(pattern) {
                let candidate = search_start + pos + pattern.len();
                if candidate > min_end {
                    return candidate;
                }
            }
        }
        preferred_end
    }
}

/// 向下取整到最近的字符边界
fn snap_to_char_boundary(text: &str, pos: usize) -> usize {
    if pos >= text.len() {
        return text.len();
    }
    let mut p = pos;
    while p > 0 && !text.is_char_boundary(p) {
        p -= 1;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text() {
        let chunker = TextChunker::new(100, 10, 5);
        assert_eq!(chunker.chunk("  hello world  "), vec!["hello world"]);
        assert!(chunker.chunk("hi").is_empty());
        assert!(chunker.chunk("").is_empty());
    }

    #[test]
    fn test_prefers_paragraph_break() {
        let chunker = TextChunker::new(60, 10, 1);
        let text = format!("{}\n\n{}", "a".repeat(40), "b".repeat(40));
        let chunks = chunker.chunk(&text);
        assert_eq!(chunks[0], "a".repeat(40));
        assert!(chunks.last().unwrap().ends_with(&"b".repeat(40)));
    }

    #[test]
    fn test_chunks_are_bounded_and_overlap() {
        let chunker = TextChunker::new(50, 10, 1);
        let text = (0..40).map(|i| format!("word{}", i)).collect::<Vec<_>>().join(" ");
        let chunks = chunker.chunk(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 50);
        }
        // 相邻块共享重叠区里的词
        let last_word = chunks[0].split(' ').last().unwrap();
        assert!(chunks[1].contains(last_word));
        assert!(chunks.last().unwrap().ends_with("word39"));
    }

    #[test]
    fn test_multibyte_text() {
        let chunker = TextChunker::new(30, 6, 1);
        let text = "知识库检索增强生成。".repeat(20);
        let chunks = chunker.chunk(&text);
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(chunk.len() <= 30);
        }
    }

    #[test]
    fn test_drops_tiny_chunks() {
        let chunker = TextChunker::new(20, 0, 10);
        let text = format!("{}\n\nabc", "x".repeat(19));
        let chunks = chunker.chunk(&text);
        assert_eq!(chunks, vec!["x".repeat(19)]);
    }
}
