use crate::config::{ChunkStrategy, ChunkingConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunker {
    /// One chunk per document.
    Identity,
    /// Overlapping character windows, cut at a sentence or word boundary
    /// inside the last fifth of a window when one exists.
    Window { size: usize, overlap: usize },
}

impl Chunker {
    pub fn from_config(cfg: &ChunkingConfig) -> Self {
        match cfg.strategy {
            ChunkStrategy::Identity => Chunker::Identity,
            ChunkStrategy::Window => Chunker::Window {
                size: cfg.chunk_size.max(1),
                overlap: cfg.chunk_overlap.min(cfg.chunk_size.saturating_sub(1)),
            },
        }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        match *self {
            Chunker::Identity => {
                if text.trim().is_empty() {
                    Vec::new()
                } else {
                    vec![text.to_string()]
                }
            }
            Chunker::Window { size, overlap } => window_chunks(text, size, overlap),
        }
    }
}

fn window_chunks(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let size = size.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < total {
        let end = (start + size).min(total);
        let cut = if end < total {
            boundary(&chars, start + size * 4 / 5, end).unwrap_or(end)
        } else {
            end
        };
        let piece: String = chars[start..cut].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
        if end == total {
            break;
        }
        start = cut.saturating_sub(overlap).max(start + 1);
    }
    chunks
}

/// Exclusive end index of the best cut in `chars[from..to]`: just after a
/// sentence terminator followed by whitespace, else just after whitespace.
fn boundary(chars: &[char], from: usize, to: usize) -> Option<usize> {
    let sentence = (from..to).rev().find(|&i| {
        matches!(chars[i], '.' | '!' | '?') && chars.get(i + 1).is_some_and(|c| c.is_whitespace())
    });
    if let Some(i) = sentence {
        return Some(i + 1);
    }
    (from..to)
        .rev()
        .find(|&i| chars[i].is_whitespace())
        .map(|i| i + 1)
}
