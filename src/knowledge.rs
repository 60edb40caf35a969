//! Knowledge retrieval over markdown workspaces
//!
//! Builds a keyword-overlap index per workspace (a directory of `*.md`
//! files) and retrieves the best-matching chunks for a query. Keyword
//! extraction is intentionally ASCII-only (`[a-zA-Z]{3,}`), mirroring the
//! question detection word list; non-English text is a known limitation.
//! The index is cached in memory and mirrored to `<workspace>/.index.json`;
//! it is only rebuilt on an explicit re-index or a cache miss, never on
//! file changes.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::MAX_CONTEXT_TOKENS;

/// Common English function words excluded from keyword sets.
static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "an", "the", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
        "from", "as", "is", "was", "are", "were", "been", "be", "have", "has", "had", "do", "does",
        "did", "will", "would", "could", "should", "may", "might", "must", "shall", "can", "need",
        "this", "that", "these", "those", "it", "its", "i", "you", "he", "she", "we", "they", "me",
        "him", "her", "us", "them", "my", "your", "his", "our", "their", "what", "which", "who",
        "whom", "when", "where", "why", "how", "all", "each", "every", "both", "few", "more",
        "most", "other", "some", "such", "no", "nor", "not", "only", "own", "same", "so", "than",
        "too", "very", "just", "also", "now", "here", "there",
    ]
    .into_iter()
    .collect()
});

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[a-zA-Z]{3,}\b").unwrap());
static TITLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#\s+(.+)$").unwrap());

/// Extract the `top_n` most frequent keywords from `text`.
///
/// Ties are broken by first occurrence, so extraction is deterministic.
pub fn extract_keywords(text: &str, top_n: usize) -> Vec<String> {
    let lower = text.to_lowercase();

    let mut order = 0usize;
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for m in WORD_RE.find_iter(&lower) {
        let word = m.as_str();
        if STOP_WORDS.contains(word) {
            continue;
        }
        let entry = counts.entry(word).or_insert_with(|| {
            let first_seen = order;
            order += 1;
            (0, first_seen)
        });
        entry.0 += 1;
    }

    let mut ranked: Vec<(&str, usize, usize)> = counts
        .into_iter()
        .map(|(word, (count, first_seen))| (word, count, first_seen))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked
        .into_iter()
        .take(top_n)
        .map(|(word, _, _)| word.to_string())
        .collect()
}

/// Split `text` into overlapping windows of at most `max_chars` characters,
/// preferring to break at a sentence terminator in the second half of the
/// window. Indices are character-based so multi-byte text never splits.
pub fn chunk_text(text: &str, max_chars: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return vec![text.to_string()];
    }

    let breaks: [&[char]; 4] = [&['.'], &['!'], &['?'], &['\n', '\n']];
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let mut end = start + max_chars;
        if end < chars.len() {
            for needle in breaks {
                if let Some(idx) = rfind_chars(&chars, needle, start + max_chars / 2, end) {
                    if idx > start {
                        end = idx + 1;
                        break;
                    }
                }
            }
        }

        let slice_end = end.min(chars.len());
        let chunk: String = chars[start..slice_end].iter().collect();
        chunks.push(chunk.trim().to_string());
        start = end - overlap;
    }

    chunks
}

/// Find the highest index in `[lo, hi)` where `needle` occurs in `chars`.
fn rfind_chars(chars: &[char], needle: &[char], lo: usize, hi: usize) -> Option<usize> {
    let hi = hi.min(chars.len());
    if needle.is_empty() || lo >= hi || hi - lo < needle.len() {
        return None;
    }
    let mut i = hi - needle.len();
    loop {
        if &chars[i..i + needle.len()] == needle {
            return Some(i);
        }
        if i == lo {
            return None;
        }
        i -= 1;
    }
}

/// One indexed chunk of a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkIndex {
    pub text: String,
    pub keywords: Vec<String>,
}

/// Index for a single markdown file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileIndex {
    pub filename: String,
    pub title: String,
    pub keywords: Vec<String>,
    pub chunks: Vec<ChunkIndex>,
}

/// Keyword-overlap retrieval over workspaces of markdown files.
pub struct KnowledgeService {
    workspaces_dir: PathBuf,
    cache: Mutex<HashMap<String, Arc<Vec<FileIndex>>>>,
}

impl KnowledgeService {
    pub fn new(workspaces_dir: PathBuf) -> Self {
        Self {
            workspaces_dir,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn workspace_path(&self, workspace: &str) -> PathBuf {
        self.workspaces_dir.join(workspace)
    }

    /// (Re)build the index for a workspace and persist it to disk.
    pub async fn index_workspace(&self, workspace: &str) -> Arc<Vec<FileIndex>> {
        let workspace_path = self.workspace_path(workspace);
        if !workspace_path.is_dir() {
            warn!(workspace, "workspace not found");
            let empty = Arc::new(Vec::new());
            self.cache
                .lock()
                .await
                .insert(workspace.to_string(), empty.clone());
            return empty;
        }

        let mut indices = Vec::new();
        for path in markdown_files(&workspace_path) {
            match index_file(&path) {
                Ok(index) => {
                    info!(workspace, filename = %index.filename, "indexed file");
                    indices.push(index);
                }
                Err(e) => {
                    error!(workspace, path = %path.display(), "failed to index file: {:#}", e);
                }
            }
        }

        if let Err(e) = save_index(&workspace_path, &indices) {
            error!(workspace, "failed to save index: {:#}", e);
        }

        let indices = Arc::new(indices);
        self.cache
            .lock()
            .await
            .insert(workspace.to_string(), indices.clone());
        indices
    }

    async fn get_index(&self, workspace: &str) -> Arc<Vec<FileIndex>> {
        if let Some(indices) = self.cache.lock().await.get(workspace) {
            return indices.clone();
        }

        if let Some(indices) = load_index(&self.workspace_path(workspace)) {
            let indices = Arc::new(indices);
            self.cache
                .lock()
                .await
                .insert(workspace.to_string(), indices.clone());
            return indices;
        }

        self.index_workspace(workspace).await
    }

    /// Retrieve up to `top_k` chunks relevant to `query`, rendered with
    /// `[From <file>]` headers under the context character budget.
    pub async fn retrieve(&self, workspace: &str, query: &str, top_k: usize) -> String {
        let indices = self.get_index(workspace).await;
        if indices.is_empty() {
            return String::new();
        }

        let query_keywords: HashSet<String> = extract_keywords(query, 10).into_iter().collect();
        if query_keywords.is_empty() {
            return String::new();
        }

        let mut scored: Vec<(usize, &str, &str)> = Vec::new();
        for file_index in indices.iter() {
            for chunk in &file_index.chunks {
                let overlap = chunk
                    .keywords
                    .iter()
                    .filter(|k| query_keywords.contains(k.as_str()))
                    .count();
                if overlap > 0 {
                    scored.push((overlap, file_index.filename.as_str(), chunk.text.as_str()));
                }
            }
        }

        // Stable sort keeps file/chunk order for equal scores.
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.truncate(top_k);
        if scored.is_empty() {
            return String::new();
        }

        let max_chars = MAX_CONTEXT_TOKENS * 4;
        let mut parts = Vec::new();
        let mut total_chars = 0usize;

        for (_, filename, text) in scored {
            let mut text = text.to_string();
            let text_chars = text.chars().count();
            if total_chars + text_chars > max_chars {
                let remaining = max_chars.saturating_sub(total_chars);
                if remaining > 100 {
                    text = text.chars().take(remaining).collect::<String>() + "...";
                } else {
                    break;
                }
            }
            total_chars += text.chars().count();
            parts.push(format!("[From {}]\n{}", filename, text));
        }

        parts.join("\n\n")
    }

    /// Names of the markdown files in a workspace.
    pub fn workspace_files(&self, workspace: &str) -> Vec<String> {
        let path = self.workspace_path(workspace);
        if !path.is_dir() {
            return Vec::new();
        }
        markdown_files(&path)
            .into_iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect()
    }
}

fn markdown_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "md"))
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

fn index_file(path: &Path) -> Result<FileIndex> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let title = TITLE_RE
        .captures(&content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or(stem);

    let keywords = extract_keywords(&content, 50);

    let chunks = chunk_text(&content, 1000, 100)
        .into_iter()
        .map(|text| {
            let keywords = extract_keywords(&text, 20);
            ChunkIndex { text, keywords }
        })
        .collect();

    Ok(FileIndex {
        filename,
        title,
        keywords,
        chunks,
    })
}

fn index_path(workspace_path: &Path) -> PathBuf {
    workspace_path.join(".index.json")
}

fn save_index(workspace_path: &Path, indices: &[FileIndex]) -> Result<()> {
    let json = serde_json::to_string_pretty(indices).context("failed to serialize index")?;
    std::fs::write(index_path(workspace_path), json).context("failed to write index file")?;
    Ok(())
}

fn load_index(workspace_path: &Path) -> Option<Vec<FileIndex>> {
    let path = index_path(workspace_path);
    if !path.exists() {
        return None;
    }
    let content = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&content) {
        Ok(indices) => Some(indices),
        Err(e) => {
            error!(path = %path.display(), "failed to load index: {}", e);
            None
        }
    }
}
