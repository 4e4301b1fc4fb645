//! 项目搜索引擎：内容正则 + 文件元数据（文件名 glob、修改日期、大小）过滤
//!
//! 所有给出的条件按 AND 组合。内容按块读取匹配，相邻块之间保留一段重叠（从行首开始），
//! 跨块边界的匹配在拼接后的窗口里完成。结果按相对路径排序，同一文件系统快照下可复现。
//! 非法正则、glob、日期不抛错，而是以零结果 + error_message 返回。

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use glob::{MatchOptions, Pattern};
use regex::bytes::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use walkdir::{DirEntry, WalkDir};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_OVERLAP: usize = 4 * 1024;
/// 一个 UTF-8 字符的最大字节数，足够 `^`、`$`、`\b` 判断相邻字符
const LOOKAROUND: usize = 4;
const DEFAULT_EXCLUDES: &[&str] = &[".git", ".bbai", "node_modules"];

/// 搜索条件（字段均可选）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_pattern: Option<String>,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_pattern: Option<String>,
    /// YYYY-MM-DD，含当天
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_after: Option<String>,
    /// YYYY-MM-DD，含当天
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_min: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_max: Option<u64>,
}

impl SearchCriteria {
    /// 人类可读的条件摘要
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(p) = &self.content_pattern {
            let case = if self.case_sensitive {
                "case-sensitive"
            } else {
                "case-insensitive"
            };
            parts.push(format!("content pattern \"{}\" ({})", p, case));
        }
        if let Some(p) = &self.file_pattern {
            parts.push(format!("file pattern \"{}\"", p));
        }
        if let Some(d) = &self.date_after {
            parts.push(format!("modified after {}", d));
        }
        if let Some(d) = &self.date_before {
            parts.push(format!("modified before {}", d));
        }
        if let Some(s) = self.size_min {
            parts.push(format!("min size {} bytes", s));
        }
        if let Some(s) = self.size_max {
            parts.push(format!("max size {} bytes", s));
        }
        if parts.is_empty() {
            "all files".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// 搜索结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SearchResult {
    fn error(message: impl Into<String>) -> Self {
        Self {
            files: Vec::new(),
            error_message: Some(message.into()),
        }
    }
}

/// 编译后的过滤条件
struct Filters {
    content: Option<Regex>,
    glob: Option<(Pattern, bool)>,
    after: Option<NaiveDate>,
    before: Option<NaiveDate>,
    size_min: Option<u64>,
    size_max: Option<u64>,
}

fn parse_date(field: &str, raw: &Option<String>) -> Result<Option<NaiveDate>, String> {
    raw.as_deref()
        .map(|s| {
            NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map_err(|e| format!("Invalid {} '{}': {} (expected YYYY-MM-DD)", field, s, e))
        })
        .transpose()
}

impl Filters {
    fn compile(criteria: &SearchCriteria) -> Result<Self, String> {
        let content = criteria
            .content_pattern
            .as_deref()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(!criteria.case_sensitive)
                    .multi_line(true)
                    .build()
                    .map_err(|e| e.to_string())
            })
            .transpose()?;
        let glob = criteria
            .file_pattern
            .as_deref()
            .map(|p| {
                Pattern::new(p)
                    .map(|pat| (pat, p.contains('/')))
                    .map_err(|e| format!("Invalid file pattern '{}': {}", p, e))
            })
            .transpose()?;
        Ok(Self {
            content,
            glob,
            after: parse_date("dateAfter", &criteria.date_after)?,
            before: parse_date("dateBefore", &criteria.date_before)?,
            size_min: criteria.size_min,
            size_max: criteria.size_max,
        })
    }

    fn name_matches(&self, rel: &str) -> bool {
        match &self.glob {
            None => true,
            // 含 `/` 的模式匹配相对路径（`*` 不跨目录，`**` 跨），否则只匹配文件名
            Some((pat, true)) => pat.matches_with(
                rel,
                MatchOptions {
                    require_literal_separator: true,
                    ..MatchOptions::new()
                },
            ),
            Some((pat, false)) => {
                let base = rel.rsplit('/').next().unwrap_or(rel);
                pat.matches(base)
            }
        }
    }

    fn metadata_matches(&self, meta: &std::fs::Metadata) -> bool {
        let size = meta.len();
        if self.size_min.is_some_and(|min| size < min) || self.size_max.is_some_and(|max| size > max) {
            return false;
        }
        if self.after.is_none() && self.before.is_none() {
            return true;
        }
        let Ok(modified) = meta.modified() else {
            return false;
        };
        let date = DateTime::<Utc>::from(modified).date_naive();
        !(self.after.is_some_and(|a| date < a) || self.before.is_some_and(|b| date > b))
    }
}

/// 项目搜索引擎
#[derive(Debug, Clone)]
pub struct ProjectSearchEngine {
    chunk_size: usize,
    overlap: usize,
    excludes: Vec<String>,
}

impl Default for ProjectSearchEngine {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_OVERLAP,
            excludes: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ProjectSearchEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 调整读块大小与重叠长度（重叠不超过块大小）
    pub fn with_buffer(mut self, chunk_size: usize, overlap: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.overlap = overlap.min(self.chunk_size);
        self
    }

    pub fn with_excludes(mut self, excludes: Vec<String>) -> Self {
        self.excludes = excludes;
        self
    }

    fn is_excluded(&self, entry: &DirEntry) -> bool {
        entry.depth() > 0
            && entry.file_type().is_dir()
            && self
                .excludes
                .iter()
                .any(|ex| entry.file_name().to_str() == Some(ex.as_str()))
    }

    /// 异步入口：遍历放在 blocking 线程上
    pub async fn search(&self, root: &Path, criteria: &SearchCriteria) -> SearchResult {
        let engine = self.clone();
        let root = root.to_path_buf();
        let criteria = criteria.clone();
        match tokio::task::spawn_blocking(move || engine.search_blocking(&root, &criteria)).await {
            Ok(result) => result,
            Err(e) => SearchResult::error(format!("search task failed: {}", e)),
        }
    }

    pub fn search_blocking(&self, root: &Path, criteria: &SearchCriteria) -> SearchResult {
        let filters = match Filters::compile(criteria) {
            Ok(f) => f,
            Err(message) => {
                tracing::debug!(%message, "invalid search criteria");
                return SearchResult::error(message);
            }
        };

        let mut files = Vec::new();
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !self.is_excluded(e));
        for entry in walker.filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = relative_path(root, entry.path());
            if !filters.name_matches(&rel) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !filters.metadata_matches(&meta) {
                continue;
            }
            if let Some(re) = &filters.content {
                match self.file_contains(entry.path(), re) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        tracing::debug!(path = %rel, error = %e, "skipping unreadable file");
                        continue;
                    }
                }
            }
            files.push(rel);
        }
        files.sort();
        SearchResult {
            files,
            error_message: None,
        }
    }

    /// 分块扫描；每个窗口 = 上下文字节 + 上一块的尾部重叠 + 新块
    ///
    /// 窗口末尾是人为截断点，`$`、`\b` 在那里的判断不可信：结束位置离窗口末尾不足
    /// LOOKAROUND 字节的匹配留到下一个窗口（或 EOF）再确认，并从它的起点开始保留。
    /// 窗口开头同样保留 LOOKAROUND 字节上下文并用 find_at 搜索：`^`、`\b` 看到真实的前一个字节，`\A` 只在文件开头匹配。
    fn file_contains(&self, path: &Path, re: &Regex) -> std::io::Result<bool> {
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut window: Vec<u8> = Vec::with_capacity(self.chunk_size + self.overlap * 2);
        let mut search_from = 0;
        loop {
            let n = file.read(&mut buf)?;
            let at_eof = n == 0;
            window.extend_from_slice(&buf[..n]);

            let mut keep_from = overlap_start(&window, self.overlap).max(search_from);
            if let Some(m) = re.find_at(&window, search_from) {
                if at_eof || m.end() + LOOKAROUND <= window.len() {
                    return Ok(true);
                }
                keep_from = keep_from.min(m.start());
            }
            if at_eof {
                return Ok(false);
            }
            let context_from = keep_from.saturating_sub(LOOKAROUND);
            window.drain(..context_from);
            search_from = keep_from - context_from;
        }
    }
}

/// 保留至少 overlap 字节，并尽量向前对齐到行首（最多再回退 overlap 字节）
fn overlap_start(window: &[u8], overlap: usize) -> usize {
    let min_start = window.len().saturating_sub(overlap);
    let floor = window.len().saturating_sub(overlap.saturating_mul(2));
    window[floor..min_start]
        .iter()
        .rposition(|&b| b == b'\n')
        .map(|p| floor + p + 1)
        .unwrap_or(min_start)
}

fn relative_path(root: &Path, path: &Path) -> String {
    let rel: PathBuf = path.strip_prefix(root).unwrap_or(path).to_path_buf();
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// 搜索结果文本：摘要行 + `<files>` 列表
pub fn format_search_result(criteria: &SearchCriteria, result: &SearchResult) -> String {
    let summary = match &result.error_message {
        Some(err) => format!(
            "Search failed for {}: {}. Found 0 files.",
            criteria.describe(),
            err
        ),
        None if result.files.is_empty() => {
            format!("No files found matching {}.", criteria.describe())
        }
        None => format!(
            "Found {} file{} matching {}.",
            result.files.len(),
            if result.files.len() == 1 { "" } else { "s" },
            criteria.describe()
        ),
    };
    let mut out = format!("{}\n<files>\n", summary);
    for f in &result.files {
        out.push_str(f);
        out.push('\n');
    }
    out.push_str("</files>");
    out
}
