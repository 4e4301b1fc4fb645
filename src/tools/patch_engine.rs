//! 补丁引擎：解析并应用统一 diff 子集
//!
//! 支持的格式：`--- old` / `+++ new` 文件头，`@@ -a,b +c,d @@` hunk 头，行首 ` `/`-`/`+`；
//! 旧路径为 `/dev/null` 表示新建文件。无文件头时使用调用方给出的 file_path。
//!
//! 容差策略：逐行比较时忽略行尾空白（含 `\r`），hunk 必须在记录的位置（加上前面 hunk 的行数差）匹配；
//! 头部没有行号的 hunk 从上一个 hunk 之后向下查找。其余情况一律 PatchMismatch，不写文件。
//! 多文件补丁逐个文件应用：某个文件失败不回滚已写入的文件，但单个文件的写入是原子的。

use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use similar::TextDiff;
use tokio::fs;

use crate::core::{BbaiError, FileOperation};
use crate::tools::filesystem::{write_atomic, SafeFs};

pub const DEV_NULL: &str = "/dev/null";

/// hunk 中的一行
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

/// 一个 hunk；行号缺失时按内容查找
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hunk {
    pub old_start: Option<usize>,
    pub old_len: Option<usize>,
    pub new_start: Option<usize>,
    pub new_len: Option<usize>,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    pub fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    pub fn new_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Add(s) => Some(s.as_str()),
                HunkLine::Remove(_) => None,
            })
            .collect()
    }

    /// 去掉超出头部声明行数的尾部空上下文行（补丁文本末尾多余的空行）
    fn trim_trailing_blank_context(&mut self) {
        let Some(declared) = self.old_len else {
            return;
        };
        while self.old_lines().len() > declared
            && matches!(self.lines.last(), Some(HunkLine::Context(s)) if s.is_empty())
        {
            self.lines.pop();
        }
    }
}

/// 单个文件的补丁
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    /// None 表示 /dev/null（新建）
    pub old_path: Option<String>,
    /// None 表示无文件头，由调用方提供目标；Some(DEV_NULL) 表示删除
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
    headerless: bool,
}

impl FilePatch {
    pub fn is_new_file(&self) -> bool {
        !self.headerless && self.old_path.is_none()
    }

    pub fn is_deletion(&self) -> bool {
        self.new_path.as_deref() == Some(DEV_NULL)
    }

    pub fn target(&self) -> Option<&str> {
        if self.headerless {
            return None;
        }
        self.new_path
            .as_deref()
            .filter(|p| *p != DEV_NULL)
            .or(self.old_path.as_deref())
    }
}

fn hunk_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("valid hunk header regex")
    })
}

fn parse_header_path(raw: &str) -> Option<String> {
    let path = raw.split('\t').next().unwrap_or("").trim();
    if path == DEV_NULL {
        return None;
    }
    let path = path
        .strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path);
    Some(path.to_string())
}

fn is_git_preamble(line: &str) -> bool {
    ["diff ", "index ", "new file mode", "deleted file mode", "similarity ", "rename "]
        .iter()
        .any(|p| line.starts_with(p))
}

/// 解析补丁文本为逐文件的 hunk 列表
pub fn parse_patch(text: &str) -> Result<Vec<FilePatch>, String> {
    let lines: Vec<&str> = text
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .collect();
    let mut files: Vec<FilePatch> = Vec::new();
    let mut hunk: Option<Hunk> = None;

    fn finish_hunk(files: &mut [FilePatch], hunk: &mut Option<Hunk>) {
        if let Some(mut h) = hunk.take() {
            h.trim_trailing_blank_context();
            if let Some(file) = files.last_mut() {
                file.hunks.push(h);
            }
        }
    }

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let next = lines.get(i + 1).copied().unwrap_or("");

        if line.starts_with("--- ") && next.starts_with("+++ ") {
            finish_hunk(&mut files, &mut hunk);
            let old_path = parse_header_path(&line[4..]);
            let new_path = match parse_header_path(&next[4..]) {
                Some(p) => Some(p),
                None => Some(DEV_NULL.to_string()),
            };
            files.push(FilePatch {
                old_path,
                new_path,
                hunks: Vec::new(),
                headerless: false,
            });
            i += 2;
            continue;
        }

        if line.starts_with("@@") {
            finish_hunk(&mut files, &mut hunk);
            if files.is_empty() {
                files.push(FilePatch {
                    old_path: None,
                    new_path: None,
                    hunks: Vec::new(),
                    headerless: true,
                });
            }
            let mut h = Hunk::default();
            if let Some(caps) = hunk_header_re().captures(line) {
                let num = |idx: usize| caps.get(idx).and_then(|m| m.as_str().parse::<usize>().ok());
                h.old_start = num(1);
                h.old_len = Some(num(2).unwrap_or(1));
                h.new_start = num(3);
                h.new_len = Some(num(4).unwrap_or(1));
            }
            hunk = Some(h);
            i += 1;
            continue;
        }

        if let Some(h) = hunk.as_mut() {
            if let Some(rest) = line.strip_prefix(' ') {
                h.lines.push(HunkLine::Context(rest.to_string()));
            } else if let Some(rest) = line.strip_prefix('-') {
                h.lines.push(HunkLine::Remove(rest.to_string()));
            } else if let Some(rest) = line.strip_prefix('+') {
                h.lines.push(HunkLine::Add(rest.to_string()));
            } else if line.starts_with('\\') {
                // "\ No newline at end of file"
            } else if line.is_empty() {
                h.lines.push(HunkLine::Context(String::new()));
            } else if is_git_preamble(line) {
                finish_hunk(&mut files, &mut hunk);
            } else {
                return Err(format!("unexpected line {} in hunk: {:?}", i + 1, line));
            }
        }
        i += 1;
    }
    finish_hunk(&mut files, &mut hunk);

    files.retain(|f| !f.hunks.is_empty() || f.is_new_file());
    if files.is_empty() {
        return Err("no hunks found in patch".to_string());
    }
    Ok(files)
}

fn lines_match(actual: &[String], at: usize, expected: &[&str]) -> bool {
    if at + expected.len() > actual.len() {
        return false;
    }
    expected
        .iter()
        .zip(&actual[at..at + expected.len()])
        .all(|(e, a)| e.trim_end() == a.trim_end())
}

/// 在内存中应用 hunk；返回新内容或不匹配原因
pub fn apply_hunks(original: &str, hunks: &[Hunk]) -> Result<String, String> {
    let eol = if original.contains("\r\n") { "\r\n" } else { "\n" };
    let had_trailing_newline = original.is_empty() || original.ends_with('\n');
    let mut lines: Vec<String> = original.lines().map(String::from).collect();
    let mut delta: isize = 0;
    let mut search_from = 0usize;

    for (idx, hunk) in hunks.iter().enumerate() {
        let old = hunk.old_lines();
        let new = hunk.new_lines();

        let pos = match hunk.old_start {
            Some(start) => {
                let base = if old.is_empty() { start } else { start.saturating_sub(1) };
                let pos = base as isize + delta;
                if pos < 0 || !lines_match(&lines, pos as usize, &old) {
                    let expected = old.first().copied().unwrap_or("");
                    let actual = if pos >= 0 {
                        lines.get(pos as usize).map(String::as_str).unwrap_or("<end of file>")
                    } else {
                        "<before start of file>"
                    };
                    return Err(format!(
                        "hunk {} does not match at line {}: expected {:?}, found {:?}",
                        idx + 1,
                        base + 1,
                        expected,
                        actual
                    ));
                }
                pos as usize
            }
            None => (search_from..=lines.len().saturating_sub(old.len()))
                .find(|&p| lines_match(&lines, p, &old))
                .ok_or_else(|| format!("hunk {} context not found in file", idx + 1))?,
        };

        lines.splice(pos..pos + old.len(), new.iter().map(|s| s.to_string()));
        delta += new.len() as isize - old.len() as isize;
        search_from = pos + new.len();
    }

    let mut out = lines.join(eol);
    if had_trailing_newline && !lines.is_empty() {
        out.push_str(eol);
    }
    Ok(out)
}

/// 新建文件的内容：只能包含新增行
pub fn new_file_content(patch: &FilePatch) -> Result<String, String> {
    let mut out = String::new();
    for hunk in &patch.hunks {
        for line in &hunk.lines {
            match line {
                HunkLine::Add(s) => {
                    out.push_str(s);
                    out.push('\n');
                }
                HunkLine::Context(s) if s.is_empty() => {}
                _ => return Err("a patch creating a new file may only contain added lines".to_string()),
            }
        }
    }
    Ok(out)
}

/// 已解析并完成路径校验的单文件补丁
#[derive(Debug, Clone)]
pub struct PlannedFilePatch {
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub patch: FilePatch,
}

/// 应用结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchOutcome {
    pub modified_files: Vec<String>,
    pub new_files: Vec<String>,
}

/// 补丁引擎
#[derive(Debug, Clone)]
pub struct PatchEngine {
    fs: SafeFs,
}

impl PatchEngine {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }

    /// 解析补丁并校验所有目标路径（任何 I/O 之前）
    pub fn plan(&self, file_path: Option<&str>, patch_text: &str) -> Result<Vec<PlannedFilePatch>, BbaiError> {
        let patches = parse_patch(patch_text).map_err(|m| BbaiError::tool("apply_patch", m))?;
        let mut planned = Vec::with_capacity(patches.len());
        for patch in patches {
            if patch.is_deletion() {
                return Err(BbaiError::tool("apply_patch", "deleting files through a patch is not supported"));
            }
            let target = patch
                .target()
                .or(file_path)
                .ok_or_else(|| BbaiError::tool("apply_patch", "patch has no file header and no filePath was given"))?
                .to_string();
            let absolute_path = self.fs.resolve(&target)?;
            planned.push(PlannedFilePatch {
                relative_path: self.fs.relative(&absolute_path),
                absolute_path,
                patch,
            });
        }
        Ok(planned)
    }

    /// 逐文件应用；每个文件要么全部 hunk 写入，要么不写
    pub async fn apply_planned(&self, planned: &[PlannedFilePatch]) -> Result<PatchOutcome, BbaiError> {
        let mut outcome = PatchOutcome::default();
        for item in planned {
            let rel = item.relative_path.as_str();
            if item.patch.is_new_file() {
                if fs::metadata(&item.absolute_path).await.is_ok() {
                    return Err(BbaiError::file(rel, FileOperation::Create, "file already exists"));
                }
                let content = new_file_content(&item.patch).map_err(|m| BbaiError::tool("apply_patch", m))?;
                write_atomic(&item.absolute_path, content.as_bytes()).await?;
                tracing::info!(path = %rel, "patch created file");
                outcome.new_files.push(rel.to_string());
            } else {
                let original = fs::read_to_string(&item.absolute_path)
                    .await
                    .map_err(|e| BbaiError::from_io(rel, FileOperation::Patch, e))?;
                let updated = apply_hunks(&original, &item.patch.hunks).map_err(|message| {
                    tracing::warn!(path = %rel, %message, "patch mismatch");
                    BbaiError::PatchMismatch {
                        path: rel.to_string(),
                        message,
                    }
                })?;
                write_atomic(&item.absolute_path, updated.as_bytes()).await?;
                tracing::info!(path = %rel, hunks = item.patch.hunks.len(), "patch applied");
                outcome.modified_files.push(rel.to_string());
            }
        }
        Ok(outcome)
    }

    pub async fn apply(&self, file_path: Option<&str>, patch_text: &str) -> Result<PatchOutcome, BbaiError> {
        let planned = self.plan(file_path, patch_text)?;
        self.apply_planned(&planned).await
    }
}

/// 生成统一 diff（内容相同时返回空字符串）；新建文件的旧路径记为 /dev/null
pub fn unified_diff(path: &str, old: &str, new: &str, context: usize) -> String {
    if old == new {
        return String::new();
    }
    let old_header = if old.is_empty() {
        DEV_NULL.to_string()
    } else {
        format!("a/{}", path)
    };
    let new_header = format!("b/{}", path);
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(context)
        .header(&old_header, &new_header)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(dir: &std::path::Path) -> PatchEngine {
        PatchEngine::new(SafeFs::new(dir))
    }

    #[tokio::test]
    async fn test_modify_single_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("test.txt"), "Hello, world!").unwrap();
        let patch = "--- test.txt\n+++ test.txt\n@@ -1 +1 @@\n-Hello, world!\n+Hello, Bob!\n";

        let outcome = engine(dir.path()).apply(Some("test.txt"), patch).await.unwrap();
        assert_eq!(outcome.modified_files, vec!["test.txt".to_string()]);
        assert!(outcome.new_files.is_empty());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("test.txt")).unwrap(),
            "Hello, Bob!"
        );
    }

    #[tokio::test]
    async fn test_create_new_file_from_dev_null() {
        let dir = tempfile::tempdir().unwrap();
        let patch = "--- /dev/null\n+++ b/docs/new.txt\n@@ -0,0 +1,2 @@\n+first line\n+second line\n";

        let outcome = engine(dir.path()).apply(None, patch).await.unwrap();
        assert_eq!(outcome.new_files, vec!["docs/new.txt".to_string()]);
        assert!(outcome.modified_files.is_empty());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("docs/new.txt")).unwrap(),
            "first line\nsecond line\n"
        );
    }

    #[tokio::test]
    async fn test_mismatch_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let original = "alpha\nbeta\ngamma\n";
        std::fs::write(dir.path().join("f.txt"), original).unwrap();
        let patch = "--- a/f.txt\n+++ b/f.txt\n@@ -1,2 +1,2 @@\n alpha\n-BETA\n+delta\n";

        let err = engine(dir.path()).apply(None, patch).await.unwrap_err();
        match err {
            BbaiError::PatchMismatch { path, .. } => assert_eq!(path, "f.txt"),
            other => panic!("expected PatchMismatch, got {:?}", other),
        }
        assert_eq!(std::fs::read_to_string(dir.path().join("f.txt")).unwrap(), original);
    }

    #[tokio::test]
    async fn test_multi_file_failure_keeps_earlier_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "two\n").unwrap();
        let patch = "--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-one\n+ONE\n\
                     --- a/b.txt\n+++ b/b.txt\n@@ -1 +1 @@\n-zwei\n+TWO\n";

        let result = engine(dir.path()).apply(None, patch).await;
        assert!(matches!(result, Err(BbaiError::PatchMismatch { .. })));
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "ONE\n");
        assert_eq!(std::fs::read_to_string(dir.path().join("b.txt")).unwrap(), "two\n");
    }

    #[tokio::test]
    async fn test_traversal_rejected_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let patch = "--- /dev/null\n+++ b/../escape.txt\n@@ -0,0 +1 @@\n+x\n";
        let err = engine(dir.path()).apply(None, patch).await.unwrap_err();
        assert!(matches!(err, BbaiError::AccessDenied { .. }));
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[test]
    fn test_hunks_apply_with_offset_tracking() {
        let original = "1\n2\n3\n4\n5\n6\n7\n8\n";
        let patch = "@@ -2,1 +2,2 @@\n-2\n+two\n+zwei\n@@ -6,1 +7,1 @@\n-6\n+six\n";
        let files = parse_patch(patch).unwrap();
        let out = apply_hunks(original, &files[0].hunks).unwrap();
        assert_eq!(out, "1\ntwo\nzwei\n3\n4\n5\nsix\n7\n8\n");
    }

    #[test]
    fn test_trailing_whitespace_tolerated() {
        let original = "fn main() {   \r\n    run();\r\n}\r\n";
        let patch = "@@ -1,3 +1,3 @@\n fn main() {\n-    run();\n+    run_fast();\n }\n";
        let files = parse_patch(patch).unwrap();
        let out = apply_hunks(original, &files[0].hunks).unwrap();
        assert_eq!(out, "fn main() {   \r\n    run_fast();\r\n}\r\n");
    }

    #[test]
    fn test_headerless_hunk_located_by_content() {
        let original = "a\nb\nc\n";
        let patch = "@@ @@\n b\n-c\n+C\n";
        let files = parse_patch(patch).unwrap();
        assert_eq!(files[0].hunks[0].old_start, None);
        assert_eq!(apply_hunks(original, &files[0].hunks).unwrap(), "a\nb\nC\n");
    }

    #[test]
    fn test_unexpected_line_is_parse_error() {
        assert!(parse_patch("@@ -1 +1 @@\n-a\n+b\ngarbage\n").is_err());
        assert!(parse_patch("no hunks here").is_err());
    }

    #[test]
    fn test_diff_roundtrip_on_pre_image() {
        let pre = "use std::io;\n\nfn main() {\n    let x = 1;\n    println!(\"{}\", x);\n}\n\nfn helper() {}\n";
        let post = "use std::io;\nuse std::fs;\n\nfn main() {\n    let x = 2;\n    println!(\"{}\", x);\n}\n\nfn helper() {}\nfn extra() {}\n";
        let diff = unified_diff("src/main.rs", pre, post, 3);
        let files = parse_patch(&diff).unwrap();
        assert_eq!(files[0].target(), Some("src/main.rs"));
        assert_eq!(apply_hunks(pre, &files[0].hunks).unwrap(), post);
        // 对同一前像再次应用得到相同结果
        assert_eq!(apply_hunks(pre, &files[0].hunks).unwrap(), post);
    }

    #[test]
    fn test_diff_of_large_file_stays_local() {
        let pre: String = (0..2001).map(|i| format!("line {}\n", i)).collect();
        let post = pre.replace("line 1000\n", "line one thousand\n");
        let diff = unified_diff("big.txt", &pre, &post, 3);
        assert_eq!(diff.lines().filter(|l| l.starts_with('-') && !l.starts_with("---")).count(), 1);
        assert_eq!(diff.lines().filter(|l| l.starts_with('+') && !l.starts_with("+++")).count(), 1);
        let files = parse_patch(&diff).unwrap();
        assert_eq!(files[0].hunks.len(), 1);
        assert_eq!(apply_hunks(&pre, &files[0].hunks).unwrap(), post);
    }

    #[test]
    fn test_diff_of_identical_content_is_empty() {
        assert!(unified_diff("x", "same\n", "same\n", 3).is_empty());
    }

    #[test]
    fn test_diff_for_new_file_uses_dev_null() {
        let diff = unified_diff("n.txt", "", "hello\n", 3);
        let files = parse_patch(&diff).unwrap();
        assert!(files[0].is_new_file());
        assert_eq!(new_file_content(&files[0]).unwrap(), "hello\n");
    }
}
