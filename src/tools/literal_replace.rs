//! 字面量查找替换
//!
//! 搜索串逐字符扫描，状态互斥：代码 / 字符串内 / heredoc 内。
//! 字符串与 heredoc 内的内容逐字匹配（空白、反斜杠都不变）；代码区的空白串在匹配时视为弹性分隔符，
//! 首尾空白仍逐字匹配（只放宽换行符 `\r\n`）。同一位置 heredoc 优先于字符串，多行定界符优先于单字符定界符。

use regex::{NoExpand, Regex, RegexBuilder};

use crate::core::BbaiError;
use crate::tools::language::{LanguageProfile, StringDelimiter};

/// 编译后正则的大小上限
const REGEX_SIZE_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
enum ScanState {
    Code,
    InString { delim: StringDelimiter, escaped: bool },
    InHeredoc { marker: String, at_line_start: bool },
}

/// 一次替换的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub content: String,
    pub replacements: usize,
    /// search 与 replace 相同，未执行
    pub skipped: bool,
}

fn push_literal(out: &mut String, ch: char) {
    let mut buf = [0u8; 4];
    out.push_str(&regex::escape(ch.encode_utf8(&mut buf)));
}

fn whitespace_pattern(run: &str, at_edge: bool) -> String {
    if !at_edge {
        return if run.contains('\n') {
            r"[ \t]*(?:\r?\n[ \t]*)+".to_string()
        } else {
            r"[ \t]+".to_string()
        };
    }
    let mut out = String::new();
    let mut chars = run.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => out.push_str(r"\r?\n"),
            '\r' => out.push_str(r"\r"),
            '\t' => out.push_str(r"\t"),
            other => push_literal(&mut out, other),
        }
    }
    out
}

fn heredoc_marker(re: &Regex, rest: &str) -> Option<(usize, String)> {
    let caps = re.captures(rest)?;
    let marker = caps
        .name("q1")
        .or_else(|| caps.name("q2"))
        .or_else(|| caps.name("bare"))?;
    let end = caps.get(0).map_or(0, |m| m.end());
    Some((end, marker.as_str().to_string()))
}

/// 把搜索串转为正则（不含大小写标志）
pub fn build_pattern(search: &str, profile: &LanguageProfile) -> Result<String, BbaiError> {
    let heredoc_re = profile
        .heredoc_start
        .map(Regex::new)
        .transpose()
        .map_err(|e| BbaiError::tool("search_and_replace", format!("bad heredoc syntax: {}", e)))?;

    let len = search.len();
    let mut out = String::with_capacity(len * 2);
    let mut state = ScanState::Code;
    let mut i = 0;

    while i < len {
        let rest = &search[i..];
        let Some(ch) = rest.chars().next() else {
            break;
        };
        match std::mem::replace(&mut state, ScanState::Code) {
            ScanState::Code => {
                if let Some((end, marker)) = heredoc_re.as_ref().and_then(|re| heredoc_marker(re, rest)) {
                    out.push_str(&regex::escape(&rest[..end]));
                    i += end;
                    state = ScanState::InHeredoc {
                        marker,
                        at_line_start: false,
                    };
                    continue;
                }
                if let Some(delim) = profile.delimiters.iter().find(|d| rest.starts_with(d.open)) {
                    out.push_str(&regex::escape(delim.open));
                    i += delim.open.len();
                    state = ScanState::InString {
                        delim: *delim,
                        escaped: false,
                    };
                    continue;
                }
                if ch.is_whitespace() {
                    let run_len = rest
                        .find(|c: char| !c.is_whitespace())
                        .unwrap_or(rest.len());
                    let at_edge = i == 0 || i + run_len == len;
                    out.push_str(&whitespace_pattern(&rest[..run_len], at_edge));
                    i += run_len;
                    continue;
                }
                push_literal(&mut out, ch);
                i += ch.len_utf8();
            }
            ScanState::InString { delim, escaped } => {
                if !escaped && rest.starts_with(delim.close) {
                    out.push_str(&regex::escape(delim.close));
                    i += delim.close.len();
                    continue;
                }
                if ch == '\n' && !delim.multiline {
                    // 未闭合的单行字符串在行尾结束
                    continue;
                }
                push_literal(&mut out, ch);
                i += ch.len_utf8();
                state = ScanState::InString {
                    delim,
                    escaped: !escaped && ch == '\\',
                };
            }
            ScanState::InHeredoc {
                marker,
                at_line_start,
            } => {
                if at_line_start {
                    let line_end = rest.find('\n').unwrap_or(rest.len());
                    let line = &rest[..line_end];
                    if line.trim() == marker {
                        out.push_str(&regex::escape(line));
                        i += line_end;
                        continue;
                    }
                }
                push_literal(&mut out, ch);
                i += ch.len_utf8();
                state = ScanState::InHeredoc {
                    marker,
                    at_line_start: ch == '\n',
                };
            }
        }
    }
    Ok(out)
}

/// 在 content 中替换 search；replace_all 为 false 时只替换第一处
pub fn replace(
    content: &str,
    search: &str,
    replacement: &str,
    replace_all: bool,
    case_sensitive: bool,
    profile: &LanguageProfile,
) -> Result<ReplaceOutcome, BbaiError> {
    if search == replacement {
        return Ok(ReplaceOutcome {
            content: content.to_string(),
            replacements: 0,
            skipped: true,
        });
    }

    let pattern = build_pattern(search, profile)?;
    let re = RegexBuilder::new(&pattern)
        .case_insensitive(!case_sensitive)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| BbaiError::tool("search_and_replace", format!("search pattern too complex: {}", e)))?;

    let replacements = if replace_all {
        re.find_iter(content).count()
    } else {
        usize::from(re.is_match(content))
    };
    let content = if replace_all {
        re.replace_all(content, NoExpand(replacement)).into_owned()
    } else {
        re.replace(content, NoExpand(replacement)).into_owned()
    };
    Ok(ReplaceOutcome {
        content,
        replacements,
        skipped: false,
    })
}
