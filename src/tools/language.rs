//! 语言词法配置：字符串定界符、多行字符串定界符、heredoc 起始语法
//!
//! 只用于 LiteralReplacer 判断搜索串中哪些区域必须逐字匹配。
//! 识别顺序：显式指定 → 扩展名 → shebang → plaintext。

use std::path::Path;

/// 一种字符串定界方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringDelimiter {
    pub open: &'static str,
    pub close: &'static str,
    /// 是否可跨行；单行字符串遇到换行即结束
    pub multiline: bool,
}

const fn single(d: &'static str) -> StringDelimiter {
    StringDelimiter {
        open: d,
        close: d,
        multiline: false,
    }
}

const fn multi(open: &'static str, close: &'static str) -> StringDelimiter {
    StringDelimiter {
        open,
        close,
        multiline: true,
    }
}

/// 语言配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageProfile {
    pub name: &'static str,
    /// 多行定界符在前，匹配时按顺序尝试
    pub delimiters: &'static [StringDelimiter],
    /// heredoc 起始正则，需含命名组 q1/q2/bare 之一捕获结束标记
    pub heredoc_start: Option<&'static str>,
}

const SHELL_HEREDOC: &str = r#"^<<[-~]?[ \t]*(?:'(?P<q1>\w+)'|"(?P<q2>\w+)"|(?P<bare>[A-Za-z_]\w*))"#;
const RUBY_HEREDOC: &str = r#"^<<[-~]?(?:'(?P<q1>\w+)'|"(?P<q2>\w+)"|(?P<bare>[A-Z_][A-Z0-9_]*))"#;
const PHP_HEREDOC: &str = r#"^<<<[ \t]*(?:'(?P<q1>\w+)'|"(?P<q2>\w+)"|(?P<bare>[A-Za-z_]\w*))"#;
const PERL_HEREDOC: &str = r#"^<<[~]?(?:'(?P<q1>\w+)'|"(?P<q2>\w+)"|(?P<bare>[A-Z_][A-Z0-9_]*))"#;

pub const PLAINTEXT: LanguageProfile = LanguageProfile {
    name: "plaintext",
    delimiters: &[],
    heredoc_start: None,
};

const PROFILES: &[LanguageProfile] = &[
    PLAINTEXT,
    LanguageProfile {
        name: "rust",
        delimiters: &[multi("r#\"", "\"#"), multi("\"", "\"")],
        heredoc_start: None,
    },
    LanguageProfile {
        name: "python",
        delimiters: &[multi("\"\"\"", "\"\"\""), multi("'''", "'''"), single("\""), single("'")],
        heredoc_start: None,
    },
    LanguageProfile {
        name: "javascript",
        delimiters: &[multi("`", "`"), single("\""), single("'")],
        heredoc_start: None,
    },
    LanguageProfile {
        name: "typescript",
        delimiters: &[multi("`", "`"), single("\""), single("'")],
        heredoc_start: None,
    },
    LanguageProfile {
        name: "go",
        delimiters: &[multi("`", "`"), single("\""), single("'")],
        heredoc_start: None,
    },
    LanguageProfile {
        name: "java",
        delimiters: &[multi("\"\"\"", "\"\"\""), single("\""), single("'")],
        heredoc_start: None,
    },
    LanguageProfile {
        name: "c",
        delimiters: &[single("\""), single("'")],
        heredoc_start: None,
    },
    LanguageProfile {
        name: "cpp",
        delimiters: &[multi("R\"(", ")\""), single("\""), single("'")],
        heredoc_start: None,
    },
    LanguageProfile {
        name: "csharp",
        delimiters: &[multi("\"\"\"", "\"\"\""), single("\""), single("'")],
        heredoc_start: None,
    },
    LanguageProfile {
        name: "shell",
        delimiters: &[multi("\"", "\""), multi("'", "'")],
        heredoc_start: Some(SHELL_HEREDOC),
    },
    LanguageProfile {
        name: "ruby",
        delimiters: &[multi("\"", "\""), multi("'", "'")],
        heredoc_start: Some(RUBY_HEREDOC),
    },
    LanguageProfile {
        name: "php",
        delimiters: &[multi("\"", "\""), multi("'", "'")],
        heredoc_start: Some(PHP_HEREDOC),
    },
    LanguageProfile {
        name: "perl",
        delimiters: &[multi("\"", "\""), multi("'", "'")],
        heredoc_start: Some(PERL_HEREDOC),
    },
    LanguageProfile {
        name: "toml",
        delimiters: &[multi("\"\"\"", "\"\"\""), multi("'''", "'''"), single("\""), single("'")],
        heredoc_start: None,
    },
    LanguageProfile {
        name: "yaml",
        delimiters: &[single("\""), single("'")],
        heredoc_start: None,
    },
    LanguageProfile {
        name: "json",
        delimiters: &[single("\"")],
        heredoc_start: None,
    },
];

/// 按名称查找配置（大小写不敏感，含常见别名）
pub fn profile_by_name(name: &str) -> Option<&'static LanguageProfile> {
    let lower = name.trim().to_ascii_lowercase();
    let canonical = match lower.as_str() {
        "bash" | "sh" | "zsh" => "shell",
        "js" | "node" => "javascript",
        "ts" => "typescript",
        "py" => "python",
        "rs" => "rust",
        "rb" => "ruby",
        "c++" => "cpp",
        "c#" | "cs" => "csharp",
        "yml" => "yaml",
        "text" | "txt" | "markdown" | "md" => "plaintext",
        other => other,
    };
    PROFILES.iter().find(|p| p.name == canonical)
}

fn language_for_extension(ext: &str) -> Option<&'static str> {
    let lang = match ext.to_ascii_lowercase().as_str() {
        "rs" => "rust",
        "py" | "pyw" => "python",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" | "mts" | "cts" => "typescript",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => "cpp",
        "cs" => "csharp",
        "sh" | "bash" | "zsh" => "shell",
        "rb" => "ruby",
        "php" => "php",
        "pl" | "pm" => "perl",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "json" => "json",
        _ => return None,
    };
    Some(lang)
}

fn language_for_shebang(first_line: &str) -> Option<&'static str> {
    let line = first_line.strip_prefix("#!")?;
    let interpreter = line
        .split_whitespace()
        .flat_map(|part| part.rsplit('/').next())
        .find(|p| *p != "env" && !p.starts_with('-'))?;
    let lang = if interpreter.starts_with("python") {
        "python"
    } else if matches!(interpreter, "node" | "deno" | "bun") {
        "javascript"
    } else if matches!(interpreter, "sh" | "bash" | "zsh" | "dash" | "ksh") {
        "shell"
    } else if interpreter.starts_with("ruby") {
        "ruby"
    } else if interpreter.starts_with("perl") {
        "perl"
    } else if interpreter.starts_with("php") {
        "php"
    } else {
        return None;
    };
    Some(lang)
}

/// 识别语言：显式指定 → 扩展名 → shebang → plaintext
pub fn detect_language(
    override_name: Option<&str>,
    path: &Path,
    content: &str,
) -> &'static LanguageProfile {
    if let Some(p) = override_name.and_then(profile_by_name) {
        return p;
    }
    let by_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(language_for_extension);
    let by_shebang = || content.lines().next().and_then(language_for_shebang);
    by_ext
        .or_else(by_shebang)
        .and_then(profile_by_name)
        .unwrap_or(&PLAINTEXT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_order() {
        let p = Path::new("script");
        assert_eq!(detect_language(Some("ruby"), Path::new("a.py"), "").name, "ruby");
        assert_eq!(detect_language(None, Path::new("a.py"), "#!/bin/bash").name, "python");
        assert_eq!(detect_language(None, p, "#!/usr/bin/env bash\necho hi").name, "shell");
        assert_eq!(detect_language(None, p, "#!/usr/bin/python3\n").name, "python");
        assert_eq!(detect_language(None, p, "just text").name, "plaintext");
        assert_eq!(detect_language(Some("klingon"), Path::new("x.rs"), "").name, "rust");
    }

    #[test]
    fn test_aliases() {
        assert_eq!(profile_by_name("BASH").map(|p| p.name), Some("shell"));
        assert_eq!(profile_by_name("md").map(|p| p.name), Some("plaintext"));
        assert!(profile_by_name("cobol").is_none());
    }
}
