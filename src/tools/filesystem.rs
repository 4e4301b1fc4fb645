//! 沙箱文件系统
//!
//! SafeFs 绑定项目根目录，所有路径先做词法解析（禁止 ../ 逃逸），再检查已存在祖先的真实路径（防符号链接逃逸）。
//! 目标文件可以尚不存在（新建文件、移动目标）。写入统一走 write_atomic：临时文件 + rename，单文件全有或全无。

use std::path::{Component, Path, PathBuf};

use tokio::fs;

use crate::core::{BbaiError, FileOperation};

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 解析项目内路径；越界返回 AccessDenied。纯词法检查在任何 I/O 之前完成。
    pub fn resolve(&self, path: &str) -> Result<PathBuf, BbaiError> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(BbaiError::file(path, FileOperation::Read, "empty path"));
        }
        let lexical = normalize_within(&self.root_dir, Path::new(trimmed)).ok_or_else(|| {
            BbaiError::AccessDenied {
                path: trimmed.to_string(),
            }
        })?;

        // 已存在的最长祖先不能经由符号链接指向根目录之外
        if let Some(real) = existing_ancestor(&lexical).and_then(|p| p.canonicalize().ok()) {
            if !real.starts_with(&self.root_dir) {
                return Err(BbaiError::AccessDenied {
                    path: trimmed.to_string(),
                });
            }
        }
        Ok(lexical)
    }

    /// 绝对路径转为相对根目录的 `/` 分隔路径
    pub fn relative(&self, abs: &Path) -> String {
        let rel = abs.strip_prefix(&self.root_dir).unwrap_or(abs);
        rel.components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn is_within(&self, path: &str) -> bool {
        self.resolve(path).is_ok()
    }
}

/// 词法规范化：处理 `.` 与 `..`，越过根目录返回 None
pub fn normalize_within(root: &Path, path: &Path) -> Option<PathBuf> {
    let relative: PathBuf = if path.is_absolute() {
        path.strip_prefix(root).ok()?.to_path_buf()
    } else {
        path.to_path_buf()
    };

    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for comp in relative.components() {
        match comp {
            Component::Normal(s) => parts.push(s),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    let mut out = root.to_path_buf();
    out.extend(parts);
    Some(out)
}

fn existing_ancestor(path: &Path) -> Option<&Path> {
    let mut cur = Some(path);
    while let Some(p) = cur {
        if p.exists() {
            return Some(p);
        }
        cur = p.parent();
    }
    None
}

/// 原子写入：同目录临时文件写完后 rename 覆盖目标；缺失的父目录自动创建
pub async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), BbaiError> {
    let display = path.display().to_string();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| BbaiError::from_io(&display, FileOperation::Create, e))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let tmp = path.with_file_name(format!(
        ".{}.bbai-tmp-{}",
        file_name,
        uuid::Uuid::new_v4().simple()
    ));

    if let Err(e) = fs::write(&tmp, content).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(BbaiError::from_io(&display, FileOperation::Write, e));
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(BbaiError::from_io(&display, FileOperation::Write, e));
    }
    Ok(())
}
