//! 沙箱文件系统协作者
//!
//! SafeFs 绑定 root_dir，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸）；
//! LocalFileStore 基于 SafeFs 实现 FileStore（read / write / list），失败一律返回 None / false 并记录日志。

use std::path::{Component, Path, PathBuf};

use crate::core::AgentError;

/// 按文本读取会出错的图片扩展名
const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".bmp", ".tiff", ".webp"];

/// 文件协作者：读 / 写 / 列目录
pub trait FileStore: Send + Sync {
    /// 读取文本文件；不存在、不可读或为图片时返回 None
    fn read(&self, path: &str) -> Option<String>;
    /// 写入文本文件（覆盖）；成功返回 true
    fn write(&self, path: &str, content: &str) -> bool;
    /// 列出目录项；目录不存在时返回 None
    fn list(&self, path: &str) -> Option<Vec<String>>;
}

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下，防止路径逃逸
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

    /// 检查已存在的路径是否在沙箱内
    pub fn resolve(&self, path: &str) -> Result<PathBuf, AgentError> {
        let path = path.trim_start_matches("./");
        let full = self.root_dir.join(path);
        let canonical = full
            .canonicalize()
            .map_err(|_| AgentError::ToolExecutionFailed(format!("Path not found: {}", path)))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(AgentError::PathEscape(path.to_string())) // 如 ../../etc/passwd
        }
    }

    /// 写入目标可以不存在：按词法规整路径，任何越过根目录的 `..` 或绝对路径都拒绝
    pub fn resolve_for_write(&self, path: &str) -> Result<PathBuf, AgentError> {
        let mut out = self.root_dir.clone();
        let mut depth = 0usize;
        for comp in Path::new(path).components() {
            match comp {
                Component::CurDir => {}
                Component::Normal(p) => {
                    out.push(p);
                    depth += 1;
                }
                Component::ParentDir if depth > 0 => {
                    out.pop();
                    depth -= 1;
                }
                _ => return Err(AgentError::PathEscape(path.to_string())),
            }
        }
        if depth == 0 {
            return Err(AgentError::ToolExecutionFailed(format!(
                "Not a file path: {}",
                path
            )));
        }
        Ok(out)
    }

    pub fn read_file(&self, path: &str) -> Result<String, AgentError> {
        let resolved = self.resolve(path)?;
        let bytes = std::fs::read(&resolved)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("Read failed: {}", e)))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn write_file(&self, path: &str, content: &str) -> Result<(), AgentError> {
        let target = self.resolve_for_write(path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::ToolExecutionFailed(format!("Create dir failed: {}", e)))?;
        }
        std::fs::write(&target, content)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("Write failed: {}", e)))
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, AgentError> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut entries = Vec::new();
        for e in std::fs::read_dir(&base)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("List failed: {}", e)))?
        {
            let e = e.map_err(|e| AgentError::ToolExecutionFailed(e.to_string()))?;
            let name = e.file_name().to_string_lossy().to_string();
            let ty = if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                "/"
            } else {
                ""
            };
            entries.push(format!("{}{}", name, ty));
        }
        entries.sort();
        Ok(entries)
    }
}

/// 本地文件协作者
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    fs: SafeFs,
}

impl LocalFileStore {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }

    pub fn root(&self) -> &Path {
        self.fs.root()
    }
}

impl FileStore for LocalFileStore {
    fn read(&self, path: &str) -> Option<String> {
        let lower = path.to_lowercase();
        if IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            tracing::error!(path = %path, "Refusing to read image file as text");
            return None;
        }
        match self.fs.read_file(path) {
            Ok(content) => {
                tracing::info!(path = %path, "read file");
                Some(content)
            }
            Err(e) => {
                tracing::error!(path = %path, error = %e, "read file failed");
                None
            }
        }
    }

    fn write(&self, path: &str, content: &str) -> bool {
        match self.fs.write_file(path, content) {
            Ok(()) => {
                tracing::info!(path = %path, bytes = content.len(), "wrote file");
                true
            }
            Err(e) => {
                tracing::error!(path = %path, error = %e, "write file failed");
                false
            }
        }
    }

    fn list(&self, path: &str) -> Option<Vec<String>> {
        match self.fs.list_dir(path) {
            Ok(entries) => Some(entries),
            Err(e) => {
                tracing::error!(path = %path, error = %e, "list directory failed");
                None
            }
        }
    }
}
