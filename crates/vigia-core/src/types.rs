//! 公共类型（对外暴露）
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// 技术抛错时引擎合成的 Occurrence 类型
pub const KIND_TECHNIQUE_ERROR: &str = "ERRO_ANALISTA";
/// 技术超出时间预算时引擎合成的 Occurrence 类型
pub const KIND_TIMEOUT: &str = "TIMEOUT";

/// 解析器产出的语法树句柄；引擎从不查看其内部结构
pub type SyntaxTree = Arc<dyn Any + Send + Sync>;

/// 单个待分析文件（由外部扫描器 / 解析器提供，单次运行内只读）
#[derive(Clone)]
pub struct FileEntry {
    /// 仓库相对路径，运行内唯一
    pub rel_path: String,
    pub full_path: PathBuf,
    /// 原始文本；二进制或读取失败时为 None
    pub content: Option<Arc<str>>,
    pub syntax_tree: Option<SyntaxTree>,
}

impl FileEntry {
    pub fn new(rel_path: impl Into<String>, full_path: impl Into<PathBuf>, content: Option<String>) -> Self {
        Self {
            rel_path: rel_path.into(),
            full_path: full_path.into(),
            content: content.map(Arc::from),
            syntax_tree: None,
        }
    }

    pub fn with_syntax_tree(mut self, tree: SyntaxTree) -> Self {
        self.syntax_tree = Some(tree);
        self
    }
}

impl fmt::Debug for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileEntry")
            .field("rel_path", &self.rel_path)
            .field("full_path", &self.full_path)
            .field("content_len", &self.content.as_ref().map(|c| c.len()))
            .field("has_syntax_tree", &self.syntax_tree.is_some())
            .finish()
    }
}

/// 严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// 一条发现（技术产出，或由引擎为失败 / 超时合成）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Occurrence {
    pub kind: String,
    pub severity_level: Severity,
    pub message: String,
    /// 全局技术的发现可以不指向具体文件
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub origin_technique: String,
}

impl Occurrence {
    pub fn new(kind: impl Into<String>, severity: Severity, message: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            severity_level: severity,
            message: message.into(),
            rel_path: None,
            line: None,
            origin_technique: origin.into(),
        }
    }

    pub fn at(mut self, rel_path: impl Into<String>, line: Option<u32>) -> Self {
        self.rel_path = Some(rel_path.into());
        self.line = line;
        self
    }

    /// 技术抛错 / panic
    pub(crate) fn technique_error(technique: &str, rel_path: Option<&str>, message: &str) -> Self {
        Self {
            kind: KIND_TECHNIQUE_ERROR.to_string(),
            severity_level: Severity::Error,
            message: format!("technique `{technique}` failed: {message}"),
            rel_path: rel_path.map(str::to_string),
            line: None,
            origin_technique: technique.to_string(),
        }
    }

    /// 技术超时
    pub(crate) fn timeout(technique: &str, rel_path: Option<&str>, budget_ms: u64) -> Self {
        Self {
            kind: KIND_TIMEOUT.to_string(),
            severity_level: Severity::Warning,
            message: format!("technique `{technique}` exceeded its {budget_ms}ms budget"),
            rel_path: rel_path.map(str::to_string),
            line: None,
            origin_technique: technique.to_string(),
        }
    }
}
