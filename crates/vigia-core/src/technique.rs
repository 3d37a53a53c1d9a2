//! 技术（分析插件）契约
//!
//! 引擎只认识技术的"形状"：名称、作用域（全局 / 按文件）、可选的路径谓词与 apply。
//! apply 可能返回错误、panic、或者长时间不返回，引擎都必须能兜住。
use std::path::PathBuf;
use std::sync::Arc;

use crate::types::{FileEntry, Occurrence, SyntaxTree};

/// 技术的作用域：整批只运行一次，或每个匹配文件运行一次
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TechniqueScope {
    Global,
    PerFile,
}

/// apply 的返回值：无 / 单条 / 多条
#[derive(Debug, Clone, Default)]
pub enum Outcome {
    #[default]
    None,
    One(Occurrence),
    Many(Vec<Occurrence>),
}

impl Outcome {
    pub fn into_vec(self) -> Vec<Occurrence> {
        match self {
            Outcome::None => Vec::new(),
            Outcome::One(o) => vec![o],
            Outcome::Many(v) => v,
        }
    }
}

impl From<Occurrence> for Outcome {
    fn from(o: Occurrence) -> Self {
        Outcome::One(o)
    }
}

impl From<Vec<Occurrence>> for Outcome {
    fn from(v: Vec<Occurrence>) -> Self {
        Outcome::Many(v)
    }
}

impl From<Option<Occurrence>> for Outcome {
    fn from(o: Option<Occurrence>) -> Self {
        o.map_or(Outcome::None, Outcome::One)
    }
}

/// 单次运行共享的只读上下文
#[derive(Debug, Clone)]
pub struct TechniqueContext {
    pub base_dir: PathBuf,
    /// 本次运行的完整文件列表（全局技术据此工作）
    pub files: Arc<[FileEntry]>,
}

/// 一次 apply 调用的全部输入；全部为拥有所有权 / Arc 共享的数据，
/// 以便在超时场景下把调用搬到独立线程上
#[derive(Debug, Clone)]
pub struct TechniqueInput {
    /// 全局技术调用时为 None
    pub content: Option<Arc<str>>,
    /// 全局技术调用时为空串
    pub rel_path: String,
    pub syntax_tree: Option<SyntaxTree>,
    pub full_path: PathBuf,
    pub context: Arc<TechniqueContext>,
}

impl TechniqueInput {
    pub(crate) fn for_file(file: &FileEntry, context: &Arc<TechniqueContext>) -> Self {
        Self {
            content: file.content.clone(),
            rel_path: file.rel_path.clone(),
            syntax_tree: file.syntax_tree.clone(),
            full_path: file.full_path.clone(),
            context: Arc::clone(context),
        }
    }

    pub(crate) fn for_global(context: &Arc<TechniqueContext>) -> Self {
        Self {
            content: None,
            rel_path: String::new(),
            syntax_tree: None,
            full_path: context.base_dir.clone(),
            context: Arc::clone(context),
        }
    }

    pub fn is_global(&self) -> bool {
        self.rel_path.is_empty()
    }
}

/// 技术契约。实现必须无状态（或仅内部只读），可跨线程共享。
pub trait Technique: Send + Sync {
    fn name(&self) -> &str;

    fn scope(&self) -> TechniqueScope {
        TechniqueScope::PerFile
    }

    /// 缺省匹配所有文件
    fn matches(&self, _rel_path: &str) -> bool {
        true
    }

    fn apply(&self, input: &TechniqueInput) -> anyhow::Result<Outcome>;
}

/// 注册表中的技术句柄
pub type TechniqueRef = Arc<dyn Technique>;

pub(crate) fn is_global(t: &TechniqueRef) -> bool {
    t.scope() == TechniqueScope::Global
}

/// 当前文件适用的按文件技术
pub(crate) fn applicable<'a>(techniques: &'a [TechniqueRef], rel_path: &'a str) -> impl Iterator<Item = &'a TechniqueRef> + 'a {
    techniques.iter().filter(move |t| !is_global(t) && t.matches(rel_path))
}
