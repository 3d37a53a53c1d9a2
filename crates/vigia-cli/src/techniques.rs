//! 内置示例技术
//!
//! - long-lines：超过上限的行
//! - todo-markers：TODO / FIXME / XXX 注释（正则）
//! - forbidden-tokens：禁用的调用（Aho-Corasick 多模式匹配）
//! - file-census：全局技术，按扩展名统计文件数
use std::collections::BTreeMap;
use std::sync::Arc;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use anyhow::{Context, Result};
use regex::Regex;
use vigia_core::{Occurrence, Outcome, Severity, Technique, TechniqueInput, TechniqueRef, TechniqueScope};

pub const LONG_LINE_LIMIT: usize = 120;

/// 默认禁用的调用
const FORBIDDEN: &[&str] = &["eval(", "innerHTML", "document.write(", "console.log("];

/// 这些扩展名视为二进制，不参与按文件分析
const SKIPPED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "ico", "woff", "woff2", "zip", "gz", "lock"];

fn is_text(rel_path: &str) -> bool {
    match rel_path.rsplit_once('.') {
        Some((_, ext)) => !SKIPPED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
        None => true,
    }
}

fn content_of<'a>(input: &'a TechniqueInput) -> &'a str {
    input.content.as_deref().unwrap_or("")
}

pub struct LongLines {
    limit: usize,
}

impl Technique for LongLines {
    fn name(&self) -> &str {
        "long-lines"
    }
    fn matches(&self, rel_path: &str) -> bool {
        is_text(rel_path)
    }
    fn apply(&self, input: &TechniqueInput) -> Result<Outcome> {
        let found: Vec<Occurrence> = content_of(input)
            .lines()
            .enumerate()
            .filter(|(_, l)| l.chars().count() > self.limit)
            .map(|(i, l)| {
                Occurrence::new(
                    "long-line",
                    Severity::Info,
                    format!("line has {} characters (limit {})", l.chars().count(), self.limit),
                    self.name(),
                )
                .at(input.rel_path.clone(), Some(i as u32 + 1))
            })
            .collect();
        Ok(found.into())
    }
}

pub struct TodoMarkers {
    re: Regex,
}

impl TodoMarkers {
    pub fn new() -> Result<Self> {
        let re = Regex::new(r"(?://|#|/\*|--)\s*(TODO|FIXME|XXX)\b:?\s*(.*)").context("compile todo pattern")?;
        Ok(Self { re })
    }
}

impl Technique for TodoMarkers {
    fn name(&self) -> &str {
        "todo-markers"
    }
    fn matches(&self, rel_path: &str) -> bool {
        is_text(rel_path)
    }
    fn apply(&self, input: &TechniqueInput) -> Result<Outcome> {
        let mut found = Vec::new();
        for (i, line) in content_of(input).lines().enumerate() {
            let Some(caps) = self.re.captures(line) else { continue };
            let tag = caps.get(1).map_or("TODO", |m| m.as_str());
            let text = caps.get(2).map_or("", |m| m.as_str().trim());
            let severity = if tag == "FIXME" { Severity::Warning } else { Severity::Info };
            found.push(
                Occurrence::new("todo-marker", severity, format!("{tag}: {text}"), self.name())
                    .at(input.rel_path.clone(), Some(i as u32 + 1)),
            );
        }
        Ok(found.into())
    }
}

pub struct ForbiddenTokens {
    ac: AhoCorasick,
    tokens: Vec<String>,
}

impl ForbiddenTokens {
    pub fn new<I, S>(tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        let ac = AhoCorasickBuilder::new()
            .match_kind(MatchKind::LeftmostLongest)
            .build(&tokens)
            .context("build forbidden token automaton")?;
        Ok(Self { ac, tokens })
    }
}

impl Technique for ForbiddenTokens {
    fn name(&self) -> &str {
        "forbidden-tokens"
    }
    fn matches(&self, rel_path: &str) -> bool {
        is_text(rel_path)
    }
    fn apply(&self, input: &TechniqueInput) -> Result<Outcome> {
        let mut found = Vec::new();
        for (i, line) in content_of(input).lines().enumerate() {
            for m in self.ac.find_iter(line) {
                let token = &self.tokens[m.pattern().as_usize()];
                found.push(
                    Occurrence::new("forbidden-token", Severity::Error, format!("use of `{token}`"), self.name())
                        .at(input.rel_path.clone(), Some(i as u32 + 1)),
                );
            }
        }
        Ok(found.into())
    }
}

/// 全局技术：整个文件集合只运行一次
pub struct FileCensus;

impl Technique for FileCensus {
    fn name(&self) -> &str {
        "file-census"
    }
    fn scope(&self) -> TechniqueScope {
        TechniqueScope::Global
    }
    fn apply(&self, input: &TechniqueInput) -> Result<Outcome> {
        let mut by_ext: BTreeMap<&str, usize> = BTreeMap::new();
        for f in input.context.files.iter() {
            let ext = f.rel_path.rsplit_once('.').map_or("(none)", |(_, e)| e);
            *by_ext.entry(ext).or_default() += 1;
        }
        let breakdown: Vec<String> = by_ext.iter().map(|(e, n)| format!("{e}={n}")).collect();
        Ok(Occurrence::new(
            "file-census",
            Severity::Info,
            format!("{} files ({})", input.context.files.len(), breakdown.join(", ")),
            self.name(),
        )
        .into())
    }
}

/// 默认技术集合
pub fn builtin() -> Result<Vec<TechniqueRef>> {
    let techniques: Vec<TechniqueRef> = vec![
        Arc::new(LongLines { limit: LONG_LINE_LIMIT }),
        Arc::new(TodoMarkers::new()?),
        Arc::new(ForbiddenTokens::new(FORBIDDEN.iter().copied())?),
        Arc::new(FileCensus),
    ];
    Ok(techniques)
}
