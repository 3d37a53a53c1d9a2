//! 内容哈希（缺省 xxh3，可切换 SHA-256）
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::Path;
use xxhash_rust::xxh3::xxh3_64;

use crate::types::FileEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashAlgorithm {
    #[default]
    Xxh3,
    Sha256,
}

impl HashAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Xxh3 => "xxh3",
            HashAlgorithm::Sha256 => "sha256",
        }
    }
}

/// 计算内容哈希，格式为 `<算法>:<十六进制>`
pub fn hash_bytes(algo: HashAlgorithm, data: &[u8]) -> String {
    match algo {
        HashAlgorithm::Xxh3 => format!("xxh3:{:016x}", xxh3_64(data)),
        HashAlgorithm::Sha256 => {
            let digest = Sha256::digest(data);
            let mut out = String::with_capacity(7 + digest.len() * 2);
            out.push_str("sha256:");
            for b in digest.iter() {
                let _ = write!(out, "{b:02x}");
            }
            out
        }
    }
}

/// 文件的内容哈希：优先使用已加载的文本；否则回读磁盘。
/// 回读失败返回 None（该文件本次不参与增量复用），从不中断运行。
pub(crate) fn hash_file(algo: HashAlgorithm, file: &FileEntry) -> Option<String> {
    match &file.content {
        Some(text) => Some(hash_bytes(algo, text.as_bytes())),
        None => read_and_hash(algo, &file.full_path),
    }
}

fn read_and_hash(algo: HashAlgorithm, path: &Path) -> Option<String> {
    match std::fs::read(path) {
        Ok(bytes) => Some(hash_bytes(algo, &bytes)),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "content unavailable, skipping cache");
            None
        }
    }
}
