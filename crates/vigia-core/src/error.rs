//! 引擎自身的错误类型
//!
//! 技术（Technique）失败、超时、缓存损坏、工作线程失联都不会走这里：
//! 它们在引擎内部被转换为 Occurrence 或计数器。这里只保留调用方误用引擎
//! （无法回退到默认值的配置）以及落盘失败两类。
use std::path::PathBuf;

/// 公共入口允许返回的唯一错误
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid configuration `{field}`: {message}")]
    InvalidConfig { field: &'static str, message: String },

    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// 状态文件 / 历史文件读写失败（只记录日志，不向上传播）
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialize {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("deserialize {path}: {source}")]
    Deserialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
