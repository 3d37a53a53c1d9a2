//! 持久化原语：JSON 读 / 写
//!
//! - 读：文件缺失返回 None；损坏返回错误，调用方回退到空状态并通过 RunLog 上报
//! - 写：先写同目录临时文件再 rename，避免中途失败留下半截文件
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::PersistError;

/// 缺失返回 Ok(None)；不可读或损坏返回错误，由调用方决定如何上报
pub(crate) fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(PersistError::Io { path: path.to_path_buf(), source }),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| PersistError::Deserialize { path: path.to_path_buf(), source })
}

pub(crate) fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let io_err = |source| PersistError::Io { path: path.to_path_buf(), source };
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
    }
    let body = serde_json::to_vec_pretty(value)
        .map_err(|source| PersistError::Serialize { path: path.to_path_buf(), source })?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp_name);
    {
        let mut f = fs::File::create(&tmp).map_err(io_err)?;
        f.write_all(&body).map_err(io_err)?;
        f.sync_all().map_err(io_err)?;
    }
    fs::rename(&tmp, path).map_err(io_err)
}
