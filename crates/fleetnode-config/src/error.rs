use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("FLEETNODE_CONFIG_PATH で指定された設定ファイルが見つかりません: {0}")]
    ConfigFileNotFound(PathBuf),

    #[error("設定ファイルの解析に失敗しました ({path}): {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("不正な設定値: {0}")]
    Invalid(String),

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
