pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 設定ファイルのパスを直接指定する環境変数
pub const CONFIG_PATH_ENV: &str = "FLEETNODE_CONFIG_PATH";

const CANDIDATES: [&str; 2] = ["fleetnode.local.yaml", "fleetnode.yaml"];

/// fleetnode の設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// ノードを作成するデフォルトゾーン
    pub zone: String,
    /// `ls` / `down` で追加で参照するゾーン
    pub zones: Vec<String>,
    pub naming: NamingSettings,
    pub timeouts: TimeoutSettings,
    pub poll: PollSettings,
    pub retry: RetrySettings,
    /// 同時に作成・削除するノード数の上限
    pub max_concurrency: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            zone: "tk1a".to_string(),
            zones: Vec::new(),
            naming: NamingSettings::default(),
            timeouts: TimeoutSettings::default(),
            poll: PollSettings::default(),
            retry: RetrySettings::default(),
            max_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingSettings {
    pub prefix: String,
}

impl Default for NamingSettings {
    fn default() -> Self {
        Self {
            prefix: "fleet".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub node_running_secs: u64,
    pub node_terminated_secs: u64,
    pub image_available_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            node_running_secs: 1200,
            node_terminated_secs: 30,
            image_available_secs: 1200,
        }
    }
}

impl TimeoutSettings {
    pub fn node_running(&self) -> Duration {
        Duration::from_secs(self.node_running_secs)
    }

    pub fn node_terminated(&self) -> Duration {
        Duration::from_secs(self.node_terminated_secs)
    }

    pub fn image_available(&self) -> Duration {
        Duration::from_secs(self.image_available_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub initial_period_ms: u64,
    pub max_period_ms: u64,
    pub multiplier: f64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            initial_period_ms: 50,
            max_period_ms: 1000,
            multiplier: 1.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl Settings {
    /// YAML 文字列から読み込む
    pub fn from_yaml(yaml: &str, path: &Path) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml, path)
    }

    /// 設定ファイルを探して読み込む。見つからなければデフォルト値
    pub fn load() -> Result<(Self, Option<PathBuf>)> {
        match find_config_file()? {
            Some(path) => Ok((Self::from_file(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    /// 参照するすべてのゾーン (デフォルトゾーンが先頭)
    pub fn all_zones(&self) -> Vec<String> {
        let mut zones = vec![self.zone.clone()];
        for zone in &self.zones {
            if !zones.contains(zone) {
                zones.push(zone.clone());
            }
        }
        zones
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.zone.is_empty() {
            return invalid("zone が空です");
        }
        if self.naming.prefix.is_empty() {
            return invalid("naming.prefix が空です");
        }
        if self.max_concurrency == 0 {
            return invalid("max_concurrency は 1 以上にしてください");
        }

        let t = &self.timeouts;
        if t.node_running_secs == 0 || t.node_terminated_secs == 0 || t.image_available_secs == 0 {
            return invalid("timeouts は 0 秒にできません");
        }

        let p = &self.poll;
        if p.initial_period_ms == 0 || p.max_period_ms == 0 {
            return invalid("poll の間隔は 0 にできません");
        }
        if p.initial_period_ms > p.max_period_ms {
            return invalid("poll.initial_period_ms が poll.max_period_ms を超えています");
        }
        if p.multiplier < 1.0 {
            return invalid("poll.multiplier は 1.0 以上にしてください");
        }

        let r = &self.retry;
        if r.max_attempts == 0 {
            return invalid("retry.max_attempts は 1 以上にしてください");
        }
        if r.initial_delay_ms == 0 || r.max_delay_ms == 0 {
            return invalid("retry の待機時間は 0 にできません");
        }
        if r.backoff_multiplier < 1.0 {
            return invalid("retry.backoff_multiplier は 1.0 以上にしてください");
        }

        Ok(())
    }
}

/// グローバル設定ファイルのパス (~/.config/fleetnode/fleetnode.yaml)
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("fleetnode").join("fleetnode.yaml"))
}

/// 設定ファイルを探す
///
/// 以下の優先順位で検索:
/// 1. 環境変数 FLEETNODE_CONFIG_PATH (直接パス指定、存在しなければエラー)
/// 2. カレントディレクトリ: fleetnode.local.yaml, fleetnode.yaml
/// 3. ./.fleetnode/fleetnode.yaml
/// 4. ~/.config/fleetnode/fleetnode.yaml (グローバル設定)
pub fn find_config_file() -> Result<Option<PathBuf>> {
    // 1. 環境変数で直接指定
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(Some(path));
        }
        return Err(ConfigError::ConfigFileNotFound(path));
    }

    let current_dir = std::env::current_dir()?;

    // 2. カレントディレクトリで検索
    for filename in &CANDIDATES {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(Some(path));
        }
    }

    // 3. ./.fleetnode/ ディレクトリ
    let local = current_dir.join(".fleetnode").join("fleetnode.yaml");
    if local.exists() {
        return Ok(Some(local));
    }

    // 4. グローバル設定
    Ok(global_config_path().filter(|path| path.exists()))
}
