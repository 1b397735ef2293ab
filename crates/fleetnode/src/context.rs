//! 設定の読み込みとプロバイダの組み立て

use colored::Colorize;
use fleetnode_compute::{
    ComputeService, ComputeSettings, GroupNamingConvention, PollConfig, RetryConfig, Timeouts,
};
use fleetnode_compute_sakura::SakuraCloudProvider;
use fleetnode_config::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub struct Context {
    pub settings: Settings,
    pub config_path: Option<PathBuf>,
    pub provider: Arc<SakuraCloudProvider>,
    pub service: ComputeService,
}

impl Context {
    /// `explicit_zone` is a zone named on the command line; it is managed
    /// even when the settings do not list it.
    pub fn load(explicit_zone: Option<&str>) -> anyhow::Result<Self> {
        let (settings, config_path) = Settings::load()?;
        tracing::debug!(?config_path, zone = %settings.zone, "settings loaded");

        let compute = compute_settings(&settings);
        let provider = Arc::new(
            SakuraCloudProvider::new(provider_zones(&settings, explicit_zone))
                .with_naming(compute.naming.clone()),
        );
        let service = ComputeService::new(provider.clone(), compute);

        Ok(Self {
            settings,
            config_path,
            provider,
            service,
        })
    }

    /// 明示されたゾーン、なければ設定ファイルのゾーン
    pub fn zone<'a>(&'a self, zone: Option<&'a str>) -> &'a str {
        zone.unwrap_or(&self.settings.zone)
    }

    pub fn print_config_source(&self) {
        match &self.config_path {
            Some(path) => println!("設定ファイル: {}", path.display().to_string().cyan()),
            None => println!("{}", "設定ファイルなし (デフォルト値を使用)".dimmed()),
        }
    }
}

/// 設定ファイルのゾーンに、コマンドラインで指定されたゾーンを加える
pub fn provider_zones(settings: &Settings, explicit_zone: Option<&str>) -> Vec<String> {
    let mut zones = settings.all_zones();
    if let Some(zone) = explicit_zone {
        if !zones.iter().any(|z| z == zone) {
            zones.push(zone.to_string());
        }
    }
    zones
}

/// 設定ファイルの値をエンジンの設定に変換
pub fn compute_settings(settings: &Settings) -> ComputeSettings {
    let t = &settings.timeouts;
    let p = &settings.poll;
    let r = &settings.retry;

    ComputeSettings {
        timeouts: Timeouts {
            node_running: t.node_running(),
            node_terminated: t.node_terminated(),
            image_available: t.image_available(),
        },
        poll: PollConfig {
            initial_period: Duration::from_millis(p.initial_period_ms),
            max_period: Duration::from_millis(p.max_period_ms),
            multiplier: p.multiplier,
            ..PollConfig::default()
        },
        retry: RetryConfig {
            max_attempts: r.max_attempts,
            initial_delay: Duration::from_millis(r.initial_delay_ms),
            max_delay: Duration::from_millis(r.max_delay_ms),
            backoff_multiplier: r.backoff_multiplier,
        },
        naming: GroupNamingConvention::new(settings.naming.prefix.clone()),
        max_concurrency: settings.max_concurrency,
    }
}
