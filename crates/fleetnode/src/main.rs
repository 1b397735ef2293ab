mod commands;
mod context;

use clap::{Parser, Subcommand};
use fleetnode_compute::{CancellationToken, NodeStatus};

#[derive(Parser)]
#[command(name = "fleetnode")]
#[command(about = "グループ単位でクラウドノードを作成・削除する", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// グループにノードを作成して起動を待つ
    Up {
        /// グループ名 (英小文字・数字・'-')
        group: String,
        /// 作成するノード数
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,
        /// ゾーン (省略時は設定ファイルの zone)
        #[arg(short, long, env = "FLEETNODE_ZONE")]
        zone: Option<String>,
        /// プラン (例: 2core-4gb)
        #[arg(short, long)]
        plan: Option<String>,
        /// OS イメージ (例: ubuntu)
        #[arg(short, long)]
        image: Option<String>,
        /// 許可する受信 TCP ポート
        #[arg(long = "port", default_values_t = [22u16])]
        ports: Vec<u16>,
    },
    /// グループのノードを削除し、不要になった鍵とパケットフィルタを片付ける
    Down {
        /// グループ名
        group: String,
        /// ゾーン (省略時は全ゾーン)
        #[arg(short, long, env = "FLEETNODE_ZONE")]
        zone: Option<String>,
    },
    /// ノードが指定の状態になるまで待つ
    Wait {
        /// ノード (サーバー) ID
        id: String,
        /// ゾーン (省略時は設定ファイルの zone)
        #[arg(short, long, env = "FLEETNODE_ZONE")]
        zone: Option<String>,
        /// 待つ状態 (running, stopped, terminated)
        #[arg(short, long, default_value = "running", value_parser = parse_status)]
        status: NodeStatus,
    },
    /// ノードの一覧を表示
    Ls {
        /// グループで絞り込む
        #[arg(short, long)]
        group: Option<String>,
    },
    /// バージョン情報を表示
    Version,
}

fn parse_status(s: &str) -> Result<NodeStatus, String> {
    NodeStatus::parse(s).ok_or_else(|| format!("unknown status '{}'", s))
}

/// Ctrl-C で待機中の処理をキャンセルする
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, cancelling");
            on_signal.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Versionコマンドは設定ファイル不要
    if matches!(cli.command, Commands::Version) {
        println!("fleetnode {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // コマンドラインで指定されたゾーンも一覧・削除の対象にする
    let explicit_zone = match &cli.command {
        Commands::Up { zone, .. } | Commands::Down { zone, .. } | Commands::Wait { zone, .. } => {
            zone.clone()
        }
        _ => None,
    };
    let ctx = context::Context::load(explicit_zone.as_deref())?;
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Commands::Up {
            group,
            count,
            zone,
            plan,
            image,
            ports,
        } => {
            commands::up::handle(
                &ctx,
                commands::up::UpArgs {
                    group,
                    count,
                    zone,
                    plan,
                    image,
                    ports,
                },
                &cancel,
            )
            .await?;
        }
        Commands::Down { group, zone } => {
            commands::down::handle(&ctx, &group, zone.as_deref(), &cancel).await?;
        }
        Commands::Wait { id, zone, status } => {
            commands::wait::handle(&ctx, &id, zone.as_deref(), status, &cancel).await?;
        }
        Commands::Ls { group } => {
            commands::ls::handle(&ctx, group.as_deref()).await?;
        }
        Commands::Version => {
            unreachable!("Version is handled before config loading");
        }
    }

    Ok(())
}
