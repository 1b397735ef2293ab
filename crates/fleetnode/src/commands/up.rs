use crate::context::Context;
use colored::Colorize;
use fleetnode_compute::{CancellationToken, ComputeError, NodeTemplate, ScopedName};
use std::path::PathBuf;

pub struct UpArgs {
    pub group: String,
    pub count: usize,
    pub zone: Option<String>,
    pub plan: Option<String>,
    pub image: Option<String>,
    pub ports: Vec<u16>,
}

pub async fn handle(ctx: &Context, args: UpArgs, cancel: &CancellationToken) -> anyhow::Result<()> {
    ctx.service.settings().naming.validate_group(&args.group)?;
    if args.count == 0 {
        anyhow::bail!("--count は 1 以上を指定してください");
    }

    let zone = ctx.zone(args.zone.as_deref()).to_string();

    println!("{}", "ノードを作成中...".yellow());
    ctx.print_config_source();
    println!(
        "グループ: {}  ゾーン: {}  台数: {}",
        args.group.cyan(),
        zone.cyan(),
        args.count
    );

    // usacloud の認証確認
    let auth = ctx.provider.check_auth().await?;
    if let Some(account) = auth.account {
        println!("アカウント: {}", account.name.cyan());
    }

    let mut template = NodeTemplate::new(zone.clone()).with_inbound_ports(args.ports);
    if let Some(plan) = args.plan {
        template = template.with_plan(plan);
    }
    if let Some(image) = args.image {
        template = template.with_image(image);
    }

    let result = ctx
        .service
        .create_nodes_in_group(&args.group, args.count, &template, cancel)
        .await;

    // ノードの作成に失敗しても、生成した鍵は保存しておく
    if let Some(path) = save_private_key(ctx, &zone, &args.group)? {
        println!("秘密鍵を保存しました: {}", path.display().to_string().cyan());
    }

    println!();
    match result {
        Ok(nodes) => {
            println!("{}", format!("ノード一覧 ({} 台):", nodes.len()).bold());
            for node in &nodes {
                super::print_node(node);
            }
            println!();
            println!("{}", "✓ 完了".green());
            Ok(())
        }
        Err(ComputeError::RunNodes(failure)) => {
            for node in &failure.good {
                super::print_node(node);
            }
            for (name, error) in &failure.failed {
                println!("  ✗ {}: {}", name, error.to_string().red());
            }
            anyhow::bail!(
                "{} 台中 {} 台のノード作成に失敗しました",
                failure.requested,
                failure.failed.len()
            )
        }
        Err(e) => Err(e.into()),
    }
}

/// このプロセスで生成した鍵の秘密鍵を ~/.config/fleetnode/keys/<zone>/ に保存
fn save_private_key(ctx: &Context, zone: &str, group: &str) -> anyhow::Result<Option<PathBuf>> {
    let name = ctx.service.settings().naming.shared_name_for_group(group);
    let Some(key_pair) = ctx
        .service
        .caches()
        .key_pairs
        .get(&ScopedName::new(zone, name.as_str()))
    else {
        return Ok(None);
    };
    let Some(private_key) = key_pair.private_key else {
        return Ok(None);
    };

    let dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("設定ディレクトリが見つかりません"))?
        .join("fleetnode")
        .join("keys")
        .join(zone);
    std::fs::create_dir_all(&dir)?;

    let path = dir.join(format!("{}.pem", key_pair.name));
    std::fs::write(&path, private_key)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(path = %path.display(), "private key saved");
    Ok(Some(path))
}
