use crate::context::Context;
use colored::Colorize;
use fleetnode_compute::CancellationToken;

pub async fn handle(
    ctx: &Context,
    group: &str,
    zone: Option<&str>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    ctx.service.settings().naming.validate_group(group)?;

    println!("{}", "ノードを削除中...".yellow());
    ctx.print_config_source();
    println!("グループ: {}", group.cyan());

    let result = ctx
        .service
        .destroy_nodes_matching(
            |node| {
                node.group.as_deref() == Some(group)
                    && zone.is_none_or(|zone| node.reference.scope == zone)
            },
            cancel,
        )
        .await?;

    if result.destroyed.is_empty() && result.failed.is_empty() {
        println!("  ℹ 対象のノードはありません");
        return Ok(());
    }

    println!();
    for node in &result.destroyed {
        println!("  ✓ {} を削除しました", node.name.cyan());
    }
    for (node, error) in &result.failed {
        println!("  ✗ {}: {}", node.name, error.red());
    }
    for resource in &result.orphans_deleted {
        println!("  ✓ {} {} を削除しました", resource.kind, resource.name.cyan());
    }
    for failure in &result.reconcile_failures {
        println!("  ⚠ 削除エラー: {}", failure);
    }

    println!();
    if !result.is_success() {
        anyhow::bail!("一部のリソースを削除できませんでした");
    }
    println!(
        "{}",
        format!("✓ 完了 ({:.1}秒)", result.duration_ms as f64 / 1000.0).green()
    );
    Ok(())
}
