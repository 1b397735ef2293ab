use crate::context::Context;
use colored::Colorize;

pub async fn handle(ctx: &Context, group: Option<&str>) -> anyhow::Result<()> {
    let nodes = match group {
        Some(group) => ctx.service.list_nodes_in_group(group).await?,
        None => ctx.service.list_nodes().await?,
    };

    if nodes.is_empty() {
        println!("{}", "ノードはありません".dimmed());
        return Ok(());
    }

    println!("{}", format!("ノード一覧 ({} 台):", nodes.len()).bold());
    for node in &nodes {
        super::print_node(node);
    }

    Ok(())
}
