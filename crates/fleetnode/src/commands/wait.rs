use crate::context::Context;
use colored::Colorize;
use fleetnode_compute::{CancellationToken, NodeStatus, ResourceRef};

pub async fn handle(
    ctx: &Context,
    id: &str,
    zone: Option<&str>,
    status: NodeStatus,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let reference = ResourceRef::new(ctx.zone(zone), id);
    println!(
        "{} が {} になるのを待っています...",
        reference.to_string().cyan(),
        status.to_string().bold()
    );

    let node = ctx
        .service
        .wait_for_node(&reference, status, None, cancel)
        .await?;

    println!(
        "  ✓ {} ({})",
        node.status.to_string().green(),
        node.observed_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    Ok(())
}
