pub mod down;
pub mod ls;
pub mod up;
pub mod wait;

use colored::Colorize;
use fleetnode_compute::{NodeMetadata, NodeStatus};

fn colored_status(status: NodeStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        NodeStatus::Running => text.green(),
        NodeStatus::Pending | NodeStatus::Stopping => text.yellow(),
        NodeStatus::Error => text.red(),
        _ => text.dimmed(),
    }
}

/// ノード 1 台分の行を表示
pub fn print_node(node: &NodeMetadata) {
    println!(
        "  • {} [{}] {} group={} ip={}",
        node.name.cyan(),
        node.reference,
        colored_status(node.status),
        node.group.as_deref().unwrap_or("-"),
        node.public_address.as_deref().unwrap_or("-"),
    );
}
