//! Background tick task.
//!
//! Drives [`TesselNode::tick`] at the configured interval until shut down.

use tokio::sync::mpsc;
use tracing::debug;

use crate::node::TesselNode;
use crate::transport::ClusterTransport;

/// Ticks `node` every `tick_interval_ms` until `shutdown_rx` fires or its
/// sender is dropped.
pub async fn tick_task<C: ClusterTransport>(node: TesselNode<C>, mut shutdown_rx: mpsc::Receiver<()>) {
    let mut tick_interval = tokio::time::interval(tokio::time::Duration::from_millis(
        node.config().tick_interval_ms,
    ));
    tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!(node = %node.node_id(), "tick task shutting down");
                break;
            }
            _ = tick_interval.tick() => {
                node.tick().await;
            }
        }
    }
}
