//! Wires the Command Router between the transports' inbound command
//! queue and their per-origin response queues.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use valvelink_core::message::{Frame, Origin, RespFrame};
use valvelink_services::CommandRouter;

pub const COMMAND_QUEUE_DEPTH: usize = 16;
pub const RESPONSE_QUEUE_DEPTH: usize = 16;

/// Spawn the router task: pulls frames off `cmd_rx`, dispatches them
/// through `router`, and forwards the response to the queue matching its
/// origin. Exits when `shutdown` fires or the command channel closes.
pub fn spawn_router_task(
    router: Arc<CommandRouter>,
    mut cmd_rx: mpsc::Receiver<Frame>,
    ble_resp_tx: mpsc::Sender<RespFrame>,
    mqtt_resp_tx: mpsc::Sender<RespFrame>,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    debug!("command router task shutting down");
                    return;
                }
                frame = cmd_rx.recv() => {
                    let Some(frame) = frame else { return };
                    let origin = frame.origin;
                    let resp = router.dispatch(frame);
                    let tx = match origin {
                        Origin::Ble => &ble_resp_tx,
                        Origin::Mqtt => &mqtt_resp_tx,
                    };
                    if tx.send(resp).await.is_err() {
                        debug!(?origin, "response queue closed, dropping response");
                    }
                }
            }
        }
    })
}
