//! Shoot-side tunnel controller entry point: the UDP accept loop and the
//! readiness endpoint run side by side; either failing ends the process.

use std::sync::Arc;

use crate::network::netlink::NetlinkHandle;
use crate::tunnel::{readiness, TunnelController, TunnelDevices};

use super::CommandError;

pub async fn run() -> Result<(), CommandError> {
    let netlink = Arc::new(NetlinkHandle::new()?);
    let devices: Arc<dyn TunnelDevices> = Arc::clone(&netlink) as _;
    let controller = TunnelController::new(devices);

    tokio::select! {
        result = Arc::clone(&controller).run(netlink) => result?,
        result = readiness::serve(controller) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("tunnel controller shutting down"),
    }
    Ok(())
}
