//! OpenVPN health endpoint entry point.

use crate::config::ServerConfig;
use crate::openvpn::health::{self, HealthConfig};

use super::CommandError;

pub async fn run(cfg: ServerConfig) -> Result<(), CommandError> {
    let health_cfg = HealthConfig::new(cfg.status_path, cfg.is_ha);
    tracing::info!(?health_cfg, "starting OpenVPN health server");
    health::serve(health_cfg).await?;
    Ok(())
}
