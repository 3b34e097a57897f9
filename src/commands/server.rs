//! Seed-server entry point: NAT rules plus the value object the OpenVPN
//! launcher renders into its config.

use crate::config::ServerConfig;
use crate::network::firewall;
use crate::openvpn::values::build_server_values;

use super::CommandError;

pub async fn run(cfg: ServerConfig) -> Result<(), CommandError> {
    if !cfg.is_ha {
        firewall::set_server_rules(
            &cfg.shoot_pod_networks,
            &cfg.shoot_service_networks,
            &cfg.shoot_node_networks,
        )
        .await?;
    }

    let values = build_server_values(&cfg)?;
    tracing::info!(values = %serde_json::to_string(&values)?, "server values assembled");
    Ok(())
}
