//! Readiness endpoint of the tunnel controller.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

use crate::constants::READINESS_PORT;

use super::TunnelController;

pub fn router(controller: Arc<TunnelController>) -> Router {
    Router::new()
        .route("/readyz", get(readyz))
        .with_state(controller)
}

/// Serves `/readyz` on the readiness port: 200 while every registered peer
/// is fully materialised, 503 with the first failing peer otherwise.
pub async fn serve(controller: Arc<TunnelController>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("::", READINESS_PORT)).await?;
    tracing::info!(port = READINESS_PORT, "serving tunnel readiness");
    axum::serve(listener, router(controller)).await
}

async fn readyz(State(controller): State<Arc<TunnelController>>) -> (StatusCode, String) {
    match controller.readiness().await {
        Ok(()) => (StatusCode::OK, "ok".to_string()),
        Err(message) => (StatusCode::SERVICE_UNAVAILABLE, message),
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt as _;

    use super::*;
    use crate::network::NetworkResult;
    use crate::tunnel::TunnelDevices;

    struct NoopDevices;

    #[async_trait::async_trait]
    impl TunnelDevices for NoopDevices {
        async fn delete_link(&self, _name: &str) -> NetworkResult<()> {
            Ok(())
        }

        async fn create_tunnel(
            &self,
            _name: &str,
            _local: Ipv6Addr,
            _remote: Ipv6Addr,
        ) -> NetworkResult<()> {
            Ok(())
        }

        async fn replace_host_route(
            &self,
            _dst: ipnet::IpNet,
            _link_name: &str,
        ) -> NetworkResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn readyz_reflects_controller_state() {
        let controller = TunnelController::new(Arc::new(NoopDevices) as _);
        let app = router(Arc::clone(&controller));

        let response = app
            .clone()
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let local: Ipv6Addr = "fd8f:6d53:b97a:1::b:0".parse().unwrap();
        let remote: Ipv6Addr = "fd8f:6d53:b97a:1::a:1".parse().unwrap();
        let task = controller
            .handle_datagram(local, remote, b"10.0.0.5")
            .await
            .unwrap();
        task.await.unwrap();

        let response = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
