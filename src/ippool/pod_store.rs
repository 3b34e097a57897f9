//! Pool storage backed by annotations on the peer pods.
//!
//! Peers discover each other through a label selector and publish their
//! reservation state as two annotations on their own pod. A `used`
//! annotation supersedes a `reserved` one.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;

use super::{IpPoolManager, PoolUsage, StoreError};

pub const ANNOTATION_RESERVED: &str = "bonding.havpn.dev/reserved";
pub const ANNOTATION_USED: &str = "bonding.havpn.dev/used";

pub struct PodAnnotationStore {
    pods: Api<Pod>,
    label_selector: String,
}

impl PodAnnotationStore {
    /// Connects with in-cluster credentials and scopes all operations to the
    /// given namespace and label selector.
    pub async fn new(namespace: &str, label_selector: &str) -> Result<Self, kube::Error> {
        let client = Client::try_default().await?;
        Ok(Self {
            pods: Api::namespaced(client, namespace),
            label_selector: label_selector.to_string(),
        })
    }
}

#[async_trait]
impl IpPoolManager for PodAnnotationStore {
    async fn usage_lookup(&self, own_name: &str) -> Result<PoolUsage, StoreError> {
        let params = ListParams::default().labels(&self.label_selector);
        let pod_list = self.pods.list(&params).await?;

        let mut usage = PoolUsage::default();
        for pod in pod_list.items {
            let Some(annotations) = pod.metadata.annotations.as_ref() else {
                continue;
            };
            let (ip, used) = match annotations.get(ANNOTATION_USED) {
                Some(ip) => (ip, true),
                None => match annotations.get(ANNOTATION_RESERVED) {
                    Some(ip) => (ip, false),
                    None => continue,
                },
            };
            if ip.is_empty() {
                continue;
            }
            if pod.metadata.name.as_deref() == Some(own_name) {
                usage.own_ip = Some(ip.clone());
                usage.own_used = used;
            } else if used {
                usage.foreign_used.insert(ip.clone());
            } else {
                usage.foreign_reserved.insert(ip.clone());
            }
        }
        Ok(usage)
    }

    async fn set_ip_address(&self, own_name: &str, ip: &str, used: bool) -> Result<(), StoreError> {
        // Surface a missing pod as a clean error before patching.
        self.pods.get(own_name).await?;

        let key = if used { ANNOTATION_USED } else { ANNOTATION_RESERVED };
        let patch = serde_json::json!({
            "metadata": {
                "annotations": { key: ip }
            }
        });
        self.pods
            .patch(own_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
