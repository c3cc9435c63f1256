use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::ProvisionError;

/// Everything the ISO generator needs to know about one VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsoRequest {
    pub vm_uuid: String,
    pub ip: String,
    pub gateway: String,
    pub vm_name: String,
    pub profile_id: Option<String>,
    pub playbook_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IsoPayload {
    pub files: BTreeMap<String, Vec<u8>>,
}

#[async_trait]
pub trait IsoProvisioner: Send + Sync {
    async fn generate_iso_payload(&self, request: &IsoRequest) -> Result<IsoPayload, ProvisionError>;
}

/// Gateway for a bot address: same /24, host `.1`.
pub fn gateway_for(ip: &str) -> Option<String> {
    let addr: Ipv4Addr = ip.trim().parse().ok()?;
    let [a, b, c, _] = addr.octets();
    Some(Ipv4Addr::new(a, b, c, 1).to_string())
}

/// Builds a NoCloud-style seed: `meta-data`, `user-data`, `network-config`.
#[derive(Debug, Clone)]
pub struct CloudInitPayloadBuilder {
    dns: Vec<String>,
}

impl CloudInitPayloadBuilder {
    pub fn new(dns: Vec<String>) -> Self {
        Self { dns }
    }
}

impl Default for CloudInitPayloadBuilder {
    fn default() -> Self {
        Self::new(vec!["1.1.1.1".into(), "8.8.8.8".into()])
    }
}

#[async_trait]
impl IsoProvisioner for CloudInitPayloadBuilder {
    async fn generate_iso_payload(&self, request: &IsoRequest) -> Result<IsoPayload, ProvisionError> {
        if request.vm_uuid.is_empty() || request.ip.is_empty() {
            return Err(ProvisionError::Iso("uuid and ip are required".into()));
        }

        let meta = json!({
            "instance-id": request.vm_uuid,
            "local-hostname": request.vm_name,
        });
        let user = json!({
            "hostname": request.vm_name,
            "profile": request.profile_id,
            "playbook": request.playbook_id,
        });
        let network = json!({
            "version": 2,
            "ethernets": {
                "eth0": {
                    "addresses": [format!("{}/24", request.ip)],
                    "gateway4": request.gateway,
                    "nameservers": { "addresses": self.dns },
                }
            }
        });

        let render = |value: &serde_json::Value| {
            serde_json::to_vec_pretty(value).map_err(|e| ProvisionError::Iso(e.to_string()))
        };

        let mut files = BTreeMap::new();
        files.insert("meta-data".to_string(), render(&meta)?);
        files.insert("user-data".to_string(), render(&user)?);
        files.insert("network-config".to_string(), render(&network)?);
        Ok(IsoPayload { files })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_keeps_the_first_three_octets() {
        assert_eq!(gateway_for("10.20.7.42").as_deref(), Some("10.20.7.1"));
        assert_eq!(gateway_for("not-an-ip"), None);
    }

    #[tokio::test]
    async fn payload_contains_the_seed_files() {
        let request = IsoRequest {
            vm_uuid: "6f1c".into(),
            ip: "10.20.7.42".into(),
            gateway: "10.20.7.1".into(),
            vm_name: "bot-40".into(),
            profile_id: Some("farm".into()),
            playbook_id: None,
        };
        let payload = CloudInitPayloadBuilder::default()
            .generate_iso_payload(&request)
            .await
            .unwrap();
        let names: Vec<&str> = payload.files.keys().map(String::as_str).collect();
        assert_eq!(names, ["meta-data", "network-config", "user-data"]);
        let network = String::from_utf8(payload.files["network-config"].clone()).unwrap();
        assert!(network.contains("10.20.7.42/24"));
        assert!(network.contains("10.20.7.1"));
    }

    #[tokio::test]
    async fn missing_identity_is_rejected() {
        let request = IsoRequest {
            vm_uuid: String::new(),
            ip: "10.0.0.2".into(),
            gateway: "10.0.0.1".into(),
            vm_name: "x".into(),
            profile_id: None,
            playbook_id: None,
        };
        assert!(CloudInitPayloadBuilder::default().generate_iso_payload(&request).await.is_err());
    }
}
