use std::net::Ipv4Addr;

use uuid::Uuid;

use crate::core::gateway::VmConfig;
use crate::errors::ProvisionError;
use crate::monitoring::FieldDiff;

/// Config keys an identity patch is allowed to touch. Anything else the
/// patcher returns is ignored.
pub const MUTABLE_CONFIG_KEYS: &[&str] = &[
    "name",
    "net0",
    "net1",
    "smbios1",
    "args",
    "vmgenid",
    "description",
    "tags",
];

/// Result of the external identity mapping for one VM.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityPatch {
    pub config: VmConfig,
    pub ip: Option<Ipv4Addr>,
    pub uuid: Option<String>,
}

/// Deterministic name/index -> network identity mapping. `index` is the
/// hypervisor VM id, unique per cluster. The real derivation of MACs,
/// serials and VNC ports lives outside this crate.
pub trait IdentityPatcher: Send + Sync {
    fn patch(&self, name: &str, index: u32, current: &VmConfig) -> Result<IdentityPatch, ProvisionError>;
}

/// Keys from `patch` that are mutable and differ from `current`.
pub fn changed_mutable_keys(current: &VmConfig, patch: &VmConfig) -> VmConfig {
    patch
        .iter()
        .filter(|(key, _)| MUTABLE_CONFIG_KEYS.contains(&key.as_str()))
        .filter(|(key, value)| current.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Fields compared between the pre-patch snapshot and the final config.
pub fn verified_fields(secondary_disk: &str) -> Vec<String> {
    ["name", "cores", "memory", "net0", secondary_disk, "args"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn diff_fields(before: &VmConfig, after: &VmConfig, fields: &[String]) -> Vec<FieldDiff> {
    fields
        .iter()
        .map(|field| FieldDiff {
            field: field.clone(),
            before: before.get(field).cloned(),
            after: after.get(field).cloned(),
        })
        .collect()
}

/// Stand-in mapping used by rehearsals: hosts numbered from a base address,
/// UUIDv5 of the name, MAC taken from the UUID bytes.
#[derive(Debug, Clone)]
pub struct SequentialIdentityPatcher {
    base: Ipv4Addr,
    bridge: String,
}

impl SequentialIdentityPatcher {
    pub fn new(base: Ipv4Addr, bridge: impl Into<String>) -> Self {
        Self {
            base,
            bridge: bridge.into(),
        }
    }

    fn address(&self, index: u32) -> Result<Ipv4Addr, ProvisionError> {
        let [a, b, c, _] = self.base.octets();
        let third = u32::from(c) + index / 250;
        let third = u8::try_from(third)
            .map_err(|_| ProvisionError::Identity(format!("index {index} overflows {}", self.base)))?;
        let fourth = (index % 250 + 2) as u8;
        Ok(Ipv4Addr::new(a, b, third, fourth))
    }
}

impl Default for SequentialIdentityPatcher {
    fn default() -> Self {
        Self::new(Ipv4Addr::new(10, 20, 0, 0), "vmbr0")
    }
}

impl IdentityPatcher for SequentialIdentityPatcher {
    fn patch(&self, name: &str, index: u32, current: &VmConfig) -> Result<IdentityPatch, ProvisionError> {
        let uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes());
        let bytes = uuid.as_bytes();
        let mac = format!(
            "BC:24:11:{:02X}:{:02X}:{:02X}",
            bytes[0], bytes[1], bytes[2]
        );
        let model = current
            .get("net0")
            .and_then(|net| net.split(['=', ',']).next())
            .filter(|m| !m.is_empty())
            .unwrap_or("virtio");
        let ip = self.address(index)?;

        let mut config = VmConfig::new();
        config.insert("name".into(), name.to_string());
        config.insert("net0".into(), format!("{model}={mac},bridge={}", self.bridge));
        config.insert("smbios1".into(), format!("uuid={uuid}"));
        config.insert("description".into(), format!("ip={ip}"));

        Ok(IdentityPatch {
            config,
            ip: Some(ip),
            uuid: Some(uuid.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(pairs: &[(&str, &str)]) -> VmConfig {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn only_changed_mutable_keys_survive() {
        let current = cfg(&[("name", "bot-01"), ("net0", "virtio=AA,bridge=vmbr0")]);
        let patch = cfg(&[
            ("name", "bot-01"),
            ("net0", "virtio=BB,bridge=vmbr0"),
            ("cores", "16"),
            ("smbios1", "uuid=1"),
        ]);
        let changes = changed_mutable_keys(&current, &patch);
        assert_eq!(changes, cfg(&[("net0", "virtio=BB,bridge=vmbr0"), ("smbios1", "uuid=1")]));
    }

    #[test]
    fn diff_reports_every_watched_field() {
        let before = cfg(&[("name", "tmpl"), ("cores", "2")]);
        let after = cfg(&[("name", "bot-03"), ("cores", "2"), ("args", "-cpu host")]);
        let diffs = diff_fields(&before, &after, &verified_fields("scsi1"));
        assert_eq!(diffs.len(), 6);
        let changed: Vec<&str> = diffs.iter().filter(|d| d.changed()).map(|d| d.field.as_str()).collect();
        assert_eq!(changed, ["name", "args"]);
    }

    #[test]
    fn sequential_patcher_is_deterministic() {
        let patcher = SequentialIdentityPatcher::default();
        let current = cfg(&[("net0", "e1000=AA:BB,bridge=vmbr1")]);
        let a = patcher.patch("bot-07", 7, &current).unwrap();
        let b = patcher.patch("bot-07", 7, &current).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.ip, Some(Ipv4Addr::new(10, 20, 0, 9)));
        assert!(a.config["net0"].starts_with("e1000=BC:24:11:"));
    }

    #[test]
    fn large_indexes_roll_into_the_next_octet() {
        let patcher = SequentialIdentityPatcher::default();
        let patch = patcher.patch("bot-260", 260, &VmConfig::new()).unwrap();
        assert_eq!(patch.ip, Some(Ipv4Addr::new(10, 20, 1, 12)));
    }
}
