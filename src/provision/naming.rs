use std::collections::HashSet;

use tracing::debug;

use crate::core::gateway::{ClusterResource, VmSummary};
use crate::core::queue::{QueueAction, QueueItem};
use crate::errors::ProvisionError;

const MAX_NAME_PROBES: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub name: String,
    pub vm_id: u32,
}

/// Hands out VM names and ids that collide with nothing the cluster, the
/// queue or this run already knows about. Every allocation is reserved on
/// the spot, before any clone is issued.
#[derive(Debug, Clone)]
pub struct NamingAllocator {
    floor: u32,
    taken_ids: HashSet<u32>,
    taken_names: HashSet<String>,
}

impl NamingAllocator {
    pub fn new(floor: u32) -> Self {
        Self {
            floor: floor.max(1),
            taken_ids: HashSet::new(),
            taken_names: HashSet::new(),
        }
    }

    pub fn observe_vms(&mut self, vms: &[VmSummary]) {
        for vm in vms {
            self.taken_ids.insert(vm.vmid);
            if let Some(name) = &vm.name {
                self.taken_names.insert(normalize(name));
            }
        }
    }

    pub fn observe_resources(&mut self, resources: &[ClusterResource]) {
        for resource in resources {
            if let ClusterResource::Qemu { vmid, name, .. } = resource {
                self.taken_ids.insert(*vmid);
                if let Some(name) = name {
                    self.taken_names.insert(normalize(name));
                }
            }
        }
    }

    /// Ids already owned by create items in the queue count as taken even if
    /// the cluster has not caught up yet.
    pub fn observe_queue(&mut self, items: &[QueueItem]) {
        for item in items.iter().filter(|item| item.action == QueueAction::Create) {
            if let Some(vm_id) = item.vm_id {
                self.taken_ids.insert(vm_id);
            }
        }
    }

    pub fn reserve_id(&mut self, vm_id: u32) {
        self.taken_ids.insert(vm_id);
    }

    pub fn is_id_taken(&self, vm_id: u32) -> bool {
        self.taken_ids.contains(&vm_id)
    }

    pub fn is_name_taken(&self, name: &str) -> bool {
        self.taken_names.contains(&normalize(name))
    }

    pub fn allocate(&mut self, requested: &str) -> Result<Allocation, ProvisionError> {
        let name = self.free_name(requested)?;
        let vm_id = self.free_id()?;
        self.taken_names.insert(normalize(&name));
        self.taken_ids.insert(vm_id);
        debug!(%name, vm_id, "name and id reserved");
        Ok(Allocation { name, vm_id })
    }

    fn free_name(&self, requested: &str) -> Result<String, ProvisionError> {
        let requested = requested.trim();
        if requested.is_empty() {
            return Err(ProvisionError::Naming("empty name".into()));
        }
        if !self.is_name_taken(requested) {
            return Ok(requested.to_string());
        }

        let (stem, suffix) = split_suffix(requested);
        for step in 1..=MAX_NAME_PROBES {
            let candidate = match suffix {
                Some((number, width)) => {
                    let next = number.saturating_add(step);
                    format!("{stem}{next:0width$}")
                }
                None => format!("{requested}-{}", step + 1),
            };
            if !self.is_name_taken(&candidate) {
                return Ok(candidate);
            }
        }
        Err(ProvisionError::Naming(format!("no free name derived from {requested}")))
    }

    fn free_id(&self) -> Result<u32, ProvisionError> {
        (self.floor..=u32::MAX)
            .find(|id| !self.taken_ids.contains(id))
            .ok_or_else(|| ProvisionError::Naming("VM id space exhausted".into()))
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// Splits `bot-07` into (`bot-`, Some((7, 2))).
fn split_suffix(name: &str) -> (&str, Option<(u32, usize)>) {
    let digits = name.chars().rev().take_while(char::is_ascii_digit).count();
    if digits == 0 || digits == name.len() {
        return (name, None);
    }
    let (stem, number) = name.split_at(name.len() - digits);
    match number.parse::<u32>() {
        Ok(value) => (stem, Some((value, digits))),
        Err(_) => (name, None),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn vm(vmid: u32, name: &str) -> VmSummary {
        VmSummary {
            vmid,
            name: Some(name.to_string()),
            status: "running".into(),
            template: false,
        }
    }

    #[test]
    fn free_name_is_kept_as_requested() {
        let mut naming = NamingAllocator::new(100);
        let out = naming.allocate("wow-bot-01").unwrap();
        assert_eq!(out, Allocation { name: "wow-bot-01".into(), vm_id: 100 });
    }

    #[test]
    fn numeric_suffix_is_bumped_keeping_its_width() {
        let mut naming = NamingAllocator::new(100);
        naming.observe_vms(&[vm(100, "wow-bot-01"), vm(101, "WOW-BOT-02")]);
        let out = naming.allocate("wow-bot-01").unwrap();
        assert_eq!(out.name, "wow-bot-03");
        assert_eq!(out.vm_id, 102);
    }

    #[test]
    fn plain_names_get_a_counter_appended() {
        let mut naming = NamingAllocator::new(100);
        naming.observe_vms(&[vm(120, "farmer")]);
        assert_eq!(naming.allocate("farmer").unwrap().name, "farmer-2");
        assert_eq!(naming.allocate("farmer").unwrap().name, "farmer-3");
    }

    #[test]
    fn ids_reserved_in_this_run_are_never_reused() {
        let mut naming = NamingAllocator::new(100);
        naming.observe_resources(&[ClusterResource::Qemu {
            node: "pve".into(),
            vmid: 101,
            name: None,
        }]);
        let mut queued = QueueItem::create("queued");
        queued.vm_id = Some(102);
        naming.observe_queue(&[queued]);

        let ids: Vec<u32> = (0..3).map(|i| naming.allocate(&format!("b{i}x")).unwrap().vm_id).collect();
        assert_eq!(ids, [100, 103, 104]);
    }

    #[test]
    fn delete_items_do_not_pin_ids() {
        let mut naming = NamingAllocator::new(100);
        let mut gone = QueueItem::delete(100, "old");
        gone.vm_id = Some(100);
        naming.observe_queue(&[gone]);
        assert!(!naming.is_id_taken(100));
    }
}
