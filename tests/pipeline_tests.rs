// Pipeline test suite - four phases against the simulated cluster, no real
// hypervisor harmed.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use fleet_provisioner::core::gateway::{
    CloneRequest, ClusterResource, ConfigUpdate, DeleteOptions, DiskResize, HypervisorGateway,
    ProvisionIsoRequest, ResourceKind, TaskOutcome, Upid, VmConfig, VmRegistration, VmSummary,
};
use fleet_provisioner::core::queue::{QueueItem, QueueStatus, ResourceMode};
use fleet_provisioner::core::simulator::SimulatedCluster;
use fleet_provisioner::errors::{GatewayResult, ProvisionError, RetryPolicy};
use fleet_provisioner::monitoring::tracker::TaskEntry;
use fleet_provisioner::monitoring::{RunState, TaskStatus};
use fleet_provisioner::provision::{
    CancellationFlag, CloudInitPayloadBuilder, IsoPayload, IsoProvisioner, IsoRequest,
    ProvisioningPipeline,
};

use common::{test_cluster, test_settings, Harness, TEMPLATE_ID};

fn wow_bot(id: &str, name: &str) -> QueueItem {
    QueueItem::create(name)
        .with_id(id)
        .with_project("wow_tbc")
        .with_resources(ResourceMode::Project)
}

// Scenario A: one project-sized create goes all the way to done
#[tokio::test]
async fn test_create_item_reaches_done_with_project_preset() -> Result<()> {
    let h = Harness::new(test_cluster(), vec![wow_bot("a", "wow-bot-01")]);

    let summary = h.run().await;

    assert_eq!(summary.state, RunState::Success);
    assert_eq!((summary.done, summary.errors, summary.pending), (1, 0, 0));

    let item = h.item("a").await;
    assert_eq!(item.status, QueueStatus::Done);
    assert_eq!(item.vm_id, Some(100));
    assert_eq!(item.name, "wow-bot-01");
    assert_eq!((item.cores, item.memory), (Some(4), Some(8192)));
    assert_eq!(item.storage.as_deref(), Some("local-lvm"));
    assert_eq!(item.ip.as_deref(), Some("10.20.0.102"));
    assert!(item.uuid.is_some());
    assert!(item.error.is_none());

    let config = h.cluster.vm_config(100).await.expect("clone exists");
    assert_eq!(config["cores"], "4");
    assert_eq!(config["memory"], "8192");
    assert!(config["smbios1"].starts_with("uuid="));
    assert!(config["ide2"].contains("provision-100.iso"));

    let registrations = h.cluster.registrations().await;
    assert_eq!(registrations.len(), 1);
    assert_eq!(registrations[0].project_id.as_deref(), Some("wow_tbc"));
    assert_eq!(registrations[0].metadata["ip"], "10.20.0.102");
    Ok(())
}

// Scenario B: failing delete task, nothing else runs
#[tokio::test]
async fn test_failed_delete_marks_item_error_and_skips_clone() -> Result<()> {
    let cluster = test_cluster().with_vm(105, "old-bot").failing_delete_of(105);
    let h = Harness::new(cluster, vec![QueueItem::delete(105, "old-bot").with_id("d")]);

    let summary = h.run().await;

    assert_eq!(summary.state, RunState::Error);
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.failures[0].item_id, "d");

    let item = h.item("d").await;
    assert_eq!(item.status, QueueStatus::Error);
    assert_eq!(item.vm_id, Some(105));
    assert!(item.error.unwrap_or_default().contains("VM is locked"));

    let calls = h.cluster.calls().await;
    assert_eq!(calls.deletes, 1);
    assert_eq!(calls.clones, 0);
    assert!(h.cluster.vm_exists(105).await);
    Ok(())
}

#[tokio::test]
async fn test_delete_runs_before_clone_in_one_batch() -> Result<()> {
    let cluster = test_cluster().with_vm(105, "old-bot");
    let h = Harness::new(
        cluster,
        vec![
            QueueItem::create("bot-05").with_id("c"),
            QueueItem::delete(105, "old-bot").with_id("d"),
        ],
    );

    let summary = h.run().await;

    assert_eq!(summary.state, RunState::Success);
    assert_eq!(summary.done, 2);
    assert_eq!(h.item("d").await.status, QueueStatus::Done);
    assert!(!h.cluster.vm_exists(105).await);
    assert_eq!(h.item("c").await.vm_id, Some(100));
    Ok(())
}

#[tokio::test]
async fn test_invalid_delete_targets_are_refused() -> Result<()> {
    let mut negative = QueueItem::delete(1, "ghost").with_id("neg");
    negative.target_vm_id = Some(-5);
    let template = QueueItem::delete(TEMPLATE_ID, "template").with_id("tmpl");
    let h = Harness::new(test_cluster(), vec![negative, template]);

    let summary = h.run().await;

    assert_eq!(summary.errors, 2);
    assert_eq!(h.item("neg").await.status, QueueStatus::Error);
    assert_eq!(h.item("tmpl").await.status, QueueStatus::Error);
    assert!(h.cluster.vm_exists(TEMPLATE_ID).await);
    assert_eq!(h.cluster.calls().await.deletes, 0);
    Ok(())
}

// Scenario D: first apply lands stale, the single re-apply converges
#[tokio::test]
async fn test_stale_resource_apply_is_retried_once() -> Result<()> {
    let cluster = test_cluster().with_stale_resource_applies(1);
    let h = Harness::new(cluster, vec![wow_bot("a", "wow-bot-01")]);

    let summary = h.run().await;

    assert_eq!(summary.state, RunState::Success);
    let item = h.item("a").await;
    assert_eq!(item.status, QueueStatus::Done);
    assert_eq!(item.cores, Some(4));
    assert_eq!(h.cluster.calls().await.resource_updates, 2);

    let rows = h.table("a", "Resources").expect("resources table");
    let value = |key: &str| {
        rows.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    };
    assert_eq!(value("apply cycles"), "2");
    // a full convergence window for the stale cycle, one read for the second
    assert_eq!(value("verify reads"), "11");
    Ok(())
}

#[tokio::test]
async fn test_second_convergence_miss_fails_the_item() -> Result<()> {
    let cluster = test_cluster().with_stale_resource_applies(2);
    let h = Harness::new(cluster, vec![wow_bot("a", "wow-bot-01")]);

    let summary = h.run().await;

    assert_eq!(summary.state, RunState::Error);
    let item = h.item("a").await;
    assert_eq!(item.status, QueueStatus::Error);
    assert!(item.error.unwrap_or_default().contains("did not converge"));

    let calls = h.cluster.calls().await;
    assert_eq!(calls.resource_updates, 2);
    assert_eq!(calls.iso_uploads, 0);
    Ok(())
}

#[tokio::test]
async fn test_cancel_before_clone_issues_no_clone_calls() -> Result<()> {
    let h = Harness::new(
        test_cluster(),
        vec![QueueItem::create("bot-01").with_id("a"), QueueItem::create("bot-02").with_id("b")],
    );
    h.cancel.cancel();

    let summary = h.run().await;

    assert!(summary.cancelled);
    assert_eq!(summary.state, RunState::Error);
    assert_eq!(summary.pending, 2);
    assert_eq!(h.cluster.calls().await.clones, 0);
    assert_eq!(h.item("a").await.status, QueueStatus::Pending);
    assert_eq!(h.item("a").await.vm_id, None);
    Ok(())
}

/// Flips the cancel flag the first time an ISO is generated.
struct CancelOnFirstIso {
    flag: CancellationFlag,
    inner: CloudInitPayloadBuilder,
}

#[async_trait]
impl IsoProvisioner for CancelOnFirstIso {
    async fn generate_iso_payload(&self, request: &IsoRequest) -> Result<IsoPayload, ProvisionError> {
        self.flag.cancel();
        self.inner.generate_iso_payload(request).await
    }
}

#[tokio::test]
async fn test_cancel_mid_run_leaves_items_where_they_stopped() -> Result<()> {
    let h = Harness::new(
        test_cluster(),
        vec![QueueItem::create("bot-01").with_id("a"), QueueItem::create("bot-02").with_id("b")],
    );
    let mut ctx = h.context();
    ctx.iso = Arc::new(CancelOnFirstIso {
        flag: h.cancel.clone(),
        inner: CloudInitPayloadBuilder::default(),
    });

    let summary = ProvisioningPipeline::new(ctx).run().await;

    assert!(summary.cancelled);
    assert_eq!(summary.state, RunState::Error);
    assert_eq!((summary.done, summary.interrupted), (1, 1));
    assert_eq!(h.item("a").await.status, QueueStatus::Done);
    // in-flight call finished, the next item never started
    assert_eq!(h.item("b").await.status, QueueStatus::Provisioning);
    assert_eq!(h.cluster.calls().await.iso_uploads, 1);
    Ok(())
}

#[tokio::test]
async fn test_names_and_ids_never_collide() -> Result<()> {
    let cluster = test_cluster().with_vm(100, "bot-01");
    let h = Harness::new(
        cluster,
        vec![
            QueueItem::create("bot-01").with_id("a"),
            QueueItem::create("bot-01").with_id("b"),
            QueueItem::create("BOT-02").with_id("c"),
        ],
    );

    let summary = h.run().await;
    assert_eq!(summary.done, 3);

    let mut names = Vec::new();
    let mut ids = HashSet::new();
    for id in ["a", "b", "c"] {
        let item = h.item(id).await;
        assert_eq!(item.status, QueueStatus::Done);
        let vm_id = item.vm_id.expect("done items carry a vm id");
        assert!(vm_id > 0);
        assert!(ids.insert(vm_id), "vm id {vm_id} handed out twice");
        names.push(item.name);
    }
    assert_eq!(names, ["bot-02", "bot-03", "BOT-04"]);
    assert_eq!(ids, HashSet::from([101, 102, 103]));
    Ok(())
}

#[tokio::test]
async fn test_failed_clone_keeps_its_reserved_id() -> Result<()> {
    let cluster = test_cluster().failing_clone_of(100);
    let h = Harness::new(
        cluster,
        vec![QueueItem::create("alpha").with_id("a"), QueueItem::create("beta").with_id("b")],
    );

    let summary = h.run().await;

    assert_eq!(summary.state, RunState::Error);
    assert_eq!((summary.done, summary.errors), (1, 1));
    let failed = h.item("a").await;
    assert_eq!(failed.status, QueueStatus::Error);
    assert_eq!(failed.vm_id, Some(100));
    assert_eq!(h.item("b").await.vm_id, Some(101));
    Ok(())
}

#[tokio::test]
async fn test_no_cloned_vm_ends_the_run_in_error() -> Result<()> {
    let cluster = test_cluster().failing_clone_of(100);
    let h = Harness::new(cluster, vec![QueueItem::create("alpha").with_id("a")]);

    let summary = h.run().await;

    assert_eq!(summary.state, RunState::Error);
    assert!(h
        .tracker
        .batch_log()
        .iter()
        .any(|entry| entry.message.contains("no VM was cloned")));
    assert_eq!(h.cluster.calls().await.resource_updates, 0);
    Ok(())
}

#[tokio::test]
async fn test_listing_failure_fails_every_create() -> Result<()> {
    let cluster = test_cluster().with_failing_listing();
    let h = Harness::new(
        cluster,
        vec![QueueItem::create("alpha").with_id("a"), QueueItem::create("beta").with_id("b")],
    );

    let summary = h.run().await;

    assert_eq!(summary.errors, 2);
    assert_eq!(h.cluster.calls().await.clones, 0);
    assert!(h.item("b").await.error.unwrap_or_default().contains("listing unavailable"));
    Ok(())
}

#[tokio::test]
async fn test_disk_shrink_is_refused_with_a_warning() -> Result<()> {
    let mut item = QueueItem::create("small").with_id("a");
    item.disk_gib = Some(32);
    let h = Harness::new(test_cluster(), vec![item]);

    let summary = h.run().await;

    assert_eq!(summary.state, RunState::Success);
    assert!(summary.warnings.iter().any(|w| w.contains("refusing to shrink")));
    assert_eq!(h.cluster.calls().await.resizes, 0);
    let config = h.cluster.vm_config(100).await.expect("clone exists");
    assert!(config["scsi0"].ends_with("size=64G"));
    // the item records the disk it really has
    assert_eq!(h.item("a").await.disk_gib, Some(64));
    Ok(())
}

#[tokio::test]
async fn test_disk_grows_to_the_requested_size() -> Result<()> {
    let mut item = QueueItem::create("big").with_id("a");
    item.disk_gib = Some(128);
    let h = Harness::new(test_cluster(), vec![item]);

    h.run().await;

    assert_eq!(h.cluster.calls().await.resizes, 1);
    let config = h.cluster.vm_config(100).await.expect("clone exists");
    assert!(config["scsi0"].ends_with("size=128G"));
    assert_eq!(h.item("a").await.disk_gib, Some(128));
    Ok(())
}

#[tokio::test]
async fn test_iso_failure_is_only_a_warning() -> Result<()> {
    let cluster = test_cluster().with_failing_iso_attach();
    let h = Harness::new(cluster, vec![QueueItem::create("bot-07").with_id("a")]);

    let summary = h.run().await;

    assert_eq!(summary.state, RunState::Success);
    assert_eq!(summary.warnings.len(), 1);
    assert_eq!(h.item("a").await.status, QueueStatus::Done);
    let record = h.tracker.task("a").expect("task record");
    assert_eq!(record.status, TaskStatus::Warning);
    Ok(())
}

#[tokio::test]
async fn test_registration_failure_is_fatal_for_the_item() -> Result<()> {
    let cluster = test_cluster().with_failing_registration();
    let h = Harness::new(cluster, vec![QueueItem::create("bot-07").with_id("a")]);

    let summary = h.run().await;

    assert_eq!(summary.state, RunState::Error);
    assert_eq!(h.item("a").await.status, QueueStatus::Error);
    assert_eq!(h.cluster.calls().await.iso_uploads, 0);
    Ok(())
}

#[tokio::test]
async fn test_slow_config_materialization_is_tolerated() -> Result<()> {
    let cluster = test_cluster().with_empty_reads_after_clone(3);
    let h = Harness::new(cluster, vec![QueueItem::create("bot-01").with_id("a")]);

    let summary = h.run().await;

    assert_eq!(summary.state, RunState::Success);
    assert_eq!(h.item("a").await.status, QueueStatus::Done);
    Ok(())
}

#[tokio::test]
async fn test_empty_queue_stays_idle() -> Result<()> {
    let h = Harness::with_settings(test_cluster(), Vec::new(), test_settings());

    let summary = h.run().await;

    assert_eq!(summary.state, RunState::Idle);
    assert_eq!(summary.total, 0);
    assert_eq!(h.tracker.run_state(), RunState::Idle);
    Ok(())
}

#[tokio::test]
async fn test_terminal_items_are_not_picked_up_again() -> Result<()> {
    let h = Harness::new(test_cluster(), vec![QueueItem::create("bot-01").with_id("a")]);
    h.run().await;

    let second = h.run().await;

    assert_eq!(second.state, RunState::Idle);
    assert_eq!(h.cluster.calls().await.clones, 1);
    Ok(())
}

/// Simulated cluster that trips the cancel flag once a delete call has gone
/// through.
struct CancelDuringDelete {
    inner: Arc<SimulatedCluster>,
    flag: CancellationFlag,
}

#[async_trait]
impl HypervisorGateway for CancelDuringDelete {
    async fn clone_vm(&self, request: &CloneRequest) -> GatewayResult<Upid> {
        self.inner.clone_vm(request).await
    }

    async fn delete_vm(&self, vm_id: u32, node: &str, options: DeleteOptions) -> GatewayResult<Upid> {
        let upid = self.inner.delete_vm(vm_id, node, options).await?;
        self.flag.cancel();
        Ok(upid)
    }

    async fn wait_for_task(&self, upid: &Upid, node: &str, policy: RetryPolicy) -> GatewayResult<TaskOutcome> {
        self.inner.wait_for_task(upid, node, policy).await
    }

    async fn wait_for_vm_presence(
        &self,
        vm_id: u32,
        node: &str,
        expected: bool,
        policy: RetryPolicy,
    ) -> GatewayResult<bool> {
        self.inner.wait_for_vm_presence(vm_id, node, expected, policy).await
    }

    async fn list_vms(&self, node: &str) -> GatewayResult<Vec<VmSummary>> {
        self.inner.list_vms(node).await
    }

    async fn get_cluster_resources(&self, kind: ResourceKind) -> GatewayResult<Vec<ClusterResource>> {
        self.inner.get_cluster_resources(kind).await
    }

    async fn get_vm_config(&self, vm_id: u32, node: &str) -> GatewayResult<VmConfig> {
        self.inner.get_vm_config(vm_id, node).await
    }

    async fn update_vm_config(&self, update: &ConfigUpdate) -> GatewayResult<Upid> {
        self.inner.update_vm_config(update).await
    }

    async fn resize_vm_disk(&self, resize: &DiskResize) -> GatewayResult<Upid> {
        self.inner.resize_vm_disk(resize).await
    }

    async fn register_vm_resource(&self, registration: &VmRegistration) -> GatewayResult<()> {
        self.inner.register_vm_resource(registration).await
    }

    async fn create_provision_iso(&self, request: &ProvisionIsoRequest) -> GatewayResult<String> {
        self.inner.create_provision_iso(request).await
    }

    async fn attach_cdrom(&self, vm_id: u32, node: &str, volume: &str) -> GatewayResult<()> {
        self.inner.attach_cdrom(vm_id, node, volume).await
    }
}

// cancel lands during the first delete: it completes, nothing else starts
#[tokio::test]
async fn test_cancel_during_delete_skips_the_rest_of_the_batch() -> Result<()> {
    let cluster = test_cluster().with_vm(105, "old-a").with_vm(106, "old-b");
    let h = Harness::new(
        cluster,
        vec![
            QueueItem::delete(105, "old-a").with_id("d1"),
            QueueItem::delete(106, "old-b").with_id("d2"),
            QueueItem::create("bot-01").with_id("c"),
        ],
    );
    let mut ctx = h.context();
    ctx.gateway = Arc::new(CancelDuringDelete {
        inner: h.cluster.clone(),
        flag: h.cancel.clone(),
    });

    let summary = ProvisioningPipeline::new(ctx).run().await;

    assert!(summary.cancelled);
    assert_eq!(summary.state, RunState::Error);
    assert_eq!((summary.done, summary.pending), (1, 2));
    assert_eq!(h.item("d1").await.status, QueueStatus::Done);
    assert_eq!(h.item("d2").await.status, QueueStatus::Pending);
    assert_eq!(h.item("c").await.status, QueueStatus::Pending);
    assert!(h.cluster.vm_exists(106).await);
    let calls = h.cluster.calls().await;
    assert_eq!((calls.deletes, calls.clones), (1, 0));
    Ok(())
}

#[tokio::test]
async fn test_vm_that_outlives_its_delete_fails_only_that_item() -> Result<()> {
    let cluster = test_cluster()
        .with_vm(105, "old-a")
        .with_vm(106, "old-b")
        .lingering_after_delete_of(105);
    let h = Harness::new(
        cluster,
        vec![
            QueueItem::delete(105, "old-a").with_id("d1"),
            QueueItem::delete(106, "old-b").with_id("d2"),
        ],
    );

    let summary = h.run().await;

    assert_eq!((summary.done, summary.errors), (1, 1));
    let lingering = h.item("d1").await;
    assert_eq!(lingering.status, QueueStatus::Error);
    assert!(lingering.error.unwrap_or_default().contains("presence did not become false"));
    assert_eq!(h.item("d2").await.status, QueueStatus::Done);
    assert!(!h.cluster.vm_exists(106).await);
    Ok(())
}

#[tokio::test]
async fn test_clone_that_never_appears_fails_only_that_item() -> Result<()> {
    let cluster = test_cluster().unlisted_clone_of(100);
    let h = Harness::new(
        cluster,
        vec![QueueItem::create("alpha").with_id("a"), QueueItem::create("beta").with_id("b")],
    );

    let summary = h.run().await;

    assert_eq!((summary.done, summary.errors), (1, 1));
    let missing = h.item("a").await;
    assert_eq!(missing.status, QueueStatus::Error);
    assert_eq!(missing.vm_id, Some(100));
    assert!(missing.error.unwrap_or_default().contains("presence did not become true"));
    let sibling = h.item("b").await;
    assert_eq!(sibling.status, QueueStatus::Done);
    assert_eq!(sibling.vm_id, Some(101));
    Ok(())
}

// a plain name and a name ending in another VM's id still get distinct addresses
#[tokio::test]
async fn test_every_vm_in_a_run_gets_its_own_address() -> Result<()> {
    let h = Harness::new(
        test_cluster(),
        vec![
            QueueItem::create("alpha").with_id("a"),
            QueueItem::create("bot-100").with_id("b"),
            QueueItem::create("bot-101").with_id("c"),
        ],
    );

    let summary = h.run().await;
    assert_eq!(summary.done, 3);

    let mut ips = HashSet::new();
    let mut uuids = HashSet::new();
    for id in ["a", "b", "c"] {
        let item = h.item(id).await;
        assert!(ips.insert(item.ip.expect("ip assigned")), "address reused in one run");
        assert!(uuids.insert(item.uuid.expect("uuid assigned")));
    }
    assert_eq!(h.item("a").await.ip.as_deref(), Some("10.20.0.102"));
    Ok(())
}

#[tokio::test]
async fn test_padded_name_is_used_trimmed_without_a_rename_note() -> Result<()> {
    let h = Harness::new(test_cluster(), vec![QueueItem::create("  bot-09  ").with_id("a")]);

    h.run().await;

    assert_eq!(h.item("a").await.name, "bot-09");
    let record = h.tracker.task("a").expect("task record");
    assert!(!record.entries.iter().any(|entry| matches!(
        entry,
        TaskEntry::Log { message, .. } if message.contains("is taken")
    )));
    Ok(())
}
