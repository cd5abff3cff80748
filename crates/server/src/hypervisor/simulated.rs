//! In-memory hypervisor with a demo fleet
//!
//! Every connection opened by a [`SimulatedConnector`] shares one inventory,
//! so power changes made through one session are visible to all.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{Hypervisor, HypervisorConnector, VcenterCredentials};
use vmcaptain_common::{
    CreateSnapshotRequest, Disk, Error, PowerOperation, Result, Snapshot, Vm, VmStatus,
};

/// Opens connections onto a shared simulated inventory
#[derive(Clone)]
pub struct SimulatedConnector {
    inventory: Arc<SimulatedHypervisor>,
}

impl SimulatedConnector {
    pub fn new() -> Self {
        Self {
            inventory: Arc::new(SimulatedHypervisor::with_demo_fleet()),
        }
    }
}

impl Default for SimulatedConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorConnector for SimulatedConnector {
    async fn connect(&self, creds: &VcenterCredentials) -> Result<Arc<dyn Hypervisor>> {
        creds.hostname()?;
        info!("Simulated connection for {} at {}", creds.username, creds.url);
        Ok(self.inventory.clone())
    }
}

#[derive(Debug, Default)]
struct SnapshotTree {
    roots: Vec<Snapshot>,
    current: Option<String>,
}

impl SnapshotTree {
    /// Attach a snapshot under the current one and make it current
    fn push(&mut self, snapshot: Snapshot) {
        let id = snapshot.id.clone();
        let parent = self
            .current
            .as_deref()
            .and_then(|current| find_mut(&mut self.roots, current));
        match parent {
            Some(parent) => parent.children.push(snapshot),
            None => self.roots.push(snapshot),
        }
        self.current = Some(id);
    }
}

fn find_mut<'a>(nodes: &'a mut [Snapshot], id: &str) -> Option<&'a mut Snapshot> {
    for node in nodes {
        if node.id == id {
            return Some(node);
        }
        if let Some(found) = find_mut(&mut node.children, id) {
            return Some(found);
        }
    }
    None
}

/// Simulated inventory
pub struct SimulatedHypervisor {
    vms: RwLock<Vec<Vm>>,
    snapshots: RwLock<HashMap<String, SnapshotTree>>,
    next_snapshot: AtomicU64,
}

impl SimulatedHypervisor {
    pub fn new(vms: Vec<Vm>) -> Self {
        Self {
            vms: RwLock::new(vms),
            snapshots: RwLock::new(HashMap::new()),
            next_snapshot: AtomicU64::new(1),
        }
    }

    /// The eight-VM fleet the dashboard ships with
    pub fn with_demo_fleet() -> Self {
        Self::new(demo_fleet())
    }

    fn transition(vm: &mut Vm, op: PowerOperation) -> Result<()> {
        let target = match op {
            PowerOperation::Start | PowerOperation::Restart => VmStatus::Running,
            PowerOperation::Stop => VmStatus::Stopped,
        };
        let allowed = match (vm.status, op) {
            (VmStatus::Maintenance, _) => false,
            (VmStatus::Running, PowerOperation::Start) => false,
            (_, PowerOperation::Start) => true,
            (VmStatus::Stopped, PowerOperation::Stop) => false,
            (_, PowerOperation::Stop) => true,
            (VmStatus::Running, PowerOperation::Restart) => true,
            (_, PowerOperation::Restart) => false,
        };
        if !allowed {
            return Err(Error::InvalidStateTransition {
                from: vm.status.to_string(),
                to: target.to_string(),
            });
        }

        vm.status = target;
        let mut rng = rand::thread_rng();
        if target == VmStatus::Running {
            vm.cpu_usage = rng.gen_range(5..=85);
            vm.memory_usage = rng.gen_range(10..=90);
        } else {
            vm.cpu_usage = 0;
            vm.memory_usage = 0;
        }
        Ok(())
    }
}

#[async_trait]
impl Hypervisor for SimulatedHypervisor {
    async fn list_vms(&self) -> Result<Vec<Vm>> {
        let vms = self.vms.read().await;
        Ok(vms
            .iter()
            .cloned()
            .map(|mut vm| {
                // The list view carries no detail
                vm.disks = None;
                vm
            })
            .collect())
    }

    async fn get_vm(&self, id: &str) -> Result<Option<Vm>> {
        let vms = self.vms.read().await;
        Ok(vms.iter().find(|vm| vm.id == id).cloned())
    }

    async fn power(&self, id: &str, op: PowerOperation) -> Result<()> {
        let mut vms = self.vms.write().await;
        let vm = vms
            .iter_mut()
            .find(|vm| vm.id == id)
            .ok_or_else(|| Error::not_found("vm", id))?;
        Self::transition(vm, op)?;
        info!("Simulated {} on {} -> {}", op, id, vm.status);
        Ok(())
    }

    async fn list_snapshots(&self, id: &str) -> Result<Vec<Snapshot>> {
        if self.get_vm(id).await?.is_none() {
            return Err(Error::not_found("vm", id));
        }
        let snapshots = self.snapshots.read().await;
        Ok(snapshots
            .get(id)
            .map(|tree| tree.roots.clone())
            .unwrap_or_default())
    }

    async fn create_snapshot(&self, id: &str, req: &CreateSnapshotRequest) -> Result<Snapshot> {
        if req.name.trim().is_empty() {
            return Err(Error::InvalidConfig("Snapshot name is required".to_string()));
        }
        let vm = self
            .get_vm(id)
            .await?
            .ok_or_else(|| Error::not_found("vm", id))?;

        let n = self.next_snapshot.fetch_add(1, Ordering::Relaxed);
        let snapshot = Snapshot {
            id: format!("snapshot-{}", n),
            name: req.name.trim().to_string(),
            description: req.description.clone(),
            create_time: Some(chrono::Utc::now().to_rfc3339()),
            state: Some(if vm.is_running() { "poweredOn" } else { "poweredOff" }.to_string()),
            children: Vec::new(),
        };

        let mut snapshots = self.snapshots.write().await;
        snapshots
            .entry(id.to_string())
            .or_default()
            .push(snapshot.clone());
        debug!(
            "Snapshot {} of {} (memory={}, quiesce={})",
            snapshot.id, id, req.memory, req.quiesce
        );
        Ok(snapshot)
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

fn demo_vm(
    id: &str,
    name: &str,
    description: &str,
    status: VmStatus,
    os: &str,
    (cpu, memory): (u32, u32),
    (cpu_usage, memory_usage, disk_usage): (u8, u8, u8),
    ip_address: Option<&str>,
) -> Vm {
    Vm {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        status,
        os: os.to_string(),
        cpu,
        memory,
        cpu_usage,
        memory_usage,
        disk_usage,
        ip_address: ip_address.map(str::to_string),
        disks: Some(vec![Disk {
            label: "Hard disk 1".to_string(),
            size_gb: 40.0,
            disk_mode: "persistent".to_string(),
            thin_provisioned: true,
        }]),
        assigned_users: None,
    }
}

fn demo_fleet() -> Vec<Vm> {
    vec![
        demo_vm("vm-001", "Web Server", "Production web server running Nginx", VmStatus::Running,
            "Ubuntu 22.04 LTS", (4, 8), (65, 72, 45), Some("10.0.0.11")),
        demo_vm("vm-002", "Database Server", "PostgreSQL database instance", VmStatus::Running,
            "CentOS 8", (8, 16), (78, 83, 67), Some("10.0.0.12")),
        demo_vm("vm-003", "Test Environment", "QA testing environment for new features", VmStatus::Stopped,
            "Windows Server 2019", (2, 4), (0, 0, 22), None),
        demo_vm("vm-004", "CI/CD Pipeline", "Jenkins server for continuous integration", VmStatus::Running,
            "Debian 11", (4, 8), (34, 51, 39), Some("10.0.0.14")),
        demo_vm("vm-005", "Backup Server", "Nightly backup and archiving system", VmStatus::Suspended,
            "Ubuntu 20.04 LTS", (2, 4), (5, 12, 94), None),
        demo_vm("vm-006", "Development Server", "Development environment for team", VmStatus::Running,
            "Alpine Linux", (4, 8), (22, 45, 31), Some("10.0.0.16")),
        demo_vm("vm-007", "Legacy Application", "Legacy application server", VmStatus::Error,
            "Windows Server 2012", (2, 4), (0, 0, 86), None),
        demo_vm("vm-008", "Mail Server", "Corporate mail server", VmStatus::Running,
            "CentOS 7", (4, 8), (18, 42, 53), Some("10.0.0.18")),
    ]
}
