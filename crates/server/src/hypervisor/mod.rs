//! Hypervisor backends
//!
//! A [`Hypervisor`] is one authenticated connection to a management API.
//! [`HypervisorConnector`]s open them from [`VcenterCredentials`]; the session
//! registry owns the resulting connections.

pub mod simulated;
pub mod vsphere;

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;

use vmcaptain_common::{
    quarter_hour_label, CreateSnapshotRequest, Error, MetricPoint, PowerOperation, Result,
    Snapshot, Vm, VmMetrics,
};

pub use simulated::{SimulatedConnector, SimulatedHypervisor};
pub use vsphere::{VsphereConnector, VsphereHypervisor};

/// One live connection to a hypervisor management API
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// List every VM in the inventory
    async fn list_vms(&self) -> Result<Vec<Vm>>;

    /// Fetch one VM with detail (disks, IP). `None` when absent.
    async fn get_vm(&self, id: &str) -> Result<Option<Vm>>;

    /// Start, stop or restart a VM
    async fn power(&self, id: &str, op: PowerOperation) -> Result<()>;

    /// Snapshot tree roots for a VM
    async fn list_snapshots(&self, id: &str) -> Result<Vec<Snapshot>>;

    /// Take a snapshot of a VM
    async fn create_snapshot(&self, id: &str, req: &CreateSnapshotRequest) -> Result<Snapshot>;

    /// Close the connection
    async fn disconnect(&self) -> Result<()>;
}

/// Opens hypervisor connections
#[async_trait]
pub trait HypervisorConnector: Send + Sync {
    async fn connect(&self, creds: &VcenterCredentials) -> Result<Arc<dyn Hypervisor>>;
}

/// Credentials for one hypervisor connection
#[derive(Clone, PartialEq, Eq)]
pub struct VcenterCredentials {
    pub url: String,
    pub username: String,
    pub password: String,
    pub ignore_ssl: bool,
}

impl std::fmt::Debug for VcenterCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VcenterCredentials")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ignore_ssl", &self.ignore_ssl)
            .finish()
    }
}

impl VcenterCredentials {
    /// Host (and port) portion of the URL. The URL must be
    /// `http(s)://host[/path]`.
    pub fn hostname(&self) -> Result<&str> {
        let rest = self
            .url
            .trim()
            .strip_prefix("https://")
            .or_else(|| self.url.trim().strip_prefix("http://"))
            .ok_or_else(|| Error::InvalidConfig("Invalid vCenter URL format".to_string()))?;
        let host = rest.split('/').next().unwrap_or_default();
        if host.is_empty() {
            return Err(Error::InvalidConfig("Invalid vCenter URL format".to_string()));
        }
        Ok(host)
    }

    /// `scheme://host` with any path stripped
    pub fn base_url(&self) -> Result<String> {
        let host = self.hostname()?;
        let scheme = if self.url.trim().starts_with("http://") {
            "http"
        } else {
            "https"
        };
        Ok(format!("{}://{}", scheme, host))
    }
}

/// Fill in usage gauges the way the list view expects: random load for
/// powered-on VMs, flat zero otherwise.
pub fn synthesize_usage<R: Rng + ?Sized>(vm: &mut Vm, rng: &mut R) {
    if vm.is_running() {
        vm.cpu_usage = rng.gen_range(5..=85);
        vm.memory_usage = rng.gen_range(10..=90);
        vm.disk_usage = rng.gen_range(20..=95);
    } else {
        vm.cpu_usage = 0;
        vm.memory_usage = 0;
        vm.disk_usage = 0;
    }
}

/// Usage history for a VM at 15-minute resolution, `hours * 4` samples.
pub fn usage_history<R: Rng + ?Sized>(vm: &Vm, hours: usize, rng: &mut R) -> VmMetrics {
    let points = hours * 4;
    let mut series = |min: u8, max: u8| -> Vec<MetricPoint> {
        (0..points)
            .map(|i| MetricPoint {
                time: quarter_hour_label(i),
                value: if vm.is_running() { rng.gen_range(min..max) } else { 0 },
            })
            .collect()
    };
    let cpu = series(5, 85);
    let memory = series(10, 90);
    VmMetrics {
        vm_id: vm.id.clone(),
        cpu,
        memory,
    }
}
