//! Core types for VM Captain

use serde::{Deserialize, Serialize};

/// Account role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::User => "USER",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADMIN" => Ok(Role::Admin),
            "USER" => Ok(Role::User),
            other => Err(crate::Error::InvalidConfig(format!("unknown role: {other}"))),
        }
    }
}

/// A console user. Never carries the password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub role: Role,
    #[serde(default)]
    pub assigned_vms: Vec<String>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Whether this user may see the VM with the given id.
    pub fn can_access(&self, vm_id: &str) -> bool {
        self.is_admin() || self.assigned_vms.iter().any(|id| id == vm_id)
    }
}

/// Request to create a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub password: String,
    pub role: Role,
}

/// VM status as shown on the dashboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VmStatus {
    Running,
    Stopped,
    Suspended,
    Maintenance,
    Error,
}

impl Default for VmStatus {
    fn default() -> Self {
        Self::Stopped
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmStatus::Running => write!(f, "RUNNING"),
            VmStatus::Stopped => write!(f, "STOPPED"),
            VmStatus::Suspended => write!(f, "SUSPENDED"),
            VmStatus::Maintenance => write!(f, "MAINTENANCE"),
            VmStatus::Error => write!(f, "ERROR"),
        }
    }
}

impl VmStatus {
    /// Map a hypervisor power state (`POWERED_ON`, `poweredOff`, ...) onto a
    /// dashboard status. Missing or empty states read as stopped; anything
    /// unrecognised is an error.
    pub fn from_power_state(state: Option<&str>) -> Self {
        let state = match state.map(str::trim) {
            Some(s) if !s.is_empty() => s,
            _ => return VmStatus::Stopped,
        };
        let normalized: String = state
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        match normalized.as_str() {
            "POWEREDON" => VmStatus::Running,
            "POWEREDOFF" => VmStatus::Stopped,
            "SUSPENDED" => VmStatus::Suspended,
            _ => VmStatus::Error,
        }
    }
}

/// Virtual disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disk {
    pub label: String,
    pub size_gb: f64,
    pub disk_mode: String,
    pub thin_provisioned: bool,
}

/// Virtual machine record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: VmStatus,
    pub os: String,
    /// vCPU count
    pub cpu: u32,
    /// Memory in GB
    pub memory: u32,
    pub cpu_usage: u8,
    pub memory_usage: u8,
    pub disk_usage: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disks: Option<Vec<Disk>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_users: Option<Vec<String>>,
}

impl Vm {
    pub fn is_running(&self) -> bool {
        self.status == VmStatus::Running
    }
}

/// Memory size in GB from a MiB figure, rounded to the nearest GB.
pub fn mib_to_gb(mib: u64) -> u32 {
    ((mib as f64) / 1024.0).round() as u32
}

/// Point-in-time snapshot. Snapshots form a tree rooted at the VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub create_time: Option<String>,
    pub state: Option<String>,
    #[serde(default)]
    pub children: Vec<Snapshot>,
}

/// Snapshot creation parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Include guest memory state
    #[serde(default)]
    pub memory: bool,
    /// Quiesce the guest filesystem first
    #[serde(default)]
    pub quiesce: bool,
}

/// Power operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerOperation {
    Start,
    Stop,
    Restart,
}

impl PowerOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerOperation::Start => "start",
            PowerOperation::Stop => "stop",
            PowerOperation::Restart => "restart",
        }
    }
}

impl std::fmt::Display for PowerOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PowerOperation {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "start" => Ok(PowerOperation::Start),
            "stop" => Ok(PowerOperation::Stop),
            "restart" => Ok(PowerOperation::Restart),
            other => Err(crate::Error::InvalidConfig(format!(
                "unknown power operation: {other}"
            ))),
        }
    }
}

/// Fleet-wide summary shown above the VM list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSummary {
    pub total_vms: usize,
    pub running_vms: usize,
    pub stopped_vms: usize,
    pub suspended_vms: usize,
    pub error_vms: usize,
    pub total_cpus: u32,
    pub total_memory_gb: u32,
    pub average_cpu_usage: u32,
    pub average_memory_usage: u32,
}

impl StatsSummary {
    pub fn from_vms(vms: &[Vm]) -> Self {
        let mut stats = StatsSummary {
            total_vms: vms.len(),
            ..Default::default()
        };
        let mut cpu_sum = 0u32;
        let mut mem_sum = 0u32;
        for vm in vms {
            match vm.status {
                VmStatus::Running => stats.running_vms += 1,
                VmStatus::Stopped => stats.stopped_vms += 1,
                VmStatus::Suspended => stats.suspended_vms += 1,
                VmStatus::Error => stats.error_vms += 1,
                VmStatus::Maintenance => {}
            }
            stats.total_cpus += vm.cpu;
            stats.total_memory_gb += vm.memory;
            cpu_sum += u32::from(vm.cpu_usage);
            mem_sum += u32::from(vm.memory_usage);
        }
        if !vms.is_empty() {
            let n = vms.len() as f64;
            stats.average_cpu_usage = (cpu_sum as f64 / n).round() as u32;
            stats.average_memory_usage = (mem_sum as f64 / n).round() as u32;
        }
        stats
    }
}

/// One sample of a usage time series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Wall-clock label, `HH:MM`
    pub time: String,
    pub value: u8,
}

/// Usage history for a VM
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmMetrics {
    pub vm_id: String,
    pub cpu: Vec<MetricPoint>,
    pub memory: Vec<MetricPoint>,
}

/// Label for the i-th sample of a 15-minute series.
pub fn quarter_hour_label(index: usize) -> String {
    let hour = (index / 4) % 24;
    let minute = (index % 4) * 15;
    format!("{:02}:{:02}", hour, minute)
}
