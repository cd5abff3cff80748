//! vSphere Automation REST backend
//!
//! Talks to `/api/session` and `/api/vcenter/vm/...` on a vCenter server.
//! The session token travels in the `vmware-api-session-id` header.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{synthesize_usage, Hypervisor, HypervisorConnector, VcenterCredentials};
use vmcaptain_common::{
    mib_to_gb, CreateSnapshotRequest, Disk, Error, PowerOperation, Result, Snapshot, Vm, VmStatus,
};

const SESSION_HEADER: &str = "vmware-api-session-id";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens vSphere REST sessions
#[derive(Clone, Default)]
pub struct VsphereConnector;

#[async_trait]
impl HypervisorConnector for VsphereConnector {
    async fn connect(&self, creds: &VcenterCredentials) -> Result<Arc<dyn Hypervisor>> {
        let hv = VsphereHypervisor::connect(creds).await?;
        Ok(Arc::new(hv))
    }
}

/// One vSphere REST session
pub struct VsphereHypervisor {
    client: reqwest::Client,
    base: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct VmSummary {
    vm: String,
    name: Option<String>,
    power_state: Option<String>,
    cpu_count: Option<u32>,
    #[serde(rename = "memory_size_MiB")]
    memory_size_mib: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct VmInfo {
    name: Option<String>,
    power_state: Option<String>,
    #[serde(rename = "guest_OS")]
    guest_os: Option<String>,
    cpu: Option<CpuInfo>,
    memory: Option<MemoryInfo>,
    #[serde(default)]
    disks: HashMap<String, DiskInfo>,
}

#[derive(Debug, Deserialize)]
struct CpuInfo {
    count: u32,
}

#[derive(Debug, Deserialize)]
struct MemoryInfo {
    #[serde(rename = "size_MiB")]
    size_mib: u64,
}

#[derive(Debug, Deserialize)]
struct DiskInfo {
    label: Option<String>,
    capacity: Option<u64>,
    backing: Option<DiskBacking>,
}

#[derive(Debug, Deserialize)]
struct DiskBacking {
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GuestIdentity {
    ip_address: Option<String>,
    full_name: Option<LocalizableMessage>,
}

#[derive(Debug, Deserialize)]
struct LocalizableMessage {
    default_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    messages: Vec<LocalizableMessage>,
    error_type: Option<String>,
}

impl VsphereHypervisor {
    /// Authenticate and open a session
    pub async fn connect(creds: &VcenterCredentials) -> Result<Self> {
        let base = creds.base_url()?;
        info!("Connecting to vCenter at {} as {}", base, creds.username);

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(creds.ignore_ssl)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Hypervisor(format!("failed to build HTTP client: {e}")))?;

        let resp = client
            .post(format!("{}/api/session", base))
            .basic_auth(&creds.username, Some(&creds.password))
            .send()
            .await
            .map_err(|e| Error::Hypervisor(format!("Failed to connect to vCenter: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Hypervisor(format!(
                "Failed to connect to vCenter - authentication failed: {}",
                describe_failure(status, &body)
            )));
        }

        let token: String = resp
            .json()
            .await
            .map_err(|e| Error::Hypervisor(format!("unexpected session response: {e}")))?;

        info!("Connected to vCenter at {}", base);
        Ok(Self {
            client,
            base,
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base, path))
            .header(SESSION_HEADER, &self.token)
    }

    /// Send a request, mapping transport failures and error statuses.
    /// A 404 comes back as `Ok(None)`.
    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Option<reqwest::Response>> {
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Hypervisor(e.to_string()))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_success() {
            return Ok(Some(resp));
        }
        let body = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED => Error::Unauthorized("vCenter session expired".to_string()),
            StatusCode::FORBIDDEN => Error::PermissionDenied(describe_failure(status, &body)),
            _ => Error::Hypervisor(describe_failure(status, &body)),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.send(self.request(Method::GET, path)).await? {
            Some(resp) => resp
                .json()
                .await
                .map(Some)
                .map_err(|e| Error::Hypervisor(format!("unexpected response from {path}: {e}"))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Hypervisor for VsphereHypervisor {
    async fn list_vms(&self) -> Result<Vec<Vm>> {
        let summaries: Vec<VmSummary> = self
            .get_json("/api/vcenter/vm")
            .await?
            .unwrap_or_default();

        let mut rng = rand::thread_rng();
        let vms = summaries
            .into_iter()
            .map(|s| {
                let mut vm = vm_from_summary(s);
                synthesize_usage(&mut vm, &mut rng);
                vm
            })
            .collect::<Vec<_>>();
        debug!("Listed {} VMs from {}", vms.len(), self.base);
        Ok(vms)
    }

    async fn get_vm(&self, id: &str) -> Result<Option<Vm>> {
        let Some(info) = self
            .get_json::<VmInfo>(&format!("/api/vcenter/vm/{}", id))
            .await?
        else {
            return Ok(None);
        };

        // Guest identity needs VMware Tools; absence is not an error
        let identity = match self
            .get_json::<GuestIdentity>(&format!("/api/vcenter/vm/{}/guest/identity", id))
            .await
        {
            Ok(identity) => identity,
            Err(e) => {
                debug!("No guest identity for {}: {}", id, e);
                None
            }
        };

        let mut vm = vm_from_info(id, info, identity);
        synthesize_usage(&mut vm, &mut rand::thread_rng());
        Ok(Some(vm))
    }

    async fn power(&self, id: &str, op: PowerOperation) -> Result<()> {
        let action = match op {
            PowerOperation::Start => "start",
            PowerOperation::Stop => "stop",
            PowerOperation::Restart => "reset",
        };
        let req = self
            .request(Method::POST, &format!("/api/vcenter/vm/{}/power", id))
            .query(&[("action", action)]);
        match self.send(req).await? {
            Some(_) => {
                info!("Power {} on {} via {}", op, id, self.base);
                Ok(())
            }
            None => Err(Error::not_found("vm", id)),
        }
    }

    async fn list_snapshots(&self, _id: &str) -> Result<Vec<Snapshot>> {
        Err(Error::Unsupported(
            "snapshots are not exposed by the vSphere Automation API".to_string(),
        ))
    }

    async fn create_snapshot(&self, _id: &str, _req: &CreateSnapshotRequest) -> Result<Snapshot> {
        Err(Error::Unsupported(
            "snapshots are not exposed by the vSphere Automation API".to_string(),
        ))
    }

    async fn disconnect(&self) -> Result<()> {
        match self.send(self.request(Method::DELETE, "/api/session")).await {
            Ok(_) => {
                info!("Disconnected from {}", self.base);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to close vCenter session at {}: {}", self.base, e);
                Err(e)
            }
        }
    }
}

fn vm_from_summary(s: VmSummary) -> Vm {
    Vm {
        id: s.vm,
        name: s.name.unwrap_or_else(|| "Unknown VM".to_string()),
        description: String::new(),
        status: VmStatus::from_power_state(s.power_state.as_deref()),
        os: "Unknown OS".to_string(),
        cpu: s.cpu_count.unwrap_or(0),
        memory: s.memory_size_mib.map(mib_to_gb).unwrap_or(0),
        cpu_usage: 0,
        memory_usage: 0,
        disk_usage: 0,
        ip_address: None,
        disks: None,
        assigned_users: None,
    }
}

fn vm_from_info(id: &str, info: VmInfo, identity: Option<GuestIdentity>) -> Vm {
    let (ip_address, guest_name) = match identity {
        Some(identity) => (
            identity.ip_address,
            identity.full_name.and_then(|m| m.default_message),
        ),
        None => (None, None),
    };

    let mut disks: Vec<Disk> = info
        .disks
        .into_values()
        .map(|d| Disk {
            label: d.label.unwrap_or_else(|| "Hard disk".to_string()),
            size_gb: d
                .capacity
                .map(|bytes| (bytes as f64 / (1024.0 * 1024.0 * 1024.0) * 100.0).round() / 100.0)
                .unwrap_or(0.0),
            disk_mode: d
                .backing
                .and_then(|b| b.kind)
                .unwrap_or_else(|| "VMDK_FILE".to_string()),
            thin_provisioned: false,
        })
        .collect();
    disks.sort_by(|a, b| a.label.cmp(&b.label));

    Vm {
        id: id.to_string(),
        name: info.name.unwrap_or_else(|| "Unknown VM".to_string()),
        description: String::new(),
        status: VmStatus::from_power_state(info.power_state.as_deref()),
        os: guest_name
            .or(info.guest_os)
            .unwrap_or_else(|| "Unknown OS".to_string()),
        cpu: info.cpu.map(|c| c.count).unwrap_or(0),
        memory: info.memory.map(|m| mib_to_gb(m.size_mib)).unwrap_or(0),
        cpu_usage: 0,
        memory_usage: 0,
        disk_usage: 0,
        ip_address,
        disks: Some(disks),
        assigned_users: None,
    }
}

/// Turn an error response into a readable message
fn describe_failure(status: StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(body) {
        let message = parsed
            .messages
            .into_iter()
            .filter_map(|m| m.default_message)
            .collect::<Vec<_>>()
            .join("; ");
        if !message.is_empty() {
            return message;
        }
        if let Some(kind) = parsed.error_type {
            return kind;
        }
    }
    if body.trim().is_empty() {
        format!("HTTP {}: No error details available", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), body.trim())
    }
}
