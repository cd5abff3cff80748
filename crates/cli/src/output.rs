//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use vmcaptain_common::{MetricPoint, Snapshot, StatsSummary, User, Vm, VmStatus};

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// Plain `key: value` lines
    Plain,
}

/// Items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

fn table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn print_plain(headers: &[&str], row: &[String]) {
    for (header, value) in headers.iter().zip(row.iter()) {
        println!("{}: {}", header, value);
    }
}

/// Print a single item
pub fn print_item<T: Serialize + TableDisplay>(item: &T, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            let mut table = table();
            table.set_header(T::headers());
            table.add_row(item.row());
            println!("{table}");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(item).unwrap_or_default());
        }
        OutputFormat::Plain => print_plain(&T::headers(), &item.row()),
    }
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    if let OutputFormat::Json = format {
        println!("{}", serde_json::to_string_pretty(items).unwrap_or_default());
        return;
    }
    if items.is_empty() {
        println!("No items found.");
        return;
    }

    match format {
        OutputFormat::Table => {
            let mut table = table();
            table.set_header(T::headers());
            for item in items {
                table.add_row(item.row());
            }
            println!("{table}");
        }
        _ => {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    println!("---");
                }
                print_plain(&T::headers(), &item.row());
            }
        }
    }
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red(), message);
}

pub fn print_warning(message: &str) {
    eprintln!("{} {}", "!".yellow(), message);
}

/// Colored status label
pub fn status_label(status: VmStatus) -> String {
    let label = status.to_string();
    match status {
        VmStatus::Running => label.green().to_string(),
        VmStatus::Stopped => label.dimmed().to_string(),
        VmStatus::Suspended | VmStatus::Maintenance => label.yellow().to_string(),
        VmStatus::Error => label.red().to_string(),
    }
}

fn percent(value: u8, status: VmStatus) -> String {
    if status == VmStatus::Running {
        format!("{}%", value)
    } else {
        "-".to_string()
    }
}

impl TableDisplay for Vm {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Status", "OS", "CPUs", "Memory", "CPU %", "Mem %", "Disk %", "IP"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            status_label(self.status),
            self.os.clone(),
            self.cpu.to_string(),
            format!("{}GB", self.memory),
            percent(self.cpu_usage, self.status),
            percent(self.memory_usage, self.status),
            percent(self.disk_usage, self.status),
            self.ip_address.clone().unwrap_or_else(|| "-".to_string()),
        ]
    }
}

impl TableDisplay for User {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Username", "Role", "Assigned VMs"]
    }

    fn row(&self) -> Vec<String> {
        let assigned = if self.is_admin() {
            "(all)".to_string()
        } else if self.assigned_vms.is_empty() {
            "-".to_string()
        } else {
            self.assigned_vms.join(", ")
        };
        vec![
            self.id.clone(),
            self.username.clone(),
            self.role.to_string(),
            assigned,
        ]
    }
}

/// One snapshot in a flattened tree listing
#[derive(Debug, Serialize)]
pub struct SnapshotRow {
    pub depth: usize,
    pub id: String,
    pub name: String,
    pub description: String,
    pub create_time: Option<String>,
    pub state: Option<String>,
}

/// Flatten a snapshot tree depth-first
pub fn flatten_snapshots(roots: &[Snapshot]) -> Vec<SnapshotRow> {
    fn walk(nodes: &[Snapshot], depth: usize, out: &mut Vec<SnapshotRow>) {
        for node in nodes {
            out.push(SnapshotRow {
                depth,
                id: node.id.clone(),
                name: node.name.clone(),
                description: node.description.clone(),
                create_time: node.create_time.clone(),
                state: node.state.clone(),
            });
            walk(&node.children, depth + 1, out);
        }
    }
    let mut out = Vec::new();
    walk(roots, 0, &mut out);
    out
}

/// Render an RFC 3339 timestamp in local time; anything else is shown as-is
fn format_time(raw: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| {
            dt.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|_| raw.to_string())
}

impl TableDisplay for SnapshotRow {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Description", "Created", "State"]
    }

    fn row(&self) -> Vec<String> {
        let indent = if self.depth == 0 {
            String::new()
        } else {
            format!("{}└ ", "  ".repeat(self.depth - 1))
        };
        vec![
            self.id.clone(),
            format!("{}{}", indent, self.name),
            self.description.clone(),
            self.create_time
                .as_deref()
                .map(format_time)
                .unwrap_or_else(|| "-".to_string()),
            self.state.clone().unwrap_or_else(|| "-".to_string()),
        ]
    }
}

impl TableDisplay for StatsSummary {
    fn headers() -> Vec<&'static str> {
        vec![
            "Total", "Running", "Stopped", "Suspended", "Error", "vCPUs", "Memory", "Avg CPU",
            "Avg Mem",
        ]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.total_vms.to_string(),
            self.running_vms.to_string(),
            self.stopped_vms.to_string(),
            self.suspended_vms.to_string(),
            self.error_vms.to_string(),
            self.total_cpus.to_string(),
            format!("{}GB", self.total_memory_gb),
            format!("{}%", self.average_cpu_usage),
            format!("{}%", self.average_memory_usage),
        ]
    }
}

/// One row of a usage history listing
#[derive(Debug, Serialize)]
pub struct MetricRow {
    pub time: String,
    pub cpu: u8,
    pub memory: u8,
}

/// Zip the cpu and memory series into rows
pub fn metric_rows(cpu: &[MetricPoint], memory: &[MetricPoint]) -> Vec<MetricRow> {
    cpu.iter()
        .zip(memory.iter())
        .map(|(c, m)| MetricRow {
            time: c.time.clone(),
            cpu: c.value,
            memory: m.value,
        })
        .collect()
}

impl TableDisplay for MetricRow {
    fn headers() -> Vec<&'static str> {
        vec!["Time", "CPU %", "Memory %"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.time.clone(), self.cpu.to_string(), self.memory.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(id: &str, children: Vec<Snapshot>) -> Snapshot {
        Snapshot {
            id: id.into(),
            name: id.into(),
            description: String::new(),
            create_time: None,
            state: None,
            children,
        }
    }

    #[test]
    fn test_flatten_snapshots_depth_first() {
        let tree = vec![
            snap("a", vec![snap("b", vec![snap("c", vec![])])]),
            snap("d", vec![]),
        ];
        let rows = flatten_snapshots(&tree);
        let order: Vec<(&str, usize)> = rows.iter().map(|r| (r.id.as_str(), r.depth)).collect();
        assert_eq!(order, vec![("a", 0), ("b", 1), ("c", 2), ("d", 0)]);
        assert_eq!(rows[2].row()[1], "  └ c");
    }

    #[test]
    fn test_format_time_passes_through_unparsable() {
        assert_eq!(format_time("yesterday"), "yesterday");
        assert_eq!(format_time("2024-03-01T10:00:00+00:00").len(), 19);
    }

    #[test]
    fn test_user_row_shows_grants() {
        let user = User {
            id: "user-1".into(),
            username: "user".into(),
            role: vmcaptain_common::Role::User,
            assigned_vms: vec!["vm-001".into(), "vm-002".into()],
        };
        assert_eq!(user.row()[3], "vm-001, vm-002");
    }

    #[test]
    fn test_metric_rows() {
        let cpu = vec![
            MetricPoint { time: "00:00".into(), value: 10 },
            MetricPoint { time: "00:15".into(), value: 20 },
        ];
        let memory = vec![
            MetricPoint { time: "00:00".into(), value: 30 },
            MetricPoint { time: "00:15".into(), value: 40 },
        ];
        let rows = metric_rows(&cpu, &memory);
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[1].cpu, rows[1].memory), (20, 40));
    }
}
