//! Is the instance up, and is it the primary?
//!
//! Both tools refuse to touch a database that is down or that is the
//! secondary side of a system replication pair.

use tracing::debug;

use crate::gateway::{GatewayError, ProcessLauncher};
use crate::topology::Topology;

/// Counts scraped from the instance's process list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessListStatus {
    /// Database services listed.
    pub services: usize,
    /// Services reported GREEN.
    pub running: usize,
    /// Index server processes listed.
    pub indexservers: usize,
}

impl ProcessListStatus {
    /// Online when every listed service is GREEN and an index server exists.
    pub fn is_online(&self) -> bool {
        self.services > 0 && self.running == self.services && self.indexservers != 0
    }
}

/// Parse the output of `sapcontrol -function GetProcessList`.
pub fn parse_process_list(output: &str) -> ProcessListStatus {
    ProcessListStatus {
        services: output
            .matches(" HDB ")
            .count()
            .saturating_add(output.matches(" Local Secure Store").count()),
        running: output.matches("GREEN").count(),
        indexservers: output.matches("hdbindexserver").count(),
    }
}

/// Command listing the instance's processes.
pub fn process_list_command(topology: &Topology) -> String {
    format!(
        "sapcontrol -nr {} -function GetProcessList",
        topology.instance_number
    )
}

/// Command printing the system replication state.
pub const REPLICATION_STATE_COMMAND: &str = "hdbnsutil -sr_state";

/// Whether `hdbnsutil -sr_state` output describes a secondary site.
pub fn is_replica_output(output: &str) -> bool {
    output.contains("active primary site")
}

/// Where the instance stands right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Running and primary.
    Online,
    /// Not every service is running.
    Offline,
    /// Running, but the secondary of a replication pair.
    Replica,
}

/// Query the process list and replication state.
///
/// # Errors
///
/// Propagates launcher errors; a missing tool is not treated as offline.
pub async fn check(
    launcher: &dyn ProcessLauncher,
    topology: &Topology,
) -> Result<Liveness, GatewayError> {
    let processes = launcher.run(&process_list_command(topology)).await?;
    let status = parse_process_list(&processes);
    debug!(?status, "process list");
    if !status.is_online() {
        return Ok(Liveness::Offline);
    }
    let replication = launcher.run(REPLICATION_STATE_COMMAND).await?;
    if is_replica_output(&replication) {
        return Ok(Liveness::Replica);
    }
    Ok(Liveness::Online)
}
