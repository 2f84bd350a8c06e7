//! Online / primary decision driven by a scripted launcher.

use async_trait::async_trait;
use dbkeeper::gateway::{GatewayError, ProcessLauncher};
use dbkeeper::liveness::{check, Liveness};
use dbkeeper::topology::Topology;

struct Scripted {
    process_list: &'static str,
    sr_state: &'static str,
}

#[async_trait]
impl ProcessLauncher for Scripted {
    async fn run(&self, command_line: &str) -> Result<String, GatewayError> {
        if command_line.starts_with("sapcontrol -nr 02") {
            Ok(self.process_list.to_owned())
        } else if command_line == "hdbnsutil -sr_state" {
            Ok(self.sr_state.to_owned())
        } else {
            Err(GatewayError::Output(format!("unexpected command {command_line}")))
        }
    }
}

const GREEN: &str = "\
hdbdaemon, HDB Daemon, GREEN, Running
hdbindexserver, HDB Indexserver-HB1, GREEN, Running
";

fn topology() -> Topology {
    Topology {
        sid: "HB1".to_owned(),
        instance_number: "02".to_owned(),
        local_host: "hana01".to_owned(),
        hosts: vec!["hana01".to_owned()],
        communication_port: 30203,
        multitenant: false,
        tenant: None,
    }
}

#[tokio::test]
async fn green_primary_is_online() {
    let launcher = Scripted {
        process_list: GREEN,
        sr_state: "mode: none",
    };
    assert_eq!(check(&launcher, &topology()).await.ok(), Some(Liveness::Online));
}

#[tokio::test]
async fn secondary_is_replica() {
    let launcher = Scripted {
        process_list: GREEN,
        sr_state: "mode: sync\nactive primary site: 1",
    };
    assert_eq!(check(&launcher, &topology()).await.ok(), Some(Liveness::Replica));
}

#[tokio::test]
async fn stopped_service_is_offline() {
    let launcher = Scripted {
        process_list: "hdbindexserver, HDB Indexserver-HB1, GRAY, Stopped\n",
        sr_state: "mode: none",
    };
    assert_eq!(check(&launcher, &topology()).await.ok(), Some(Liveness::Offline));
}
