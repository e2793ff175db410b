//! Registrar scenarios driven through the public operations and the
//! channel, checking both the registry and the messages sent out.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use rfv_proto::config::IpcConfig;
use rfv_proto::defs::{CLIENT_SERVER_CHANNEL, PROXY_ID, SERVER_ID, SERVER_PROXY_CHANNEL};
use rfv_proto::ipc::{EnvelopeStore, IpcService, open_pool};
use rfv_proto::messages::{DatapathOperation, PortOperation, RouteModType};
use rfv_proto::{Action, ClientMessage, Directive, FlowOption, Match, Message, ProxyMessage};
use rfv_server::registry::{FieldFilter, RecordQuery};
use rfv_server::server::{DatapathRegistration, VmRegistration};
use rfv_server::{Registry, RfServer};
use tempfile::TempDir;

const VM: u64 = 0x12a0_a0a0_a0a0;
const DP: u64 = 0x99;

struct Harness {
    _tmp: TempDir,
    store: Arc<EnvelopeStore>,
    server: Arc<RfServer>,
    server_ipc: Arc<IpcService>,
}

async fn setup() -> Harness {
    let tmp = TempDir::new().unwrap();
    let pool = open_pool(&tmp.path().join("rfv.db")).await.unwrap();
    let registry = Registry::new(pool.clone()).await.unwrap();
    let store = Arc::new(EnvelopeStore::new(pool).await.unwrap());
    let config = IpcConfig::new("unused").with_poll_interval(Duration::from_millis(5));
    let server_ipc = Arc::new(IpcService::new(SERVER_ID, Arc::clone(&store), &config));
    let server = Arc::new(RfServer::new(Arc::clone(&server_ipc), registry));
    Harness {
        _tmp: tmp,
        store,
        server,
        server_ipc,
    }
}

impl Harness {
    async fn to_vm(&self, vm_id: u64) -> Vec<ClientMessage> {
        self.sent(CLIENT_SERVER_CHANNEL, &vm_id.to_string()).await
    }

    async fn to_proxy(&self) -> Vec<ProxyMessage> {
        self.sent(SERVER_PROXY_CHANNEL, PROXY_ID).await
    }

    async fn sent<M: Message>(&self, channel: &str, to: &str) -> Vec<M> {
        self.store
            .history(channel, to)
            .await
            .unwrap()
            .iter()
            .map(|e| e.decode::<M>().unwrap())
            .collect()
    }

    async fn assert_invariant(&self) {
        for record in self.server.registry().all().await.unwrap() {
            assert!(record.mapping_consistent(), "partial mapping: {record:?}");
        }
    }
}

fn base_config(dp_id: u64) -> Vec<ProxyMessage> {
    DatapathOperation::BASE
        .iter()
        .map(|operation| ProxyMessage::DatapathConfig {
            dp_id,
            operation: *operation,
        })
        .collect()
}

#[tokio::test]
async fn test_vm_before_datapath() {
    let h = setup().await;

    assert_eq!(
        h.server.register_vm(VM).await.unwrap(),
        VmRegistration::Idle
    );
    assert_eq!(
        h.to_vm(VM).await,
        vec![ClientMessage::VmRegisterResponse { accept: true }]
    );

    let records = h.server.registry().all().await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].is_idle_vm());

    assert_eq!(
        h.server.register_datapath(DP, 3, false).await.unwrap(),
        DatapathRegistration::Paired(VM)
    );

    assert_eq!(h.to_proxy().await, base_config(DP));

    let records = h.server.registry().all().await.unwrap();
    assert_eq!(records.len(), 3);
    for record in &records {
        assert_eq!(record.vm_id, Some(VM));
        assert_eq!(record.dp_id, Some(DP));
        assert!(!record.is_mapped());
    }

    assert_eq!(
        h.to_vm(VM).await,
        vec![
            ClientMessage::VmRegisterResponse { accept: true },
            ClientMessage::VmConfig { n_ports: 3 },
        ]
    );
    h.assert_invariant().await;
}

#[tokio::test]
async fn test_datapath_before_vm() {
    let h = setup().await;

    assert_eq!(
        h.server.register_datapath(DP, 2, false).await.unwrap(),
        DatapathRegistration::Idle
    );
    let records = h.server.registry().all().await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.is_idle_dp()));

    assert_eq!(
        h.server.register_vm(VM).await.unwrap(),
        VmRegistration::Paired(DP)
    );
    assert!(
        h.server
            .registry()
            .all()
            .await
            .unwrap()
            .iter()
            .all(|r| r.vm_id == Some(VM))
    );
    assert_eq!(
        h.to_vm(VM).await,
        vec![
            ClientMessage::VmRegisterResponse { accept: true },
            ClientMessage::VmConfig { n_ports: 2 },
        ]
    );
}

#[tokio::test]
async fn test_datapath_registration_is_idempotent() {
    let h = setup().await;
    h.server.register_datapath(DP, 4, false).await.unwrap();
    let first = h.server.registry().all().await.unwrap();

    assert_eq!(
        h.server.register_datapath(DP, 4, false).await.unwrap(),
        DatapathRegistration::Restored
    );
    assert_eq!(h.server.registry().all().await.unwrap(), first);
}

#[tokio::test]
async fn test_bootstrap_datapath_forwards_all() {
    let h = setup().await;
    h.server.register_vm(VM).await.unwrap();

    assert_eq!(
        h.server.register_datapath(0x1, 8, true).await.unwrap(),
        DatapathRegistration::Bootstrap
    );

    let mut expected = base_config(0x1);
    expected.push(ProxyMessage::DatapathConfig {
        dp_id: 0x1,
        operation: DatapathOperation::ForwardAll,
    });
    assert_eq!(h.to_proxy().await, expected);

    // The VM stays idle, waiting for a real datapath.
    let records = h.server.registry().all().await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].is_idle_vm());
}

#[tokio::test]
async fn test_mapping_and_datapath_restart() {
    let h = setup().await;
    h.server.register_vm(VM).await.unwrap();
    h.server.register_datapath(DP, 3, false).await.unwrap();

    assert!(h.server.map_vm(VM, 1, 0x10, 5).await.unwrap());
    let mapped = h
        .server
        .registry()
        .get_entries(&RecordQuery {
            vs_id: FieldFilter::Present,
            ..RecordQuery::vm(VM)
        })
        .await
        .unwrap();
    assert_eq!(mapped.len(), 1);
    let record = &mapped[0];
    assert!(record.is_mapped());
    assert_eq!(record.vm_port, Some(1));
    assert_eq!(record.vs_id, Some(0x10));
    assert_eq!(record.vs_port, Some(5));
    assert_eq!(record.dp_port, Some(1));

    assert_eq!(
        h.to_proxy().await.last(),
        Some(&ProxyMessage::DataPlaneMap {
            dp_id: DP,
            dp_port: 1,
            vs_id: 0x10,
            vs_port: 5,
        })
    );
    h.assert_invariant().await;

    // The datapath goes away: mappings are forgotten, the pairing stays.
    h.server.datapath_leave(DP).await.unwrap();
    let records = h.server.registry().all().await.unwrap();
    assert_eq!(records.len(), 3);
    for record in &records {
        assert_eq!(record.vm_id, Some(VM));
        assert_eq!(record.dp_id, Some(DP));
        assert!(!record.is_mapped());
    }
    h.assert_invariant().await;

    // And comes back.
    assert_eq!(
        h.server.register_datapath(DP, 3, false).await.unwrap(),
        DatapathRegistration::Restored
    );
    let proxy = h.to_proxy().await;
    assert_eq!(&proxy[proxy.len() - 6..], base_config(DP).as_slice());
    assert_eq!(
        h.to_vm(VM).await.last(),
        Some(&ClientMessage::VmConfig { n_ports: 3 })
    );
}

fn data_plane_maps(messages: &[ProxyMessage]) -> usize {
    messages
        .iter()
        .filter(|m| matches!(m, ProxyMessage::DataPlaneMap { .. }))
        .count()
}

impl Harness {
    /// VM ports of the mapped records, sorted, with repeats kept.
    async fn mapped_ports(&self, vm_id: u64) -> Vec<u32> {
        let mut ports: Vec<u32> = self
            .server
            .registry()
            .get_entries(&RecordQuery {
                vs_id: FieldFilter::Present,
                ..RecordQuery::vm(vm_id)
            })
            .await
            .unwrap()
            .iter()
            .filter_map(|r| r.vm_port)
            .collect();
        ports.sort_unstable();
        ports
    }
}

#[tokio::test]
async fn test_repeated_mapping_report() {
    let h = setup().await;
    h.server.register_vm(VM).await.unwrap();
    h.server.register_datapath(DP, 3, false).await.unwrap();

    assert!(h.server.map_vm(VM, 1, 0x77, 5).await.unwrap());
    assert!(!h.server.map_vm(VM, 1, 0x77, 5).await.unwrap());
    assert_eq!(h.mapped_ports(VM).await, vec![1]);
    assert_eq!(data_plane_maps(&h.to_proxy().await), 1);

    // The remaining ports still find a free record.
    assert!(h.server.map_vm(VM, 2, 0x77, 6).await.unwrap());
    assert!(h.server.map_vm(VM, 3, 0x77, 7).await.unwrap());
    assert_eq!(h.mapped_ports(VM).await, vec![1, 2, 3]);
    h.assert_invariant().await;
}

#[tokio::test]
async fn test_mapping_report_rebinds_switch_port() {
    let h = setup().await;
    h.server.register_vm(VM).await.unwrap();
    h.server.register_datapath(DP, 2, false).await.unwrap();

    assert!(h.server.map_vm(VM, 1, 0x77, 5).await.unwrap());
    assert!(h.server.map_vm(VM, 1, 0x78, 9).await.unwrap());
    assert_eq!(h.mapped_ports(VM).await, vec![1]);

    let records = h
        .server
        .registry()
        .get_entries(&RecordQuery {
            vm_port: FieldFilter::Eq(1),
            ..RecordQuery::vm(VM)
        })
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].vs_id, Some(0x78));
    assert_eq!(records[0].vs_port, Some(9));
    assert_eq!(records[0].dp_port, Some(1));
    assert_eq!(
        h.to_proxy().await.last(),
        Some(&ProxyMessage::DataPlaneMap {
            dp_id: DP,
            dp_port: 1,
            vs_id: 0x78,
            vs_port: 9,
        })
    );
    h.assert_invariant().await;
}

#[tokio::test]
async fn test_mapping_replay_after_partial_restore() {
    let h = setup().await;
    h.server.register_vm(VM).await.unwrap();
    h.server.register_datapath(DP, 3, false).await.unwrap();
    assert!(h.server.map_vm(VM, 1, 0x77, 5).await.unwrap());
    assert!(h.server.map_vm(VM, 2, 0x77, 6).await.unwrap());

    // The VM re-announces every interface; only port 3 is new.
    assert!(!h.server.map_vm(VM, 1, 0x77, 5).await.unwrap());
    assert!(!h.server.map_vm(VM, 2, 0x77, 6).await.unwrap());
    assert!(h.server.map_vm(VM, 3, 0x77, 7).await.unwrap());

    assert_eq!(h.mapped_ports(VM).await, vec![1, 2, 3]);
    let records = h.server.registry().get_entries(&RecordQuery::vm(VM)).await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.is_mapped()));
    assert_eq!(data_plane_maps(&h.to_proxy().await), 3);
    h.assert_invariant().await;
}

#[tokio::test]
async fn test_vm_reregistration_resets_mapping() {
    let h = setup().await;
    h.server.register_vm(VM).await.unwrap();
    h.server.register_datapath(DP, 2, false).await.unwrap();
    h.server.map_vm(VM, 1, DP, 1).await.unwrap();
    h.server.map_vm(VM, 2, DP, 2).await.unwrap();
    // No unmapped record left.
    assert!(!h.server.map_vm(VM, 3, DP, 3).await.unwrap());

    assert_eq!(
        h.server.register_vm(VM).await.unwrap(),
        VmRegistration::Restored
    );
    let records = h.server.registry().all().await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| !r.is_mapped() && r.dp_id == Some(DP)));
    h.assert_invariant().await;
}

#[tokio::test]
async fn test_route_report_forwarding() {
    let h = setup().await;
    let directive = Directive::new(RouteModType::Add, VM)
        .with_match(Match::ipv4(
            Ipv4Addr::new(10, 1, 0, 0),
            Ipv4Addr::new(255, 255, 255, 0),
        ))
        .with_action(Action::output(2))
        .with_option(FlowOption::priority(0x8018));

    // Unpaired VM: dropped.
    h.server.register_vm(VM).await.unwrap();
    assert!(!h.server.route_mod(directive.clone()).await.unwrap());
    assert!(h.to_proxy().await.is_empty());

    h.server.register_datapath(DP, 2, false).await.unwrap();
    assert!(h.server.route_mod(directive.clone()).await.unwrap());

    let mut expected = directive.clone();
    expected.target = DP;
    assert_eq!(
        h.to_proxy().await.last(),
        Some(&ProxyMessage::FlowMod(expected))
    );
}

#[tokio::test]
async fn test_port_down_and_up() {
    let h = setup().await;
    h.server.register_vm(VM).await.unwrap();
    h.server.register_datapath(DP, 2, false).await.unwrap();
    h.server.map_vm(VM, 2, 0x10, 7).await.unwrap();

    h.server.datapath_port_status(DP, 2, false).await.unwrap();
    assert!(
        h.server
            .registry()
            .all()
            .await
            .unwrap()
            .iter()
            .all(|r| !r.is_mapped())
    );
    assert_eq!(
        h.to_vm(VM).await.last(),
        Some(&ClientMessage::PortConfig {
            vm_id: VM,
            vm_port: 2,
            operation: PortOperation::Reset,
        })
    );
    h.assert_invariant().await;

    h.server.datapath_port_status(DP, 2, true).await.unwrap();
    assert_eq!(
        h.to_vm(VM).await.last(),
        Some(&ClientMessage::PortConfig {
            vm_id: VM,
            vm_port: 2,
            operation: PortOperation::Map,
        })
    );
}

#[tokio::test]
async fn test_messages_through_channel() {
    let h = setup().await;
    let config = IpcConfig::new("unused");
    let vm = IpcService::new(VM.to_string(), Arc::clone(&h.store), &config);
    let proxy = IpcService::new(PROXY_ID, Arc::clone(&h.store), &config);

    vm.send(
        CLIENT_SERVER_CHANNEL,
        SERVER_ID,
        &ClientMessage::VmRegisterRequest { vm_id: VM },
    )
    .await
    .unwrap();
    proxy
        .send(
            SERVER_PROXY_CHANNEL,
            SERVER_ID,
            &ProxyMessage::DatapathJoin {
                dp_id: DP,
                n_ports: 1,
                is_bootstrap: false,
            },
        )
        .await
        .unwrap();

    let handled = h
        .server_ipc
        .poll_once::<ClientMessage, _>(CLIENT_SERVER_CHANNEL, h.server.as_ref())
        .await
        .unwrap();
    assert_eq!(handled, 1);
    let handled = h
        .server_ipc
        .poll_once::<ProxyMessage, _>(SERVER_PROXY_CHANNEL, h.server.as_ref())
        .await
        .unwrap();
    assert_eq!(handled, 1);

    let records = h.server.registry().all().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].vm_id, Some(VM));
    assert_eq!(records[0].dp_id, Some(DP));
}
