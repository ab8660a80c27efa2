use std::{net::SocketAddr, time::Duration};

use camirror::{
    Provider, ServerBuilder, ServerHandle,
    client::{Circuit, ClientError},
    dbr::{DbrBasicType, DbrCategory, DbrType, DbrValue},
    messages::{Access, EPICS_VERSION, ErrorCondition},
    providers::{BridgeState, LocalProvider, LocalPvSpec, MirrorBuilder, MirrorProvider},
};
use tokio::select;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::fmt::TestWriter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();
}

/// Start a plain server on random free ports to act as the remote IOC
async fn serve_upstream(provider: LocalProvider) -> ServerHandle {
    ServerBuilder::new(provider)
        .connection_port(0)
        .search_port(0)
        .beacons(false)
        .start()
        .await
        .unwrap()
}

/// Mirror `names` from a local upstream port and serve them on random ports
async fn serve_mirror(
    names: &[&str],
    upstream_port: u16,
    read_only: bool,
) -> (MirrorProvider, ServerHandle) {
    let upstream: SocketAddr = format!("127.0.0.1:{upstream_port}").parse().unwrap();
    let mut builder = MirrorBuilder::default().force_read_only(read_only);
    for name in names {
        builder = builder.add_pv(name, upstream);
    }
    let provider = builder.assemble().await.unwrap();
    let server = ServerBuilder::new(provider.clone())
        .connection_port(0)
        .search_port(0)
        .beacons(false)
        .start()
        .await
        .unwrap();
    info!(
        "Mirror server ports: {} {}",
        server.connection_port(),
        server.search_port()
    );
    (provider, server)
}

/// Wait until a mirror's bridge reports the given state, or panic
async fn wait_for_bridge(provider: &MirrorProvider, name: &str, state: BridgeState) {
    let mut watcher = provider.watch_bridge(name).unwrap();
    select! {
        _ = tokio::time::sleep(Duration::from_secs(4)) => panic!("Bridge never reached {state:?}"),
        result = watcher.wait_for(|s| *s == state) => {
            result.unwrap();
        }
    }
}

async fn connect_to(server: &ServerHandle) -> Circuit {
    let address: SocketAddr = format!("127.0.0.1:{}", server.connection_port())
        .parse()
        .unwrap();
    Circuit::connect(&address, EPICS_VERSION).await.unwrap()
}

#[tokio::test]
async fn test_mirror_follows_upstream() {
    init_logging();
    let mut upstream_provider = LocalProvider::new();
    let pv = upstream_provider.add_pv("VALUE", 3.14f64).unwrap();
    let mut upstream_updates = upstream_provider.subscribe("VALUE").unwrap();
    let upstream = serve_upstream(upstream_provider).await;

    let (mirror_provider, mirror) =
        serve_mirror(&["VALUE"], upstream.connection_port(), false).await;
    wait_for_bridge(&mirror_provider, "mirror:VALUE", BridgeState::Subscribed).await;

    let circuit = connect_to(&mirror).await;
    let channel = circuit.get_channel("mirror:VALUE").await.unwrap();
    assert_eq!(channel.native_type, DbrBasicType::Double);
    assert!(channel.permissions.can_write());
    assert_eq!(
        circuit
            .read_pv("mirror:VALUE", DbrCategory::Basic)
            .await
            .unwrap()
            .value(),
        &DbrValue::Double(vec![3.14])
    );

    // An upstream change arrives through the subscription, and is served
    // with the timestamp the upstream server stamped it with
    let mut updates = circuit
        .subscribe("mirror:VALUE", DbrCategory::Time)
        .await
        .unwrap();
    assert_eq!(
        updates.recv().await.unwrap().value(),
        &DbrValue::Double(vec![3.14])
    );
    pv.store(2.71f64);
    let stamped = select! {
        _ = tokio::time::sleep(Duration::from_secs(4)) => panic!("Upstream never broadcast the store"),
        update = upstream_updates.recv() => update.unwrap(),
    };
    select! {
        _ = tokio::time::sleep(Duration::from_secs(4)) => panic!("Did not get subscription event"),
        update = updates.recv() => {
            let update = update.unwrap();
            assert_eq!(update.value(), &DbrValue::Double(vec![2.71]));
            assert_eq!(update.timestamp(), stamped.timestamp());
        }
    }

    mirror.stop().await.unwrap();
    upstream.stop().await.unwrap();
}

#[tokio::test]
async fn test_writes_travel_upstream_once() {
    init_logging();
    let mut upstream_provider = LocalProvider::new();
    let pv = upstream_provider.add_pv("SETPOINT", 10i32).unwrap();
    let mut upstream_updates = upstream_provider.subscribe("SETPOINT").unwrap();
    let upstream = serve_upstream(upstream_provider).await;
    let (mirror_provider, mirror) =
        serve_mirror(&["SETPOINT"], upstream.connection_port(), false).await;
    wait_for_bridge(&mirror_provider, "mirror:SETPOINT", BridgeState::Subscribed).await;

    let circuit = connect_to(&mirror).await;
    let mut updates = circuit
        .subscribe("mirror:SETPOINT", DbrCategory::Basic)
        .await
        .unwrap();
    assert_eq!(
        updates.recv().await.unwrap().value(),
        &DbrValue::Long(vec![10])
    );

    // The put completes once the remote server has accepted the value
    circuit
        .write_pv(
            "mirror:SETPOINT",
            DbrValue::Long(vec![55]),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert_eq!(pv.load(), 55);

    // ... and the value shows up locally by coming back around through
    // the upstream subscription
    select! {
        _ = tokio::time::sleep(Duration::from_secs(4)) => panic!("Did not get subscription event"),
        update = updates.recv() => {
            assert_eq!(update.unwrap().value(), &DbrValue::Long(vec![55]));
        }
    }

    // The upstream server saw exactly one write: applying the mirrored
    // update must not send it upstream a second time
    select! {
        _ = tokio::time::sleep(Duration::from_secs(4)) => panic!("Upstream never saw the write"),
        update = upstream_updates.recv() => {
            assert_eq!(update.unwrap().value(), &DbrValue::Long(vec![55]));
        }
    }
    select! {
        _ = tokio::time::sleep(Duration::from_millis(500)) => (),
        update = upstream_updates.recv() => panic!("Upstream saw an extra write: {update:?}"),
    }

    mirror.stop().await.unwrap();
    upstream.stop().await.unwrap();
}

#[tokio::test]
async fn test_read_only_mirrors_reject_writes() {
    init_logging();
    let mut upstream_provider = LocalProvider::new();
    upstream_provider
        .add_spec(
            "LOCKED",
            LocalPvSpec::new(DbrValue::Long(vec![7])).read_only(true),
        )
        .unwrap();
    let pv = upstream_provider.add_pv("OPEN", 1i32).unwrap();
    let upstream = serve_upstream(upstream_provider).await;

    // Without forcing, the mirror takes its rights from the remote channel
    let (mirror_provider, mirror) =
        serve_mirror(&["LOCKED", "OPEN"], upstream.connection_port(), false).await;
    wait_for_bridge(&mirror_provider, "mirror:OPEN", BridgeState::Subscribed).await;
    let circuit = connect_to(&mirror).await;
    assert_eq!(
        circuit.get_channel("mirror:LOCKED").await.unwrap().permissions,
        Access::Read
    );
    assert_eq!(
        circuit.get_channel("mirror:OPEN").await.unwrap().permissions,
        Access::ReadWrite
    );
    match circuit
        .write_pv(
            "mirror:LOCKED",
            DbrValue::Long(vec![8]),
            Duration::from_secs(2),
        )
        .await
    {
        Err(ClientError::WriteRejected(ErrorCondition::NoWtAccess)) => (),
        other => panic!("Expected a write rejection, got {other:?}"),
    }
    assert_eq!(
        circuit
            .read_pv("mirror:LOCKED", DbrCategory::Basic)
            .await
            .unwrap()
            .value(),
        &DbrValue::Long(vec![7])
    );

    // Forcing read-only denies writes even where the remote allows them
    let (_forced_provider, forced) =
        serve_mirror(&["OPEN"], upstream.connection_port(), true).await;
    let forced_circuit = connect_to(&forced).await;
    assert_eq!(
        forced_circuit
            .get_channel("mirror:OPEN")
            .await
            .unwrap()
            .permissions,
        Access::Read
    );
    match forced_circuit
        .write_pv("mirror:OPEN", DbrValue::Long(vec![2]), Duration::from_secs(2))
        .await
    {
        Err(ClientError::WriteRejected(ErrorCondition::NoWtAccess)) => (),
        other => panic!("Expected a write rejection, got {other:?}"),
    }
    assert_eq!(pv.load(), 1);

    forced.stop().await.unwrap();
    mirror.stop().await.unwrap();
    upstream.stop().await.unwrap();
}

#[tokio::test]
async fn test_enum_writes_translate_labels() {
    init_logging();
    let mut upstream_provider = LocalProvider::new();
    upstream_provider
        .add_spec(
            "POWER",
            LocalPvSpec::new(DbrValue::Enum(0)).enum_labels(["OFF", "ON"]),
        )
        .unwrap();
    let mut upstream_updates = upstream_provider.subscribe("POWER").unwrap();
    let upstream = serve_upstream(upstream_provider).await;
    let (mirror_provider, mirror) =
        serve_mirror(&["POWER"], upstream.connection_port(), false).await;
    wait_for_bridge(&mirror_provider, "mirror:POWER", BridgeState::Subscribed).await;

    let circuit = connect_to(&mirror).await;
    let channel = circuit.get_channel("mirror:POWER").await.unwrap();
    assert_eq!(channel.native_type, DbrBasicType::Enum);

    let mut updates = circuit
        .subscribe("mirror:POWER", DbrCategory::Basic)
        .await
        .unwrap();
    assert_eq!(updates.recv().await.unwrap().value(), &DbrValue::Enum(0));

    // Writing a state string travels upstream as the matching state code
    circuit
        .write_pv(
            "mirror:POWER",
            DbrValue::String(vec!["ON".to_string()]),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    select! {
        _ = tokio::time::sleep(Duration::from_secs(4)) => panic!("Upstream never saw the enum write"),
        update = upstream_updates.recv() => {
            assert_eq!(update.unwrap().value(), &DbrValue::Enum(1));
        }
    }
    select! {
        _ = tokio::time::sleep(Duration::from_secs(4)) => panic!("Did not get subscription event"),
        update = updates.recv() => {
            assert_eq!(update.unwrap().value(), &DbrValue::Enum(1));
        }
    }

    // A string read of the mirrored copy reports the state label
    let label = mirror_provider
        .read_value(
            "mirror:POWER",
            Some(DbrType {
                basic_type: DbrBasicType::String,
                category: DbrCategory::Basic,
            }),
        )
        .unwrap();
    assert_eq!(label.value(), &DbrValue::String(vec!["ON".to_string()]));

    // A string that matches no state is rejected before anything is sent
    match circuit
        .write_pv(
            "mirror:POWER",
            DbrValue::String(vec!["MAYBE".to_string()]),
            Duration::from_secs(2),
        )
        .await
    {
        Err(ClientError::WriteRejected(ErrorCondition::NoConvert)) => (),
        other => panic!("Expected a conversion rejection, got {other:?}"),
    }

    mirror.stop().await.unwrap();
    upstream.stop().await.unwrap();
}

#[tokio::test]
async fn test_lost_upstream_serves_last_value() {
    init_logging();
    let mut upstream_provider = LocalProvider::new();
    let _pv = upstream_provider.add_pv("VALUE", 5i32).unwrap();
    let upstream = serve_upstream(upstream_provider).await;
    let (mirror_provider, mirror) =
        serve_mirror(&["VALUE"], upstream.connection_port(), false).await;
    wait_for_bridge(&mirror_provider, "mirror:VALUE", BridgeState::Subscribed).await;

    // Take the upstream server away; the bridge falls back to retrying
    upstream.stop().await.unwrap();
    wait_for_bridge(&mirror_provider, "mirror:VALUE", BridgeState::Connecting).await;

    // The last known value is still served while the bridge retries
    let circuit = connect_to(&mirror).await;
    assert_eq!(
        circuit
            .read_pv("mirror:VALUE", DbrCategory::Basic)
            .await
            .unwrap()
            .value(),
        &DbrValue::Long(vec![5])
    );
    // ... but a write has nowhere to go
    match circuit
        .write_pv(
            "mirror:VALUE",
            DbrValue::Long(vec![6]),
            Duration::from_secs(2),
        )
        .await
    {
        Err(ClientError::WriteRejected(ErrorCondition::Disconn)) => (),
        other => panic!("Expected a disconnected write to fail, got {other:?}"),
    }
    assert_eq!(
        circuit
            .read_pv("mirror:VALUE", DbrCategory::Basic)
            .await
            .unwrap()
            .value(),
        &DbrValue::Long(vec![5])
    );

    mirror.stop().await.unwrap();
}
