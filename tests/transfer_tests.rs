use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use stream_migration::{
    AddressBinding, Application, SessionConfig, SessionError, SessionEvent, SessionState,
    Simulation, SimulationConfig, SocketKind,
};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn request_only() -> SessionConfig {
    SessionConfig::default().with_echo(false)
}

#[test]
fn test_bulk_transfer_completes_after_close() {
    let mut sim = Simulation::new(SimulationConfig::default());
    let id = sim.add_client(request_only(), AddressBinding::new(1, ip("10.1.1.1")));
    sim.start().unwrap();

    // Step until every payload byte has been read; the FIN is a later delivery.
    while sim.client(id).unwrap().total_bytes_received() < 15360 {
        assert!(sim.step(), "run ended before the bulk reply arrived");
    }
    let client = sim.client(id).unwrap();
    assert_eq!(client.completed_transfer_bytes(), 0);
    assert_eq!(client.state(), SessionState::Connected);

    let report = sim.run();
    assert_eq!(report.server.total_rx, 13);
    assert_eq!(report.server.total_tx, 15360);
    assert_eq!(report.server.stats.bulk_replies_completed, 1);
    assert_eq!(report.clients[0].total_rx, 15360);
    assert_eq!(report.clients[0].total_tx, 13);
    assert_eq!(report.clients[0].completed, 15360);
}

#[test]
fn test_server_rx_matches_client_uploads() {
    let mut sim = Simulation::new(SimulationConfig::default());
    let config = request_only().with_upload_bytes(4000);
    let id = sim.add_client(config, AddressBinding::new(1, ip("10.1.1.1")));
    sim.start().unwrap();
    let report = sim.run();

    assert_eq!(report.server.total_rx, 4000 + 13);
    assert_eq!(report.clients[0].total_tx, 4000 + 13);
    assert_eq!(sim.client(id).unwrap().completed_transfer_bytes(), 15360);
}

#[test]
fn test_echo_reflects_payload() {
    let config = SimulationConfig::default().with_server(SessionConfig::default().with_echo(true));
    let mut sim = Simulation::new(config);
    let upload = request_only().with_upload_bytes(1024);
    let id = sim.add_client(upload, AddressBinding::new(1, ip("10.1.1.1")));
    sim.start().unwrap();
    let report = sim.run();

    // Echoed bytes count against the reply budget of the connection.
    assert_eq!(report.server.total_rx, 1024 + 13);
    assert_eq!(report.server.total_tx, 15360);
    assert_eq!(report.server.stats.echoed_bytes, 1024);
    let client = sim.client(id).unwrap();
    assert_eq!(client.total_bytes_received(), 15360);
    assert_eq!(client.completed_transfer_bytes(), 15360);
}

#[test]
fn test_two_clients_are_independent() {
    let mut sim = Simulation::new(SimulationConfig::default());
    let small = sim.add_client(
        request_only().with_max_transfer_bytes(2048),
        AddressBinding::new(1, ip("10.1.1.1")),
    );
    let large = sim.add_client(request_only(), AddressBinding::new(1, ip("10.1.2.1")));
    sim.start().unwrap();
    sim.run();

    // The server's bulk budget is its own; the small client sees it all but
    // only the large client expected that much.
    let small = sim.client(small).unwrap();
    let large = sim.client(large).unwrap();
    assert_eq!(small.total_bytes_received(), 15360);
    assert_eq!(small.completed_transfer_bytes(), 15360);
    assert_eq!(large.total_bytes_received(), 15360);
    assert_eq!(large.completed_transfer_bytes(), 15360);
    assert_eq!(sim.server().total_bytes_received(), 26);
    assert_eq!(sim.server().stats().accepted, 2);
}

#[test]
fn test_connection_refused_is_not_fatal() {
    let mut sim = Simulation::new(SimulationConfig::default());
    let wrong_port: SocketAddr = "10.1.3.1:10".parse().unwrap();
    let id = sim.add_client_to(
        request_only(),
        AddressBinding::new(1, ip("10.1.1.1")),
        wrong_port,
    );
    let mut events = sim.subscribe();
    sim.start().unwrap();
    let report = sim.run();

    let client = sim.client(id).unwrap();
    assert_eq!(client.stats().connect_failures, 1);
    assert_eq!(client.total_bytes_sent(), 0);
    assert_eq!(report.network.connections_refused, 1);
    assert!(events
        .drain()
        .contains(&SessionEvent::ClientConnectFailed { client: id }));
}

#[test]
fn test_datagram_configuration_is_rejected() {
    let mut sim = Simulation::new(SimulationConfig::default());
    sim.add_client(
        SessionConfig::default().with_socket_kind(SocketKind::Datagram),
        AddressBinding::new(1, ip("10.1.1.1")),
    );

    let err = sim.start().unwrap_err();
    assert!(matches!(err, SessionError::NotStreamOriented { .. }));
}

#[test]
fn test_stop_at_ends_everything() {
    let config = SimulationConfig::default().with_stop_at(Duration::from_millis(20));
    let mut sim = Simulation::new(config);
    let id = sim.add_client(request_only(), AddressBinding::new(1, ip("10.1.1.1")));
    sim.start().unwrap();
    let report = sim.run();

    assert!(report.ended_at >= Duration::from_millis(20));
    assert_eq!(report.clients[0].state, SessionState::Disconnected);
    assert_eq!(sim.client(id).unwrap().completed_transfer_bytes(), 0);
    assert!(sim.server().active_connections().is_empty());
}
