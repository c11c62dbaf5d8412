//! Integration tests for session negotiation through `GameStreamClient`.
//!
//! A simulated host sits behind a simulated network; the client locates it
//! by address, pairs, and then runs every post-pairing operation.

mod common;

use std::sync::Arc;

use common::{
    client_ids, SimulatedHost, SimulatedNetwork, BOX_ART, CORRECT_PIN, HOST_ADDRESS, HOST_ID,
};
use gs_client::application::client_api::{ClientError, GameStreamClient};
use gs_client::application::discover_hosts::DiscoverySettings;
use gs_client::application::negotiate_session::SessionError;
use gs_client::application::pair_host::PairingFailure;
use gs_core::{
    ClientIdentity, ControlError, HostEndpoint, HostId, LaunchVerb, PairStatus, StreamConfig,
};

struct Fixture {
    host: Arc<SimulatedHost>,
    client: GameStreamClient,
}

fn fixture() -> Fixture {
    let host = SimulatedHost::new(HOST_ID, CORRECT_PIN);
    let network = SimulatedNetwork::new(client_ids("CLIENT-1"));
    network.attach(HOST_ADDRESS, host.clone());
    let client = GameStreamClient::new(
        network,
        ClientIdentity::generate().unwrap(),
        None,
        DiscoverySettings::default(),
    );
    Fixture { host, client }
}

async fn located(f: &Fixture) -> HostEndpoint {
    let (endpoint, _) = f.client.locate(HOST_ADDRESS, 47989, 47984).await.unwrap();
    endpoint
}

async fn paired(f: &Fixture) -> HostEndpoint {
    let endpoint = located(f).await;
    f.client.pair(&endpoint, CORRECT_PIN).await.unwrap();
    endpoint
}

#[tokio::test]
async fn test_locate_keys_endpoint_by_unique_id() {
    // Arrange
    let f = fixture();

    // Act
    let (endpoint, info) = f.client.locate(HOST_ADDRESS, 47989, 47984).await.unwrap();

    // Assert
    assert_eq!(endpoint.id, HostId::from(HOST_ID));
    assert_eq!(endpoint.address, HOST_ADDRESS);
    assert_eq!(endpoint.name, "DESKTOP-SIM");
    assert!(!info.paired, "plaintext server info always reads unpaired");
}

#[tokio::test]
async fn test_pair_then_server_info_reports_paired() {
    // Arrange
    let f = fixture();
    let endpoint = paired(&f).await;

    // Act
    let info = f.client.server_info(&endpoint).await.unwrap();

    // Assert
    assert!(info.paired);
    assert_eq!(f.client.trusted_certificate(&endpoint.id), Some(f.host.cert_der()));
}

#[tokio::test]
async fn test_server_info_fails_closed_when_host_certificate_changes() {
    // Arrange
    let f = fixture();
    let endpoint = paired(&f).await;
    f.host.present_foreign_certificate();
    let calls_before = f.host.calls();

    // Act
    let result = f.client.server_info(&endpoint).await;

    // Assert
    assert!(matches!(
        result,
        Err(ClientError::Control(ControlError::Unauthorized))
    ));
    assert_eq!(
        f.host.calls(),
        calls_before,
        "no plaintext retry after a certificate mismatch"
    );
}

#[tokio::test]
async fn test_server_info_falls_back_when_host_refuses_client_certificate() {
    // Arrange: the client pins the host, but the host never paired it.
    let f = fixture();
    let endpoint = located(&f).await;
    f.client.trust_host(endpoint.id.clone(), f.host.cert_der());

    // Act
    let info = f.client.server_info(&endpoint).await.unwrap();

    // Assert
    assert!(!info.paired);
    assert_eq!(
        f.host.paths().last().map(String::as_str),
        Some("/serverinfo")
    );
    assert_eq!(f.host.calls(), 3, "locate, refused HTTPS, plaintext retry");
}

#[tokio::test]
async fn test_session_operations_require_pairing() {
    // Arrange
    let f = fixture();
    let endpoint = located(&f).await;

    // Act
    let apps = f.client.list_apps(&endpoint).await;
    let launch = f.client.launch(&endpoint, "1", &StreamConfig::default()).await;

    // Assert
    assert!(matches!(apps, Err(ClientError::Session(SessionError::NotPaired))));
    assert!(matches!(launch, Err(ClientError::Session(SessionError::NotPaired))));
    assert!(
        !f.host.paths().iter().any(|p| p == "/applist" || p == "/launch"),
        "nothing sent before pairing"
    );
}

#[tokio::test]
async fn test_list_apps_marks_running_app() {
    let f = fixture();
    let endpoint = paired(&f).await;
    f.host.set_running_app(2);

    let apps = f.client.list_apps(&endpoint).await.unwrap();

    assert_eq!(apps.len(), 2);
    assert!(!apps[0].running);
    assert!(apps[1].running, "currentgame marks app 2 running");
    assert!(apps[1].hdr_supported);
}

#[tokio::test]
async fn test_launch_returns_ticket_with_session_url() {
    // Arrange
    let f = fixture();
    let endpoint = paired(&f).await;
    let config = StreamConfig::new(2560, 1440, 120);

    // Act
    let ticket = f.client.launch(&endpoint, "1", &config).await.unwrap();

    // Assert
    assert_eq!(ticket.verb, LaunchVerb::Launch);
    assert_eq!(ticket.app_id.as_deref(), Some("1"));
    assert_eq!(ticket.session_url.as_deref(), Some("rtsp://192.168.1.20:48010"));
    assert_eq!(ticket.remote_input_key, config.remote_input_key);
    assert_eq!(f.host.running_app(), 1);
}

#[tokio::test]
async fn test_launch_while_app_running_is_a_conflict() {
    let f = fixture();
    let endpoint = paired(&f).await;
    f.host.set_running_app(2);

    let result = f.client.launch(&endpoint, "1", &StreamConfig::default()).await;

    assert!(matches!(
        result,
        Err(ClientError::Session(SessionError::AppAlreadyRunning))
    ));
}

#[tokio::test]
async fn test_launch_on_busy_host_reports_host_busy() {
    let f = fixture();
    let endpoint = paired(&f).await;
    f.host.set_launch_busy(true);

    let result = f.client.launch(&endpoint, "1", &StreamConfig::default()).await;

    assert!(matches!(result, Err(ClientError::Session(SessionError::HostBusy))));
}

#[tokio::test]
async fn test_resume_without_running_app_is_rejected() {
    // Arrange
    let f = fixture();
    let endpoint = paired(&f).await;

    // Act
    let idle = f.client.resume(&endpoint, &StreamConfig::default()).await;
    f.host.set_running_app(1);
    let running = f.client.resume(&endpoint, &StreamConfig::default()).await;

    // Assert
    assert!(matches!(idle, Err(ClientError::Session(SessionError::Rejected(_)))));
    let ticket = running.unwrap();
    assert_eq!(ticket.verb, LaunchVerb::Resume);
    assert_eq!(ticket.app_id, None);
}

#[tokio::test]
async fn test_quit_succeeds_whether_or_not_an_app_runs() {
    // Arrange
    let f = fixture();
    let endpoint = paired(&f).await;
    f.host.set_running_app(1);

    // Act
    let first = f.client.quit(&endpoint).await;
    let second = f.client.quit(&endpoint).await;

    // Assert: the second call gets status 599 from the host.
    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(f.host.running_app(), 0);
}

#[tokio::test]
async fn test_app_asset_returns_bytes_or_empty_when_missing() {
    let f = fixture();
    let endpoint = paired(&f).await;

    let art = f.client.app_asset(&endpoint, "1").await.unwrap();
    let missing = f.client.app_asset(&endpoint, "2").await.unwrap();

    assert_eq!(art, BOX_ART);
    assert!(missing.is_empty());
}

#[tokio::test]
async fn test_wrong_pin_is_recorded_on_tracked_host() {
    // Arrange
    let f = fixture();
    let endpoint = located(&f).await;
    f.client.add_known_host(endpoint.clone());

    // Act
    let result = f.client.pair(&endpoint, "0000").await;

    // Assert
    assert!(matches!(
        result,
        Err(ClientError::Pairing(PairingFailure::SecretMismatch))
    ));
    let tracked = f.client.discovery().host(&endpoint.id).unwrap();
    assert_eq!(tracked.state.pair_status, PairStatus::PinWrong);
    assert_eq!(f.client.trusted_certificate(&endpoint.id), None);
}

#[tokio::test]
async fn test_unpair_drops_trust_and_blocks_sessions() {
    // Arrange
    let f = fixture();
    let endpoint = paired(&f).await;

    // Act
    f.client.unpair(&endpoint).await.unwrap();
    let apps = f.client.list_apps(&endpoint).await;

    // Assert
    assert_eq!(f.client.trusted_certificate(&endpoint.id), None);
    assert!(!f.host.is_paired_with("CLIENT-1"));
    assert!(matches!(apps, Err(ClientError::Session(SessionError::NotPaired))));
}
