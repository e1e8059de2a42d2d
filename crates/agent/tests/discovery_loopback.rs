//! Discovery tests over real multicast loopback.
//!
//! These need a host where joining a multicast group works. When it does
//! not (some CI sandboxes), the tests print a note and pass vacuously.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use tether_agent::discovery::{DiscoveryConfig, DiscoveryService};
use tether_agent::pairing::LocalIdentity;

/// Per-process port so parallel test runs do not cross-talk.
fn test_port() -> u16 {
    49400 + (std::process::id() % 500) as u16
}

fn service(fingerprint: &str, name: &str, port: u16, respond_to_probes: bool) -> DiscoveryService {
    let identity = LocalIdentity {
        device_id: fingerprint.to_string(),
        device_name: name.to_string(),
        device_model: None,
        device_kind: "desktop".to_string(),
    };
    let config = DiscoveryConfig {
        port,
        respond_to_probes,
        ..DiscoveryConfig::default()
    };
    DiscoveryService::new(config, &identity, 8900)
}

/// Checks that this host can actually join the group.
async fn multicast_available(port: u16) -> bool {
    match service("probe", "Probe", port, false)
        .scan_once(Duration::from_millis(10))
        .await
    {
        Ok(_) => true,
        Err(e) => {
            eprintln!("skipping: multicast unavailable on this host: {e:#}");
            false
        }
    }
}

#[tokio::test]
async fn scan_finds_continuous_announcer() {
    let port = test_port();
    if !multicast_available(port).await {
        return;
    }

    let cancel = CancellationToken::new();
    let (found_tx, mut found_rx) = mpsc::channel(16);
    let announcer_cancel = cancel.clone();
    let announcer = tokio::spawn(async move {
        service("desk-fp", "Desk", port, true)
            .run(announcer_cancel, found_tx)
            .await
    });

    // Let the announcer join the group before scanning
    tokio::time::sleep(Duration::from_millis(200)).await;

    let peers = service("phone-fp", "Phone", port, false)
        .scan_once(Duration::from_secs(3))
        .await
        .unwrap();
    assert!(
        peers.iter().any(|peer| peer.fingerprint() == "desk-fp"),
        "announcer not discovered, saw: {peers:?}"
    );

    // The announcer heard the scan burst and reported the scanner
    let heard = timeout(Duration::from_secs(3), found_rx.recv())
        .await
        .expect("announcer saw no peers")
        .expect("discovery channel closed");
    assert_eq!(heard.fingerprint(), "phone-fp");

    cancel.cancel();
    announcer.await.unwrap().unwrap();
}

#[tokio::test]
async fn scan_never_reports_the_scanner_itself() {
    // Offset keeps this group apart from the other test's
    let port = test_port() + 500;
    if !multicast_available(port).await {
        return;
    }

    // Multicast loopback is on, so our own burst comes straight back;
    // self-exclusion has to swallow it.
    let peers = service("solo-fp", "Solo", port, false)
        .scan_once(Duration::from_millis(700))
        .await
        .unwrap();
    assert!(
        peers.iter().all(|peer| peer.fingerprint() != "solo-fp"),
        "scanner reported itself: {peers:?}"
    );
}
