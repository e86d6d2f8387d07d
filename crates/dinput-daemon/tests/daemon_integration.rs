//! Integration tests exercising the full daemon event loop over in-process
//! transports and mock devices.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dinput_daemon::config::Config;
use dinput_daemon::{ChannelTransport, Daemon, DaemonError, DaemonEvent, DaemonStatus, PeerMessage};
use dinput_input::backend::KernelEvent;
use dinput_input::mock::{MockBackend, MockDeviceSpec, MockUinput, MockUinputHandle};
use dinput_types::codes::{
    EV_KEY, EV_SYN, KEY_A, KEY_DELETE, KEY_LEFTCTRL, KEY_UP_STATE, SYN_REPORT,
};
use dinput_types::InputType;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

const KEYBOARD_PATH: &str = "/dev/input/event0";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(network_id: &str) -> Config {
    let mut config = Config::default();
    config.daemon.network_id = network_id.to_string();
    config.hub.poll_timeout_ms = 10;
    config.hub.key_state_retry_interval_ms = 1;
    config
}

/// A source daemon "alpha" with a keyboard and a sink daemon "beta" that
/// recreates remote devices.
#[allow(dead_code)]
struct TestPair {
    backend_a: MockBackend,
    keyboard: String,
    uinput_b: MockUinputHandle,
    status_a: watch::Receiver<DaemonStatus>,
    status_b: watch::Receiver<DaemonStatus>,
    events_a: mpsc::Sender<DaemonEvent>,
    events_b: mpsc::Sender<DaemonEvent>,
    handle_a: JoinHandle<Daemon>,
    handle_b: JoinHandle<Daemon>,
}

impl TestPair {
    async fn shutdown(self) -> (Daemon, Daemon) {
        let _ = self.events_a.send(DaemonEvent::Shutdown).await;
        let _ = self.events_b.send(DaemonEvent::Shutdown).await;
        let a = tokio::time::timeout(Duration::from_secs(5), self.handle_a)
            .await
            .expect("daemon A should stop")
            .unwrap();
        let b = tokio::time::timeout(Duration::from_secs(5), self.handle_b)
            .await
            .expect("daemon B should stop")
            .unwrap();
        (a, b)
    }

    async fn request_from_b(&self, message: PeerMessage) {
        self.events_b
            .send(DaemonEvent::Request {
                peer: "alpha".to_string(),
                message,
            })
            .await
            .unwrap();
    }
}

fn spawn(mut daemon: Daemon) -> JoinHandle<Daemon> {
    tokio::spawn(async move {
        if let Err(e) = daemon.run().await {
            eprintln!("daemon {} error: {e}", daemon.network_id());
        }
        daemon
    })
}

async fn setup_pair(config_a: Config) -> TestPair {
    init_tracing();
    let (transport_a, transport_b) = ChannelTransport::pair("alpha", "beta", 256);

    let backend_a = MockBackend::new();
    backend_a.add_device(KEYBOARD_PATH, MockDeviceSpec::keyboard("Test Keyboard"));
    let daemon_a = Daemon::new(
        config_a,
        Arc::new(backend_a.clone()),
        None,
        Arc::new(transport_a),
    )
    .unwrap();
    let keyboard = daemon_a
        .collector()
        .hub()
        .scan_input_devices(Path::new("/dev/input"))
        .remove(0)
        .descriptor;

    let uinput = MockUinput::new();
    let uinput_b = uinput.handle();
    let daemon_b = Daemon::new(
        config("beta"),
        Arc::new(MockBackend::new()),
        Some(Arc::new(uinput)),
        Arc::new(transport_b),
    )
    .unwrap();

    let pair = TestPair {
        backend_a,
        keyboard,
        uinput_b,
        status_a: daemon_a.status_receiver(),
        status_b: daemon_b.status_receiver(),
        events_a: daemon_a.event_sender(),
        events_b: daemon_b.event_sender(),
        handle_a: spawn(daemon_a),
        handle_b: spawn(daemon_b),
    };

    pair.events_b
        .send(DaemonEvent::Connect("alpha".to_string()))
        .await
        .unwrap();
    let uinput_b = pair.uinput_b.clone();
    eventually("virtual keyboard on B", || uinput_b.created().len() == 1).await;
    pair
}

/// Wait for a condition on a status receiver with timeout.
async fn wait_for_status(
    rx: &mut watch::Receiver<DaemonStatus>,
    pred: impl Fn(&DaemonStatus) -> bool,
) -> DaemonStatus {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let status = rx.borrow_and_update().clone();
                if pred(&status) {
                    return status;
                }
            }
            rx.changed().await.expect("status channel closed");
        }
    })
    .await
    .expect("timed out waiting for status")
}

/// Poll a condition that is updated outside the daemon loop.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn key_frame(code: u16, value: i32) -> [KernelEvent; 2] {
    [
        KernelEvent::new(EV_KEY, code, value),
        KernelEvent::new(EV_SYN, SYN_REPORT, 0),
    ]
}

fn written_keys(handle: &MockUinputHandle) -> Vec<(u16, i32)> {
    handle
        .written(0)
        .iter()
        .filter(|e| e.event_type == EV_KEY)
        .map(|e| (e.code, e.value))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sessions_and_announcements() {
    let mut pair = setup_pair(config("alpha")).await;

    let status_a = wait_for_status(&mut pair.status_a, |s| s.running && !s.peers.is_empty()).await;
    assert_eq!(status_a.peers, vec!["beta".to_string()]);
    let status_b = wait_for_status(&mut pair.status_b, |s| !s.peers.is_empty()).await;
    assert_eq!(status_b.peers, vec!["alpha".to_string()]);

    let created = pair.uinput_b.created().remove(0);
    assert_eq!(created.name, "DistributedInput Test Keyboard");
    assert!(created.phys.ends_with(&format!("|alpha|{}", pair.keyboard)));

    pair.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forwarding_and_release_on_stop() {
    let mut pair = setup_pair(config("alpha")).await;
    let keyboard = pair.keyboard.clone();

    pair.request_from_b(PeerMessage::StartSharing {
        session_id: "session-1".to_string(),
        dh_ids: vec![keyboard.clone()],
    })
    .await;
    wait_for_status(&mut pair.status_a, |s| s.shared == vec![keyboard.clone()]).await;

    pair.backend_a
        .push_events(KEYBOARD_PATH, &key_frame(KEY_A, 1));
    let uinput_b = pair.uinput_b.clone();
    eventually("key press on B", || uinput_b.written(0).len() == 2).await;
    assert_eq!(written_keys(&pair.uinput_b), vec![(KEY_A, 1)]);

    // Sharing stops while the key is still held on A.
    pair.request_from_b(PeerMessage::StopSharing {
        session_id: "session-1".to_string(),
        dh_ids: vec![keyboard.clone()],
    })
    .await;
    eventually("release on B", || uinput_b.written(0).len() == 4).await;
    assert_eq!(
        written_keys(&pair.uinput_b),
        vec![(KEY_A, 1), (KEY_A, KEY_UP_STATE)]
    );
    let status_a = wait_for_status(&mut pair.status_a, |s| s.shared.is_empty()).await;
    assert_eq!(status_a.forwarded_events, 2);

    // Unshared input stays local.
    pair.backend_a
        .push_events(KEYBOARD_PATH, &key_frame(KEY_A, 0));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pair.uinput_b.written(0).len(), 4);

    pair.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_whitelisted_combination_stays_local() {
    let mut config_a = config("alpha");
    config_a.whitelist.combinations = vec![vec![KEY_LEFTCTRL, KEY_A]];
    let mut pair = setup_pair(config_a).await;
    let keyboard = pair.keyboard.clone();

    pair.request_from_b(PeerMessage::StartSharing {
        session_id: "session-1".to_string(),
        dh_ids: vec![keyboard.clone()],
    })
    .await;
    wait_for_status(&mut pair.status_a, |s| s.shared == vec![keyboard.clone()]).await;

    for (code, value) in [(KEY_LEFTCTRL, 1), (KEY_A, 1), (KEY_A, 0), (KEY_DELETE, 1)] {
        pair.backend_a
            .push_events(KEYBOARD_PATH, &key_frame(code, value));
    }
    let uinput_b = pair.uinput_b.clone();
    eventually("marker key on B", || {
        written_keys(&uinput_b).contains(&(KEY_DELETE, 1))
    })
    .await;
    assert_eq!(
        written_keys(&pair.uinput_b),
        vec![(KEY_LEFTCTRL, 1), (KEY_DELETE, 1)]
    );

    pair.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_closes_virtual_devices() {
    let mut pair = setup_pair(config("alpha")).await;

    pair.events_b
        .send(DaemonEvent::Disconnect("alpha".to_string()))
        .await
        .unwrap();
    let uinput_b = pair.uinput_b.clone();
    eventually("virtual keyboard destroyed", || uinput_b.is_destroyed(0)).await;
    wait_for_status(&mut pair.status_a, |s| s.peers.is_empty()).await;
    wait_for_status(&mut pair.status_b, |s| s.peers.is_empty()).await;

    let (mut a, _b) = pair.shutdown().await;
    assert!(matches!(a.run().await, Err(DaemonError::AlreadyRunning)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loopback_shares_by_input_type() {
    init_tracing();
    let backend = MockBackend::new();
    backend.add_device(KEYBOARD_PATH, MockDeviceSpec::keyboard("Keyboard"));
    backend.add_device("/dev/input/event1", MockDeviceSpec::mouse("Mouse"));
    let uinput = MockUinput::new();
    let observer = uinput.handle();
    let daemon = Daemon::new(
        config("solo"),
        Arc::new(backend.clone()),
        Some(Arc::new(uinput)),
        Arc::new(ChannelTransport::loopback("solo", 64)),
    )
    .unwrap();
    let mut status = daemon.status_receiver();
    let events = daemon.event_sender();
    let handle = spawn(daemon);

    events
        .send(DaemonEvent::Connect("solo".to_string()))
        .await
        .unwrap();
    eventually("loopback virtual devices", || observer.created().len() == 2).await;

    events
        .send(DaemonEvent::Request {
            peer: "solo".to_string(),
            message: PeerMessage::ShareInputTypes {
                session_id: "diag".to_string(),
                enabled: true,
                types: InputType::Keyboard.into(),
            },
        })
        .await
        .unwrap();
    let shared = wait_for_status(&mut status, |s| s.shared.len() == 1).await;
    assert_eq!(shared.virtual_devices, 2);

    // Hot-plugged devices are announced, and the collector picks them up.
    backend.add_device("/dev/input/event2", MockDeviceSpec::keyboard("Second Keyboard"));
    eventually("hot-plugged device recreated", || observer.created().len() == 3).await;

    events.send(DaemonEvent::Shutdown).await.unwrap();
    let daemon = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon should stop")
        .unwrap();
    assert!(!status.borrow().running);
    assert!(daemon.collector().hub().is_all_devices_stopped());
    assert!(observer.is_destroyed(0));
}
