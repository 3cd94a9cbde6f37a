//! Session arbitration end to end over the emulated backends.

use std::sync::Arc;
use std::time::Duration;

use hwlink_core::domain::{BackendKind, Descriptor};
use hwlink_core::error::ErrorKind;
use hwlink_core::protocol::LogicalMessage;
use hwlink_transport::infrastructure::backend::mock::{MockBackend, MockUsbHost};
use hwlink_transport::infrastructure::backend::usb::{UsbBackend, UsbDeviceInfo, UsbSettings};
use hwlink_transport::{AcquireOptions, AcquirePolicy, SessionArbitrator};

const CALL_TIMEOUT: Duration = Duration::from_secs(2);

fn desc(path: &str) -> Descriptor {
    Descriptor::new(path, BackendKind::Hid)
}

fn ping() -> LogicalMessage {
    LogicalMessage::new(1, b"ping".to_vec())
}

#[tokio::test]
async fn test_steal_then_call_with_first_session_is_stale() {
    // Arrange
    let backend = MockBackend::new(BackendKind::Hid).with_device(desc("D"));
    let arbitrator = SessionArbitrator::new(AcquirePolicy::Steal, CALL_TIMEOUT);

    // Act
    let first = arbitrator.acquire(&backend, &desc("D"), AcquireOptions::default()).await.unwrap();
    let second = arbitrator.acquire(&backend, &desc("D"), AcquireOptions::default()).await.unwrap();
    let stale = arbitrator.call(&backend, &first, &ping()).await;
    let fresh = arbitrator.call(&backend, &second, &ping()).await;

    // Assert
    assert_eq!(stale.unwrap_err().kind(), ErrorKind::SessionStale);
    assert_eq!(fresh.unwrap().message_type, 2);
    assert!(second.epoch() > first.epoch());
}

#[tokio::test]
async fn test_stale_release_leaves_valid_session_alone() {
    let backend = MockBackend::new(BackendKind::Hid).with_device(desc("D"));
    let arbitrator = SessionArbitrator::new(AcquirePolicy::Steal, CALL_TIMEOUT);
    let first = arbitrator.acquire(&backend, &desc("D"), AcquireOptions::default()).await.unwrap();
    let second = arbitrator.acquire(&backend, &desc("D"), AcquireOptions::default()).await.unwrap();

    arbitrator.release(&backend, &first).await.unwrap();

    assert!(arbitrator.is_valid(&second).await);
    assert!(arbitrator.call(&backend, &second, &ping()).await.is_ok());
}

#[tokio::test]
async fn test_concurrent_acquires_leave_exactly_one_valid_session() {
    // Arrange
    let backend = Arc::new(MockBackend::new(BackendKind::Hid).with_device(desc("D")));
    let arbitrator = Arc::new(SessionArbitrator::new(AcquirePolicy::Steal, CALL_TIMEOUT));

    // Act
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let backend = Arc::clone(&backend);
            let arbitrator = Arc::clone(&arbitrator);
            tokio::spawn(async move {
                arbitrator
                    .acquire(backend.as_ref(), &desc("D"), AcquireOptions::default())
                    .await
            })
        })
        .collect();
    let mut sessions = Vec::new();
    for task in tasks {
        sessions.push(task.await.unwrap().unwrap());
    }

    // Assert
    let mut valid = 0;
    for s in &sessions {
        if arbitrator.is_valid(s).await {
            valid += 1;
        }
    }
    assert_eq!(valid, 1);
    let mut epochs: Vec<_> = sessions.iter().map(|s| s.epoch()).collect();
    epochs.sort_unstable();
    epochs.dedup();
    assert_eq!(epochs.len(), sessions.len());
}

#[tokio::test]
async fn test_different_devices_do_not_interfere() {
    let backend = MockBackend::new(BackendKind::Hid)
        .with_device(desc("A"))
        .with_device(desc("B"));
    let arbitrator = SessionArbitrator::new(AcquirePolicy::Steal, CALL_TIMEOUT);

    let a = arbitrator.acquire(&backend, &desc("A"), AcquireOptions::default()).await.unwrap();
    let b = arbitrator.acquire(&backend, &desc("B"), AcquireOptions::default()).await.unwrap();

    assert!(arbitrator.is_valid(&a).await);
    assert!(arbitrator.is_valid(&b).await);
    assert_eq!(a.epoch(), 0);
    assert_eq!(b.epoch(), 0);
}

#[tokio::test]
async fn test_require_force_policy_refuses_then_allows_forced_takeover() {
    // Arrange
    let backend = MockBackend::new(BackendKind::Hid).with_device(desc("D"));
    let arbitrator = SessionArbitrator::new(AcquirePolicy::RequireForce, CALL_TIMEOUT);
    let first = arbitrator.acquire(&backend, &desc("D"), AcquireOptions::default()).await.unwrap();

    // Act
    let refused = arbitrator.acquire(&backend, &desc("D"), AcquireOptions::default()).await;
    let forced = arbitrator.acquire(&backend, &desc("D"), AcquireOptions::forced()).await;

    // Assert
    assert_eq!(refused.unwrap_err().kind(), ErrorKind::DeviceUnreachable);
    assert!(forced.is_ok());
    assert!(!arbitrator.is_valid(&first).await);
}

#[tokio::test]
async fn test_usb_backend_session_survives_multi_packet_call() {
    // Arrange
    let host = MockUsbHost::new().with_device(UsbDeviceInfo::new("usb-1", 0x1209, 0x53c1));
    let backend = UsbBackend::hid(Arc::new(host), UsbSettings::default());
    let arbitrator = SessionArbitrator::new(AcquirePolicy::Steal, CALL_TIMEOUT);
    let descriptor = Descriptor::new("usb-1", BackendKind::Hid);
    let payload: Vec<u8> = (0..=255).cycle().take(1000).collect();

    // Act
    let session = arbitrator.acquire(&backend, &descriptor, AcquireOptions::default()).await.unwrap();
    let response = arbitrator
        .call(&backend, &session, &LogicalMessage::new(9, payload.clone()))
        .await
        .unwrap();

    // Assert
    assert_eq!(response.message_type, 10);
    assert_eq!(response.payload, payload);
}

#[tokio::test]
async fn test_unplugged_usb_device_reports_disconnected() {
    let host = MockUsbHost::new().with_device(UsbDeviceInfo::new("usb-1", 0x1209, 0x53c1));
    let backend = UsbBackend::hid(Arc::new(host.clone()), UsbSettings::default());
    let arbitrator = SessionArbitrator::new(AcquirePolicy::Steal, CALL_TIMEOUT);
    let descriptor = Descriptor::new("usb-1", BackendKind::Hid);
    let session = arbitrator.acquire(&backend, &descriptor, AcquireOptions::default()).await.unwrap();

    host.unplug("usb-1");
    let err = arbitrator.call(&backend, &session, &ping()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DeviceDisconnected);
}

#[tokio::test]
async fn test_failed_usb_takeover_keeps_current_session_working() {
    // Arrange: the device becomes unopenable after the first acquire
    let host = MockUsbHost::new().with_device(UsbDeviceInfo::new("a", 0x1209, 0x53c1));
    let backend = UsbBackend::hid(Arc::new(host.clone()), UsbSettings::default());
    let arbitrator = SessionArbitrator::new(AcquirePolicy::Steal, CALL_TIMEOUT);
    let descriptor = Descriptor::new("a", BackendKind::Hid);
    let first = arbitrator.acquire(&backend, &descriptor, AcquireOptions::default()).await.unwrap();
    host.deny("a");

    // Act
    let steal = arbitrator.acquire(&backend, &descriptor, AcquireOptions::default()).await;
    let call = arbitrator.call(&backend, &first, &ping()).await;

    // Assert
    assert_eq!(steal.unwrap_err().kind(), ErrorKind::DeviceUnreachable);
    assert!(arbitrator.is_valid(&first).await);
    assert_eq!(call.unwrap().message_type, 2);
}
