//! Integration tests for the core service façade
//!
//! These tests verify:
//! - Fail-fast configuration
//! - Router loop wiring through `start`
//! - Shutdown of background workers

use bridge_traits::{ChannelTransport, ManualClock, RawNotification};
use bytes::Bytes;
use core_runtime::config::CoreConfig;
use core_runtime::events::{CoreEvent, UploadEvent};
use core_service::{CoreError, CoreService};
use core_upload::protocol::NOTIFICATION_FUNCTION;
use core_upload::{Annotations, ContentType, UploadConfig, UploadMetadata};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_missing_transport_is_reported() {
    let err = CoreConfig::builder()
        .build()
        .map_err(CoreError::from)
        .unwrap_err();

    match err {
        CoreError::CapabilityMissing { capability, .. } => {
            assert_eq!(capability, "MessageTransport")
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_invalid_upload_config_rejected() {
    let (transport, _outbound) = ChannelTransport::new();
    let config = CoreConfig::builder()
        .transport(Arc::new(transport))
        .build()
        .unwrap();

    let result = CoreService::new(config, UploadConfig::default().with_max_chunk_bytes(0));
    assert!(matches!(result, Err(CoreError::Upload(_))));
}

#[tokio::test]
async fn test_start_routes_notifications() {
    let (transport, mut outbound) = ChannelTransport::new();
    let config = CoreConfig::builder()
        .transport(Arc::new(transport))
        .clock(Arc::new(ManualClock::new(0)))
        .enable_stall_watchdog(false)
        .build()
        .unwrap();

    let core = CoreService::new(config, UploadConfig::default()).unwrap();
    let mut chunk_events = core
        .subscribe()
        .filter(|event| matches!(event, CoreEvent::Upload(UploadEvent::ChunkSent { .. })));
    let notifications = core.start().await.unwrap();

    let id = core
        .manager()
        .upload(
            Bytes::from_static(b"hello"),
            UploadMetadata::new(ContentType::Video, "video/mp4", "hello.mp4"),
            Annotations::new(),
        )
        .await
        .unwrap();
    assert_eq!(outbound.recv().await.unwrap().method, "InitiateUpload");

    notifications
        .send(RawNotification::new(
            NOTIFICATION_FUNCTION,
            "ChunkRequest",
            json!({ "taskid": id.as_str(), "state": "waitforchunk", "chunksize": 5 }),
        ))
        .await
        .unwrap();

    let chunk = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chunk.method, "UploadChunk");
    assert_eq!(chunk.arguments["chunkdata"], "68656c6c6f");

    match chunk_events.recv().await.unwrap() {
        CoreEvent::Upload(UploadEvent::ChunkSent { percent, .. }) => assert_eq!(percent, 100),
        other => panic!("unexpected event {other:?}"),
    }

    core.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_twice_and_after_shutdown() {
    let (transport, _outbound) = ChannelTransport::new();
    let config = CoreConfig::builder()
        .transport(Arc::new(transport))
        .build()
        .unwrap();
    let core = CoreService::new(config, UploadConfig::default()).unwrap();

    core.start().await.unwrap();
    assert!(matches!(
        core.start().await,
        Err(CoreError::InitializationFailed(_))
    ));

    core.shutdown().await.unwrap();
    assert!(matches!(
        core.start().await,
        Err(CoreError::InitializationFailed(_))
    ));
}
