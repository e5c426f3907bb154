//! End-to-end tests for the upload pipeline
//!
//! These tests drive the manager and router the way a host does: outbound
//! messages are captured from a `ChannelTransport`, and server notifications
//! are fed back as `RawNotification`s.
//! - Chunked transfer and offsets
//! - Duplicate uploads
//! - Failure and removal states
//! - Artwork import trigger
//! - Stall watchdog and uploads list

use bridge_traits::{ChannelTransport, ManualClock, OutboundMessage, RawNotification};
use bytes::Bytes;
use core_runtime::events::{CoreEvent, EventBus, PipelineEvent, UploadEvent};
use core_upload::protocol::{NOTIFICATION_FUNCTION, UPLOADS_LIST_FUNCTION, UPLOADS_LIST_SIGNAL};
use core_upload::{
    Annotations, ChunkTransferDriver, ContentId, ContentType, NotificationRouter, PipelineState,
    RouteOutcome, UploadConfig, UploadError, UploadManager, UploadMetadata,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Harness
// ============================================================================

struct Pipeline {
    manager: Arc<UploadManager>,
    router: Arc<NotificationRouter>,
    outbound: UnboundedReceiver<OutboundMessage>,
    clock: Arc<ManualClock>,
    events: EventBus,
}

impl Pipeline {
    fn new(config: UploadConfig) -> Self {
        let (transport, outbound) = ChannelTransport::new();
        let transport = Arc::new(transport);
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let events = EventBus::new(256);

        let manager = Arc::new(
            UploadManager::new(transport.clone(), clock.clone(), events.clone(), config).unwrap(),
        );
        let router = Arc::new(NotificationRouter::new(
            Arc::clone(manager.registry()),
            transport,
            events.clone(),
        ));

        Self {
            manager,
            router,
            outbound,
            clock,
            events,
        }
    }

    fn sent(&mut self) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            messages.push(message);
        }
        messages
    }

    async fn upload(&self, bytes: &'static [u8], content_type: ContentType, annotations: Annotations) -> ContentId {
        self.manager
            .upload(
                Bytes::from_static(bytes),
                UploadMetadata::new(content_type, "application/octet-stream", "upload.bin"),
                annotations,
            )
            .await
            .unwrap()
    }

    async fn notify(&self, raw: RawNotification) -> Result<RouteOutcome, UploadError> {
        self.router.handle_raw(&raw).await
    }
}

fn chunk_request(id: &ContentId, size: u64) -> RawNotification {
    RawNotification::new(
        NOTIFICATION_FUNCTION,
        "ChunkRequest",
        json!({
            "taskid": id.as_str(),
            "state": "waitforchunk",
            "chunksize": size,
            "uploadtask": { "id": id.as_str(), "state": "waitforchunk" },
        }),
    )
}

fn state_update(id: &ContentId, state: &str, task: Value) -> RawNotification {
    RawNotification::new(
        NOTIFICATION_FUNCTION,
        "StateUpdate",
        json!({
            "taskid": id.as_str(),
            "state": state,
            "uploadtask": task,
            "uploadslist": { "videos": [], "albumfiles": [], "artworks": [] },
        }),
    )
}

fn chunk_bytes(message: &OutboundMessage) -> Vec<u8> {
    assert_eq!(message.method, "UploadChunk");
    hex::decode(message.arguments["chunkdata"].as_str().unwrap()).unwrap()
}

/// Answer chunk requests of `size` until the registry offset reaches the file size.
async fn transfer(pipeline: &mut Pipeline, id: &ContentId, size: u64) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    loop {
        let task = pipeline.manager.task(id).await.unwrap();
        if task.offset == task.filesize {
            break;
        }
        pipeline.notify(chunk_request(id, size)).await.unwrap();
        for message in pipeline.sent() {
            chunks.push(chunk_bytes(&message));
        }
    }
    chunks
}

// ============================================================================
// Chunk Transfer
// ============================================================================

#[tokio::test]
async fn test_ten_bytes_in_four_byte_chunks() {
    let mut pipeline = Pipeline::new(UploadConfig::default());
    let id = pipeline.upload(b"0123456789", ContentType::Video, Annotations::new()).await;

    let initiate = pipeline.sent();
    assert_eq!(initiate.len(), 1);
    assert_eq!(initiate[0].method, "InitiateUpload");
    assert_eq!(initiate[0].signal.as_deref(), Some("UploadingContent"));
    assert_eq!(initiate[0].arguments["checksum"], id.as_str());

    let mut offsets = vec![pipeline.manager.task(&id).await.unwrap().offset];
    let mut lengths = Vec::new();
    for _ in 0..3 {
        pipeline.notify(chunk_request(&id, 4)).await.unwrap();
        let messages = pipeline.sent();
        assert_eq!(messages.len(), 1);
        lengths.push(chunk_bytes(&messages[0]).len());
        offsets.push(pipeline.manager.task(&id).await.unwrap().offset);
    }

    assert_eq!(offsets, vec![0, 4, 8, 10]);
    assert_eq!(lengths, vec![4, 4, 2]);

    let extra = pipeline.notify(chunk_request(&id, 4)).await;
    assert!(matches!(extra, Err(UploadError::NoDataRemaining { .. })));
    assert!(pipeline.sent().is_empty());
}

#[tokio::test]
async fn test_chunk_count_and_reassembly() {
    const DATA: &[u8] = b"The quick brown fox jumps over the lazy dog";
    let n = DATA.len() as u64;

    for k in [1u64, 5, 7, 43, 100] {
        let mut pipeline = Pipeline::new(UploadConfig::default());
        let id = pipeline.upload(DATA, ContentType::AlbumFile, Annotations::new()).await;
        pipeline.sent();

        let chunks = transfer(&mut pipeline, &id, k).await;
        assert_eq!(chunks.len() as u64, ChunkTransferDriver::chunk_count(n, k), "k = {k}");

        let expected_last = if n % k == 0 { k } else { n - (n / k) * k };
        assert_eq!(chunks.last().unwrap().len() as u64, expected_last, "k = {k}");
        assert_eq!(chunks.concat(), DATA, "k = {k}");
    }
}

#[tokio::test]
async fn test_identical_bytes_coalesce() {
    let mut pipeline = Pipeline::new(UploadConfig::default());
    let first = pipeline.upload(b"same payload", ContentType::Video, Annotations::new()).await;
    let second = pipeline.upload(b"same payload", ContentType::Video, Annotations::new()).await;

    assert_eq!(first, second);
    assert_eq!(pipeline.manager.tasks().await.len(), 1);
    assert_eq!(pipeline.sent().len(), 1);
}

#[tokio::test]
async fn test_oversized_chunk_request_rejected() {
    let mut pipeline = Pipeline::new(UploadConfig::default().with_max_chunk_bytes(8));
    let id = pipeline.upload(b"0123456789", ContentType::Video, Annotations::new()).await;
    pipeline.sent();

    let result = pipeline.notify(chunk_request(&id, 9)).await;
    assert!(matches!(result, Err(UploadError::InvalidChunkSize { requested: 9, max: 8 })));
    assert_eq!(pipeline.manager.task(&id).await.unwrap().offset, 0);
    assert!(pipeline.sent().is_empty());
}

// ============================================================================
// Failure and Removal
// ============================================================================

#[tokio::test]
async fn test_stray_chunk_request_after_upload_failed() {
    let mut pipeline = Pipeline::new(UploadConfig::default());
    let id = pipeline.upload(b"0123456789", ContentType::Video, Annotations::new()).await;
    pipeline.notify(chunk_request(&id, 4)).await.unwrap();
    pipeline
        .notify(state_update(&id, "uploadfailed", json!(null)))
        .await
        .unwrap();
    pipeline.sent();

    let stray = pipeline.notify(chunk_request(&id, 4)).await;
    assert!(matches!(stray, Err(UploadError::TaskTerminal { .. })));
    assert!(pipeline.sent().is_empty());

    let task = pipeline.manager.task(&id).await.unwrap();
    assert_eq!(task.state, Some(PipelineState::UploadFailed));
    assert!(!task.payload_held);
}

#[tokio::test]
async fn test_no_outbound_action_after_terminal_state() {
    let mut pipeline = Pipeline::new(UploadConfig::default());
    let mut annotations = Annotations::new();
    annotations.insert("musicpath".into(), json!("Artist/Album"));
    let id = pipeline.upload(b"artwork", ContentType::Artwork, annotations).await;
    transfer(&mut pipeline, &id, 4).await;
    pipeline.sent();

    for state in ["uploadcomplete", "preprocessing", "invalidcontent"] {
        pipeline.notify(state_update(&id, state, json!(null))).await.unwrap();
    }

    let late = [
        chunk_request(&id, 4),
        state_update(
            &id,
            "readyforintegration",
            json!({ "contenttype": "artwork", "preprocessedpath": "tmp/a.jpg" }),
        ),
    ];
    for raw in late {
        assert!(pipeline.notify(raw).await.is_err());
    }
    assert!(pipeline.sent().is_empty());
    assert!(matches!(
        pipeline.manager.annotate(&id, Annotations::new()).await,
        Err(UploadError::TaskTerminal { .. })
    ));
    assert!(pipeline.sent().is_empty());
}

#[tokio::test]
async fn test_server_remove_retires_task() {
    let mut pipeline = Pipeline::new(UploadConfig::default());
    let id = pipeline.upload(b"remove me", ContentType::AlbumFile, Annotations::new()).await;
    pipeline.notify(chunk_request(&id, 4)).await.unwrap();

    let outcome = pipeline.notify(state_update(&id, "remove", json!(null))).await.unwrap();
    assert_eq!(outcome, RouteOutcome::Retired { task_id: id.clone() });
    assert!(pipeline.manager.tasks().await.is_empty());

    pipeline.sent();
    let stray = pipeline.notify(chunk_request(&id, 4)).await;
    assert!(matches!(stray, Err(UploadError::TaskNotFound { .. })));
    assert!(pipeline.sent().is_empty());
}

// ============================================================================
// Artwork Import
// ============================================================================

#[tokio::test]
async fn test_artwork_pipeline_forwards_annotations_unmodified() {
    let mut pipeline = Pipeline::new(UploadConfig::default());
    let mut events = pipeline.events.subscribe();

    let mut annotations = Annotations::new();
    annotations.insert("musicpath".into(), json!("Artist/2020 - Album"));
    annotations.insert("albumid".into(), json!(1337));
    annotations.insert("origin".into(), json!({ "view": "album", "tags": ["a", "b"] }));

    let id = pipeline.upload(b"\x89PNG fake image", ContentType::Artwork, annotations.clone()).await;

    let opening = pipeline.sent();
    assert_eq!(opening[0].method, "InitiateUpload");
    assert_eq!(opening[1].method, "AnnotateUpload");
    assert_eq!(opening[1].arguments["origin"], annotations["origin"]);

    let chunks = transfer(&mut pipeline, &id, 6).await;
    assert_eq!(chunks.concat(), b"\x89PNG fake image");

    let server_task = json!({
        "id": id.as_str(),
        "contenttype": "artwork",
        "preprocessedpath": "uploads/tmp/abc.png",
        "annotations": Value::Object(annotations.clone()),
    });
    for state in ["uploadcomplete", "preprocessing"] {
        pipeline
            .notify(state_update(&id, state, server_task.clone()))
            .await
            .unwrap();
    }
    assert!(pipeline.sent().is_empty());

    pipeline
        .notify(state_update(&id, "readyforintegration", server_task.clone()))
        .await
        .unwrap();

    let import = pipeline.sent();
    assert_eq!(import.len(), 1);
    assert_eq!(import[0].method, "InitiateArtworkImport");
    assert_eq!(import[0].signal.as_deref(), Some("ImportingArtwork"));
    assert_eq!(
        import[0].arguments,
        json!({ "sourcepath": "uploads/tmp/abc.png", "targetpath": "Artist/2020 - Album" })
    );
    assert_eq!(import[0].pass, Some(json!({ "annotations": annotations })));

    for state in ["startartworkimport", "importingartwork", "importcomplete"] {
        pipeline
            .notify(state_update(&id, state, server_task.clone()))
            .await
            .unwrap();
    }
    assert!(pipeline.sent().is_empty());
    assert_eq!(
        pipeline.manager.task(&id).await.unwrap().state,
        Some(PipelineState::ImportComplete)
    );

    let mut import_events = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, CoreEvent::Pipeline(PipelineEvent::ArtworkImportRequested { .. })) {
            import_events += 1;
        }
    }
    assert_eq!(import_events, 1);
}

// ============================================================================
// Router Loop
// ============================================================================

#[tokio::test]
async fn test_router_loop_keeps_order_and_survives_errors() {
    let mut pipeline = Pipeline::new(UploadConfig::default());
    let mut violations = pipeline.events.stream().filter(|event| {
        matches!(event, CoreEvent::Upload(UploadEvent::ProtocolViolation { .. }))
    });
    let id = pipeline.upload(b"0123456789", ContentType::Video, Annotations::new()).await;
    pipeline.sent();

    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&pipeline.router).run(rx, cancel.clone()));

    tx.send(chunk_request(&id, 4)).await.unwrap();
    tx.send(RawNotification::new(NOTIFICATION_FUNCTION, "ChunkRequest", json!({ "taskid": "nonsense" })))
        .await
        .unwrap();
    tx.send(chunk_request(&id, 4)).await.unwrap();
    tx.send(chunk_request(&id, 4)).await.unwrap();

    let violation = tokio::time::timeout(Duration::from_secs(5), violations.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        violation,
        CoreEvent::Upload(UploadEvent::ProtocolViolation { task_id: Some(ref t), .. }) if t == "nonsense"
    ));

    let mut received = Vec::new();
    for _ in 0..3 {
        let message = tokio::time::timeout(Duration::from_secs(5), pipeline.outbound.recv())
            .await
            .unwrap()
            .unwrap();
        received.extend(chunk_bytes(&message));
    }
    assert_eq!(received, b"0123456789");

    cancel.cancel();
    handle.await.unwrap();
}

// ============================================================================
// Watchdog and Uploads List
// ============================================================================

#[tokio::test]
async fn test_stalled_upload_fails_and_rejects_late_chunks() {
    let mut pipeline = Pipeline::new(
        UploadConfig::default()
            .with_stall_timeout(Duration::from_secs(30))
            .with_fail_stalled_uploads(true),
    );
    let mut stalled = pipeline.events.stream().filter(|event| {
        matches!(event, CoreEvent::Upload(UploadEvent::Stalled { .. }))
    });
    let id = pipeline.upload(b"0123456789", ContentType::Video, Annotations::new()).await;
    pipeline.notify(chunk_request(&id, 4)).await.unwrap();
    pipeline.sent();

    pipeline.clock.advance_millis(29_999);
    assert!(pipeline.manager.sweep_stalled().await.is_empty());

    pipeline.clock.advance_millis(1);
    assert_eq!(pipeline.manager.sweep_stalled().await, vec![id.clone()]);
    match stalled.try_recv() {
        Some(Ok(CoreEvent::Upload(UploadEvent::Stalled { state, idle_secs, .. }))) => {
            assert_eq!(state.as_deref(), Some("waitforchunk"));
            assert_eq!(idle_secs, 30);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let task = pipeline.manager.task(&id).await.unwrap();
    assert_eq!(task.state, Some(PipelineState::UploadFailed));
    assert_eq!(task.offset, 4);

    let late = pipeline.notify(chunk_request(&id, 4)).await;
    assert!(matches!(late, Err(UploadError::TaskTerminal { .. })));
    assert!(pipeline.sent().is_empty());

    pipeline.clock.advance_millis(60_000);
    assert!(pipeline.manager.sweep_stalled().await.is_empty());
}

#[tokio::test]
async fn test_uploads_list_round_trip() {
    let mut pipeline = Pipeline::new(UploadConfig::default());
    pipeline.manager.request_uploads_list().await.unwrap();

    let request = pipeline.sent();
    assert_eq!(request.len(), 1);
    assert_eq!(request[0].method, "GetUploads");
    assert_eq!(request[0].signal.as_deref(), Some("ShowUploads"));

    let answer = RawNotification::new(
        UPLOADS_LIST_FUNCTION,
        UPLOADS_LIST_SIGNAL,
        json!({
            "videos": [
                { "id": "a", "contenttype": "video", "state": "importingmusic" },
                { "id": "b", "contenttype": "video", "state": "integrationfailed" },
            ],
            "artworks": [{ "id": "c", "contenttype": "artwork", "state": "readyforimport" }],
        }),
    );
    let outcome = pipeline.notify(answer).await.unwrap();
    assert_eq!(outcome, RouteOutcome::TableRefreshed { rows: 3 });

    let table = pipeline.router.table().await;
    let statuses = table.statuses(ContentType::Video);
    assert_eq!(statuses[0].status, "Importing Music …");
    assert_eq!(statuses[1].status, "Integration Failed");
    assert_eq!(table.rows(ContentType::Artwork).len(), 1);
    assert!(table.rows(ContentType::AlbumFile).is_empty());
}
