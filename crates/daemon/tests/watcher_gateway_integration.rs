// Integration test: watcher gateway registration, event delivery, and
// reconnection against the in-memory watcher service.
//
// Backoff runs on paused tokio time, so the default 2s..10s schedule elapses
// instantly.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use trisync_common::protocol::watcher::{WatchEventKind, WatcherMessage};
use trisync_common::types::{ProjectId, WatcherStatus};
use trisync_daemon::events::EventBus;
use trisync_daemon::gateway::{GatewayConfig, MemoryConnector, WatcherGateway};

fn project() -> ProjectId {
    ProjectId::parse("watched").unwrap()
}

fn gateway(connector: &MemoryConnector, bus: &EventBus) -> WatcherGateway<MemoryConnector> {
    WatcherGateway::new(connector.clone(), GatewayConfig::default(), bus.clone())
}

async fn wait_for_status(status: &mut watch::Receiver<WatcherStatus>, wanted: WatcherStatus) {
    tokio::time::timeout(Duration::from_secs(120), status.wait_for(|s| *s == wanted))
        .await
        .unwrap_or_else(|_| panic!("watcher never reached {wanted:?}"))
        .expect("status channel closed");
}

#[tokio::test]
async fn registered_channel_delivers_normalized_events() {
    let connector = MemoryConnector::new();
    let bus = EventBus::new();
    let gateway = gateway(&connector, &bus);

    let mut subscription = gateway.register(&project(), "/work/watched", "box-1").await.unwrap();
    assert_eq!(gateway.status(&project()), Some(WatcherStatus::Watching));
    assert_eq!(gateway.registration(&project()).unwrap().container_id, "box-1");

    connector.emit(
        &project(),
        WatcherMessage::FileAdded { file_path: "docs\\guide.md".into(), timestamp: Utc::now() },
    );
    connector.emit(
        &project(),
        WatcherMessage::FileChanged { file_path: "../escape.md".into(), timestamp: Utc::now() },
    );
    connector.emit(
        &project(),
        WatcherMessage::FileDeleted { file_path: "docs/old.md".into(), timestamp: Utc::now() },
    );

    let first = subscription.events.recv().await.unwrap();
    assert_eq!(first.kind, WatchEventKind::FileAdded);
    assert_eq!(first.path, "docs/guide.md");
    // The traversal attempt is dropped, not forwarded.
    let second = subscription.events.recv().await.unwrap();
    assert_eq!(second.kind, WatchEventKind::FileDeleted);
    assert_eq!(second.path, "docs/old.md");
}

#[tokio::test]
async fn rejected_registration_is_an_error() {
    let connector = MemoryConnector::new();
    connector.reject_registrations(Some("unknown container"));
    let gateway = gateway(&connector, &EventBus::new());

    let err = gateway.register(&project(), "/work/watched", "ghost").await.err().unwrap();
    assert!(err.to_string().contains("unknown container"));
    assert_eq!(gateway.status(&project()), None);
}

#[tokio::test(start_paused = true)]
async fn connect_failures_park_in_disconnected_until_reconnect() {
    let connector = MemoryConnector::new();
    connector.fail_all_connects(true);
    let gateway = gateway(&connector, &EventBus::new());

    let mut subscription = gateway.register(&project(), "/work/watched", "box-1").await.unwrap();
    wait_for_status(&mut subscription.status, WatcherStatus::Disconnected).await;
    assert_eq!(connector.connect_attempts(), 5);
    assert_eq!(gateway.status(&project()), Some(WatcherStatus::Disconnected));

    // Terminal: no further attempts on its own.
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(connector.connect_attempts(), 5);

    connector.fail_all_connects(false);
    gateway.reconnect(&project()).unwrap();
    wait_for_status(&mut subscription.status, WatcherStatus::Watching).await;
    assert_eq!(connector.connect_attempts(), 6);
    assert_eq!(connector.registered_channels(&project()), 1);
}

#[tokio::test(start_paused = true)]
async fn lost_channel_is_reestablished() {
    let connector = MemoryConnector::new();
    let bus = EventBus::new();
    let mut events = bus.subscribe(Some(project()));
    let gateway = gateway(&connector, &bus);

    let mut subscription = gateway.register(&project(), "/work/watched", "box-1").await.unwrap();
    connector.drop_connections();
    wait_for_status(&mut subscription.status, WatcherStatus::Error).await;
    wait_for_status(&mut subscription.status, WatcherStatus::Watching).await;
    assert_eq!(connector.connect_attempts(), 2);

    let mut seen = Vec::new();
    while let Some(event) = events.try_recv() {
        if event.type_name() == "watcher-status-changed" {
            seen.push(event);
        }
    }
    assert!(seen.len() >= 4, "expected a full status cycle, got {seen:?}");

    // The same subscription keeps receiving events after the reconnect.
    connector.emit(
        &project(),
        WatcherMessage::FileChanged { file_path: "a.md".into(), timestamp: Utc::now() },
    );
    assert_eq!(subscription.events.recv().await.unwrap().path, "a.md");
}

#[tokio::test]
async fn unregister_ends_the_event_stream() {
    let connector = MemoryConnector::new();
    let gateway = gateway(&connector, &EventBus::new());
    let mut subscription = gateway.register(&project(), "/work/watched", "box-1").await.unwrap();

    assert!(gateway.unregister(&project()));
    assert!(!gateway.unregister(&project()));
    assert!(subscription.events.recv().await.is_none());
    assert!(gateway.list().is_empty());
    assert!(connector
        .client_messages()
        .iter()
        .any(|m| matches!(m, WatcherMessage::Unregister { .. })));
}

#[tokio::test]
async fn full_event_queue_does_not_block_shutdown() {
    let connector = MemoryConnector::new();
    let gateway = gateway(&connector, &EventBus::new());
    let mut subscription = gateway.register(&project(), "/work/watched", "box-1").await.unwrap();

    // Nobody reads the subscription while the watcher floods it.
    for i in 0..1500 {
        let message =
            WatcherMessage::FileChanged { file_path: format!("f{i}.md"), timestamp: Utc::now() };
        connector.emit(&project(), message);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(5), gateway.shutdown())
        .await
        .expect("shutdown should not wait on a full event queue");

    let mut delivered = 0;
    while subscription.events.recv().await.is_some() {
        delivered += 1;
    }
    assert!(delivered <= 1024, "queue is bounded, got {delivered}");
    assert_eq!(gateway.status(&project()), None);
}
