//! Fan-out semantics as seen by subscribers: best-effort delivery,
//! no backfill after a reconnect.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use docvault::fanout::{FanOut, DEFAULT_BUFFER};
use docvault::model::{ArchivedEvent, ArchivedKind};

fn event(id: i64) -> ArchivedEvent {
    ArchivedEvent {
        uuid: Uuid::nil(),
        kind: ArchivedKind::Version,
        name: None,
        id,
        signature: format!("v1.1.sig{id}"),
    }
}

#[tokio::test]
async fn reconnecting_subscriber_gets_no_backfill() {
    let fanout = FanOut::new();
    let token = CancellationToken::new();

    let mut rx = fanout.subscribe(token.clone(), DEFAULT_BUFFER).await;

    fanout.publish(event(1)).await;
    assert_eq!(rx.recv().await.unwrap().id, 1);

    // Disconnect, miss an event, reconnect.
    drop(rx);
    fanout.publish(event(2)).await;

    let mut rx = fanout.subscribe(token.clone(), DEFAULT_BUFFER).await;
    fanout.publish(event(3)).await;

    // Only the post-reconnect event arrives; event 2 is gone.
    assert_eq!(rx.recv().await.unwrap().id, 3);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn slow_subscriber_does_not_block_others() {
    let fanout = FanOut::new();
    let token = CancellationToken::new();

    // One subscriber that never drains with a single-slot buffer,
    // one healthy subscriber.
    let _slow = fanout.subscribe(token.clone(), 1).await;
    let mut healthy = fanout.subscribe(token.clone(), DEFAULT_BUFFER).await;

    for id in 1..=5 {
        fanout.publish(event(id)).await;
    }

    // The healthy subscriber saw everything despite the stalled one.
    for id in 1..=5 {
        assert_eq!(healthy.recv().await.unwrap().id, id);
    }
}
