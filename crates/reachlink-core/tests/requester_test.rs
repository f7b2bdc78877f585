#![allow(clippy::unwrap_used)]
// Integration tests for `Requester` driven through an in-memory transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::{mpsc, oneshot};

use reachlink_api::{ChannelPeer, ChannelTransport, FRAME_REQUEST, KEY_VALUE};
use reachlink_core::{
    CommandRecord, CommandStatus, CoreError, DeviceDataRecord, DeviceKey, Expect, KeyValueKey,
    MessageParser, Requester, RequesterConfig, Status,
};

// ── Helpers ─────────────────────────────────────────────────────────

/// Parses `joints` records into their sequence number.
struct JointsParser;

impl MessageParser for JointsParser {
    type Supplement = i64;

    fn get_message_supplement(&self, record: &DeviceDataRecord) -> Option<i64> {
        (record.data_type == "joints").then_some(record.seq)
    }
}

fn robot() -> DeviceKey {
    DeviceKey::new("robot", "")
}

fn setup() -> (Requester<JointsParser>, ChannelPeer) {
    let (transport, _inbound, peer) = ChannelTransport::pair();
    let requester = Requester::new(
        "robot",
        Arc::new(transport),
        JointsParser,
        RequesterConfig::default(),
    );
    requester.start();
    (requester, peer)
}

fn joints(seq: i64) -> Arc<DeviceDataRecord> {
    Arc::new(DeviceDataRecord::new("robot", "", "joints").with_seq(seq))
}

fn tagged_joints(tag: &str, seq: i64) -> Arc<DeviceDataRecord> {
    Arc::new(
        DeviceDataRecord::new("robot", "", "joints")
            .with_seq(seq)
            .with_tag(tag),
    )
}

fn status(tag: &str, status: CommandStatus) -> Arc<DeviceDataRecord> {
    Arc::new(DeviceDataRecord::cmd_status("robot", "", tag, status))
}

fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    (Arc::clone(&count), count)
}

fn frame_requests(peer: &mut ChannelPeer) -> usize {
    peer.drain_commands()
        .iter()
        .filter(|c| c.data_type == FRAME_REQUEST)
        .count()
}

// ── Tagged requests ─────────────────────────────────────────────────

#[tokio::test]
async fn test_tagged_request_collects_until_done() {
    let (requester, mut peer) = setup();

    let cmd = CommandRecord::new("robot", "", "reach-script").with_tag("tag-1");
    let queue = requester
        .send_tagged_request(cmd, Some(Duration::from_secs(10)), Expect::terminal())
        .unwrap();

    let sent = peer.next_command().await.unwrap();
    assert_eq!(sent.tag.as_deref(), Some("tag-1"));
    assert_eq!(sent.data_type, "reach-script");

    requester.on_message(status("tag-1", CommandStatus::Executing));
    requester.on_message(status("tag-1", CommandStatus::Done));

    let statuses: Vec<_> = queue
        .drain()
        .await
        .iter()
        .map(|(record, _)| record.status)
        .collect();
    assert_eq!(
        statuses,
        vec![Some(CommandStatus::Executing), Some(CommandStatus::Done)]
    );
    assert_eq!(requester.pending_count(), 0);
}

#[tokio::test]
async fn test_expected_messages_close_without_status() {
    let (requester, mut peer) = setup();

    let queue = requester.request_tagged(&robot(), None, Expect::messages(2));
    let tag = peer.next_command().await.unwrap().tag.unwrap();

    requester.on_message(tagged_joints(&tag, 1));
    requester.on_message(tagged_joints(&tag, 2));

    let items = queue.drain().await;
    assert_eq!(items.len(), 2);
    assert_eq!(items[1].1.as_deref(), Some(&2));
}

#[tokio::test]
async fn test_tag_is_generated_when_missing() {
    let (requester, mut peer) = setup();

    let _queue = requester
        .send_tagged_request(CommandRecord::new("robot", "", "stop"), None, Expect::terminal())
        .unwrap();
    let sent = peer.next_command().await.unwrap();
    assert!(sent.tag.is_some_and(|t| !t.is_empty()));
}

#[tokio::test]
async fn test_duplicate_tag_is_rejected() {
    let (requester, _peer) = setup();

    let cmd = CommandRecord::new("robot", "", "stop").with_tag("same");
    let _first = requester
        .send_tagged_request(cmd.clone(), None, Expect::terminal())
        .unwrap();
    let err = requester
        .send_tagged_request(cmd, None, Expect::terminal())
        .unwrap_err();
    assert!(matches!(err, CoreError::DuplicateTag { tag } if tag == "same"));
}

#[tokio::test]
async fn test_zero_timeout_returns_closed_queue() {
    let (requester, mut peer) = setup();

    let queue = requester.request_tagged(&robot(), Some(Duration::ZERO), Expect::terminal());
    assert!(queue.drain().await.is_empty());
    assert_eq!(requester.pending_count(), 0);
    // The command itself still goes out.
    assert_eq!(frame_requests(&mut peer), 1);
}

#[tokio::test(start_paused = true)]
async fn test_tagged_request_times_out() {
    let (requester, _peer) = setup();

    let mut queue = requester.request_tagged(&robot(), Some(Duration::from_secs(2)), Expect::terminal());
    tokio::time::sleep(Duration::from_millis(1900)).await;
    assert!(!queue.is_finished());

    assert!(queue.recv().await.is_none());
    assert_eq!(requester.pending_count(), 0);
}

// ── Untagged requests ───────────────────────────────────────────────

#[tokio::test]
async fn test_untagged_matching_is_fifo() {
    let (requester, _peer) = setup();

    let mut first = requester.request_untagged(&robot(), "joints", None);
    let mut second = requester.request_untagged(&robot(), "joints", None);

    requester.on_message(joints(1));
    requester.flush().await;
    assert_eq!(first.try_recv().unwrap().1.as_deref(), Some(&1));
    assert!(first.is_finished());
    assert!(second.try_recv().is_err());
    assert!(!second.is_finished());

    requester.on_message(joints(2));
    requester.flush().await;
    assert_eq!(second.try_recv().unwrap().1.as_deref(), Some(&2));
    assert!(second.is_finished());
}

#[tokio::test(start_paused = true)]
async fn test_untagged_request_resends_until_answered() {
    let (requester, mut peer) = setup();

    let queue = requester.request_untagged(&robot(), "joints", Some(Duration::from_secs(30)));
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let sent = frame_requests(&mut peer);
    assert!((2..=3).contains(&sent), "expected initial send plus resends, got {sent}");

    requester.on_message(joints(7));
    let items = queue.drain().await;
    assert_eq!(items.len(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(frame_requests(&mut peer), 0);
}

// ── Periodic requests ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_periodic_request_fires_on_schedule() {
    let (requester, mut peer) = setup();

    requester
        .set_untagged_request_period(&robot(), "joints", Some(Duration::from_millis(100)))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    let sent = frame_requests(&mut peer);
    assert!((3..=4).contains(&sent), "expected 3-4 periodic sends, got {sent}");

    requester
        .set_untagged_request_period(&robot(), "joints", None)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(frame_requests(&mut peer), 0);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_request_is_replaced() {
    let (requester, mut peer) = setup();

    requester
        .set_untagged_request_period(&robot(), "joints", Some(Duration::from_millis(100)))
        .unwrap();
    requester
        .set_untagged_request_period(&robot(), "joints", Some(Duration::from_secs(1)))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(frame_requests(&mut peer), 2);
}

#[tokio::test]
async fn test_zero_period_is_rejected() {
    let (requester, _peer) = setup();
    let err = requester
        .set_untagged_request_period(&robot(), "joints", Some(Duration::ZERO))
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidPeriod { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_periodic_request_stops_on_close() {
    let (requester, mut peer) = setup();
    requester
        .set_untagged_request_period(&robot(), "joints", Some(Duration::from_millis(100)))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    requester.shutdown().await;
    peer.drain_commands();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(frame_requests(&mut peer), 0);
}

// ── Tagged streaming ────────────────────────────────────────────────

#[tokio::test]
async fn test_tagged_stream_keeps_one_request_in_flight() {
    let (requester, mut peer) = setup();

    requester.set_enable_tagged_request(&robot(), true);
    let first = peer.try_next_command().unwrap();
    assert_eq!(first.data_type, FRAME_REQUEST);
    let first_tag = first.tag.unwrap();
    assert!(peer.try_next_command().is_none());

    requester.on_message(tagged_joints(&first_tag, 1));
    requester.on_message(status(&first_tag, CommandStatus::Done));
    requester.flush().await;
    let second_tag = peer.try_next_command().unwrap().tag.unwrap();
    assert_ne!(first_tag, second_tag);

    requester.set_enable_tagged_request(&robot(), false);
    requester.on_message(status(&second_tag, CommandStatus::Done));
    requester.flush().await;
    assert!(peer.try_next_command().is_none());
}

// ── Update callbacks ────────────────────────────────────────────────

#[tokio::test]
async fn test_every_callback_sees_each_update_once() {
    let (requester, _peer) = setup();
    let (a, a_count) = counter();
    let (b, b_count) = counter();

    requester.add_update_callback(
        move |_| {
            a.fetch_add(1, Ordering::SeqCst);
            false
        },
        None,
    );
    requester.add_update_callback(
        move |_| {
            b.fetch_add(1, Ordering::SeqCst);
            false
        },
        None,
    );

    requester.on_message(joints(1));
    requester.flush().await;
    assert_eq!(a_count.load(Ordering::SeqCst), 1);
    assert_eq!(b_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_callback_returning_true_unsubscribes() {
    let (requester, _peer) = setup();
    let (calls, call_count) = counter();
    let (finished, finished_count) = counter();

    let subscription = requester.add_update_callback(
        move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            true
        },
        Some(Box::new(move || {
            finished.fetch_add(1, Ordering::SeqCst);
        })),
    );

    for seq in 1..=3 {
        requester.on_message(joints(seq));
    }
    requester.flush().await;
    assert_eq!(call_count.load(Ordering::SeqCst), 1);
    assert_eq!(finished_count.load(Ordering::SeqCst), 1);
    assert_eq!(requester.subscription_count(), 0);

    subscription.cancel();
    requester.flush().await;
    assert_eq!(finished_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let (requester, _peer) = setup();
    let (calls, call_count) = counter();
    let (finished, finished_count) = counter();

    let subscription = requester.add_update_callback(
        move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            false
        },
        Some(Box::new(move || {
            finished.fetch_add(1, Ordering::SeqCst);
        })),
    );
    subscription.cancel();
    subscription.clone().cancel();

    requester.on_message(joints(1));
    requester.flush().await;
    assert_eq!(call_count.load(Ordering::SeqCst), 0);
    assert_eq!(finished_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_panicking_callback_does_not_stop_dispatch() {
    let (requester, _peer) = setup();
    let (calls, call_count) = counter();

    requester.add_update_callback(|seq| panic!("bad update {seq}"), None);
    requester.add_update_callback(
        move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            false
        },
        None,
    );

    requester.on_message(joints(1));
    requester.on_message(joints(2));
    requester.flush().await;
    assert_eq!(call_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_updates_arrive_in_order() {
    let (requester, _peer) = setup();
    let (tx, mut rx) = mpsc::unbounded_channel();

    requester.add_update_callback(
        move |seq| {
            tx.send(*seq).unwrap();
            false
        },
        None,
    );
    for seq in 1..=5 {
        requester.on_message(joints(seq));
    }
    requester.flush().await;

    let mut seen = Vec::new();
    while let Ok(seq) = rx.try_recv() {
        seen.push(seq);
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
}

// ── Cache and key/value store ───────────────────────────────────────

#[tokio::test]
async fn test_cache_holds_latest_value() {
    let (requester, _peer) = setup();
    assert!(requester.get_cached(&robot()).is_none());

    requester.on_message(joints(1));
    requester.on_message(joints(2));
    requester.flush().await;
    assert_eq!(requester.get_cached(&robot()).as_deref(), Some(&2));
    assert_eq!(requester.latest().as_deref(), Some(&2));
}

#[tokio::test]
async fn test_unknown_tag_still_updates_cache() {
    let (requester, _peer) = setup();

    requester.on_message(tagged_joints("stray", 9));
    requester.flush().await;
    assert_eq!(requester.get_cached(&robot()).as_deref(), Some(&9));
}

#[tokio::test]
async fn test_key_value_records_are_stored() {
    let (requester, _peer) = setup();

    let mut record = DeviceDataRecord::new("robot", "", KEY_VALUE);
    record.key = Some("speed".into());
    record.value = Some("0.25".into());
    requester.on_message(Arc::new(record));
    requester.flush().await;

    let key = KeyValueKey::new("robot", "", "speed");
    assert_eq!(requester.get_key_value(&key).as_deref(), Some("0.25"));
}

// ── Queue helpers ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_error_callback_reports_timeout() {
    let (requester, _peer) = setup();
    let (tx, rx) = oneshot::channel::<Result<i64, Status>>();
    let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
    let err_tx = Arc::clone(&tx);

    let queue = requester.request_tagged(&robot(), Some(Duration::from_secs(1)), Expect::messages(1));
    requester.queue_to_error_callback(
        queue,
        move |value| {
            let _ = tx.lock().unwrap().take().unwrap().send(Ok(*value));
        },
        move |status| {
            let _ = err_tx.lock().unwrap().take().unwrap().send(Err(status));
        },
    );

    let status = rx.await.unwrap().unwrap_err();
    assert!(status.is_timeout());
}

#[tokio::test]
async fn test_error_callback_reports_value() {
    let (requester, mut peer) = setup();
    let (tx, rx) = oneshot::channel::<i64>();

    let queue = requester.request_tagged(&robot(), None, Expect::messages(1));
    let tag = peer.next_command().await.unwrap().tag.unwrap();
    requester.queue_to_error_callback(
        queue,
        move |value| {
            let _ = tx.send(*value);
        },
        |status| panic!("unexpected status {status:?}"),
    );
    requester.on_message(tagged_joints(&tag, 42));

    assert_eq!(rx.await.unwrap(), 42);
}

#[tokio::test]
async fn test_queue_to_callback_survives_panic() {
    let (requester, mut peer) = setup();
    let (finished_tx, finished_rx) = oneshot::channel();
    let (calls, call_count) = counter();

    let queue = requester.request_tagged(&robot(), None, Expect::terminal());
    let tag = peer.next_command().await.unwrap().tag.unwrap();
    requester.queue_to_callback(
        queue,
        move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            panic!("first element fails");
        },
        move || {
            let _ = finished_tx.send(());
        },
    );

    requester.on_message(tagged_joints(&tag, 1));
    requester.on_message(tagged_joints(&tag, 2));
    requester.on_message(status(&tag, CommandStatus::Done));

    finished_rx.await.unwrap();
    assert_eq!(call_count.load(Ordering::SeqCst), 1);
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_close_drains_queues_and_finishes_subscriptions() {
    let (requester, mut peer) = setup();
    let (finished, finished_count) = counter();

    let queue = requester.request_tagged(&robot(), None, Expect::terminal());
    let tag = peer.next_command().await.unwrap().tag.unwrap();
    requester.add_update_callback(
        |_| false,
        Some(Box::new(move || {
            finished.fetch_add(1, Ordering::SeqCst);
        })),
    );

    requester.on_message(tagged_joints(&tag, 1));
    requester.close();
    requester.close();

    let items = queue.drain().await;
    assert_eq!(items.len(), 1);

    requester.shutdown().await;
    assert_eq!(finished_count.load(Ordering::SeqCst), 1);
    assert!(requester.wait(Some(Duration::ZERO)).await);
    assert_eq!(requester.subscription_count(), 0);
}

#[tokio::test]
async fn test_close_from_inside_callback() {
    let (requester, _peer) = setup();
    let (finished, finished_count) = counter();
    let handle = requester.clone();

    requester.add_update_callback(
        move |_| {
            handle.close();
            false
        },
        Some(Box::new(move || {
            finished.fetch_add(1, Ordering::SeqCst);
        })),
    );
    requester.on_message(joints(1));

    assert!(requester.wait(Some(Duration::from_secs(5))).await);
    requester.shutdown().await;
    assert_eq!(finished_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_requests_after_close_are_not_sent() {
    let (requester, mut peer) = setup();
    requester.shutdown().await;

    let queue = requester.request_tagged(&robot(), None, Expect::terminal());
    assert!(queue.drain().await.is_empty());
    let queue = requester.request_untagged(&robot(), "joints", None);
    assert!(queue.drain().await.is_empty());
    assert!(peer.try_next_command().is_none());

    let (finished, finished_count) = counter();
    requester.add_update_callback(
        |_| false,
        Some(Box::new(move || {
            finished.fetch_add(1, Ordering::SeqCst);
        })),
    );
    assert_eq!(finished_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_records_after_close_are_dropped() {
    let (requester, _peer) = setup();
    requester.close();
    requester.on_message(joints(1));
    requester.shutdown().await;
    assert!(requester.get_cached(&robot()).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_racing_requests_leaves_no_queue_open() {
    for _ in 0..200 {
        let (requester, _peer) = setup();
        let closer = requester.clone();
        let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();
        let closing = std::thread::spawn(move || {
            go_rx.recv().unwrap();
            closer.close();
        });

        go_tx.send(()).unwrap();
        let mut queues = Vec::new();
        for _ in 0..20 {
            let cmd = CommandRecord::new("robot", "", "reach-script");
            queues.push(
                requester
                    .send_tagged_request(cmd, None, Expect::terminal())
                    .unwrap(),
            );
        }
        closing.join().unwrap();
        requester.shutdown().await;

        for queue in queues {
            let drained = tokio::time::timeout(Duration::from_secs(1), queue.drain()).await;
            assert!(drained.is_ok(), "a queue stayed open after close");
        }
    }
}

// ── Plain-thread callers ────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timed_request_from_plain_thread_times_out() {
    let (requester, mut peer) = setup();
    let caller = requester.clone();
    let (done_tx, done_rx) = oneshot::channel();

    std::thread::spawn(move || {
        let cmd = CommandRecord::new("robot", "", "reach-script");
        let queue = caller
            .send_tagged_request(cmd, Some(Duration::from_millis(50)), Expect::terminal())
            .unwrap();
        let _ = done_tx.send(queue.blocking_drain());
    });

    let items = tokio::time::timeout(Duration::from_secs(5), done_rx)
        .await
        .unwrap()
        .unwrap();
    assert!(items.is_empty());
    assert_eq!(peer.next_command().await.unwrap().data_type, "reach-script");
    requester.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plain_thread_receives_tagged_reply() {
    let (requester, mut peer) = setup();
    let caller = requester.clone();
    let (done_tx, done_rx) = oneshot::channel();

    std::thread::spawn(move || {
        let cmd = CommandRecord::new("robot", "", "reach-script").with_tag("from-thread");
        let queue = caller
            .send_tagged_request(cmd, Some(Duration::from_secs(5)), Expect::terminal())
            .unwrap();
        let _ = done_tx.send(queue.blocking_drain());
    });

    let cmd = peer.next_command().await.unwrap();
    assert_eq!(cmd.tag.as_deref(), Some("from-thread"));
    requester.on_message(tagged_joints("from-thread", 7));
    requester.on_message(status("from-thread", CommandStatus::Done));

    let items = tokio::time::timeout(Duration::from_secs(5), done_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].1.as_deref(), Some(&7));
    assert!(items[1].0.is_terminal());
    requester.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tagged_stream_enabled_from_plain_thread() {
    let (requester, mut peer) = setup();
    let caller = requester.clone();
    std::thread::spawn(move || caller.set_enable_tagged_request(&robot(), true))
        .join()
        .unwrap();

    let cmd = tokio::time::timeout(Duration::from_secs(5), peer.next_command())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cmd.data_type, FRAME_REQUEST);
    assert!(cmd.tag.is_some());
    requester.shutdown().await;
}
