//! Broker dispatch scenarios: subscription routing, QoS selection,
//! session close, and delivery ordering.

use bytes::Bytes;
use strato::protocol::Qos;
use strato::routing::{Filter, Topic};
use strato::Broker;

fn topic(s: &str) -> Topic {
    Topic::parse(s).unwrap()
}

fn filter(s: &str) -> Filter {
    Filter::parse(s).unwrap()
}

#[test]
fn publish_reaches_only_the_matching_session() {
    let broker = Broker::new();
    let s1 = broker.create_session();
    let s2 = broker.create_session();

    assert!(s1.subscribe(&[(filter("a/+"), Qos::AtLeastOnce)]));
    broker.publish(&topic("a/x"), Bytes::from_static(b"m"));

    assert_eq!(
        s1.queued(Qos::AtLeastOnce),
        vec![(topic("a/x"), Bytes::from_static(b"m"))]
    );
    assert!(s1.queued(Qos::AtMostOnce).is_empty());
    assert!(s1.queued(Qos::ExactlyOnce).is_empty());
    for qos in [Qos::AtMostOnce, Qos::AtLeastOnce, Qos::ExactlyOnce] {
        assert!(s2.queued(qos).is_empty());
    }
}

#[test]
fn overlapping_subscriptions_deliver_at_the_maximum_qos() {
    let broker = Broker::new();
    let s1 = broker.create_session();

    assert!(s1.subscribe(&[
        (filter("a/+"), Qos::AtMostOnce),
        (filter("a/#"), Qos::ExactlyOnce),
    ]));
    broker.publish(&topic("a/b"), Bytes::from_static(b"m"));

    assert_eq!(
        s1.queued(Qos::ExactlyOnce),
        vec![(topic("a/b"), Bytes::from_static(b"m"))]
    );
    assert!(s1.queued(Qos::AtMostOnce).is_empty());
    assert!(s1.queued(Qos::AtLeastOnce).is_empty());
}

#[test]
fn close_session_withdraws_its_routes() {
    let broker = Broker::new();
    let s1 = broker.create_session();

    assert!(s1.subscribe(&[(filter("a/b"), Qos::AtMostOnce)]));
    assert!(!broker.subscribers(&topic("a/b")).is_empty());

    s1.close();
    broker.publish(&topic("a/b"), Bytes::from_static(b"m"));

    assert!(broker.subscribers(&topic("a/b")).is_empty());
    assert!(!broker.has_routes());
    assert!(s1.queued(Qos::AtMostOnce).is_empty());
    assert_eq!(broker.session_count(), 0);
}

#[test]
fn close_session_leaves_other_subscribers_in_place() {
    let broker = Broker::new();
    let s1 = broker.create_session();
    let s2 = broker.create_session();

    assert!(s1.subscribe(&[(filter("a/b"), Qos::AtMostOnce)]));
    assert!(s2.subscribe(&[(filter("a/b"), Qos::AtMostOnce)]));
    s1.close();

    assert_eq!(broker.subscribers(&topic("a/b")).len(), 1);
    broker.publish(&topic("a/b"), Bytes::from_static(b"m"));
    assert_eq!(s2.queued(Qos::AtMostOnce).len(), 1);
}

#[test]
fn unsubscribe_prunes_only_the_named_filter() {
    let broker = Broker::new();
    let s1 = broker.create_session();

    assert!(s1.subscribe(&[
        (filter("a/+"), Qos::AtMostOnce),
        (filter("a/b"), Qos::AtMostOnce),
    ]));
    assert!(s1.unsubscribe(&[filter("a/+")]));

    broker.publish(&topic("a/b"), Bytes::from_static(b"m"));
    broker.publish(&topic("a/c"), Bytes::from_static(b"n"));

    assert_eq!(
        s1.queued(Qos::AtMostOnce),
        vec![(topic("a/b"), Bytes::from_static(b"m"))]
    );
    assert!(broker.subscribers(&topic("a/c")).is_empty());
}

#[test]
fn concurrent_publishers_keep_per_publisher_order() {
    let broker = Broker::new();
    let session = broker.create_session();
    assert!(session.subscribe(&[(filter("t"), Qos::AtMostOnce)]));

    let barrier = std::sync::Barrier::new(2);
    std::thread::scope(|scope| {
        for publisher in ["a", "b"] {
            let broker = broker.clone();
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                for seq in 0..50 {
                    let payload = format!("{publisher}{seq}");
                    broker.publish(&topic("t"), Bytes::from(payload));
                }
            });
        }
    });

    let queued = session.queued(Qos::AtMostOnce);
    assert_eq!(queued.len(), 100);
    for publisher in ["a", "b"] {
        let sequence: Vec<&[u8]> = queued
            .iter()
            .filter(|(_, payload)| payload.starts_with(publisher.as_bytes()))
            .map(|(_, payload)| payload.as_ref())
            .collect();
        let expected: Vec<String> = (0..50).map(|seq| format!("{publisher}{seq}")).collect();
        assert_eq!(sequence.len(), 50, "publisher {publisher} lost messages");
        for (got, want) in sequence.iter().zip(&expected) {
            assert_eq!(got, &want.as_bytes(), "publisher {publisher} reordered");
        }
    }
}

#[test]
fn effective_qos_tracks_the_session_trie() {
    let broker = Broker::new();
    let session = broker.create_session();
    assert!(session.subscribe(&[
        (filter("a/#"), Qos::AtMostOnce),
        (filter("a/b"), Qos::AtLeastOnce),
    ]));
    assert_eq!(session.subscription_qos(&topic("a/b")), Some(Qos::AtLeastOnce));
    assert_eq!(session.subscription_qos(&topic("a/c")), Some(Qos::AtMostOnce));
    assert_eq!(session.subscription_qos(&topic("b")), None);
}
