mod common;

use common::{sample, sample_from, shared, FailingSink, MemorySink};
use heartbeat_core::db::open_shared_in_memory;
use heartbeat_core::pipeline::sink::{private_history_parent, public_history_parent};
use heartbeat_core::{
    advisory_channel, Advisory, BatchHandler, CanonicalRecord, ChildListQuery, RecordObserved,
    Relay, RelayError, SinkSet, SqliteDocumentRepo, SqliteStateRepo,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

const T: i64 = 1_700_000_000_000;

struct Harness {
    relay: Relay,
    documents: SqliteDocumentRepo,
    state: Arc<SqliteStateRepo>,
    observed: watch::Receiver<Option<RecordObserved>>,
    advisories: broadcast::Receiver<Advisory>,
}

fn harness_with(sinks: impl FnOnce(&SqliteDocumentRepo) -> SinkSet) -> Harness {
    let conn = open_shared_in_memory().unwrap();
    let documents = SqliteDocumentRepo::new(conn.clone());
    let state = shared(SqliteStateRepo::new(conn));
    state.set_owner_id("uid-1").unwrap();
    let (observed_tx, observed) = watch::channel(None);
    let (advisory_tx, advisories) = advisory_channel();
    let relay = Relay::new(
        "share01",
        state.clone(),
        &sinks(&documents),
        Arc::new(observed_tx),
        advisory_tx,
    );
    Harness {
        relay,
        documents,
        state,
        observed,
        advisories,
    }
}

fn published() -> Harness {
    harness_with(|documents| SinkSet::published(Arc::new(documents.clone())))
}

fn history(documents: &SqliteDocumentRepo, parent: &str) -> Vec<(String, u64)> {
    documents
        .list_children(parent, &ChildListQuery::default())
        .unwrap()
        .into_iter()
        .map(|(key, body)| (key, body["bpm"].as_u64().unwrap()))
        .collect()
}

fn latest(documents: &SqliteDocumentRepo) -> Value {
    documents.get("public/share01/latest").unwrap().unwrap()
}

#[tokio::test]
async fn two_samples_land_in_both_histories_and_latest_is_the_second() {
    let h = published();
    let second = sample_from(75.0, T + 60_000, "Watch");

    let dispatched = h
        .relay
        .deliver(&[sample(72.0, T), second.clone()])
        .await
        .unwrap();
    assert_eq!(dispatched, 2);
    h.relay.flush().await;

    let expected = vec![(T.to_string(), 72), ((T + 60_000).to_string(), 75)];
    assert_eq!(
        history(&h.documents, &private_history_parent("uid-1").unwrap()),
        expected
    );
    assert_eq!(
        history(&h.documents, &public_history_parent("share01").unwrap()),
        expected
    );
    assert_eq!(
        latest(&h.documents),
        CanonicalRecord::from_sample(&second).to_payload().unwrap()
    );
}

#[tokio::test]
async fn latest_slot_follows_dispatch_order_not_event_time() {
    let h = published();
    let (t0, t1, t2) = (T - 5_000, T, T + 5_000);

    h.relay.deliver(&[sample(61.0, t1)]).await.unwrap();
    h.relay.deliver(&[sample(62.0, t2)]).await.unwrap();
    h.relay.deliver(&[sample(60.0, t0)]).await.unwrap();
    h.relay.flush().await;

    assert_eq!(latest(&h.documents)["bpm"], 60);
    assert_eq!(
        history(&h.documents, "public/share01/heartRate"),
        vec![
            (t0.to_string(), 60),
            (t1.to_string(), 61),
            (t2.to_string(), 62),
        ]
    );
}

#[tokio::test]
async fn same_end_timestamp_overwrites_instead_of_appending() {
    let h = published();

    h.relay
        .deliver(&[sample(70.0, T), sample(90.0, T)])
        .await
        .unwrap();
    h.relay.flush().await;

    assert_eq!(
        history(&h.documents, "owner/uid-1/heartRate"),
        vec![(T.to_string(), 90)]
    );
    assert_eq!(
        history(&h.documents, "public/share01/heartRate"),
        vec![(T.to_string(), 90)]
    );
}

#[tokio::test]
async fn failing_sink_does_not_block_the_other_sink_or_the_batch() {
    let memory = shared(MemorySink::default());
    let sink_for_set = memory.clone();
    let mut h = harness_with(move |_| {
        SinkSet::local_only()
            .with_sink(Arc::new(FailingSink))
            .with_sink(sink_for_set)
    });

    let result = h
        .relay
        .deliver(&[sample(72.0, T), sample(73.0, T + 1_000)])
        .await;
    assert_eq!(result, Ok(2));
    h.relay.flush().await;

    let bpms = memory.records().iter().map(|r| r.bpm).collect::<Vec<_>>();
    assert_eq!(bpms, vec![72, 73]);

    let advisory = h.advisories.try_recv().unwrap();
    assert_eq!(
        advisory,
        Advisory::SinkFailed {
            sink: "failing".to_string(),
            key: T.to_string(),
            message: "backend write failed: backend offline".to_string(),
        }
    );
}

#[tokio::test]
async fn missing_owner_skips_private_log_but_publishes() {
    let h = published();
    h.state.clear_owner_id().unwrap();

    h.relay.deliver(&[sample(66.0, T)]).await.unwrap();
    h.relay.flush().await;

    assert_eq!(h.documents.count_children("owner/uid-1/heartRate").unwrap(), 0);
    assert_eq!(
        history(&h.documents, "public/share01/heartRate"),
        vec![(T.to_string(), 66)]
    );
}

#[tokio::test]
async fn halted_relay_dispatches_nothing() {
    let h = published();
    h.relay.halt();

    let err = h.relay.deliver(&[sample(70.0, T)]).await.unwrap_err();
    assert_eq!(err, RelayError::Halted { dispatched: 0 });
    h.relay.flush().await;

    assert!(h.documents.get("public/share01/latest").unwrap().is_none());
    assert!(h.observed.borrow().is_none());
}

#[tokio::test]
async fn observed_notification_keeps_only_the_most_recent_record() {
    let mut h = harness_with(|_| SinkSet::local_only());

    h.relay
        .deliver(&[
            sample_from(70.0, T, "Watch"),
            sample_from(80.4, T + 1_000, "Chest Strap"),
        ])
        .await
        .unwrap();

    assert!(h.observed.has_changed().unwrap());
    let observed = h.observed.borrow_and_update().clone().unwrap();
    assert_eq!(
        observed,
        RecordObserved {
            bpm: 80,
            at: common::at(T + 1_000),
            source: "Chest Strap".to_string(),
        }
    );
}

#[tokio::test]
async fn history_keys_order_numerically_across_digit_count_change() {
    let h = published();

    h.relay
        .deliver(&[sample(61.0, 1_000_000_000_000), sample(60.0, 999_999_999_999)])
        .await
        .unwrap();
    h.relay.flush().await;

    let keys = history(&h.documents, "public/share01/heartRate")
        .into_iter()
        .map(|(key, _)| key)
        .collect::<Vec<_>>();
    assert_eq!(keys, vec!["999999999999", "1000000000000"]);
}
