use juju_env::env::{
    ConnectionManager, EnvError, EnvelopeCodec, MemoryConnector, NotificationRouter,
    RequestDispatcher,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

type Outcomes = Arc<Mutex<HashMap<u64, Vec<Result<Value, EnvError>>>>>;

/// What happens to each request after it is issued.
#[derive(Debug, Clone, Copy)]
enum Fate {
    Answered,
    AnsweredTwice,
    Cancelled,
    Orphaned,
}

fn fate() -> impl Strategy<Value = Fate> {
    prop_oneof![
        Just(Fate::Answered),
        Just(Fate::AnsweredTwice),
        Just(Fate::Cancelled),
        Just(Fate::Orphaned),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

async fn settle(outcomes: &Outcomes, expected: usize) {
    for _ in 0..500 {
        if outcomes.lock().values().map(Vec::len).sum::<usize>() >= expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    // Give duplicates a chance to show up.
    tokio::time::sleep(Duration::from_millis(5)).await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Whatever order responses arrive in, and whatever else happens to a
    /// request, its callback fires exactly once.
    #[test]
    fn every_callback_fires_exactly_once(
        fates in prop::collection::vec(fate(), 1..24),
        order in any::<prop::sample::Index>(),
        close_at_end in any::<bool>(),
    ) {
        runtime().block_on(async {
            let (connector, backend) = MemoryConnector::pair();
            let connection =
                ConnectionManager::new(Arc::new(connector), EnvelopeCodec::new("request_id"));
            let dispatcher = RequestDispatcher::new(connection.clone(), NotificationRouter::new());
            connection.connect("memory://test").expect("connect");
            connection.wait_for_settled().await;

            let outcomes: Outcomes = Arc::default();
            let mut ids = Vec::new();
            for _ in &fates {
                let sink = outcomes.clone();
                let slot = Arc::new(Mutex::new(None::<u64>));
                let slot_in_callback = slot.clone();
                let id = dispatcher.request(json!({"op": "status"}), move |result| {
                    let id = slot_in_callback.lock().unwrap_or_default();
                    sink.lock().entry(id).or_default().push(result);
                });
                *slot.lock() = Some(id);
                ids.push(id);
            }

            // Respond in a rotated order so responses do not follow issue order.
            let mut responders: Vec<(u64, Fate)> = ids.iter().copied().zip(fates.iter().copied()).collect();
            let pivot = order.index(responders.len());
            responders.rotate_left(pivot);
            responders.reverse();

            for (id, fate) in &responders {
                match fate {
                    Fate::Answered => {
                        backend.push(json!({"request_id": id, "result": id}));
                    }
                    Fate::AnsweredTwice => {
                        backend.push(json!({"request_id": id, "result": id}));
                        backend.push(json!({"request_id": id, "result": "again"}));
                    }
                    Fate::Cancelled => {
                        dispatcher.cancel(*id);
                    }
                    Fate::Orphaned => {}
                }
            }

            let resolved = fates
                .iter()
                .filter(|fate| !matches!(fate, Fate::Orphaned))
                .count();
            settle(&outcomes, resolved).await;

            if close_at_end {
                connection.close();
                settle(&outcomes, fates.len()).await;
                prop_assert_eq!(dispatcher.pending_count(), 0);
            }

            let outcomes = outcomes.lock();
            for (id, fate) in ids.iter().zip(&fates) {
                let delivered = outcomes.get(id).map(Vec::len).unwrap_or(0);
                match (fate, close_at_end) {
                    (Fate::Orphaned, false) => prop_assert_eq!(delivered, 0),
                    _ => prop_assert_eq!(delivered, 1, "request {} ({:?})", id, fate),
                }
                if let Some(results) = outcomes.get(id) {
                    match (fate, &results[0]) {
                        (Fate::Answered | Fate::AnsweredTwice, Ok(value)) => {
                            prop_assert_eq!(&value["result"], &json!(id));
                        }
                        (Fate::Cancelled, Err(EnvError::Cancelled)) => {}
                        (Fate::Orphaned, Err(EnvError::ConnectionLost { .. })) => {}
                        (fate, other) => {
                            prop_assert!(false, "request {} ({:?}) got {:?}", id, fate, other);
                        }
                    }
                }
            }
            Ok(())
        })?;
    }
}
