//! Cross-thread integration tests for the transaction engine.

use graphtx_core::{
    CancelToken, Domain, EngineError, FnPostcommit, OptionKey, OptionMap, SequenceNumber,
};
use graphtx_model::{Model, NodeId, Value};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn text(s: &str) -> Option<Value> {
    Some(Value::Text(s.to_string()))
}

fn setup_node(domain: &Domain) -> NodeId {
    domain
        .execute(|model| Ok(model.create_node()?))
        .unwrap()
}

#[test]
fn reader_never_observes_mid_transaction_state() {
    let domain = Arc::new(Domain::new());
    let node = setup_node(&domain);
    let stop = Arc::new(AtomicBool::new(false));

    let reader = {
        let domain = domain.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                domain
                    .run_exclusive(|model| {
                        let value = model.attr(node, "x");
                        assert!(
                            value.is_none() || value == text("final"),
                            "observed intermediate state: {value:?}"
                        );
                    })
                    .unwrap();
            }
        })
    };

    for _ in 0..20 {
        let tx = domain.start(OptionMap::new()).unwrap();
        domain.model().set_attr(node, "x", text("mid")).unwrap();
        // The recorder is dirty, so this degrades to a pause and the
        // intermediate value stays invisible.
        tx.yield_now().unwrap();
        domain.model().set_attr(node, "x", text("final")).unwrap();
        tx.commit().unwrap();

        let reset = domain.start(OptionMap::new()).unwrap();
        domain.model().set_attr(node, "x", None).unwrap();
        reset.commit().unwrap();
    }

    stop.store(true, Ordering::SeqCst);
    reader.join().unwrap();
}

#[test]
fn clean_writer_yield_lets_readers_through() {
    let domain = Arc::new(Domain::new());
    let node = setup_node(&domain);
    let reader_ran = Arc::new(AtomicBool::new(false));

    let tx = domain.start(OptionMap::new()).unwrap();
    let reader = {
        let domain = domain.clone();
        let reader_ran = reader_ran.clone();
        thread::spawn(move || {
            domain
                .run_exclusive(|model| {
                    assert!(model.contains(node));
                })
                .unwrap();
            reader_ran.store(true, Ordering::SeqCst);
        })
    };

    // An empty recorder allows a true release; keep yielding until the
    // reader has had its turn.
    while !reader_ran.load(Ordering::SeqCst) {
        tx.yield_now().unwrap();
    }
    reader.join().unwrap();
    domain.model().set_attr(node, "x", text("done")).unwrap();
    tx.commit().unwrap();
}

#[test]
fn concurrent_writers_serialize() {
    let domain = Arc::new(Domain::new());
    let node = setup_node(&domain);
    domain
        .execute(|model| {
            model.set_attr(node, "count", Some(Value::Int(0)))?;
            Ok(())
        })
        .unwrap();

    let per_writer = 25;
    let writers: Vec<_> = (0..4)
        .map(|_| {
            let domain = domain.clone();
            thread::spawn(move || {
                for _ in 0..per_writer {
                    domain
                        .execute(|model| {
                            let current = model
                                .attr(node, "count")
                                .and_then(|v| v.as_int())
                                .unwrap_or(0);
                            model.set_attr(node, "count", Some(Value::Int(current + 1)))?;
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let total = domain
        .run_exclusive(|model| model.attr(node, "count").and_then(|v| v.as_int()))
        .unwrap();
    assert_eq!(total, Some(4 * per_writer));
}

#[test]
fn commit_order_replay_reproduces_final_state() {
    let domain = Arc::new(Domain::new());
    let committed = Arc::new(Mutex::new(Vec::new()));
    let sink = committed.clone();
    domain
        .add_postcommit_listener(Arc::new(FnPostcommit::new("collect", move |event| {
            if let Some(description) = &event.description {
                sink.lock().push((event.sequence, description.clone()));
            }
        })))
        .unwrap();

    let writers: Vec<_> = (0..3)
        .map(|w| {
            let domain = domain.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    domain
                        .execute(|model| {
                            let node = model.create_node()?;
                            model.set_attr(
                                node,
                                "tag",
                                Some(Value::Text(format!("w{w}-{i}"))),
                            )?;
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let mut deltas = committed.lock().clone();
    deltas.sort_by_key(|(sequence, _)| *sequence);
    // Sequence numbers are dense and unique.
    for (i, (sequence, _)) in deltas.iter().enumerate() {
        assert_eq!(*sequence, SequenceNumber::new(i as u64 + 1));
    }

    let replay = Model::new();
    for (_, description) in &deltas {
        description.apply(&replay);
    }
    let final_state = domain.run_exclusive(|model| model.state()).unwrap();
    assert_eq!(replay.state(), final_state);
}

#[test]
fn cancelled_lock_wait_is_interrupted() {
    let domain = Arc::new(Domain::new());
    let holder = domain.start(OptionMap::new()).unwrap();

    let token = CancelToken::new();
    let waiter = {
        let domain = domain.clone();
        let token = token.clone();
        thread::spawn(move || {
            domain
                .start_interruptible(OptionMap::new(), token)
                .map(|tx| tx.rollback("should not get here"))
        })
    };
    thread::sleep(Duration::from_millis(30));
    token.cancel();
    let result = waiter.join().unwrap();
    assert!(matches!(result, Err(EngineError::Interrupted)));

    holder.commit().unwrap();
}

#[test]
fn postcommit_listener_may_read_the_domain() {
    let domain = Arc::new(Domain::new());
    let seen = Arc::new(AtomicBool::new(false));
    let inner_domain = domain.clone();
    let inner_seen = seen.clone();
    domain
        .add_postcommit_listener(Arc::new(FnPostcommit::new("read-back", move |_| {
            // The write lock is released before notification, so a read
            // transaction here must not deadlock.
            inner_domain
                .run_exclusive(|model| {
                    assert_eq!(model.node_count(), 1);
                })
                .unwrap();
            inner_seen.store(true, Ordering::SeqCst);
        })))
        .unwrap();

    domain
        .execute(|model| Ok(model.create_node().map(|_| ())?))
        .unwrap();
    assert!(seen.load(Ordering::SeqCst));
}

#[test]
fn silent_option_inherits_into_children() {
    let domain = Arc::new(Domain::new());
    let node = setup_node(&domain);

    let silent_counter = Arc::new(AtomicBool::new(false));
    let flag = silent_counter.clone();
    domain
        .add_postcommit_listener(Arc::new(FnPostcommit::new("flag", move |_| {
            flag.store(true, Ordering::SeqCst);
        })))
        .unwrap();

    // A silent parent makes its plain child silent through inheritance.
    let parent = domain
        .start(OptionMap::new().with(OptionKey::Silent, true))
        .unwrap();
    let child = domain.start(OptionMap::new()).unwrap();
    domain.model().set_attr(node, "by", text("child")).unwrap();
    child.commit().unwrap();
    parent.commit().unwrap();
    assert!(!silent_counter.load(Ordering::SeqCst));

    domain
        .execute(|model| {
            model.set_attr(node, "by", text("loud"))?;
            Ok(())
        })
        .unwrap();
    assert!(silent_counter.load(Ordering::SeqCst));
}
