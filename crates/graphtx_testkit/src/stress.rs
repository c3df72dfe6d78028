//! Concurrent stress harness.
//!
//! Drives a domain with N reader and M writer threads while checking the
//! engine's two core promises: writers are mutually exclusive with every
//! other transaction, and replaying the committed deltas in sequence order
//! reproduces the final model state.

use crate::fixtures::model_from_state;
use graphtx_core::{ChangeDescription, Domain, FnPostcommit};
use graphtx_model::Value;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Configuration for a mixed-load run.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of reader threads.
    pub readers: usize,
    /// Number of writer threads.
    pub writers: usize,
    /// Committed transactions per writer thread.
    pub commits_per_writer: usize,
    /// List pushes per committed transaction.
    pub ops_per_commit: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            readers: 4,
            writers: 4,
            commits_per_writer: 20,
            ops_per_commit: 5,
        }
    }
}

/// Outcome of a mixed-load run.
#[derive(Debug)]
pub struct StressReport {
    /// Root transactions committed.
    pub commits: usize,
    /// Commits that failed; always zero without listeners or validators.
    pub failed_commits: usize,
    /// Reads completed across all reader threads.
    pub reads: usize,
    /// True if replaying the deltas in sequence order onto the initial
    /// state reproduced the final state.
    pub replay_matches: bool,
}

/// Runs readers and writers against one domain and checks the invariants.
///
/// Panics (through a joined thread) if a writer ever observes another
/// active writer or an active reader, or if a reader observes an active
/// writer.
#[must_use]
pub fn run_mixed_load(config: &StressConfig) -> StressReport {
    let domain = Arc::new(Domain::new());
    let initial = domain.model().state();

    let deltas: Arc<Mutex<Vec<Arc<ChangeDescription>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = deltas.clone();
    domain
        .add_postcommit_listener(Arc::new(FnPostcommit::new("collect", move |event| {
            if let Some(description) = &event.description {
                sink.lock().push(description.clone());
            }
        })))
        .expect("listener registration outside any commit");

    let writers_inside = Arc::new(AtomicUsize::new(0));
    let readers_inside = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let reads_done = Arc::new(AtomicUsize::new(0));
    let writers_left = Arc::new(AtomicUsize::new(config.writers));

    let mut handles = Vec::new();
    for w in 0..config.writers {
        let domain = domain.clone();
        let writers_inside = writers_inside.clone();
        let readers_inside = readers_inside.clone();
        let failed = failed.clone();
        let writers_left = writers_left.clone();
        let ops = config.ops_per_commit;
        let commits = config.commits_per_writer;
        handles.push(thread::spawn(move || {
            for i in 0..commits {
                let result = domain.execute(|model| {
                    assert_eq!(
                        writers_inside.fetch_add(1, Ordering::SeqCst),
                        0,
                        "two writers inside at once"
                    );
                    assert_eq!(
                        readers_inside.load(Ordering::SeqCst),
                        0,
                        "writer overlaps an active reader"
                    );

                    let node = model.create_node()?;
                    model.set_attr(
                        node,
                        "owner",
                        Some(Value::Text(format!("w{w}-{i}"))),
                    )?;
                    for op in 0..ops {
                        model.list_insert(node, "ops", op, Value::Int(op as i64))?;
                    }

                    writers_inside.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                });
                if result.is_err() {
                    failed.fetch_add(1, Ordering::SeqCst);
                }
            }
            writers_left.fetch_sub(1, Ordering::SeqCst);
        }));
    }

    for _ in 0..config.readers {
        let domain = domain.clone();
        let writers_inside = writers_inside.clone();
        let readers_inside = readers_inside.clone();
        let reads_done = reads_done.clone();
        let writers_left = writers_left.clone();
        handles.push(thread::spawn(move || {
            while writers_left.load(Ordering::SeqCst) > 0 {
                domain
                    .run_exclusive(|model| {
                        readers_inside.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(
                            writers_inside.load(Ordering::SeqCst),
                            0,
                            "reader overlaps an active writer"
                        );
                        // Every committed node is complete; a reader can
                        // never see a node without its owner tag.
                        for node in model.node_ids() {
                            assert!(model.attr(node, "owner").is_some());
                        }
                        readers_inside.fetch_sub(1, Ordering::SeqCst);
                    })
                    .expect("read transaction");
                reads_done.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    for handle in handles {
        handle.join().expect("stress thread");
    }

    let mut deltas = deltas.lock().clone();
    deltas.sort_by_key(|d| d.sequence);

    let replay = model_from_state(&initial);
    for description in &deltas {
        description.apply(&replay);
    }
    let final_state = domain
        .run_exclusive(|model| model.state())
        .expect("final read");

    StressReport {
        commits: deltas.len(),
        failed_commits: failed.load(Ordering::SeqCst),
        reads: reads_done.load(Ordering::SeqCst),
        replay_matches: replay.state() == final_state,
    }
}
