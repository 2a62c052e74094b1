// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use super::critical::{CriticalFields, CriticalKind};
use kestrel_types::Bytes;

/// How long a batch may run before the scheduler logs a warning. Advisory
/// only: execution always continues to natural completion.
pub const DAG_BATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Dependency graph over one batch of parallel-eligible transactions.
///
/// Edges always point from the earlier-registered transaction to the later
/// one, so the graph is acyclic by construction and, crucially, identical
/// for any worker count: discovery order decides edge direction, never
/// wall-clock completion order.
pub struct TxDag {
    vertices: Vec<Vertex>,
}

struct Vertex {
    in_degree: AtomicUsize,
    out_edges: Vec<usize>,
}

struct SlotState {
    /// Every transaction that touched the slot, in registration order.
    /// Whole/Len keys scan this linearly — O(K²) worst case in the declared
    /// keys of a batch, accepted for its conservatism.
    touchers: Vec<usize>,
    /// Transactions that hold a Whole/Len key on the slot.
    coarse_touchers: Vec<usize>,
    /// Last writer per concrete payload.
    last_by_payload: HashMap<Bytes, usize>,
}

impl TxDag {
    /// Builds the graph. Transactions whose entry in `criticals` is `None`
    /// take no part in the DAG; the caller has already routed them to the
    /// serial path.
    pub fn new(criticals: &CriticalFields) -> TxDag {
        let mut vertices: Vec<Vertex> = (0..criticals.len())
            .map(|_| Vertex {
                in_degree: AtomicUsize::new(0),
                out_edges: Vec::new(),
            })
            .collect();

        let mut slots: HashMap<u64, SlotState> = HashMap::new();

        for id in 0..criticals.len() {
            let Some(keys) = criticals.get(id) else { continue };

            let mut predecessors: HashSet<usize> = HashSet::new();
            for key in keys {
                let slot = slots.entry(key.slot).or_insert_with(|| SlotState {
                    touchers: Vec::new(),
                    coarse_touchers: Vec::new(),
                    last_by_payload: HashMap::new(),
                });

                match key.kind {
                    CriticalKind::Whole | CriticalKind::Len => {
                        // Conservative: order after everything that touched
                        // any element of the container.
                        predecessors.extend(
                            slot.touchers.iter().filter(|t| **t != id),
                        );
                    }
                    CriticalKind::Payload => {
                        if let Some(prev) =
                            slot.last_by_payload.get(&key.payload)
                        {
                            if *prev != id {
                                predecessors.insert(*prev);
                            }
                        }
                        predecessors.extend(
                            slot.coarse_touchers.iter().filter(|t| **t != id),
                        );
                    }
                }

                if slot.touchers.last() != Some(&id) {
                    slot.touchers.push(id);
                }
                match key.kind {
                    CriticalKind::Whole | CriticalKind::Len => {
                        if slot.coarse_touchers.last() != Some(&id) {
                            slot.coarse_touchers.push(id);
                        }
                    }
                    CriticalKind::Payload => {
                        slot.last_by_payload.insert(key.payload.clone(), id);
                    }
                }
            }

            vertices[id]
                .in_degree
                .store(predecessors.len(), Ordering::Relaxed);
            for pred in predecessors {
                vertices[pred].out_edges.push(id);
            }
        }

        TxDag { vertices }
    }

    pub fn vertex_count(&self) -> usize { self.vertices.len() }

    #[cfg(test)]
    fn in_degree(&self, id: usize) -> usize {
        self.vertices[id].in_degree.load(Ordering::Relaxed)
    }

    /// Executes `job` once per DAG vertex on `workers` threads, honoring
    /// every edge. A vertex becomes ready when its last predecessor
    /// completes. Vertices excluded from the batch (the serial SEND_BACK
    /// ones) must be skipped by the caller inside `job`.
    pub fn run<F>(&self, workers: usize, timeout: Duration, job: F)
    where F: Fn(usize) + Sync {
        let total = self.vertices.len();
        if total == 0 {
            return;
        }

        let ready: Mutex<Vec<usize>> = Mutex::new(
            (0..total)
                .filter(|id| {
                    self.vertices[*id].in_degree.load(Ordering::Relaxed) == 0
                })
                .collect(),
        );
        let ready_cv = Condvar::new();
        let remaining = AtomicUsize::new(total);
        let started = Instant::now();
        let timeout_logged = AtomicBool::new(false);

        let workers = workers.max(1);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let id = {
                        let mut queue = ready.lock();
                        loop {
                            if remaining.load(Ordering::Acquire) == 0 {
                                return;
                            }
                            if let Some(id) = queue.pop() {
                                break id;
                            }
                            ready_cv.wait_for(
                                &mut queue,
                                Duration::from_millis(100),
                            );
                            if started.elapsed() > timeout
                                && !timeout_logged.swap(true, Ordering::AcqRel)
                            {
                                warn!(
                                    "DAG batch exceeded {:?}, continuing to \
                                     natural completion",
                                    timeout
                                );
                            }
                        }
                    };

                    job(id);

                    for succ in &self.vertices[id].out_edges {
                        let left = self.vertices[*succ]
                            .in_degree
                            .fetch_sub(1, Ordering::AcqRel);
                        if left == 1 {
                            ready.lock().push(*succ);
                            ready_cv.notify_one();
                        }
                    }
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        ready_cv.notify_all();
                        return;
                    }
                });
            }
        });
    }
}
