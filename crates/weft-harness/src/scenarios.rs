//! End-to-end scenario runners.
//!
//! Each runner drives one workload across component boundaries and reports
//! what it observed; verdicts compare the observation against the documented
//! contract. [`run_all`] collects the full suite into a
//! [`ScenarioReport`](crate::report::ScenarioReport).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use weft_core::{Barrier, Candidate, Cond, Error, GhostEngine, Mutex, Pool, Thread};

use crate::report::{ScenarioCase, ScenarioReport};

/// Counter whose increments are made safe by a lock, not by atomic RMW: a
/// broken mutex loses updates and the scenario fails.
struct GuardedCounter {
    mutex: Mutex,
    value: AtomicU64,
}

impl GuardedCounter {
    fn new() -> weft_core::Result<Self> {
        let mutex = Mutex::new();
        mutex.init()?;
        Ok(Self {
            mutex,
            value: AtomicU64::new(0),
        })
    }

    fn increment(&self) -> weft_core::Result<()> {
        self.mutex.lock()?;
        let v = self.value.load(Ordering::Relaxed);
        self.value.store(v + 1, Ordering::Relaxed);
        self.mutex.unlock()
    }

    fn get(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

/// Worker pool basic: `tasks` increments through a 4-worker pool, quiesce,
/// shutdown, and the counter must equal the submission count.
pub fn pool_counter(workers: usize, tasks: u64) -> ScenarioCase {
    let run = || -> weft_core::Result<u64> {
        let pool = Pool::new(workers)?;
        let counter = Arc::new(GuardedCounter::new()?);
        for _ in 0..tasks {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                let _ = counter.increment();
            })?;
        }
        pool.wait();
        // Quiesce only drains the queue; shutdown joins the workers, so
        // after it returns every task has completed.
        pool.shutdown();
        Ok(counter.get())
    };
    match run() {
        Ok(observed) => ScenarioCase::observed(
            "pool_counter",
            format!("workers={workers} tasks={tasks} counter={observed}"),
            observed == tasks,
        ),
        Err(e) => ScenarioCase::observed("pool_counter", format!("error={e}"), false),
    }
}

/// Barrier cyclic: `parties` threads run `rounds` iterations of work +
/// rendezvous; the generation must advance once per round.
pub fn barrier_cycles(parties: usize, rounds: u64) -> ScenarioCase {
    let run = || -> weft_core::Result<(u64, u64)> {
        let barrier = Arc::new(Barrier::new());
        barrier.init(parties, true)?;
        let work = Arc::new(AtomicU64::new(0));

        let mut threads = Vec::new();
        for _ in 0..parties {
            let barrier = Arc::clone(&barrier);
            let work = Arc::clone(&work);
            let t: Thread<weft_core::Result<()>> = Thread::new();
            t.spawn(move |_| {
                for _ in 0..rounds {
                    work.fetch_add(1, Ordering::SeqCst);
                    barrier.wait()?;
                }
                Ok(())
            })?;
            threads.push(t);
        }
        for t in &threads {
            t.join().map_err(|_| Error::Internal)??;
            t.dispose();
        }
        let generation = barrier.generation();
        barrier.destroy();
        Ok((work.load(Ordering::SeqCst), generation))
    };
    match run() {
        Ok((work, generation)) => ScenarioCase::observed(
            "barrier_cycles",
            format!("parties={parties} rounds={rounds} work={work} generation={generation}"),
            work == parties as u64 * rounds && generation == rounds,
        ),
        Err(e) => ScenarioCase::observed("barrier_cycles", format!("error={e}"), false),
    }
}

/// Producer/consumer over a mutex + condition variable: the consumer must
/// receive 0..count in submission order.
pub fn producer_consumer(count: u32) -> ScenarioCase {
    struct Shared {
        mutex: Mutex,
        not_empty: Cond,
        /// Item storage; all pushes and pops happen with `mutex` held.
        items: std::sync::Mutex<std::collections::VecDeque<u32>>,
    }

    impl Shared {
        fn push(&self, v: u32) {
            if let Ok(mut q) = self.items.lock() {
                q.push_back(v);
            }
        }
        fn pop(&self) -> Option<u32> {
            self.items.lock().ok().and_then(|mut q| q.pop_front())
        }
    }

    let run = || -> weft_core::Result<Vec<u32>> {
        let shared = Arc::new(Shared {
            mutex: Mutex::new(),
            not_empty: Cond::new(),
            items: std::sync::Mutex::new(std::collections::VecDeque::new()),
        });
        shared.mutex.init()?;
        shared.not_empty.init()?;

        let producer_shared = Arc::clone(&shared);
        let producer: Thread<weft_core::Result<()>> = Thread::new();
        producer.spawn(move |_| {
            for i in 0..count {
                producer_shared.mutex.lock()?;
                producer_shared.push(i);
                producer_shared.not_empty.signal()?;
                producer_shared.mutex.unlock()?;
            }
            Ok(())
        })?;

        let consumer_shared = Arc::clone(&shared);
        let consumer: Thread<weft_core::Result<Vec<u32>>> = Thread::new();
        consumer.spawn(move |_| {
            let mut received = Vec::with_capacity(count as usize);
            while received.len() < count as usize {
                consumer_shared.mutex.lock()?;
                loop {
                    match consumer_shared.pop() {
                        Some(v) => {
                            received.push(v);
                            break;
                        }
                        None => consumer_shared.not_empty.wait(&consumer_shared.mutex)?,
                    }
                }
                consumer_shared.mutex.unlock()?;
            }
            Ok(received)
        })?;

        producer.join().map_err(|_| Error::Internal)??;
        let received = consumer.join().map_err(|_| Error::Internal)??;
        producer.dispose();
        consumer.dispose();
        shared.not_empty.dispose();
        shared.mutex.dispose();
        Ok(received)
    };
    match run() {
        Ok(received) => {
            let in_order = received.iter().copied().eq(0..count);
            ScenarioCase::observed(
                "producer_consumer",
                format!("count={count} received={} in_order={in_order}", received.len()),
                in_order,
            )
        }
        Err(e) => ScenarioCase::observed("producer_consumer", format!("error={e}"), false),
    }
}

/// Thread join return value: the value produced by the entry comes back from
/// join exactly once; the second join reports the detached kind.
pub fn thread_return_value() -> ScenarioCase {
    let run = || -> weft_core::Result<(bool, bool)> {
        let marker = Arc::new(77u64);
        let expected = Arc::clone(&marker);
        let t: Thread<Arc<u64>> = Thread::new();
        t.spawn(move |_| marker)?;

        let received = t.join()?;
        let first_matches = Arc::ptr_eq(&received, &expected);
        let second_rejected = matches!(t.join(), Err(Error::Detached));
        t.dispose();
        Ok((first_matches, second_rejected))
    };
    match run() {
        Ok((first_matches, second_rejected)) => ScenarioCase::observed(
            "thread_return_value",
            format!("first_matches={first_matches} second_rejected={second_rejected}"),
            first_matches && second_rejected,
        ),
        Err(e) => ScenarioCase::observed("thread_return_value", format!("error={e}"), false),
    }
}

/// Ghost determinism: two engines fed the identical call sequence must
/// collapse to the same index.
pub fn ghost_determinism() -> ScenarioCase {
    let run_once = || -> weft_core::Result<usize> {
        let mut engine: GhostEngine<u32> = GhostEngine::new();
        let g = engine.create("g-alpha", None)?;
        engine.propose(
            g,
            vec![
                Candidate::new(Arc::new(1), "A"),
                Candidate::new(Arc::new(2), "B"),
            ],
        )?;
        engine.collapse(g)
    };
    match (run_once(), run_once()) {
        (Ok(a), Ok(b)) => ScenarioCase::observed(
            "ghost_determinism",
            format!("first={a} second={b}"),
            a == b,
        ),
        (Err(e), _) | (_, Err(e)) => {
            ScenarioCase::observed("ghost_determinism", format!("error={e}"), false)
        }
    }
}

const FNV_OFFSET_BASIS: u64 = 14_695_981_039_346_656_037;
const FNV_PRIME: u64 = 1_099_511_628_211;

/// The engine's published collapse seed.
const COLLAPSE_SEED: u64 = 0x5745_4654_4C45_4447;

fn fnv1a_mix(prior: u64, bytes: &[u8]) -> u64 {
    let mut acc = FNV_OFFSET_BASIS ^ prior;
    for &b in bytes {
        acc ^= u64::from(b);
        acc = acc.wrapping_mul(FNV_PRIME);
    }
    acc
}

/// Ghost collapse formula: with a ledger of exactly [create, propose], the
/// chosen index for tags p/q/r must equal the FNV-1a chain mod 3.
pub fn ghost_formula() -> ScenarioCase {
    let run = || -> weft_core::Result<(usize, usize, usize)> {
        let mut engine: GhostEngine<u32> = GhostEngine::new();
        let g = engine.create("x", None)?;
        engine.propose(
            g,
            vec![
                Candidate::new(Arc::new(1), "p"),
                Candidate::new(Arc::new(2), "q"),
                Candidate::new(Arc::new(3), "r"),
            ],
        )?;
        let ledger_len = engine.ledger_len();
        let chosen = engine.collapse(g)?;

        let mut h = COLLAPSE_SEED;
        h = fnv1a_mix(h, &1u64.to_le_bytes());
        h = fnv1a_mix(h, b"x");
        h = fnv1a_mix(h, &1u64.to_le_bytes());
        for tag in ["p", "q", "r"] {
            h = fnv1a_mix(h, tag.as_bytes());
        }
        Ok((ledger_len, chosen, (h % 3) as usize))
    };
    match run() {
        Ok((ledger_len, chosen, expected)) => ScenarioCase::observed(
            "ghost_formula",
            format!("ledger_len={ledger_len} chosen={chosen} expected={expected}"),
            ledger_len == 2 && chosen == expected,
        ),
        Err(e) => ScenarioCase::observed("ghost_formula", format!("error={e}"), false),
    }
}

/// Run the whole scenario suite.
#[must_use]
pub fn run_all() -> ScenarioReport {
    ScenarioReport::new(
        "weft end-to-end scenarios",
        vec![
            pool_counter(4, 1000),
            barrier_cycles(3, 5),
            producer_consumer(100),
            thread_return_value(),
            ghost_determinism(),
            ghost_formula(),
        ],
    )
}
