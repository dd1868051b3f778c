//! Cooperative task scheduler
//!
//! Connections in the asynchronous scenarios are explicit state machines
//! ([`Task`]) rather than threads. A small, fixed pool of workers pulls tasks
//! from a shared ready queue and polls them. A task that would block returns
//! [`Step::Pending`] with the readiness it is waiting for and is parked. Idle
//! workers sweep the parked tasks with [`Task::is_ready`] and move the ready
//! ones to the back of the ready queue. Tasks found ready by the same sweep
//! keep the order they were parked in, so resumption follows the sweep that
//! saw them ready, not the order they were spawned.
//!
//! A run ends when every task has reached a terminal state or the wall-clock
//! budget expires. Tasks still alive at the deadline are destroyed (dropped,
//! which closes whatever they own) and reported as [`Completion::Destroyed`].
//!
//! ```
//! use vtls::sched::{Interest, Scheduler, Step, Task};
//! use std::time::Duration;
//!
//! struct Countdown(u32);
//!
//! impl Task for Countdown {
//!     type Output = u32;
//!
//!     fn name(&self) -> &str {
//!         "countdown"
//!     }
//!
//!     fn poll(&mut self) -> Step<u32> {
//!         if self.0 == 0 {
//!             return Step::Ready(7);
//!         }
//!         self.0 -= 1;
//!         Step::Pending(Interest::Yield)
//!     }
//!
//!     fn is_ready(&self, _interest: Interest) -> bool {
//!         true
//!     }
//! }
//!
//! let mut scheduler = Scheduler::new(2);
//! scheduler.spawn(Box::new(Countdown(3)));
//! let summary = scheduler.run(Duration::from_secs(5));
//! assert_eq!(summary.reports.len(), 1);
//! ```

use crate::env::ledger::Tracked;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Default number of pool workers
pub const DEFAULT_WORKERS: usize = 4;

/// How long an idle worker sleeps between readiness sweeps
const SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// What a parked task is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Its transport has data (or a peer to accept)
    Read,
    /// Its transport can take more data
    Write,
    /// Nothing; it only gives other tasks a turn
    Yield,
}

/// Result of polling a task once
#[derive(Debug)]
pub enum Step<T> {
    /// Suspended until `Interest` is satisfied
    Pending(Interest),
    /// Finished with an output
    Ready(T),
}

/// A suspendable unit of work
pub trait Task: Send {
    type Output: Send;

    /// Label used in reports and logs
    fn name(&self) -> &str;

    /// Advance as far as possible without blocking
    fn poll(&mut self) -> Step<Self::Output>;

    /// Whether resuming now would make progress on `interest`
    fn is_ready(&self, interest: Interest) -> bool;
}

/// How a task left the scheduler
#[derive(Debug)]
pub enum Completion<T> {
    /// The task returned an output
    Finished(T),
    /// The task was destroyed before finishing
    Destroyed,
}

/// Terminal record of one task
#[derive(Debug)]
pub struct TaskReport<T> {
    /// Spawn order
    pub id: usize,
    pub name: String,
    /// Number of times the task was polled
    pub resumes: u64,
    pub completion: Completion<T>,
}

/// Outcome of a scheduler run
#[derive(Debug)]
pub struct RunSummary<T> {
    /// Reports in the order tasks reached a terminal state
    pub reports: Vec<TaskReport<T>>,
    pub elapsed: Duration,
    /// Whether the budget expired before every task finished
    pub deadline_hit: bool,
}

impl<T> RunSummary<T> {
    /// Number of tasks destroyed at the deadline
    pub fn destroyed(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.completion, Completion::Destroyed))
            .count()
    }
}

struct Frame<T> {
    id: usize,
    name: String,
    resumes: u64,
    task: Box<dyn Task<Output = T>>,
    _tracked: Tracked,
}

impl<T> Frame<T> {
    fn into_report(self, completion: Completion<T>) -> TaskReport<T> {
        TaskReport {
            id: self.id,
            name: self.name,
            resumes: self.resumes,
            completion,
        }
    }
}

struct Queues<T> {
    ready: VecDeque<Frame<T>>,
    parked: Vec<(Frame<T>, Interest)>,
    finished: Vec<TaskReport<T>>,
    live: usize,
    draining: bool,
}

impl<T: Send> Queues<T> {
    /// Move parked tasks whose interest is satisfied to the back of the ready
    /// queue, in park order
    fn sweep(&mut self) -> usize {
        let mut moved = 0;
        let mut i = 0;
        while i < self.parked.len() {
            let (frame, interest) = &self.parked[i];
            if *interest == Interest::Yield || frame.task.is_ready(*interest) {
                let (frame, _) = self.parked.remove(i);
                self.ready.push_back(frame);
                moved += 1;
            } else {
                i += 1;
            }
        }
        moved
    }

    fn destroy_queued(&mut self) {
        let parked = std::mem::take(&mut self.parked);
        let queued = self
            .ready
            .drain(..)
            .chain(parked.into_iter().map(|(frame, _)| frame))
            .collect::<Vec<_>>();
        for frame in queued {
            warn!(task = %frame.name, "destroying unfinished task");
            self.live -= 1;
            self.finished.push(frame.into_report(Completion::Destroyed));
        }
    }
}

struct Shared<T> {
    queues: Mutex<Queues<T>>,
    wake: Condvar,
}

/// Fixed-size worker pool for cooperative tasks
pub struct Scheduler<T> {
    workers: usize,
    pending: Vec<Frame<T>>,
    next_id: usize,
}

impl<T: Send> Scheduler<T> {
    /// Create a scheduler with `workers` pool threads (at least one)
    pub fn new(workers: usize) -> Self {
        Scheduler {
            workers: workers.max(1),
            pending: Vec::new(),
            next_id: 0,
        }
    }

    /// Number of pool workers
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Number of tasks waiting for the next run
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no tasks are waiting
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queue a task for the next run; returns its id
    pub fn spawn(&mut self, task: Box<dyn Task<Output = T>>) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.push(Frame {
            id,
            name: task.name().to_string(),
            resumes: 0,
            task,
            _tracked: Tracked::new("task-frame"),
        });
        id
    }

    /// Run all queued tasks to a terminal state within `budget`
    pub fn run(&mut self, budget: Duration) -> RunSummary<T> {
        let start = Instant::now();
        let deadline = start + budget;
        let frames = std::mem::take(&mut self.pending);
        let live = frames.len();

        let shared = Shared {
            queues: Mutex::new(Queues {
                ready: frames.into(),
                parked: Vec::new(),
                finished: Vec::with_capacity(live),
                live,
                draining: false,
            }),
            wake: Condvar::new(),
        };

        debug!(tasks = live, workers = self.workers, "scheduler run started");
        thread::scope(|scope| {
            for _ in 0..self.workers {
                scope.spawn(|| worker_loop(&shared, deadline));
            }
        });

        let queues = shared.queues.into_inner();
        let summary = RunSummary {
            reports: queues.finished,
            elapsed: start.elapsed(),
            deadline_hit: queues.draining,
        };
        debug!(
            tasks = summary.reports.len(),
            destroyed = summary.destroyed(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "scheduler run finished"
        );
        summary
    }
}

fn worker_loop<T: Send>(shared: &Shared<T>, deadline: Instant) {
    loop {
        let mut frame = {
            let mut q = shared.queues.lock();
            loop {
                if q.live == 0 {
                    shared.wake.notify_all();
                    return;
                }
                if !q.draining && Instant::now() >= deadline {
                    q.draining = true;
                    q.destroy_queued();
                    continue;
                }
                if q.draining {
                    // Wait for tasks other workers are still polling.
                    shared.wake.wait_for(&mut q, SWEEP_INTERVAL);
                    continue;
                }
                if let Some(frame) = q.ready.pop_front() {
                    break frame;
                }
                if q.sweep() > 0 {
                    continue;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                shared.wake.wait_for(&mut q, remaining.min(SWEEP_INTERVAL));
            }
        };

        frame.resumes += 1;
        let step = frame.task.poll();

        let mut q = shared.queues.lock();
        match step {
            Step::Ready(output) => {
                trace!(task = %frame.name, resumes = frame.resumes, "task finished");
                q.live -= 1;
                q.finished.push(frame.into_report(Completion::Finished(output)));
                shared.wake.notify_all();
            }
            Step::Pending(_) if q.draining => {
                warn!(task = %frame.name, "destroying unfinished task");
                q.live -= 1;
                q.finished.push(frame.into_report(Completion::Destroyed));
                shared.wake.notify_all();
            }
            Step::Pending(Interest::Yield) => {
                q.ready.push_back(frame);
                shared.wake.notify_one();
            }
            Step::Pending(interest) => {
                q.parked.push((frame, interest));
            }
        }
    }
}
