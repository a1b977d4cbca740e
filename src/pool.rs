//! Worker pools.
//!
//! Two flavors back the engines:
//!
//! - [`SimplePool`] launches N threads all running the same closure against
//!   shared state, and joins them on [`SimplePool::join`]. The compress and
//!   extract engines use it for their drain loops.
//! - [`JobPool`] keeps an internal job queue with `submit`, `wait_all`, and
//!   shutdown-on-drop, for callers that feed heterogeneous work items.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// Fixed set of workers all running one function over one shared parameter.
pub struct SimplePool {
    workers: Vec<JoinHandle<()>>,
}

impl SimplePool {
    /// Spawn `count` threads, each running `func()` to completion.
    pub fn new<F>(count: usize, func: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let func = Arc::new(func);
        let workers = (0..count)
            .map(|_| {
                let func = Arc::clone(&func);
                thread::spawn(move || func())
            })
            .collect();
        SimplePool { workers }
    }

    /// Wait for every worker to finish.
    pub fn join(self) {
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------

type Job = Box<dyn FnOnce() + Send + 'static>;

struct JobState {
    jobs: VecDeque<Job>,
    shutdown: bool,
    working_count: usize,
}

struct JobShared {
    state: Mutex<JobState>,
    job_available: Condvar,
    job_done: Condvar,
    max_queue_size: usize,
}

/// Thread pool with an internal job queue.
///
/// `submit` refuses new jobs once the pool is shutting down, or when
/// `max_queue_size > 0` and the queue is full. Dropping the pool signals
/// shutdown, joins the workers, and discards jobs that never ran.
pub struct JobPool {
    shared: Arc<JobShared>,
    workers: Vec<JoinHandle<()>>,
}

impl JobPool {
    /// `max_queue_size == 0` means unbounded.
    pub fn new(num_threads: usize, max_queue_size: usize) -> Self {
        let num_threads = num_threads.max(1);
        let shared = Arc::new(JobShared {
            state: Mutex::new(JobState {
                jobs: VecDeque::new(),
                shutdown: false,
                working_count: 0,
            }),
            job_available: Condvar::new(),
            job_done: Condvar::new(),
            max_queue_size,
        });

        let workers = (0..num_threads)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || Self::worker_loop(&shared))
            })
            .collect();

        JobPool { shared, workers }
    }

    fn worker_loop(shared: &JobShared) {
        loop {
            let job = {
                let mut s = shared.state.lock().unwrap();
                while !s.shutdown && s.jobs.is_empty() {
                    s = shared.job_available.wait(s).unwrap();
                }
                if s.shutdown && s.jobs.is_empty() {
                    return;
                }
                let job = s.jobs.pop_front();
                if job.is_some() {
                    s.working_count += 1;
                }
                job
            };

            if let Some(job) = job {
                job();
                let mut s = shared.state.lock().unwrap();
                s.working_count -= 1;
                if s.jobs.is_empty() && s.working_count == 0 {
                    shared.job_done.notify_all();
                }
            }
        }
    }

    /// Queue a job and wake one worker. Returns `false` if the pool is
    /// shutting down or the queue is full.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut s = self.shared.state.lock().unwrap();
        if s.shutdown
            || (self.shared.max_queue_size > 0 && s.jobs.len() >= self.shared.max_queue_size)
        {
            return false;
        }
        s.jobs.push_back(Box::new(job));
        self.shared.job_available.notify_one();
        true
    }

    /// Block until the queue is empty and no worker is mid-job.
    pub fn wait_all(&self) {
        let mut s = self.shared.state.lock().unwrap();
        while !s.jobs.is_empty() || s.working_count > 0 {
            s = self.shared.job_done.wait(s).unwrap();
        }
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        {
            let mut s = self.shared.state.lock().unwrap();
            s.shutdown = true;
            self.shared.job_available.notify_all();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        // jobs that never ran are dropped with the queue
        self.shared.state.lock().unwrap().jobs.clear();
    }
}
