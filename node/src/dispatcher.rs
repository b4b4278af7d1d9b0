//! CPU-bound verification kept off the event loop.
//!
//! The daemon runs on a single-threaded cooperative runtime; PoW hashes
//! and ring-signature batches would stall every connection for tens of
//! milliseconds each. A small pool of plain OS threads takes those jobs
//! from a mailbox and posts completions back through oneshot channels,
//! which is the only cross-thread traffic in the process.

use cache_core::core::RingCheckJob;
use cache_core::crypto::{Hash, slow_hash};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;

/// Shutdown token observed by every long-lived task at each suspension
/// point.
pub type StopToken = tokio_util::sync::CancellationToken;

enum Job {
    PowHash {
        blob: Vec<u8>,
        reply: oneshot::Sender<Hash>,
    },
    RingBatch {
        jobs: Vec<RingCheckJob>,
        reply: oneshot::Sender<bool>,
    },
}

pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> WorkerPool {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = std::sync::Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads.max(1) {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("verify-{index}"))
                .spawn(move || {
                    loop {
                        // the lock is held only while waiting for the
                        // next job, so the pool drains in parallel
                        let job = match receiver.lock().recv() {
                            Ok(job) => job,
                            Err(_) => return, // pool dropped
                        };
                        match job {
                            Job::PowHash { blob, reply } => {
                                let _ = reply.send(slow_hash(&blob));
                            }
                            Job::RingBatch { jobs, reply } => {
                                let ok = jobs.iter().all(RingCheckJob::check);
                                let _ = reply.send(ok);
                            }
                        }
                    }
                })
                .expect("spawning verification worker");
            handles.push(handle);
        }
        WorkerPool {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
        }
    }

    fn submit(&self, job: Job) {
        if let Some(sender) = self.sender.lock().as_ref() {
            // a send failure means shutdown already started; the oneshot
            // receiver sees the drop and the caller bails out
            let _ = sender.send(job);
        }
    }

    /// Compute the PoW hash of a hashing blob on a worker.
    pub fn pow_hash(&self, blob: Vec<u8>) -> oneshot::Receiver<Hash> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::PowHash { blob, reply });
        rx
    }

    /// Verify a batch of ring signatures; resolves to false as soon as
    /// any check in the batch fails.
    pub fn verify_ring_batch(&self, jobs: Vec<RingCheckJob>) -> oneshot::Receiver<bool> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::RingBatch { jobs, reply });
        rx
    }

    /// Drop the mailbox and join the workers. Pending replies resolve
    /// as channel closures.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        for handle in self.handles.lock().drain(..) {
            let _ = handle.join();
        }
    }
}
