//! Serial background context
//!
//! Deletions and modification time bumps run one after another on a
//! dedicated thread so they never race each other.

use crossbeam_channel::{Sender, unbounded};
use std::io;
use std::thread;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A FIFO of jobs executed on one background thread
pub struct SerialQueue {
    sender: Option<Sender<Job>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SerialQueue {
    /// Spawn the worker thread
    pub fn new(name: &str) -> io::Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!("Serial queue started");
                for job in receiver {
                    job();
                }
                debug!("Serial queue stopped");
            })?;
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Run `job` after everything queued before it
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.send(Box::new(job)).is_err() {
            error!("Serial queue worker is gone, dropping job");
        }
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is left and exit.
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Serial queue worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_jobs_run_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let queue = SerialQueue::new("test-serial").unwrap();
        for i in 0..100 {
            let seen = Arc::clone(&seen);
            queue.dispatch(move || seen.lock().push(i));
        }
        drop(queue);
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }
}
