//! Task-runtime shim
//!
//! The engine proper runs on an external work-stealing task runtime whose
//! only contract is `schedule(fn) -> future` and `await`. This module is the
//! thin stand-in for that collaborator: background work is spawned on an OS
//! thread and joined through a [`TaskFuture`]. The texture streamer is the
//! only hot-path user.

use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

/// Handle to a value being produced by a scheduled task.
pub struct TaskFuture<T> {
    receiver: Receiver<T>,
    result: Option<T>,
}

impl<T> TaskFuture<T> {
    /// Returns true once the task has finished and its result is available.
    pub fn is_complete(&mut self) -> bool {
        if self.result.is_some() {
            return true;
        }
        match self.receiver.try_recv() {
            Ok(value) => {
                self.result = Some(value);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                // The task panicked; treat as never completing. The panic is
                // surfaced when the result is demanded.
                false
            }
        }
    }

    /// Blocks until the task completes and returns its result.
    ///
    /// # Panics
    /// Panics if the task itself panicked.
    pub fn block_on(mut self) -> T {
        if let Some(value) = self.result.take() {
            return value;
        }
        self.receiver.recv().expect("scheduled task panicked")
    }
}

/// Schedules a closure to run in the background and returns a future for its
/// result.
pub fn schedule<T, F>(task: F) -> TaskFuture<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        // A dropped receiver just means nobody is waiting on the result.
        let _ = sender.send(task());
    });
    TaskFuture {
        receiver,
        result: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_produces_result() {
        let future = schedule(|| 21 * 2);
        assert_eq!(future.block_on(), 42);
    }

    #[test]
    fn is_complete_latches() {
        let mut future = schedule(|| "done");
        while !future.is_complete() {
            std::thread::yield_now();
        }
        assert!(future.is_complete());
        assert_eq!(future.block_on(), "done");
    }
}
