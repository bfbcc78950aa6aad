//! Thread helpers

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of a bounded join
#[derive(Debug)]
pub enum JoinOutcome<T> {
    Finished(T),
    Panicked,
    /// The thread is still running; the handle is returned so the caller can
    /// decide whether to keep waiting or abandon it
    TimedOut(JoinHandle<T>),
}

/// Wait for `handle` to finish, giving up after `timeout`
pub fn join_bounded<T>(handle: JoinHandle<T>, timeout: Duration) -> JoinOutcome<T> {
    let start = Instant::now();
    loop {
        if handle.is_finished() {
            return joined(handle);
        }
        if start.elapsed() >= timeout {
            return JoinOutcome::TimedOut(handle);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// [`join_bounded`] for async callers: polls on the tokio timer instead of
/// parking the runtime thread
pub async fn join_bounded_async<T>(handle: JoinHandle<T>, timeout: Duration) -> JoinOutcome<T> {
    let start = tokio::time::Instant::now();
    loop {
        if handle.is_finished() {
            return joined(handle);
        }
        if start.elapsed() >= timeout {
            return JoinOutcome::TimedOut(handle);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Only called once the thread has finished, so `join` returns immediately
fn joined<T>(handle: JoinHandle<T>) -> JoinOutcome<T> {
    match handle.join() {
        Ok(value) => JoinOutcome::Finished(value),
        Err(_) => JoinOutcome::Panicked,
    }
}
