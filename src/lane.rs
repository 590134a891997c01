//! # The ptrace lane
//!
//! After `PTRACE_ATTACH`, the kernel requires every later ptrace request
//! for that tracee to come from the same OS thread. This is a correctness
//! requirement, not an optimization: requests from any other thread fail
//! with `ESRCH` even though the tracee is alive and stopped.
//!
//! [`PtraceLane`] pins one thread for this purpose. Callers submit a
//! closure and block until the lane thread has run it and sent the result
//! back. The lane is created once at startup and handed to every driver
//! instance; see the process controller.
//!
//! `waitpid` is deliberately *not* routed through the lane. It has no
//! thread-affinity requirement and routing it here would wedge the lane
//! for the whole blocking wait, making `halt` impossible.

use std::sync::mpsc;
use std::thread;

type Job = Box<dyn FnOnce() + Send>;

/// Serialises ptrace calls onto a single pinned OS thread.
pub struct PtraceLane {
    submit: mpsc::SyncSender<Job>,
}

impl PtraceLane {
    pub fn new() -> Self {
        let (submit, jobs) = mpsc::sync_channel::<Job>(1);
        thread::Builder::new()
            .name("ptrace-lane".into())
            .spawn(move || {
                for job in jobs {
                    job();
                }
            })
            .expect("could not spawn the ptrace lane thread");
        Self { submit }
    }

    /// Run `f` on the lane thread and return its result.
    ///
    /// Blocks the caller until the lane has executed the closure. Panics
    /// if the lane thread is gone, which can only happen if a previous
    /// job panicked.
    pub fn exec<T, F>(&self, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (reply, result) = mpsc::sync_channel(1);
        self.submit
            .send(Box::new(move || {
                let _ = reply.send(f());
            }))
            .expect("ptrace lane thread is gone");
        result.recv().expect("ptrace lane dropped the reply")
    }
}

impl Default for PtraceLane {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_exec_returns_result() {
        let lane = PtraceLane::new();
        assert_eq!(lane.exec(|| 21 * 2), 42);
    }

    #[test]
    fn test_all_jobs_run_on_the_same_thread() {
        let lane = PtraceLane::new();
        let first = lane.exec(|| thread::current().id());
        let second = lane.exec(|| thread::current().id());
        assert_eq!(first, second);
        assert_ne!(first, thread::current().id());
    }
}
