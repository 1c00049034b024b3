//! Running async cleanup to completion from `Drop`.
//!
//! A task spawned from `drop` dies with its runtime, and `#[tokio::test]` shuts its
//! current-thread runtime down as soon as the test body returns or panics. Cleanup started
//! here therefore finishes before `drop` returns.

use std::future::Future;
use std::sync::mpsc;
use std::time::Duration;

use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{error, warn};

/// How long a drop blocks on its cleanup before leaving it to finish on its own thread.
pub(crate) const DROP_CLEANUP_WAIT: Duration = Duration::from_secs(120);

/// Run `cleanup` to completion from synchronous code.
///
/// On a multi-thread runtime the current worker blocks in place while the runtime drives
/// the cleanup. Anywhere else the cleanup runs on a helper thread with its own runtime and
/// the caller waits up to [`DROP_CLEANUP_WAIT`] for it. The bound matters when the cleanup
/// needs a lock held by a task of the blocked runtime: the caller then stops waiting and the
/// helper finishes once the lock is free.
pub(crate) fn run_to_completion<F>(what: &'static str, cleanup: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(runtime) if runtime.runtime_flavor() == RuntimeFlavor::MultiThread => {
            let joined = tokio::task::block_in_place(|| runtime.block_on(runtime.spawn(cleanup)));
            if let Err(e) = joined {
                error!(what, error = %e, "Cleanup task failed");
            }
        }
        _ => run_on_helper_thread(what, cleanup),
    }
}

fn run_on_helper_thread<F>(what: &'static str, cleanup: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel();
    let spawned = std::thread::Builder::new()
        .name("mcluster-cleanup".to_string())
        .spawn(move || {
            match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime.block_on(cleanup),
                Err(e) => error!(what, error = %e, "No runtime for cleanup"),
            }
            let _ = done_tx.send(());
        });

    if let Err(e) = spawned {
        error!(what, error = %e, "Could not start cleanup thread");
        return;
    }

    match done_rx.recv_timeout(DROP_CLEANUP_WAIT) {
        Ok(()) => {}
        Err(mpsc::RecvTimeoutError::Timeout) => warn!(
            what,
            wait_secs = DROP_CLEANUP_WAIT.as_secs(),
            "Cleanup still running, no longer waiting for it"
        ),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            error!(what, "Cleanup thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn flag_after_sleep(flag: &Arc<AtomicBool>) -> impl Future<Output = ()> + Send + 'static {
        let flag = Arc::clone(flag);
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn runs_without_a_runtime() {
        let done = Arc::new(AtomicBool::new(false));
        run_to_completion("test", flag_after_sleep(&done));
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn runs_inside_current_thread_runtime() {
        let done = Arc::new(AtomicBool::new(false));
        run_to_completion("test", flag_after_sleep(&done));
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_inside_multi_thread_runtime() {
        let done = Arc::new(AtomicBool::new(false));
        run_to_completion("test", flag_after_sleep(&done));
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn survives_a_panicking_cleanup() {
        run_to_completion("test", async { panic!("cleanup blew up") });
    }
}
