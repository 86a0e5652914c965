//! Thread to loop bridge.
//!
//! One dedicated thread drives a current-thread tokio runtime (the bartering
//! loop). Worker threads push jobs through a bounded `flume` queue and block
//! on a per-job result channel, so every order intent in the process is
//! executed in one global order.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::core::{Error, Result};

type Job = BoxFuture<'static, ()>;

pub struct LinkBridge {
    tx: Option<flume::Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl LinkBridge {
    /// Spawn the loop thread with a queue of `capacity` pending jobs.
    pub fn start(capacity: usize) -> Result<Self> {
        let (tx, rx) = flume::bounded::<Job>(capacity);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let handle = std::thread::Builder::new()
            .name("bartering-loop".into())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Ok(job) = rx.recv_async().await {
                        job.await;
                    }
                });
                debug!("bartering loop drained, exiting");
            })?;

        info!("🔌 Bartering loop started (queue capacity {})", capacity);
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Run `fut` on the loop and block until it finishes.
    ///
    /// Must be called from a plain thread: calling it from inside a runtime
    /// would park that runtime's worker on its own queue.
    pub fn submit<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(Error::Contract(
                "LinkBridge::submit called from inside an async context".into(),
            ));
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::Bridge("bridge already shut down".into()))?;

        let (res_tx, res_rx) = flume::bounded(1);
        let job = async move {
            let outcome = AssertUnwindSafe(fut).catch_unwind().await;
            // the submitter may have given up; nothing to report then
            let _ = res_tx.send(outcome);
        }
        .boxed();

        tx.send(job)
            .map_err(|_| Error::Bridge("bartering loop is gone".into()))?;

        match res_rx.recv() {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let msg = panic_message(panic.as_ref());
                error!("bartering task panicked: {}", msg);
                Err(Error::Bridge(format!("task panicked: {msg}")))
            }
            Err(_) => Err(Error::Bridge("bartering loop dropped the task".into())),
        }
    }

    /// Jobs queued but not yet picked up by the loop.
    pub fn queued(&self) -> usize {
        self.tx.as_ref().map(|tx| tx.len()).unwrap_or(0)
    }
}

impl Drop for LinkBridge {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("bartering loop thread panicked");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Wait for every task up to `timeout`. Tasks still running at the deadline
/// are aborted and logged, never retried. Results come back in completion
/// order.
pub async fn gather_with_timeout<F, T>(tasks: Vec<F>, timeout: Duration) -> Vec<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let total = tasks.len();
    let mut set = JoinSet::new();
    for task in tasks {
        set.spawn(task);
    }

    let deadline = tokio::time::Instant::now() + timeout;
    let mut done = Vec::with_capacity(total);
    loop {
        match tokio::time::timeout_at(deadline, set.join_next()).await {
            Ok(Some(Ok(value))) => done.push(value),
            Ok(Some(Err(e))) => error!("gathered task failed: {}", e),
            Ok(None) => break,
            Err(_) => {
                warn!(
                    "{} of {} tasks still pending after {:?}, dropped",
                    set.len(),
                    total,
                    timeout
                );
                set.abort_all();
                break;
            }
        }
    }
    done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::capture_logs;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_submit_returns_result() {
        let bridge = LinkBridge::start(4).unwrap();
        let value = bridge.submit(async { Ok::<_, Error>(41 + 1) }).unwrap();
        assert_eq!(value, 42);

        let err = bridge
            .submit(async { Err::<u32, _>(Error::Bartering("venue down".into())) })
            .unwrap_err();
        assert!(matches!(err, Error::Bartering(_)));
    }

    #[test]
    fn test_panic_is_contained() {
        let bridge = LinkBridge::start(4).unwrap();
        let err = bridge
            .submit(async {
                if true {
                    panic!("boom");
                }
                Ok::<u32, Error>(0)
            })
            .unwrap_err();
        assert!(matches!(err, Error::Bridge(ref m) if m.contains("boom")));
        // loop survives the panic
        assert_eq!(bridge.submit(async { Ok::<_, Error>(7) }).unwrap(), 7);
    }

    #[test]
    fn test_jobs_from_many_threads_are_serialized() {
        let bridge = Arc::new(LinkBridge::start(2).unwrap());
        let in_flight = Arc::new(AtomicU64::new(0));
        let max_seen = Arc::new(AtomicU64::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let bridge = bridge.clone();
                let in_flight = in_flight.clone();
                let max_seen = max_seen.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        let in_flight = in_flight.clone();
                        let max_seen = max_seen.clone();
                        bridge
                            .submit(async move {
                                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                                max_seen.fetch_max(now, Ordering::SeqCst);
                                tokio::task::yield_now().await;
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                                Ok::<_, Error>(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_submit_inside_runtime_is_contract_error() {
        let bridge = LinkBridge::start(1).unwrap();
        let err = bridge.submit(async { Ok::<_, Error>(()) }).unwrap_err();
        assert!(err.is_contract_violation());
        // joining the loop thread from here is fine, it never touches this runtime
        drop(bridge);
    }

    #[tokio::test]
    async fn test_gather_drops_pending_tasks() {
        let (_guard, logs) = capture_logs();
        let tasks: Vec<BoxFuture<'static, u32>> = vec![
            async { 1 }.boxed(),
            async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                2
            }
            .boxed(),
            async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                3
            }
            .boxed(),
        ];
        let mut done = gather_with_timeout(tasks, Duration::from_millis(200)).await;
        done.sort();
        assert_eq!(done, vec![1, 3]);
        assert!(logs.contents().contains("1 of 3 tasks still pending"));
    }
}
