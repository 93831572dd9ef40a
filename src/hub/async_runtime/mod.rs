//! Abstractions over different async runtimes in the Rust ecosystem.

#[cfg(feature = "async_runtime_tokio")]
mod tokio;

#[cfg(feature = "async_runtime_async_std")]
mod async_std;

use std::future::Future;

use crate::hub::error::*;
use crate::hub::globals::Global;

#[cfg(feature = "async_runtime_tokio")]
use self::tokio as rt_impl;

#[cfg(feature = "async_runtime_async_std")]
use self::async_std as rt_impl;

static RUNTIME: Global<rt_impl::Runtime> = Global::new();

/// A `JoinHandle` represents a future which may be polled
/// for the result of a spawned task.
pub struct JoinHandle<T> {
    inner: rt_impl::JoinHandle<T>,
}

/// Initializes the async runtime with `num_threads` worker threads.
///
/// Called by `hermod::init`; should not be invoked directly.
pub(crate) unsafe fn init(num_threads: usize) -> Result<()> {
    let rt = rt_impl::init(num_threads)?;
    RUNTIME.set(rt);
    Ok(())
}

/// Drops the global async runtime.
pub(crate) unsafe fn drop() -> Result<()> {
    RUNTIME.unset();
    Ok(())
}

/// Spawns a new task `future` into the global async runtime.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let runtime = RUNTIME
        .get()
        .expect("async runtime has not been initialized");
    let inner = runtime.spawn(future);
    JoinHandle { inner }
}

/// Blocks on a future `future` until it completes.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let runtime = RUNTIME
        .get()
        .expect("async runtime has not been initialized");
    runtime.block_on(future)
}

impl<T: Send + 'static> JoinHandle<T> {
    /// Waits for the task to complete, yielding its result.
    pub async fn join(self) -> Result<T> {
        self.inner.join().await
    }
}
