//! A thread pool abstraction over different backends,
//! used to execute Service request handlers off the async runtime.

#[cfg(feature = "threadpool_crossbeam")]
mod crossbeam {
    pub use ::threadpool_crossbeam_channel::Builder;
    pub use ::threadpool_crossbeam_channel::ThreadPool;
}

#[cfg(feature = "threadpool_crossbeam")]
use self::crossbeam as pool_impl;

/// A thread pool, used to execute work which would
/// otherwise block an async executor thread.
pub struct ThreadPool {
    inner: pool_impl::ThreadPool,
}

/// Helper type used to construct a new `ThreadPool`.
pub struct Builder {
    num_threads: Option<usize>,
}

impl Builder {
    /// Starts constructing a new `ThreadPool`.
    pub fn new() -> Self {
        Self { num_threads: None }
    }

    /// Sets the number of worker threads in the pool.
    pub fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = Some(n);
        self
    }

    /// Builds the new `ThreadPool`.
    pub fn build(self) -> ThreadPool {
        let mut builder = pool_impl::Builder::new().thread_name("hermod-pool-worker".into());
        if let Some(n) = self.num_threads {
            builder = builder.num_threads(n);
        }
        let inner = builder.build();
        ThreadPool { inner }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadPool {
    /// Schedules a new job to run in this `ThreadPool`.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.execute(job);
    }

    /// Synchronously waits for all the jobs queued in the
    /// pool to complete.
    pub fn join(&self) {
        self.inner.join();
    }
}

impl Clone for ThreadPool {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}
