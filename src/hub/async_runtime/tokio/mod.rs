use std::future::Future;

use crate::hub::error::*;

pub struct JoinHandle<T> {
    inner: ::tokio::task::JoinHandle<T>,
}

pub struct Runtime {
    inner: ::tokio::runtime::Runtime,
}

pub fn init(num_threads: usize) -> Result<Runtime> {
    ::tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_threads)
        .thread_name("hermod-worker")
        .thread_stack_size(2 * 1024 * 1024)
        .enable_all()
        .build()
        .map(|inner| Runtime { inner })
        .wrapped_msg(ErrorKind::AsyncRuntime, "Failed to build tokio runtime")
}

impl Runtime {
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let inner = self.inner.spawn(future);
        JoinHandle { inner }
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.inner.block_on(future)
    }
}

impl<T: Send + 'static> JoinHandle<T> {
    pub async fn join(self) -> Result<T> {
        self.inner
            .await
            .simple_msg(ErrorKind::AsyncRuntime, "Failed to join task")
    }
}
