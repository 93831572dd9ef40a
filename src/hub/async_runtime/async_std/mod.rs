use std::future::Future;

use crate::hub::error::*;

pub struct JoinHandle<T> {
    inner: ::async_std::task::JoinHandle<T>,
}

// async-std has no explicit runtime handle; its executor is
// process global, so this type only carries the thread count
// for symmetry with the other backends
pub struct Runtime {
    _num_threads: usize,
}

pub fn init(num_threads: usize) -> Result<Runtime> {
    Ok(Runtime {
        _num_threads: num_threads,
    })
}

impl Runtime {
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let inner = ::async_std::task::spawn(future);
        JoinHandle { inner }
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        ::async_std::task::block_on(future)
    }
}

impl<T: Send + 'static> JoinHandle<T> {
    pub async fn join(self) -> Result<T> {
        Ok(self.inner.await)
    }
}
