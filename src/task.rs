//! Thin wrapper around `tokio::spawn` that names background tasks for
//! diagnostics. Mirrors the teacher's `task.rs`; `tokio::task::Builder::name`
//! requires the `tokio_unstable` cfg, so this is a stable-friendly stand-in.

use std::future::Future;
use tokio::task::JoinHandle;

pub fn spawn_named<T, F>(_name: &str, future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(future)
}

pub fn spawn_blocking_named<T, F>(_name: &str, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
}
