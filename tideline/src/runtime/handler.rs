use std::future::Future;
use std::pin::Pin;

use crate::runtime::io::ConnCtx;

/// The application side of a worker: one handler instance per worker
/// thread, one long-lived task per connection.
///
/// # Example
///
/// ```no_run
/// use std::future::Future;
/// use tideline::{ConnCtx, ConnectionHandler, ParseResult};
///
/// struct Shouty;
///
/// impl ConnectionHandler for Shouty {
///     fn on_accept(&self, conn: ConnCtx) -> impl Future<Output = ()> + 'static {
///         async move {
///             loop {
///                 let n = conn
///                     .with_data(|data| {
///                         let reply = data.to_ascii_uppercase();
///                         conn.send_nowait(&reply).ok();
///                         ParseResult::Consumed(data.len())
///                     })
///                     .await;
///                 if n == 0 {
///                     break;
///                 }
///             }
///         }
///     }
///
///     fn create_for_worker(_worker_id: usize) -> Self {
///         Shouty
///     }
/// }
/// ```
pub trait ConnectionHandler: Send + 'static {
    /// Runs as the connection's task. Returning ends the task and
    /// closes the connection.
    fn on_accept(&self, conn: ConnCtx) -> impl Future<Output = ()> + 'static;

    /// Optional startup task, spawned before the first accept.
    ///
    /// Client-only deployments (no `.bind()`) drive all their work from
    /// here: dial with [`connect()`](crate::connect), then finish with
    /// [`request_shutdown()`](crate::request_shutdown). The default has
    /// no startup task.
    fn on_start(&self) -> Option<Pin<Box<dyn Future<Output = ()> + 'static>>> {
        None
    }

    /// Build the worker's handler instance. Called once on each worker
    /// thread before its event loop starts.
    fn create_for_worker(worker_id: usize) -> Self
    where
        Self: Sized;
}
