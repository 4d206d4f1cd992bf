//! volley: concurrent execution core for an HTTP client with a blocking API.

mod config;
mod error;
mod handle;
mod request;
mod response;
mod version;

pub mod api;
pub mod interceptor;
pub mod multi;
pub mod pool;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{ClientConfig, MultiConfig, PoolConfig};
pub use error::{Error, Result};
pub use handle::{AsyncResponse, CancellableHandle, CancellationResult};
pub use interceptor::{Chain, ChainState, Interceptor, InterceptorChain, Target};
pub use multi::{MultiDriver, SessionKey, SessionSlot};
pub use pool::{FutureStatus, PoolState, TaskFuture, ThreadPool, WorkerId};
pub use request::{Auth, DownloadSink, Method, Progress, ProgressCallback, Request};
pub use response::{ErrorCode, ErrorInfo, Response};
pub use session::{Session, SharedSession};
pub use tokio_util::sync::CancellationToken;
pub use transport::{AsyncMultiplexer, HttpTransport, Multiplexer, Transfer, Transport};
pub use version::{VOLLEY_VERSION, default_user_agent};
