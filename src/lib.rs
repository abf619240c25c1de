pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod monitoring;
pub mod pool;
pub mod queue;

pub use cache::{CacheSpace, ResponseCache};
pub use context::{PerfContext, UpstreamAdapter};
pub use error::{PerfError, PerfResult};
pub use pool::ConnectionPool;
pub use queue::{QueueClass, RequestQueueManager};
