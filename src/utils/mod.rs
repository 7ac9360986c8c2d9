//! # Utility Modules
//!
//! Supporting pieces shared by the engine and every transport.
//!
//! ## Components
//! - **Governor**: counting admission gate for handler executions
//! - **Pool**: reusable request contexts
//! - **Metrics**: thread-safe observability counters
//! - **Logging**: structured logging configuration
//! - **Timeout**: default deadlines and async timeout wrappers

pub mod governor;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod timeout;

pub use governor::{Governor, GovernorPermit};
pub use metrics::{Metrics, MetricsSnapshot};
pub use pool::{ContextPool, PooledContext, TransportPools};
