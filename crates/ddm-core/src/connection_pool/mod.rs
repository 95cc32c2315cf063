//! Per-host connection pool with a global concurrency budget (§4.2).

mod lease;
mod pool;

pub use lease::ConnectionLease;
pub use pool::{ConnectionPool, ConnectionPoolConfig};
