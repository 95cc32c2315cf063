//! RAII handle returned by `ConnectionPool::checkout`.

use tokio::sync::OwnedSemaphorePermit;

use crate::host_policy::HostKey;

use super::pool::ConnectionPool;

/// Holds one connection slot (per-host and global) until dropped. Call
/// `mark_failed` before dropping if the request that used this lease failed,
/// so the pool's health/idle accounting reflects it.
///
/// The held `OwnedSemaphorePermit` is what makes the *next* `checkout` for
/// this host block rather than fail while this lease is alive; dropping it
/// (alongside this struct) is what wakes the next waiter.
pub struct ConnectionLease<'a> {
    pool: &'a ConnectionPool,
    host: HostKey,
    healthy: bool,
    _permit: OwnedSemaphorePermit,
}

impl<'a> ConnectionLease<'a> {
    pub(super) fn new(pool: &'a ConnectionPool, host: HostKey, permit: OwnedSemaphorePermit) -> Self {
        Self {
            pool,
            host,
            healthy: true,
            _permit: permit,
        }
    }

    pub fn host(&self) -> &HostKey {
        &self.host
    }

    pub fn mark_failed(&mut self) {
        self.healthy = false;
    }
}

impl Drop for ConnectionLease<'_> {
    fn drop(&mut self) {
        self.pool.return_connection(&self.host, self.healthy);
    }
}
