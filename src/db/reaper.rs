//! Background reaper.
//!
//! Periodically reclaims leases held by dead owners and closes connections that
//! have sat idle longer than the pool's idle timeout. The task only holds a weak
//! reference, so it never keeps a pool alive.

use crate::db::connection::ConnectionFactory;
use crate::db::pool::ConnectionPool;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Start the reaper for `pool`. Returns `None` outside a tokio runtime.
pub(crate) fn spawn<F: ConnectionFactory>(
    pool: Weak<ConnectionPool<F>>,
    frequency: Duration,
) -> Option<JoinHandle<()>> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Some(handle.spawn(run(pool, frequency))),
        Err(_) => {
            debug!("No runtime available, reaper not started");
            None
        }
    }
}

async fn run<F: ConnectionFactory>(pool: Weak<ConnectionPool<F>>, frequency: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + frequency, frequency);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        // Exit if the pool was dropped
        let Some(pool) = pool.upgrade() else {
            debug!("Connection pool dropped, reaper exiting");
            return;
        };
        if pool.is_discarded() {
            info!("Connection pool discarded, reaper exiting");
            return;
        }

        let reaped = pool.reap().await;
        let flushed = match pool.settings().idle_timeout {
            Some(idle_timeout) => pool.flush(idle_timeout).await,
            None => 0,
        };
        if reaped > 0 || flushed > 0 {
            debug!(reaped, flushed, "Reaper pass complete");
        }
    }
}
