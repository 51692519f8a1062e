//! Connection pool.
//!
//! The pool leases physical connections to execution contexts and takes them back.
//! All bookkeeping lives in one `PoolState` behind a `parking_lot` mutex that is
//! never held across an `.await`. Network work (opening, pinging, resetting and
//! closing connections) always happens outside that lock.
//!
//! Ordering: idle connections are reused LIFO (the most recently checked-in one
//! first), and callers waiting for a connection are served FIFO. A checkin hands the
//! connection straight to the first waiter, so a waiter can never be overtaken by a
//! caller that arrives later.

use crate::config::DatabaseConfig;
use crate::db::connection::{Connection, ConnectionFactory};
use crate::db::owner::{LeaseOwner, OwnerRef, OwnerScope};
use crate::db::reaper;
use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, QueryResult, RawResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{MappedMutexGuard, MutexGuard, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

type Conn<F> = <F as ConnectionFactory>::Connection;

/// Tuning knobs for a pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Maximum number of connections, including ones being opened.
    pub size: usize,
    pub checkout_timeout: Duration,
    /// Bound for `disconnect` to gain ownership of every connection.
    pub exclusive_timeout: Duration,
    /// Idle connections older than this are closed by the reaper.
    pub idle_timeout: Option<Duration>,
    /// Interval of the background reaper. `None` disables it.
    pub reaping_frequency: Option<Duration>,
    pub test_before_acquire: bool,
    pub owner_scope: OwnerScope,
}

impl PoolSettings {
    pub fn new(size: usize, checkout_timeout: Duration) -> Self {
        Self {
            size,
            checkout_timeout,
            exclusive_timeout: checkout_timeout * 2,
            idle_timeout: None,
            reaping_frequency: None,
            test_before_acquire: false,
            owner_scope: OwnerScope::Thread,
        }
    }

    pub fn with_owner_scope(mut self, scope: OwnerScope) -> Self {
        self.owner_scope = scope;
        self
    }

    pub fn with_exclusive_timeout(mut self, timeout: Duration) -> Self {
        self.exclusive_timeout = timeout;
        self
    }

    pub fn with_reaping(mut self, frequency: Duration, idle_timeout: Option<Duration>) -> Self {
        self.reaping_frequency = Some(frequency);
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_test_before_acquire(mut self, enabled: bool) -> Self {
        self.test_before_acquire = enabled;
        self
    }
}

impl From<&DatabaseConfig> for PoolSettings {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            size: config.pool_size,
            checkout_timeout: config.checkout_timeout(),
            exclusive_timeout: config.exclusive_timeout(),
            idle_timeout: config.idle_timeout(),
            reaping_frequency: config.reaping_frequency(),
            test_before_acquire: config.test_before_acquire,
            owner_scope: config.pool_class.into(),
        }
    }
}

/// Point-in-time view of a pool, taken under a single lock acquisition.
///
/// `busy` counts every lease, including those of dead owners that `reap` has not
/// reclaimed yet, so `dead <= busy` and `busy + idle == connections` once no
/// connection is being opened.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolStat {
    pub size: usize,
    pub connections: usize,
    pub busy: usize,
    pub dead: usize,
    pub idle: usize,
    pub waiting: usize,
    /// Seconds.
    pub checkout_timeout: f64,
}

/// One managed physical connection. `None` once closed.
struct Slot<C> {
    id: u64,
    conn: tokio::sync::Mutex<Option<C>>,
}

impl<C> Slot<C> {
    fn new(id: u64, conn: C) -> Self {
        Self {
            id,
            conn: tokio::sync::Mutex::new(Some(conn)),
        }
    }
}

/// Handle to a leased connection.
///
/// Cloning the handle does not create a new lease. Statements go through `lock`,
/// which serialises access so a connection never runs two statements at once.
pub struct PooledConnection<C> {
    slot: Arc<Slot<C>>,
}

impl<C> Clone for PooledConnection<C> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<C> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.slot.id)
            .finish_non_exhaustive()
    }
}

impl<C> PartialEq for PooledConnection<C> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<C: Connection> PooledConnection<C> {
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    /// Exclusive access to the adapter. Fails once the pool has closed it.
    pub async fn lock(&self) -> DbResult<MappedMutexGuard<'_, C>> {
        let guard = self.slot.conn.lock().await;
        MutexGuard::try_map(guard, Option::as_mut)
            .map_err(|_| DbError::connection_closed(self.slot.id))
    }

    pub async fn execute(&self, sql: &str) -> DbResult<RawResult> {
        self.lock().await?.execute(sql).await
    }

    pub async fn exec_query(&self, sql: &str, binds: &[QueryParam]) -> DbResult<QueryResult> {
        self.lock().await?.exec_query(sql, binds).await
    }

    pub async fn last_inserted_id(&self) -> DbResult<Option<u64>> {
        Ok(self.lock().await?.last_inserted_id())
    }

    pub async fn affected_rows(&self) -> DbResult<u64> {
        Ok(self.lock().await?.affected_rows())
    }
}

struct Lease {
    owner: OwnerRef,
    leased_at: Instant,
}

impl Lease {
    fn new(owner: OwnerRef) -> Self {
        Self {
            owner,
            leased_at: Instant::now(),
        }
    }
}

struct IdleEntry<C> {
    slot: Arc<Slot<C>>,
    since: Instant,
}

enum Handoff<C> {
    /// A connection, already leased to the waiter.
    Connection(Arc<Slot<C>>),
    /// Room to open a new connection; the pending count already includes it.
    Capacity,
}

struct Waiter<C> {
    id: u64,
    owner: OwnerRef,
    /// Exclusive waiters (disconnect) take connections but never capacity.
    exclusive: bool,
    tx: oneshot::Sender<Handoff<C>>,
}

struct PoolState<C> {
    max_size: usize,
    /// Every managed connection, idle or leased.
    connections: HashMap<u64, Arc<Slot<C>>>,
    /// Stack: the last pushed entry is reused first.
    idle: Vec<IdleEntry<C>>,
    leases: HashMap<u64, Lease>,
    waiters: VecDeque<Waiter<C>>,
    /// Connections being opened outside the lock.
    pending: usize,
    /// Owner id -> connection leased by `with_connection` / `connection`.
    context_cache: HashMap<Uuid, Arc<Slot<C>>>,
    discarded: bool,
    next_connection_id: u64,
    next_waiter_id: u64,
}

impl<C> PoolState<C> {
    fn new(max_size: usize) -> Self {
        Self {
            max_size,
            connections: HashMap::new(),
            idle: Vec::new(),
            leases: HashMap::new(),
            waiters: VecDeque::new(),
            pending: 0,
            context_cache: HashMap::new(),
            discarded: false,
            next_connection_id: 0,
            next_waiter_id: 0,
        }
    }

    fn lease(&mut self, slot: &Slot<C>, owner: &LeaseOwner) {
        self.leases.insert(slot.id, Lease::new(owner.downgrade()));
    }

    fn enqueue(&mut self, owner: &LeaseOwner, exclusive: bool) -> (u64, oneshot::Receiver<Handoff<C>>) {
        let (tx, rx) = oneshot::channel();
        self.next_waiter_id += 1;
        let waiter = Waiter {
            id: self.next_waiter_id,
            owner: owner.downgrade(),
            exclusive,
            tx,
        };
        if exclusive {
            self.waiters.push_front(waiter);
        } else {
            self.waiters.push_back(waiter);
        }
        (self.next_waiter_id, rx)
    }

    /// Give a connection to the first live waiter, or push it on the idle stack.
    fn make_available(&mut self, slot: Arc<Slot<C>>) {
        if self.discarded || !self.connections.contains_key(&slot.id) {
            return;
        }
        while let Some(waiter) = self.waiters.pop_front() {
            self.leases.insert(slot.id, Lease::new(waiter.owner.clone()));
            if waiter.tx.send(Handoff::Connection(Arc::clone(&slot))).is_ok() {
                debug!(
                    connection_id = slot.id,
                    owner = %waiter.owner.id(),
                    "Handed connection to waiter"
                );
                return;
            }
            self.leases.remove(&slot.id);
        }
        self.idle.push(IdleEntry {
            slot,
            since: Instant::now(),
        });
    }

    /// Let waiters open connections while there is room below the maximum.
    fn hand_capacity(&mut self) {
        while !self.discarded && self.connections.len() + self.pending < self.max_size {
            let Some(pos) = self.waiters.iter().position(|w| !w.exclusive) else {
                return;
            };
            let Some(waiter) = self.waiters.remove(pos) else {
                return;
            };
            self.pending += 1;
            if waiter.tx.send(Handoff::Capacity).is_err() {
                self.pending -= 1;
            }
        }
    }

    /// Stop managing a connection entirely.
    fn detach(&mut self, id: u64) -> Option<Arc<Slot<C>>> {
        let slot = self.connections.remove(&id)?;
        if let Some(lease) = self.leases.remove(&id) {
            self.forget_cached(lease.owner.id(), id);
        }
        self.idle.retain(|e| e.slot.id != id);
        self.hand_capacity();
        Some(slot)
    }

    fn forget_cached(&mut self, owner_id: Uuid, connection_id: u64) {
        if self
            .context_cache
            .get(&owner_id)
            .is_some_and(|s| s.id == connection_id)
        {
            self.context_cache.remove(&owner_id);
        }
    }

    fn cached_for(&self, owner_id: Uuid) -> Option<PooledConnection<C>> {
        let slot = self.context_cache.get(&owner_id)?;
        let leased_to_owner = self
            .leases
            .get(&slot.id)
            .is_some_and(|l| l.owner.id() == owner_id);
        leased_to_owner.then(|| PooledConnection {
            slot: Arc::clone(slot),
        })
    }

    /// Take every connection out of the pool.
    fn drain(&mut self) -> Vec<Arc<Slot<C>>> {
        self.idle.clear();
        self.leases.clear();
        self.context_cache.clear();
        self.connections.drain().map(|(_, slot)| slot).collect()
    }
}

/// A pool of connections produced by `F`.
///
/// Pools are always shared behind an `Arc`; the background reaper holds a `Weak`
/// reference and stops once the pool is dropped or discarded.
pub struct ConnectionPool<F: ConnectionFactory> {
    factory: F,
    settings: PoolSettings,
    state: Mutex<PoolState<Conn<F>>>,
    automatic_reconnect: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl<F: ConnectionFactory> fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("settings", &self.settings)
            .field("stat", &self.stat())
            .finish_non_exhaustive()
    }
}

enum Step<C> {
    Idle(Arc<Slot<C>>),
    Create,
    Wait(u64, oneshot::Receiver<Handoff<C>>),
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    pub fn new(factory: F, settings: PoolSettings) -> Arc<Self> {
        let pool = Arc::new(Self {
            factory,
            state: Mutex::new(PoolState::new(settings.size)),
            settings,
            automatic_reconnect: AtomicBool::new(true),
            reaper: Mutex::new(None),
        });
        if let Some(frequency) = pool.settings.reaping_frequency {
            *pool.reaper.lock() = reaper::spawn(Arc::downgrade(&pool), frequency);
        }
        pool
    }

    pub fn from_config(factory: F, config: &DatabaseConfig) -> Arc<Self> {
        Self::new(factory, PoolSettings::from(config))
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn size(&self) -> usize {
        self.settings.size
    }

    /// When cleared, the pool refuses to open new connections.
    pub fn set_automatic_reconnect(&self, enabled: bool) {
        self.automatic_reconnect.store(enabled, Ordering::Release);
    }

    pub fn automatic_reconnect(&self) -> bool {
        self.automatic_reconnect.load(Ordering::Acquire)
    }

    pub fn is_discarded(&self) -> bool {
        self.state.lock().discarded
    }

    /// True when at least one connection is open.
    pub fn connected(&self) -> bool {
        !self.state.lock().connections.is_empty()
    }

    pub fn num_waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn stat(&self) -> PoolStat {
        let state = self.state.lock();
        PoolStat {
            size: self.settings.size,
            connections: state.connections.len(),
            busy: state.leases.len(),
            dead: state
                .leases
                .values()
                .filter(|l| !l.owner.is_alive())
                .count(),
            idle: state.idle.len(),
            waiting: state.waiters.len(),
            checkout_timeout: self.settings.checkout_timeout.as_secs_f64(),
        }
    }

    fn current_owner(&self) -> LeaseOwner {
        LeaseOwner::current(self.settings.owner_scope)
    }

    fn context_owner(&self) -> Option<LeaseOwner> {
        LeaseOwner::context(self.settings.owner_scope)
    }

    /// Lease a connection to the calling context.
    ///
    /// `timeout` defaults to the pool's checkout timeout.
    pub async fn checkout(&self, timeout: Option<Duration>) -> DbResult<PooledConnection<Conn<F>>> {
        let owner = self.current_owner();
        self.checkout_as(&owner, timeout).await
    }

    /// Lease a connection to an explicit owner.
    pub async fn checkout_as(
        &self,
        owner: &LeaseOwner,
        timeout: Option<Duration>,
    ) -> DbResult<PooledConnection<Conn<F>>> {
        let timeout = timeout.unwrap_or(self.settings.checkout_timeout);
        let deadline = Instant::now() + timeout;
        loop {
            let (slot, reused) = self.acquire(owner, deadline, timeout).await?;
            let conn = PooledConnection { slot };
            if reused && self.settings.test_before_acquire && !self.verify(&conn).await {
                continue;
            }
            debug!(connection_id = conn.id(), owner = %owner, "Checked out connection");
            return Ok(conn);
        }
    }

    async fn acquire(
        &self,
        owner: &LeaseOwner,
        deadline: Instant,
        timeout: Duration,
    ) -> DbResult<(Arc<Slot<Conn<F>>>, bool)> {
        let step = {
            let mut state = self.state.lock();
            if state.discarded {
                return Err(DbError::PoolDiscarded);
            }
            if let Some(entry) = state.idle.pop() {
                state.lease(&entry.slot, owner);
                Step::Idle(entry.slot)
            } else if state.connections.len() + state.pending < self.settings.size {
                state.pending += 1;
                Step::Create
            } else {
                let (id, rx) = state.enqueue(owner, false);
                Step::Wait(id, rx)
            }
        };

        match step {
            Step::Idle(slot) => Ok((slot, true)),
            Step::Create => {
                let slot = self.create(owner, Reservation::new(self)).await?;
                Ok((slot, false))
            }
            Step::Wait(id, rx) => {
                let mut waiter = WaitGuard::new(self, id, rx);
                let handoff = match tokio::time::timeout_at(deadline, waiter.recv()).await {
                    Ok(result) => result?,
                    // A handoff may have landed right at the deadline.
                    Err(_) => match waiter.cancel() {
                        Some(handoff) => handoff,
                        None => return Err(self.timeout_error(timeout)),
                    },
                };
                match handoff {
                    Handoff::Connection(slot) => Ok((slot, false)),
                    Handoff::Capacity => {
                        let slot = self.create(owner, Reservation::new(self)).await?;
                        Ok((slot, false))
                    }
                }
            }
        }
    }

    fn timeout_error(&self, timeout: Duration) -> DbError {
        let state = self.state.lock();
        if state.discarded {
            return DbError::PoolDiscarded;
        }
        let err = DbError::connection_timeout(timeout, self.settings.size, state.leases.len());
        drop(state);
        warn!(error = %err, "Checkout timed out");
        err
    }

    /// Open a connection for a slot already counted in `pending`.
    async fn create(
        &self,
        owner: &LeaseOwner,
        mut reservation: Reservation<'_, F>,
    ) -> DbResult<Arc<Slot<Conn<F>>>> {
        if !self.automatic_reconnect() {
            return Err(DbError::connection_not_established(
                "the pool was disconnected and automatic reconnection is disabled",
            ));
        }
        let conn = self.factory.connect().await?;

        let mut state = self.state.lock();
        reservation.armed = false;
        state.pending = state.pending.saturating_sub(1);
        if state.discarded {
            return Err(DbError::PoolDiscarded);
        }
        state.next_connection_id += 1;
        let slot = Arc::new(Slot::new(state.next_connection_id, conn));
        state.connections.insert(slot.id, Arc::clone(&slot));
        state.lease(&slot, owner);
        debug!(
            connection_id = slot.id,
            connections = state.connections.len(),
            "Opened new connection"
        );
        Ok(slot)
    }

    /// Ping an idle connection before handing it out. Dead ones are removed.
    async fn verify(&self, conn: &PooledConnection<Conn<F>>) -> bool {
        let mut guard = CheckinOnDrop::new(self, conn.clone());
        let alive = match conn.lock().await {
            Ok(mut c) => c.is_active().await,
            Err(_) => false,
        };
        guard.disarm();
        if !alive {
            warn!(connection_id = conn.id(), "Connection failed liveness check, removing");
            let slot = self.state.lock().detach(conn.id());
            if let Some(slot) = slot {
                close_slot(slot).await;
            }
        }
        alive
    }

    /// Return a leased connection. Never blocks.
    ///
    /// Returns `false` when the connection is not currently leased (double checkin,
    /// or it was already reclaimed). A connection left mid-statement is removed and
    /// closed instead of going back to the idle set.
    pub fn checkin(&self, conn: &PooledConnection<Conn<F>>) -> bool {
        let slot = &conn.slot;
        let to_close = {
            let mut state = self.state.lock();
            let Some(lease) = state.leases.remove(&slot.id) else {
                drop(state);
                warn!(
                    connection_id = slot.id,
                    "Attempted to check in a connection that is not leased"
                );
                return false;
            };
            state.forget_cached(lease.owner.id(), slot.id);
            if prepare_for_idle(slot) {
                state.make_available(Arc::clone(slot));
                debug!(
                    connection_id = slot.id,
                    owner = %lease.owner.id(),
                    held_ms = lease.leased_at.elapsed().as_millis() as u64,
                    "Checked in connection"
                );
                None
            } else {
                state.detach(slot.id)
            }
        };
        if let Some(slot) = to_close {
            warn!(
                connection_id = slot.id,
                "Connection left in an unknown state, removing from pool"
            );
            spawn_close(slot);
        }
        true
    }

    /// Stop managing a connection. It stays open for the caller; waiters get the
    /// freed capacity.
    pub fn remove(&self, conn: &PooledConnection<Conn<F>>) -> bool {
        let removed = self.state.lock().detach(conn.id()).is_some();
        if removed {
            debug!(connection_id = conn.id(), "Removed connection from pool");
        }
        removed
    }

    /// The connection cached for the calling context, if any.
    pub fn active_connection(&self) -> Option<PooledConnection<Conn<F>>> {
        let owner = self.context_owner()?;
        self.state.lock().cached_for(owner.id())
    }

    /// The calling context's cached connection, leasing one on first use.
    ///
    /// Inside a tokio runtime the caller must run in `LeaseOwner::scope`; tasks on
    /// one worker thread would otherwise share the lease.
    pub async fn connection(&self) -> DbResult<PooledConnection<Conn<F>>> {
        let owner = self.context_owner().ok_or_else(|| {
            DbError::invalid_input(
                "no owner context for a cached connection; run the task in LeaseOwner::scope",
            )
        })?;
        let (conn, _) = self.connection_for(&owner).await?;
        Ok(conn)
    }

    async fn connection_for(
        &self,
        owner: &LeaseOwner,
    ) -> DbResult<(PooledConnection<Conn<F>>, bool)> {
        let cached = self.state.lock().cached_for(owner.id());
        if let Some(conn) = cached {
            return Ok((conn, false));
        }
        let conn = self.checkout_as(owner, None).await?;
        self.state
            .lock()
            .context_cache
            .insert(owner.id(), Arc::clone(&conn.slot));
        Ok((conn, true))
    }

    /// Check in the calling context's cached connection.
    pub fn release_connection(&self) -> bool {
        match self.context_owner() {
            Some(owner) => self.release_connection_for(owner.id()),
            None => false,
        }
    }

    fn release_connection_for(&self, owner_id: Uuid) -> bool {
        let cached = self.state.lock().context_cache.remove(&owner_id);
        match cached {
            Some(slot) => self.checkin(&PooledConnection { slot }),
            None => false,
        }
    }

    /// Run `op` with the calling context's connection.
    ///
    /// Nested calls reuse the outer lease; only the call that leased the connection
    /// releases it, including when `op` fails or the future is dropped. Without an
    /// owner context the call leases under a fresh task owner that `op` runs in, so
    /// concurrent tasks never share a connection.
    pub async fn with_connection<T, Op, Fut>(&self, op: Op) -> DbResult<T>
    where
        Op: FnOnce(PooledConnection<Conn<F>>) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        match self.context_owner() {
            Some(owner) => self.with_connection_as(&owner, op).await,
            None => {
                let owner = LeaseOwner::new();
                owner.clone().enter(self.with_connection_as(&owner, op)).await
            }
        }
    }

    async fn with_connection_as<T, Op, Fut>(&self, owner: &LeaseOwner, op: Op) -> DbResult<T>
    where
        Op: FnOnce(PooledConnection<Conn<F>>) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let (conn, created) = self.connection_for(owner).await?;
        let _release = created.then(|| ReleaseOnDrop {
            pool: self,
            owner_id: owner.id(),
        });
        op(conn).await
    }

    /// Reclaim connections whose owner has terminated.
    ///
    /// Usable connections are reset and returned to the idle set (or the first
    /// waiter); unusable ones are removed, freeing capacity for waiters.
    pub async fn reap(&self) -> usize {
        let reaper = LeaseOwner::new();
        let stolen: Vec<Arc<Slot<Conn<F>>>> = {
            let mut state = self.state.lock();
            let dead: Vec<u64> = state
                .leases
                .iter()
                .filter(|(_, lease)| !lease.owner.is_alive())
                .map(|(id, _)| *id)
                .collect();
            let mut stolen = Vec::with_capacity(dead.len());
            for id in dead {
                if let Some(old) = state.leases.insert(id, Lease::new(reaper.downgrade())) {
                    state.context_cache.remove(&old.owner.id());
                }
                if let Some(slot) = state.connections.get(&id) {
                    stolen.push(Arc::clone(slot));
                }
            }
            stolen
        };

        for slot in &stolen {
            let outcome = reclaim(slot).await;
            let to_close = {
                let mut state = self.state.lock();
                let still_ours = state
                    .leases
                    .get(&slot.id)
                    .is_some_and(|l| l.owner.id() == reaper.id());
                if !still_ours {
                    continue;
                }
                match outcome {
                    Reclaim::Reuse => {
                        state.leases.remove(&slot.id);
                        state.make_available(Arc::clone(slot));
                        None
                    }
                    Reclaim::Close => state.detach(slot.id),
                    Reclaim::Abandon => {
                        state.detach(slot.id);
                        None
                    }
                }
            };
            if let Some(slot) = to_close {
                close_slot(slot).await;
            }
        }

        if !stolen.is_empty() {
            info!(count = stolen.len(), "Reaped connections from dead owners");
        }
        stolen.len()
    }

    /// Close idle connections that have been idle for at least `minimum_idle`.
    pub async fn flush(&self, minimum_idle: Duration) -> usize {
        let expired: Vec<Arc<Slot<Conn<F>>>> = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|e| now.duration_since(e.since) >= minimum_idle);
            state.idle = kept;
            for entry in &expired {
                state.connections.remove(&entry.slot.id);
            }
            state.hand_capacity();
            expired.into_iter().map(|e| e.slot).collect()
        };

        let count = expired.len();
        for slot in expired {
            close_slot(slot).await;
        }
        if count > 0 {
            debug!(count, "Flushed idle connections");
        }
        count
    }

    /// Reap, then close every idle connection.
    pub async fn flush_all(&self) -> usize {
        self.reap().await;
        self.flush(Duration::ZERO).await
    }

    /// Gain ownership of every connection and close them all.
    ///
    /// Connections leased to other contexts are waited for up to the exclusive
    /// timeout. On timeout this fails with `ExclusiveConnectionTimeout` when
    /// `raise_on_acquisition_timeout` is set, and otherwise closes everything anyway.
    /// Connections leased by the calling context count as already owned.
    pub async fn disconnect(&self, raise_on_acquisition_timeout: bool) -> DbResult<()> {
        let caller = self.current_owner();
        let drainer = LeaseOwner::new();
        let timeout = self.settings.exclusive_timeout;
        let deadline = Instant::now() + timeout;

        let acquired_all = loop {
            let step = {
                let mut state = self.state.lock();
                if state.discarded {
                    return Ok(());
                }
                claim_for_exclusive(&mut state, &drainer);
                let outstanding = count_outstanding(&state, &caller, &drainer);
                if outstanding == 0 {
                    None
                } else {
                    Some(state.enqueue(&drainer, true))
                }
            };
            let Some((id, rx)) = step else {
                break true;
            };

            let mut waiter = WaitGuard::new(self, id, rx);
            match tokio::time::timeout_at(deadline, waiter.recv()).await {
                // The handed-over connection is already leased to the drainer.
                Ok(result) => {
                    result?;
                }
                Err(_) => {
                    waiter.cancel();
                    if !raise_on_acquisition_timeout {
                        break false;
                    }
                    let (connections, outstanding) = {
                        let mut state = self.state.lock();
                        let outstanding = count_outstanding(&state, &caller, &drainer);
                        release_claimed(&mut state, &drainer);
                        (state.connections.len(), outstanding)
                    };
                    let err = DbError::exclusive_connection_timeout(timeout, connections, outstanding);
                    warn!(error = %err, "Failed to gain exclusive access to the pool");
                    return Err(err);
                }
            }
        };

        let slots = {
            let mut state = self.state.lock();
            let slots = state.drain();
            state.hand_capacity();
            slots
        };
        info!(
            connections = slots.len(),
            forced = !acquired_all,
            "Disconnecting connection pool"
        );
        for slot in slots {
            let taken = match slot.conn.try_lock() {
                Ok(mut guard) => Some(guard.take()),
                Err(_) => None,
            };
            // Still locked by a running statement.
            let Some(conn) = taken else {
                spawn_close(slot);
                continue;
            };
            if let Some(mut conn) = conn {
                if let Err(e) = conn.disconnect().await {
                    warn!(connection_id = slot.id, error = %e, "Failed to close connection");
                }
            }
        }
        Ok(())
    }

    /// Drop every connection without closing it gracefully, e.g. in a forked child
    /// whose sockets belong to the parent. The pool cannot be used afterwards.
    pub fn discard(&self) {
        let (slots, waiters) = {
            let mut state = self.state.lock();
            if state.discarded {
                return;
            }
            state.discarded = true;
            state.pending = 0;
            let waiters = std::mem::take(&mut state.waiters);
            (state.drain(), waiters)
        };
        // Dropping the senders wakes every waiter with PoolDiscarded.
        drop(waiters);
        for slot in &slots {
            if let Ok(mut guard) = slot.conn.try_lock() {
                drop(guard.take());
            }
        }
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
        info!(connections = slots.len(), "Discarded connection pool");
    }
}

impl<F: ConnectionFactory> Drop for ConnectionPool<F> {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.get_mut().take() {
            handle.abort();
        }
    }
}

fn claim_for_exclusive<C>(state: &mut PoolState<C>, drainer: &LeaseOwner) {
    while let Some(entry) = state.idle.pop() {
        state.lease(&entry.slot, drainer);
    }
    for lease in state.leases.values_mut() {
        if !lease.owner.is_alive() {
            *lease = Lease::new(drainer.downgrade());
        }
    }
}

fn count_outstanding<C>(state: &PoolState<C>, caller: &LeaseOwner, drainer: &LeaseOwner) -> usize {
    state
        .leases
        .values()
        .filter(|l| l.owner.id() != caller.id() && l.owner.id() != drainer.id())
        .count()
}

fn release_claimed<C>(state: &mut PoolState<C>, drainer: &LeaseOwner) {
    let claimed: Vec<u64> = state
        .leases
        .iter()
        .filter(|(_, l)| l.owner.id() == drainer.id())
        .map(|(id, _)| *id)
        .collect();
    for id in claimed {
        state.leases.remove(&id);
        if let Some(slot) = state.connections.get(&id).cloned() {
            state.make_available(slot);
        }
    }
}

fn prepare_for_idle<C: Connection>(slot: &Slot<C>) -> bool {
    // A held lock means a statement is still running on this connection.
    match slot.conn.try_lock() {
        Ok(mut guard) => match guard.as_mut() {
            Some(conn) if !conn.statement_in_flight() && !conn.connection_lost() => {
                conn.on_checkin();
                true
            }
            _ => false,
        },
        Err(_) => false,
    }
}

enum Reclaim {
    Reuse,
    Close,
    /// Still in use through a surviving handle; stop managing it.
    Abandon,
}

async fn reclaim<C: Connection>(slot: &Slot<C>) -> Reclaim {
    let Ok(mut guard) = slot.conn.try_lock() else {
        return Reclaim::Abandon;
    };
    match guard.as_mut() {
        Some(conn) if !conn.statement_in_flight() && !conn.connection_lost() => match conn.reset().await {
            Ok(()) => Reclaim::Reuse,
            Err(e) => {
                debug!(connection_id = slot.id, error = %e, "Reset failed");
                Reclaim::Close
            }
        },
        _ => Reclaim::Close,
    }
}

async fn close_slot<C: Connection>(slot: Arc<Slot<C>>) {
    let conn = slot.conn.lock().await.take();
    if let Some(mut conn) = conn {
        if let Err(e) = conn.disconnect().await {
            warn!(connection_id = slot.id, error = %e, "Failed to close connection");
        }
    }
}

fn spawn_close<C: Connection>(slot: Arc<Slot<C>>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(close_slot(slot));
        }
        Err(_) => {
            debug!(
                connection_id = slot.id,
                "No runtime available, dropping connection without closing"
            );
        }
    }
}

/// Gives a creation slot back if the connect attempt fails or is cancelled.
struct Reservation<'a, F: ConnectionFactory> {
    pool: &'a ConnectionPool<F>,
    armed: bool,
}

impl<'a, F: ConnectionFactory> Reservation<'a, F> {
    fn new(pool: &'a ConnectionPool<F>) -> Self {
        Self { pool, armed: true }
    }
}

impl<F: ConnectionFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.pool.state.lock();
        state.pending = state.pending.saturating_sub(1);
        state.hand_capacity();
    }
}

/// A queued checkout. Dropping it unqueues the waiter and returns anything handed
/// over in the meantime.
struct WaitGuard<'a, F: ConnectionFactory> {
    pool: &'a ConnectionPool<F>,
    id: u64,
    rx: oneshot::Receiver<Handoff<Conn<F>>>,
    done: bool,
}

impl<'a, F: ConnectionFactory> WaitGuard<'a, F> {
    fn new(pool: &'a ConnectionPool<F>, id: u64, rx: oneshot::Receiver<Handoff<Conn<F>>>) -> Self {
        Self {
            pool,
            id,
            rx,
            done: false,
        }
    }

    async fn recv(&mut self) -> DbResult<Handoff<Conn<F>>> {
        let result = (&mut self.rx).await;
        self.done = true;
        // Senders are only dropped unsent when the pool is discarded.
        result.map_err(|_| DbError::PoolDiscarded)
    }

    /// Leave the queue. Returns a handoff that raced with the cancellation.
    fn cancel(&mut self) -> Option<Handoff<Conn<F>>> {
        self.done = true;
        let mut state = self.pool.state.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == self.id) {
            state.waiters.remove(pos);
            return None;
        }
        // Handoffs are sent under the pool lock, so one is visible here if it happened.
        self.rx.try_recv().ok()
    }
}

impl<F: ConnectionFactory> Drop for WaitGuard<'_, F> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let Some(handoff) = self.cancel() else {
            return;
        };
        let mut state = self.pool.state.lock();
        match handoff {
            Handoff::Connection(slot) => {
                state.leases.remove(&slot.id);
                state.make_available(slot);
            }
            Handoff::Capacity => {
                state.pending = state.pending.saturating_sub(1);
                state.hand_capacity();
            }
        }
    }
}

/// Checks a connection back in if the future holding it is dropped.
struct CheckinOnDrop<'a, F: ConnectionFactory> {
    pool: &'a ConnectionPool<F>,
    conn: Option<PooledConnection<Conn<F>>>,
}

impl<'a, F: ConnectionFactory> CheckinOnDrop<'a, F> {
    fn new(pool: &'a ConnectionPool<F>, conn: PooledConnection<Conn<F>>) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }

    fn disarm(&mut self) {
        self.conn = None;
    }
}

impl<F: ConnectionFactory> Drop for CheckinOnDrop<'_, F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(&conn);
        }
    }
}

/// Releases the context-cached connection at the end of `with_connection`.
struct ReleaseOnDrop<'a, F: ConnectionFactory> {
    pool: &'a ConnectionPool<F>,
    owner_id: Uuid,
}

impl<F: ConnectionFactory> Drop for ReleaseOnDrop<'_, F> {
    fn drop(&mut self) {
        self.pool.release_connection_for(self.owner_id);
    }
}
