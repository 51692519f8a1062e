//! Lease owners.
//!
//! Every lease records the execution context that took it. The pool only keeps a
//! weak handle to the owner, so once the thread exits or the task's owner scope ends
//! the lease counts as dead and `reap` may reclaim it.

use crate::config::PoolClass;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use uuid::Uuid;

tokio::task_local! {
    static TASK_OWNER: LeaseOwner;
}

thread_local! {
    static THREAD_OWNER: LeaseOwner = LeaseOwner::new();
}

/// Which kind of execution context owns a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerScope {
    /// OS threads, for the preemptive model.
    Thread,
    /// Tokio tasks wrapped in `LeaseOwner::scope`, for the cooperative model.
    Task,
}

impl From<PoolClass> for OwnerScope {
    fn from(class: PoolClass) -> Self {
        match class {
            PoolClass::ConnectionPool => Self::Thread,
            PoolClass::AsyncConnectionPool => Self::Task,
        }
    }
}

#[derive(Debug)]
struct OwnerInner {
    id: Uuid,
}

/// Identity of an execution context. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LeaseOwner(Arc<OwnerInner>);

impl LeaseOwner {
    /// Create a fresh owner, independent of any thread or task.
    pub fn new() -> Self {
        Self(Arc::new(OwnerInner { id: Uuid::new_v4() }))
    }

    pub fn id(&self) -> Uuid {
        self.0.id
    }

    /// Owner recorded on a lease taken by the calling context.
    ///
    /// Inside `LeaseOwner::scope` this is the task owner. Otherwise it is the thread
    /// owner, which only tracks liveness and is never used to share a lease.
    pub fn current(scope: OwnerScope) -> Self {
        Self::context(scope).unwrap_or_else(Self::current_thread)
    }

    /// Owner whose cached connection the calling context may reuse.
    ///
    /// Every tokio task on a worker thread sees the same thread owner, so it only
    /// identifies a context for `OwnerScope::Thread` outside a tokio runtime. Inside
    /// a runtime, a context needs `LeaseOwner::scope`.
    pub fn context(scope: OwnerScope) -> Option<Self> {
        if let Ok(owner) = TASK_OWNER.try_with(Clone::clone) {
            return Some(owner);
        }
        match scope {
            OwnerScope::Thread if tokio::runtime::Handle::try_current().is_err() => {
                Some(Self::current_thread())
            }
            _ => None,
        }
    }

    fn current_thread() -> Self {
        THREAD_OWNER.with(Clone::clone)
    }

    /// Run `fut` as a new task-scoped owner. Leases still held when the future
    /// finishes or is dropped become dead.
    pub async fn scope<F>(fut: F) -> F::Output
    where
        F: Future,
    {
        TASK_OWNER.scope(Self::new(), fut).await
    }

    /// Run `fut` with `self` as the task owner.
    pub async fn enter<F>(self, fut: F) -> F::Output
    where
        F: Future,
    {
        TASK_OWNER.scope(self, fut).await
    }

    pub fn downgrade(&self) -> OwnerRef {
        OwnerRef {
            id: self.0.id,
            inner: Arc::downgrade(&self.0),
        }
    }
}

impl Default for LeaseOwner {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for LeaseOwner {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for LeaseOwner {}

impl fmt::Display for LeaseOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.id)
    }
}

/// Weak handle stored in the pool's lease table.
#[derive(Debug, Clone)]
pub struct OwnerRef {
    id: Uuid,
    inner: Weak<OwnerInner>,
}

impl OwnerRef {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    pub fn upgrade(&self) -> Option<LeaseOwner> {
        self.inner.upgrade().map(LeaseOwner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_owner_is_stable() {
        let a = LeaseOwner::current(OwnerScope::Thread);
        let b = LeaseOwner::current(OwnerScope::Thread);
        assert_eq!(a, b);
    }

    #[test]
    fn test_threads_have_distinct_owners() {
        let here = LeaseOwner::current(OwnerScope::Thread).id();
        let there = std::thread::spawn(|| LeaseOwner::current(OwnerScope::Thread).id())
            .join()
            .unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_thread_owner_dies_with_thread() {
        let weak = std::thread::spawn(|| LeaseOwner::current(OwnerScope::Thread).downgrade())
            .join()
            .unwrap();
        assert!(!weak.is_alive());
    }

    #[tokio::test]
    async fn test_task_scope_owner() {
        let outside = LeaseOwner::current(OwnerScope::Task);
        let (inner_a, inner_b) = LeaseOwner::scope(async {
            (
                LeaseOwner::current(OwnerScope::Task),
                LeaseOwner::current(OwnerScope::Task),
            )
        })
        .await;
        assert_eq!(inner_a, inner_b);
        assert_ne!(inner_a, outside);
    }

    #[tokio::test]
    async fn test_no_context_inside_runtime_without_scope() {
        assert!(LeaseOwner::context(OwnerScope::Thread).is_none());
        assert!(LeaseOwner::context(OwnerScope::Task).is_none());

        let (context, current) = LeaseOwner::scope(async {
            (
                LeaseOwner::context(OwnerScope::Thread),
                LeaseOwner::current(OwnerScope::Thread),
            )
        })
        .await;
        assert_eq!(context, Some(current));
    }

    #[test]
    fn test_thread_context_outside_runtime() {
        assert_eq!(
            LeaseOwner::context(OwnerScope::Thread),
            Some(LeaseOwner::current(OwnerScope::Thread))
        );
        assert!(LeaseOwner::context(OwnerScope::Task).is_none());
    }

    #[tokio::test]
    async fn test_task_owner_dies_with_scope() {
        let weak = LeaseOwner::scope(async { LeaseOwner::current(OwnerScope::Task).downgrade() })
            .await;
        assert!(!weak.is_alive());
    }

    #[test]
    fn test_owner_ref_upgrade() {
        let owner = LeaseOwner::new();
        let weak = owner.downgrade();
        assert_eq!(weak.id(), owner.id());
        assert_eq!(weak.upgrade(), Some(owner.clone()));
        drop(owner);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_scope_from_pool_class() {
        assert_eq!(OwnerScope::from(PoolClass::ConnectionPool), OwnerScope::Thread);
        assert_eq!(
            OwnerScope::from(PoolClass::AsyncConnectionPool),
            OwnerScope::Task
        );
    }
}
