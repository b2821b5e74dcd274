///
/// The coordination-store client boundary consumed by the locks.
///
pub mod store;

///
/// Path composition and sequence-number ordering of lock nodes.
///
pub mod path;

///
/// Session manager: one live client, rebuilt on session expiry.
///
pub mod session;

///
/// Fair distributed read/write locks.
///
pub mod lock;

///
/// etcd-backed coordination client.
///
pub mod etcd;

///
/// In-process coordination store, for tests.
pub mod memory;

///
/// Utility function to manage various transient errors.
pub mod retry;

pub use {
    lock::{LockError, LockOptions, ReadLock, WriteLock},
    session::{SessionEvent, SessionEventKind, SessionManager},
    store::{CoordinationClient, SessionState, StoreError},
};
