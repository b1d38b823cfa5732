//! The `SessionStore` trait and its in-memory implementation
//!
//! Uses `Pin<Box<dyn Future>>` return types so stores can be shared as
//! `Arc<dyn SessionStore>` between the gateway and the lifecycle manager.

use std::future::Future;
use std::pin::Pin;

use common::Secret;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::model::Session;

/// Boxed future returned by every store operation.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Single source of truth for the session triple.
///
/// Writes replace all fields at once and are atomic with respect to reads: a
/// reader sees either the previous session or the new one, never a new access
/// token paired with an old refresh token. Absent fields read as `None`.
pub trait SessionStore: Send + Sync {
    /// Persist all three fields.
    fn write(&self, session: Session) -> StoreFuture<'_, Result<()>>;

    /// Access token for attaching to upstream calls. Gateway use only.
    fn read_access_credential(&self) -> StoreFuture<'_, Option<Secret<String>>>;

    /// Refresh token for the recovery exchange.
    fn read_refresh_credential(&self) -> StoreFuture<'_, Option<Secret<String>>>;

    /// Numeric id of the signed-in user.
    fn read_subject_id(&self) -> StoreFuture<'_, Option<u64>>;

    /// Erase all three fields. Succeeds when nothing is stored.
    fn clear(&self) -> StoreFuture<'_, Result<()>>;
}

/// Process-local store. The session lives behind a single `RwLock` so
/// replacing it is one pointer-sized swap under the write guard.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    state: RwLock<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            state: RwLock::new(Some(session)),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn write(&self, session: Session) -> StoreFuture<'_, Result<()>> {
        Box::pin(async move {
            let subject_id = session.subject_id;
            *self.state.write().await = Some(session);
            debug!(subject_id, "session written");
            Ok(())
        })
    }

    fn read_access_credential(&self) -> StoreFuture<'_, Option<Secret<String>>> {
        Box::pin(async move { self.state.read().await.as_ref().map(|s| s.access.clone()) })
    }

    fn read_refresh_credential(&self) -> StoreFuture<'_, Option<Secret<String>>> {
        Box::pin(async move { self.state.read().await.as_ref().map(|s| s.refresh.clone()) })
    }

    fn read_subject_id(&self) -> StoreFuture<'_, Option<u64>> {
        Box::pin(async move { self.state.read().await.as_ref().map(|s| s.subject_id) })
    }

    fn clear(&self) -> StoreFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.state.write().await.take().is_some() {
                debug!("session cleared");
            }
            Ok(())
        })
    }
}
