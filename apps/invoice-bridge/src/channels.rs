use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::node::{CredentialScope, NodeChannel, NodeConnector, NodeError};

/// A live channel for one scope. `id` is unique per build, so two handles for
/// the same scope compare equal only if they share the same underlying
/// connection.
#[derive(Clone)]
pub struct ChannelHandle {
    id: u64,
    scope: CredentialScope,
    channel: Arc<dyn NodeChannel>,
}

impl ChannelHandle {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn scope(&self) -> CredentialScope {
        self.scope
    }

    #[must_use]
    pub fn channel(&self) -> &dyn NodeChannel {
        self.channel.as_ref()
    }
}

impl PartialEq for ChannelHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ChannelHandle {}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Per-scope owned slot. The async mutex serializes build and teardown so two
/// concurrent resets cannot race each other.
struct ScopeSlot {
    scope: CredentialScope,
    current: Mutex<Option<ChannelHandle>>,
}

impl ScopeSlot {
    fn new(scope: CredentialScope) -> Self {
        Self {
            scope,
            current: Mutex::new(None),
        }
    }
}

/// Builds, caches and tears down one channel per credential scope.
pub struct ChannelFactory {
    connector: Arc<dyn NodeConnector>,
    read_only: ScopeSlot,
    invoice: ScopeSlot,
    streaming: ScopeSlot,
    next_id: AtomicU64,
}

impl ChannelFactory {
    pub fn new(connector: Arc<dyn NodeConnector>) -> Self {
        Self {
            connector,
            read_only: ScopeSlot::new(CredentialScope::ReadOnly),
            invoice: ScopeSlot::new(CredentialScope::Invoice),
            streaming: ScopeSlot::new(CredentialScope::Streaming),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &'static str {
        self.connector.backend()
    }

    fn slot(&self, scope: CredentialScope) -> &ScopeSlot {
        match scope {
            CredentialScope::ReadOnly => &self.read_only,
            CredentialScope::Invoice => &self.invoice,
            CredentialScope::Streaming => &self.streaming,
        }
    }

    /// Returns the cached channel for `scope`, connecting on first use.
    pub async fn get_channel(&self, scope: CredentialScope) -> Result<ChannelHandle, NodeError> {
        let slot = self.slot(scope);
        let mut current = slot.current.lock().await;
        if let Some(handle) = current.as_ref() {
            return Ok(handle.clone());
        }

        let channel = self.connector.connect(slot.scope).await?;
        let handle = ChannelHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            scope: slot.scope,
            channel,
        };
        info!(
            scope = %slot.scope,
            channel_id = handle.id,
            backend = self.connector.backend(),
            "lightning node channel established"
        );
        *current = Some(handle.clone());
        Ok(handle)
    }

    /// Closes and forgets the cached channel for `scope`, if any. Close
    /// failures are logged and swallowed; the slot is always cleared.
    pub async fn reset_channel(&self, scope: CredentialScope) {
        let slot = self.slot(scope);
        let taken = slot.current.lock().await.take();
        if let Some(handle) = taken {
            close_quietly(&handle).await;
        }
    }

    /// Like [`Self::reset_channel`], but only if `stale` is still the cached
    /// channel. When another task already replaced it, the fresh channel is
    /// left alone.
    pub async fn invalidate(&self, stale: &ChannelHandle) {
        let slot = self.slot(stale.scope);
        let taken = {
            let mut current = slot.current.lock().await;
            match current.as_ref() {
                Some(handle) if handle == stale => current.take(),
                _ => None,
            }
        };
        match taken {
            Some(handle) => close_quietly(&handle).await,
            None => debug!(
                scope = %stale.scope,
                channel_id = stale.id,
                "stale channel already replaced"
            ),
        }
    }

    /// Closes every cached channel. Used on shutdown.
    pub async fn close_all(&self) {
        for scope in CredentialScope::ALL {
            self.reset_channel(scope).await;
        }
    }

    /// Id of the currently cached channel for `scope`, without connecting.
    pub async fn current_id(&self, scope: CredentialScope) -> Option<u64> {
        self.slot(scope)
            .current
            .lock()
            .await
            .as_ref()
            .map(ChannelHandle::id)
    }
}

async fn close_quietly(handle: &ChannelHandle) {
    match handle.channel.close().await {
        Ok(()) => debug!(
            scope = %handle.scope,
            channel_id = handle.id,
            "lightning node channel closed"
        ),
        Err(error) => error!(
            scope = %handle.scope,
            channel_id = handle.id,
            error = %error,
            "could not close lightning node channel"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::ChannelFactory;
    use crate::memory::{MemoryConnector, YieldingConnector};
    use crate::node::CredentialScope;

    #[tokio::test]
    async fn channel_is_built_lazily_and_cached_until_reset() {
        let connector = Arc::new(MemoryConnector::new());
        let factory = ChannelFactory::new(connector.clone());
        assert_eq!(connector.connects(CredentialScope::ReadOnly), 0);
        assert_eq!(factory.current_id(CredentialScope::ReadOnly).await, None);

        let first = factory
            .get_channel(CredentialScope::ReadOnly)
            .await
            .expect("first channel");
        let again = factory
            .get_channel(CredentialScope::ReadOnly)
            .await
            .expect("cached channel");
        assert_eq!(first, again);
        assert_eq!(connector.connects(CredentialScope::ReadOnly), 1);

        factory.reset_channel(CredentialScope::ReadOnly).await;
        assert_eq!(connector.closes(), 1);
        let rebuilt = factory
            .get_channel(CredentialScope::ReadOnly)
            .await
            .expect("rebuilt channel");
        assert_ne!(first, rebuilt);
        assert_eq!(connector.connects(CredentialScope::ReadOnly), 2);
    }

    #[tokio::test]
    async fn scopes_are_independent() {
        let connector = Arc::new(MemoryConnector::new());
        let factory = ChannelFactory::new(connector.clone());
        let read_only = factory
            .get_channel(CredentialScope::ReadOnly)
            .await
            .expect("read only");
        let invoice = factory
            .get_channel(CredentialScope::Invoice)
            .await
            .expect("invoice");
        assert_ne!(read_only, invoice);

        factory.reset_channel(CredentialScope::Invoice).await;
        assert_eq!(
            factory.current_id(CredentialScope::ReadOnly).await,
            Some(read_only.id())
        );
        assert_eq!(factory.current_id(CredentialScope::Invoice).await, None);
    }

    #[tokio::test]
    async fn reset_clears_slot_even_when_close_fails() {
        let connector = Arc::new(MemoryConnector::new());
        connector.fail_closes();
        let factory = ChannelFactory::new(connector.clone());
        factory
            .get_channel(CredentialScope::Streaming)
            .await
            .expect("streaming");

        factory.reset_channel(CredentialScope::Streaming).await;
        assert_eq!(connector.closes(), 1);
        assert_eq!(factory.current_id(CredentialScope::Streaming).await, None);
    }

    #[tokio::test]
    async fn reset_without_channel_is_a_no_op() {
        let connector = Arc::new(MemoryConnector::new());
        let factory = ChannelFactory::new(connector.clone());
        factory.reset_channel(CredentialScope::Invoice).await;
        assert_eq!(connector.closes(), 0);
    }

    #[tokio::test]
    async fn invalidate_leaves_a_newer_channel_alone() {
        let connector = Arc::new(MemoryConnector::new());
        let factory = ChannelFactory::new(connector.clone());
        let stale = factory
            .get_channel(CredentialScope::Invoice)
            .await
            .expect("first");
        factory.invalidate(&stale).await;
        let fresh = factory
            .get_channel(CredentialScope::Invoice)
            .await
            .expect("fresh");

        // A second caller that also saw `stale` fail must not tear down `fresh`.
        factory.invalidate(&stale).await;
        assert_eq!(
            factory.current_id(CredentialScope::Invoice).await,
            Some(fresh.id())
        );
        assert_eq!(connector.closes(), 1);
    }

    #[tokio::test]
    async fn connect_failure_leaves_slot_empty() {
        let connector = Arc::new(MemoryConnector::new());
        connector.fail_next_connects(CredentialScope::ReadOnly, 1);
        let factory = ChannelFactory::new(connector.clone());
        let error = factory
            .get_channel(CredentialScope::ReadOnly)
            .await
            .expect_err("connect fails");
        assert_eq!(error.code(), "connect_failed");
        assert_eq!(factory.current_id(CredentialScope::ReadOnly).await, None);
        factory
            .get_channel(CredentialScope::ReadOnly)
            .await
            .expect("second connect succeeds");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_callers_share_one_connect() {
        let memory = MemoryConnector::new();
        let factory = Arc::new(ChannelFactory::new(Arc::new(YieldingConnector(
            memory.clone(),
        ))));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let factory = Arc::clone(&factory);
                tokio::spawn(async move { factory.get_channel(CredentialScope::ReadOnly).await })
            })
            .collect();
        let mut ids = Vec::new();
        for task in tasks {
            let handle = task.await.expect("task joined").expect("channel");
            ids.push(handle.id());
        }

        assert_eq!(memory.connects(CredentialScope::ReadOnly), 1);
        assert!(ids.iter().all(|id| *id == ids[0]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_resets_close_each_channel_once() {
        let memory = MemoryConnector::new();
        let factory = Arc::new(ChannelFactory::new(Arc::new(YieldingConnector(
            memory.clone(),
        ))));
        factory
            .get_channel(CredentialScope::Invoice)
            .await
            .expect("channel");

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let factory = Arc::clone(&factory);
                tokio::spawn(async move { factory.reset_channel(CredentialScope::Invoice).await })
            })
            .collect();
        for task in tasks {
            task.await.expect("task joined");
        }

        assert_eq!(memory.closes(), 1);
        assert_eq!(factory.current_id(CredentialScope::Invoice).await, None);
    }
}
