//! Session lifecycle: removal policies and the background sweeper.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::session::{Session, SessionState};
use crate::store::SessionStore;

/// When the store should give up on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemovalPolicy {
    /// Remove as soon as the streaming connection closes. Strict cleanup; no
    /// reconnect window.
    #[default]
    OnDisconnect,
    /// Keep detached sessions for `reconnect_grace` to allow quick
    /// reconnects.
    AfterGrace,
    /// Remove after the session has been idle for `idle_ttl`.
    AfterIdle,
    /// Removal only via explicit DELETE or external cleanup.
    Manual,
}

/// What the event buffer does when it exceeds capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the lowest ids.
    #[default]
    DropOldest,
    /// Evict the lowest ids and latch an overflow flag so replays can
    /// indicate a gap.
    Mark,
}

/// Hook invoked when the sweeper (or a transport) finally closes a session.
pub type CloseHook = Arc<dyn Fn(&Arc<Session>) + Send + Sync>;

/// Lifecycle tuning for a streaming transport. Zero durations disable the
/// corresponding check.
#[derive(Clone)]
pub struct LifecycleConfig {
    /// Detached sessions are reclaimable within this window under
    /// [`RemovalPolicy::AfterGrace`].
    pub reconnect_grace: Duration,
    /// Remove after `now - last_seen > idle_ttl`.
    pub idle_ttl: Duration,
    /// Hard cap on `now - created_at`, applied under every policy.
    pub max_lifetime: Duration,
    /// Sweeper cadence. Zero disables the sweeper.
    pub cleanup_interval: Duration,
    /// Per-session event buffer size.
    pub max_event_buffer: usize,
    pub removal_policy: RemovalPolicy,
    pub overflow_policy: OverflowPolicy,
    pub on_session_close: Option<CloseHook>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            reconnect_grace: Duration::from_secs(30),
            idle_ttl: Duration::ZERO,
            max_lifetime: Duration::ZERO,
            cleanup_interval: Duration::from_secs(30),
            max_event_buffer: 1024,
            removal_policy: RemovalPolicy::AfterGrace,
            overflow_policy: OverflowPolicy::DropOldest,
            on_session_close: None,
        }
    }
}

impl std::fmt::Debug for LifecycleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleConfig")
            .field("reconnect_grace", &self.reconnect_grace)
            .field("idle_ttl", &self.idle_ttl)
            .field("max_lifetime", &self.max_lifetime)
            .field("cleanup_interval", &self.cleanup_interval)
            .field("max_event_buffer", &self.max_event_buffer)
            .field("removal_policy", &self.removal_policy)
            .field("overflow_policy", &self.overflow_policy)
            .finish_non_exhaustive()
    }
}

/// Periodic sweeper enforcing TTLs and removal policies over a session store.
pub struct Sweeper {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Spawns the sweeper task. Returns a handle whose drop stops the task.
    pub fn spawn(store: Arc<dyn SessionStore>, config: LifecycleConfig) -> Self {
        let cancel = CancellationToken::new();
        if config.cleanup_interval.is_zero() {
            return Self {
                cancel,
                handle: None,
            };
        }

        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => sweep_once(store.as_ref(), &config).await,
                }
            }
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// One sweep pass. Exposed for transports that want an on-demand sweep.
pub async fn sweep_once(store: &dyn SessionStore, config: &LifecycleConfig) {
    let mut removed = 0usize;
    for id in store.ids().await {
        let Some(session) = store.get(&id).await else {
            continue;
        };
        let snapshot = session.snapshot().await;
        let reason = removal_reason(config, &snapshot);
        let Some(reason) = reason else { continue };

        store.remove(&id).await;
        session.close().await;
        if let Some(hook) = &config.on_session_close {
            hook(&session);
        }
        debug!(session = %id, reason, "session removed");
        removed += 1;
    }
    if removed > 0 {
        info!(removed, "sweeper removed sessions");
    }
}

fn removal_reason(
    config: &LifecycleConfig,
    snapshot: &crate::session::SessionSnapshot,
) -> Option<&'static str> {
    if !config.max_lifetime.is_zero() && snapshot.created_at.elapsed() >= config.max_lifetime {
        return Some("max lifetime");
    }
    if !config.idle_ttl.is_zero() && snapshot.last_seen.elapsed() >= config.idle_ttl {
        return Some("idle ttl");
    }
    if config.removal_policy == RemovalPolicy::AfterGrace
        && snapshot.state == SessionState::Detached
    {
        if let Some(detached_at) = snapshot.detached_at {
            if detached_at.elapsed() >= config.reconnect_grace {
                return Some("reconnect grace elapsed");
            }
        }
    }
    // a detached session whose writer already failed will not come back
    if snapshot.state == SessionState::Detached && snapshot.has_error {
        return Some("latched write error");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;

    fn config(policy: RemovalPolicy) -> LifecycleConfig {
        LifecycleConfig {
            reconnect_grace: Duration::from_millis(50),
            idle_ttl: Duration::ZERO,
            max_lifetime: Duration::ZERO,
            cleanup_interval: Duration::from_millis(10),
            removal_policy: policy,
            ..LifecycleConfig::default()
        }
    }

    #[tokio::test]
    async fn detached_session_survives_within_grace_then_goes() {
        let store = Arc::new(MemorySessionStore::new());
        let session = Session::builder().id("s").build();
        session.mark_detached().await;
        store.put(Arc::clone(&session)).await;

        let cfg = config(RemovalPolicy::AfterGrace);
        sweep_once(store.as_ref(), &cfg).await;
        assert!(store.get("s").await.is_some(), "still within grace");

        tokio::time::sleep(Duration::from_millis(60)).await;
        sweep_once(store.as_ref(), &cfg).await;
        assert!(store.get("s").await.is_none(), "grace elapsed");
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn idle_ttl_removes_stale_sessions() {
        let store = Arc::new(MemorySessionStore::new());
        let session = Session::builder().id("idle").build();
        session.backdate_last_seen(Duration::from_secs(2)).await;
        store.put(Arc::clone(&session)).await;

        let mut cfg = config(RemovalPolicy::AfterIdle);
        cfg.idle_ttl = Duration::from_millis(100);
        sweep_once(store.as_ref(), &cfg).await;
        assert!(store.get("idle").await.is_none());
    }

    #[tokio::test]
    async fn max_lifetime_is_a_hard_cap_even_under_manual_policy() {
        let store = Arc::new(MemorySessionStore::new());
        let session = Session::builder().id("old").build();
        session.backdate_created_at(Duration::from_secs(5)).await;
        store.put(Arc::clone(&session)).await;

        let mut cfg = config(RemovalPolicy::Manual);
        cfg.max_lifetime = Duration::from_secs(1);
        sweep_once(store.as_ref(), &cfg).await;
        assert!(store.get("old").await.is_none());
    }

    #[tokio::test]
    async fn manual_policy_keeps_detached_sessions() {
        let store = Arc::new(MemorySessionStore::new());
        let session = Session::builder().id("manual").build();
        session.mark_detached().await;
        store.put(Arc::clone(&session)).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        sweep_once(store.as_ref(), &config(RemovalPolicy::Manual)).await;
        assert!(store.get("manual").await.is_some());
    }

    #[tokio::test]
    async fn close_hook_fires_on_removal() {
        let store = Arc::new(MemorySessionStore::new());
        let session = Session::builder().id("hooked").build();
        session.backdate_created_at(Duration::from_secs(5)).await;
        store.put(session).await;

        let closed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let closed_in_hook = Arc::clone(&closed);
        let mut cfg = config(RemovalPolicy::Manual);
        cfg.max_lifetime = Duration::from_secs(1);
        cfg.on_session_close = Some(Arc::new(move |_s| {
            closed_in_hook.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        sweep_once(store.as_ref(), &cfg).await;
        assert_eq!(closed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spawned_sweeper_ticks() {
        let store = Arc::new(MemorySessionStore::new());
        let session = Session::builder().id("ticked").build();
        session.mark_detached().await;
        store.put(session).await;

        let sweeper = Sweeper::spawn(
            Arc::clone(&store) as Arc<dyn SessionStore>,
            LifecycleConfig {
                reconnect_grace: Duration::from_millis(30),
                cleanup_interval: Duration::from_millis(10),
                removal_policy: RemovalPolicy::AfterGrace,
                ..LifecycleConfig::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.get("ticked").await.is_none());
        sweeper.shutdown();
    }
}
