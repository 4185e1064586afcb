//! Webhook listeners and their per-listener event queues.
//!
//! Listeners live in `webhooks/_listeners.json`; each listener owns a queue
//! file `webhooks/<listenerId>.json`. A new event is appended to every queue
//! or to none.

use crate::locks::LockKey;
use crate::store::{read_json_or_default, remove_if_exists, write_json, JsonStore};
use ::async_trait::async_trait;
use portal_core::{
    create_random_id, DaoError, DaoResult, EventDispatcher, ListenerHook, WebhookEvent,
    WebhookEventsDao, WebhookListener, WebhookListenersDao, WebhooksDao,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

const WEBHOOKS_DIR: &str = "webhooks";
const LISTENERS_FILE: &str = "_listeners.json";

/// Dispatch interval of the document store, from `PORTAL_API_HOOK_INTERVAL`
/// (milliseconds, default 10000).
pub fn hook_interval_from_env() -> Duration {
    let millis = std::env::var("PORTAL_API_HOOK_INTERVAL")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .unwrap_or(10_000);
    Duration::from_millis(millis)
}

/// Document-store webhooks.
#[derive(Debug, Clone)]
pub struct JsonWebhooks {
    store: Arc<JsonStore>,
    hook_interval: Duration,
}

impl JsonWebhooks {
    pub fn new(store: Arc<JsonStore>) -> Self {
        Self {
            store,
            hook_interval: hook_interval_from_env(),
        }
    }

    pub fn with_hook_interval(mut self, hook_interval: Duration) -> Self {
        self.hook_interval = hook_interval;
        self
    }

    fn listeners_file(&self) -> PathBuf {
        self.store.file(WEBHOOKS_DIR, LISTENERS_FILE)
    }

    fn events_file(&self, listener_id: &str) -> DaoResult<PathBuf> {
        self.store.entity_file(WEBHOOKS_DIR, listener_id, ".json")
    }

    fn load_listeners(&self) -> DaoResult<Vec<WebhookListener>> {
        read_json_or_default(&self.listeners_file())
    }

    fn save_listeners(&self, listeners: &[WebhookListener]) -> DaoResult<()> {
        write_json(&self.listeners_file(), listeners)
    }

    fn load_events(&self, listener_id: &str) -> DaoResult<Vec<WebhookEvent>> {
        read_json_or_default(&self.events_file(listener_id)?)
    }

    fn save_events(&self, listener_id: &str, events: &[WebhookEvent]) -> DaoResult<()> {
        write_json(&self.events_file(listener_id)?, events)
    }

    fn require_listener(&self, listener_id: &str) -> DaoResult<()> {
        if self.load_listeners()?.iter().any(|l| l.id == listener_id) {
            Ok(())
        } else {
            Err(DaoError::not_found(format!("Listener not found: {}", listener_id)))
        }
    }
}

impl WebhooksDao for JsonWebhooks {
    fn listeners(&self) -> &dyn WebhookListenersDao {
        self
    }

    fn events(&self) -> &dyn WebhookEventsDao {
        self
    }
}

// ============================================================================
// LISTENERS
// ============================================================================

#[async_trait]
impl WebhookListenersDao for JsonWebhooks {
    async fn get_all(&self) -> DaoResult<Vec<WebhookListener>> {
        self.load_listeners()
    }

    async fn get_by_id(&self, listener_id: &str) -> DaoResult<Option<WebhookListener>> {
        Ok(self.load_listeners()?.into_iter().find(|l| l.id == listener_id))
    }

    async fn upsert(&self, listener: WebhookListener) -> DaoResult<WebhookListener> {
        debug!(listener_id = %listener.id, "webhooks.listeners.upsert");
        let _lock = self.store.lock(LockKey::Listeners)?;
        let mut listeners = self.load_listeners()?;
        match listeners.iter_mut().find(|l| l.id == listener.id) {
            Some(existing) => *existing = listener.clone(),
            None => {
                self.save_events(&listener.id, &[])?;
                listeners.push(listener.clone());
            }
        }
        self.save_listeners(&listeners)?;
        Ok(listener)
    }

    async fn delete(&self, listener_id: &str) -> DaoResult<()> {
        debug!(listener_id, "webhooks.listeners.delete");
        let _lock = self.store.lock(LockKey::Listeners)?;
        let mut listeners = self.load_listeners()?;
        let pos = listeners
            .iter()
            .position(|l| l.id == listener_id)
            .ok_or_else(|| DaoError::not_found(format!("Listener not found: {}", listener_id)))?;
        listeners.remove(pos);
        self.save_listeners(&listeners)?;
        remove_if_exists(&self.events_file(listener_id)?)?;
        Ok(())
    }
}

// ============================================================================
// EVENTS
// ============================================================================

#[async_trait]
impl WebhookEventsDao for JsonWebhooks {
    async fn hook_listeners(
        &self,
        dispatcher: Arc<dyn EventDispatcher>,
    ) -> DaoResult<ListenerHook> {
        let period = self.hook_interval;
        info!(interval_ms = period.as_millis() as u64, "starting webhook dispatch loop");
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("webhook dispatch loop shutting down");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = dispatcher.dispatch().await {
                            warn!(error = %e, "webhook dispatch failed");
                        }
                    }
                }
            }
        });

        Ok(ListenerHook::new(shutdown_tx, handle))
    }

    async fn get_by_listener(&self, listener_id: &str) -> DaoResult<Vec<WebhookEvent>> {
        self.require_listener(listener_id)?;
        self.load_events(listener_id)
    }

    async fn create(&self, mut event: WebhookEvent) -> DaoResult<()> {
        if event.id.is_empty() {
            event.id = create_random_id();
        }
        debug!(event_id = %event.id, action = %event.action, entity = %event.entity, "webhooks.events.create");

        let listeners = self.load_listeners()?;
        if listeners.is_empty() {
            return Ok(());
        }
        let keys = listeners
            .iter()
            .map(|l| LockKey::Events(l.id.clone()))
            .collect();
        let _locks = self.store.lock_all(keys)?;

        for listener in &listeners {
            let mut events = self.load_events(&listener.id)?;
            events.push(event.clone());
            self.save_events(&listener.id, &events)?;
        }
        Ok(())
    }

    async fn delete(&self, listener_id: &str, event_id: &str) -> DaoResult<()> {
        self.require_listener(listener_id)?;
        let _lock = self.store.lock(LockKey::Events(listener_id.to_string()))?;
        let mut events = self.load_events(listener_id)?;
        let before = events.len();
        events.retain(|e| e.id != event_id);
        if events.len() != before {
            self.save_events(listener_id, &events)?;
        }
        Ok(())
    }

    async fn flush(&self, listener_id: &str) -> DaoResult<()> {
        debug!(listener_id, "webhooks.events.flush");
        self.require_listener(listener_id)?;
        let _lock = self.store.lock(LockKey::Events(listener_id.to_string()))?;
        self.save_events(listener_id, &[])
    }
}
