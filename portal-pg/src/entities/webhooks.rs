//! Webhook listeners and queued events.
//!
//! Inserting an event fires the `webhook_insert` notification through a
//! table trigger. The dispatch loop reacts to it within one check period
//! and additionally dispatches on a fixed safety interval, so events are
//! delivered even if a notification is lost.

use crate::engine::{encode, PgEngine, QueryOptions};
use crate::model::Entity;
use crate::notify::NotificationSink;
use crate::sql::Criteria;
use ::async_trait::async_trait;
use portal_core::{
    create_random_id, DaoError, DaoResult, EventDispatcher, ListenerHook,
    WebhookEvent, WebhookEventsDao, WebhookListener, WebhookListenersDao, WebhooksDao,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Channel fed by the insert trigger on `webhook_events`.
pub const WEBHOOK_CHANNEL: &str = "webhook_insert";

/// How often the loop checks for pending events.
pub const HOOK_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Dispatch at least this often, pending notification or not.
pub const SAFETY_DISPATCH_INTERVAL: Duration = Duration::from_secs(10);

fn should_dispatch(pending: bool, since_last_dispatch: Duration) -> bool {
    pending || since_last_dispatch > SAFETY_DISPATCH_INTERVAL
}

/// Relational webhooks.
#[derive(Debug, Clone)]
pub struct PgWebhooks {
    engine: PgEngine,
}

impl PgWebhooks {
    pub fn new(engine: PgEngine) -> Self {
        Self { engine }
    }
}

impl WebhooksDao for PgWebhooks {
    fn listeners(&self) -> &dyn WebhookListenersDao {
        self
    }

    fn events(&self) -> &dyn WebhookEventsDao {
        self
    }
}

#[async_trait]
impl WebhookListenersDao for PgWebhooks {
    async fn get_all(&self) -> DaoResult<Vec<WebhookListener>> {
        debug!("webhooks.listeners.get_all");
        Ok(self
            .engine
            .get_page::<WebhookListener>(
                Entity::WebhookListeners,
                &Criteria::new(),
                &QueryOptions::new(),
            )
            .await?
            .rows)
    }

    async fn get_by_id(&self, listener_id: &str) -> DaoResult<Option<WebhookListener>> {
        debug!(listener_id, "webhooks.listeners.get_by_id");
        self.engine
            .get_single(Entity::WebhookListeners, &Criteria::by("id", listener_id), None)
            .await
    }

    async fn upsert(&self, listener: WebhookListener) -> DaoResult<WebhookListener> {
        debug!(listener_id = %listener.id, "webhooks.listeners.upsert");
        if listener.id.is_empty() {
            return Err(DaoError::internal("Webhook listener needs an id"));
        }
        self.engine
            .upsert_entity(Entity::WebhookListeners, &listener, None, None)
            .await?;
        Ok(listener)
    }

    async fn delete(&self, listener_id: &str) -> DaoResult<()> {
        debug!(listener_id, "webhooks.listeners.delete");
        // Queued events cascade in the database.
        let deleted = self
            .engine
            .delete_by_id(Entity::WebhookListeners, listener_id, None)
            .await?;
        if deleted == 0 {
            return Err(DaoError::not_found(format!(
                "Listener not found: {}",
                listener_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl WebhookEventsDao for PgWebhooks {
    async fn hook_listeners(
        &self,
        dispatcher: Arc<dyn EventDispatcher>,
    ) -> DaoResult<ListenerHook> {
        debug!("webhooks.events.hook_listeners");
        let pending = Arc::new(AtomicBool::new(false));
        let flag = pending.clone();
        let sink: NotificationSink = Arc::new(move |_payload| {
            info!("Received a pending event, queueing...");
            flag.store(true, Ordering::SeqCst);
        });
        self.engine.listen_to_channel(WEBHOOK_CHANNEL, sink).await?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(HOOK_CHECK_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_dispatch = Instant::now();
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("webhook dispatch loop shutting down");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let was_pending = pending.swap(false, Ordering::SeqCst);
                        if !should_dispatch(was_pending, last_dispatch.elapsed()) {
                            continue;
                        }
                        if was_pending {
                            info!("Detected pending webhook events, firing dispatcher");
                        } else {
                            debug!("safety dispatch of webhook events");
                        }
                        last_dispatch = Instant::now();
                        if let Err(e) = dispatcher.dispatch().await {
                            error!(error = %e, "dispatching webhook events failed");
                        }
                    }
                }
            }
        });

        Ok(ListenerHook::new(shutdown_tx, handle))
    }

    async fn get_by_listener(&self, listener_id: &str) -> DaoResult<Vec<WebhookEvent>> {
        debug!(listener_id, "webhooks.events.get_by_listener");
        Ok(self
            .engine
            .get_page::<WebhookEvent>(
                Entity::WebhookEvents,
                &Criteria::by("webhook_listeners_id", listener_id),
                &QueryOptions::new().ordered("id ASC"),
            )
            .await?
            .rows)
    }

    async fn create(&self, event: WebhookEvent) -> DaoResult<()> {
        debug!(action = %event.action, entity = %event.entity, "webhooks.events.create");
        let listeners = WebhookListenersDao::get_all(self).await?;
        if listeners.is_empty() {
            return Ok(());
        }
        // Each listener gets its own row and id.
        let rows = listeners
            .iter()
            .map(|listener| {
                let mut copy = event.clone();
                copy.id = create_random_id();
                copy.listener_id = Some(listener.id.clone());
                encode(&copy)
            })
            .collect::<DaoResult<Vec<_>>>()?;

        let engine = self.engine.clone();
        self.engine
            .with_transaction(move |tx| {
                Box::pin(async move {
                    for row in rows {
                        engine.upsert(Entity::WebhookEvents, row, None, Some(tx)).await?;
                    }
                    Ok(())
                })
            })
            .await?;
        debug!(listeners = listeners.len(), "queued event for all listeners");
        Ok(())
    }

    async fn delete(&self, listener_id: &str, event_id: &str) -> DaoResult<()> {
        debug!(listener_id, event_id, "webhooks.events.delete");
        self.engine
            .delete_by_id(Entity::WebhookEvents, event_id, None)
            .await?;
        Ok(())
    }

    async fn flush(&self, listener_id: &str) -> DaoResult<()> {
        debug!(listener_id, "webhooks.events.flush");
        let flushed = self
            .engine
            .delete_by(
                Entity::WebhookEvents,
                &Criteria::by("webhook_listeners_id", listener_id),
                None,
            )
            .await?;
        debug!(listener_id, flushed, "flushed webhook events");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_decision() {
        assert!(should_dispatch(true, Duration::ZERO));
        assert!(!should_dispatch(false, Duration::from_secs(1)));
        assert!(should_dispatch(false, Duration::from_secs(11)));
    }
}
