//! `LISTEN`/`NOTIFY` delivery on a dedicated connection.

use crate::error::DbResultExt;
use dashmap::DashMap;
use futures_util::StreamExt;
use portal_core::DaoResult;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, NoTls};
use tracing::{debug, error, warn};

/// Receives the decoded JSON payload of each notification.
pub type NotificationSink = Arc<dyn Fn(JsonValue) + Send + Sync>;

type SinkMap = Arc<DashMap<String, NotificationSink>>;

/// Long-lived connection listening on one or more channels.
pub struct ChannelListener {
    client: tokio_postgres::Client,
    sinks: SinkMap,
    task: JoinHandle<()>,
}

impl ChannelListener {
    /// Connect and start forwarding notifications to registered sinks.
    pub async fn connect(config: tokio_postgres::Config) -> DaoResult<Self> {
        let (client, mut connection) = config.connect(NoTls).await.db()?;
        let sinks: SinkMap = Arc::new(DashMap::new());
        let task_sinks = sinks.clone();

        let task = tokio::spawn(async move {
            let mut messages = futures_util::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        debug!(channel = n.channel(), "received notification");
                        dispatch(&task_sinks, n.channel(), n.payload());
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        debug!(notice = %notice, "postgres notice");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "Postgres event listener threw an error");
                        break;
                    }
                }
            }
            debug!("notification listener stopped");
        });

        Ok(Self {
            client,
            sinks,
            task,
        })
    }

    /// Register `sink` for `channel` and issue `LISTEN`.
    pub async fn listen(&self, channel: &str, sink: NotificationSink) -> DaoResult<()> {
        debug!(channel, "hooking channel");
        self.sinks.insert(channel.to_string(), sink);
        self.client
            .batch_execute(&format!("LISTEN {}", channel))
            .await
            .db()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

fn dispatch(sinks: &SinkMap, channel: &str, payload: &str) {
    let Some(sink) = sinks.get(channel).map(|s| s.value().clone()) else {
        warn!(channel, "notification on unknown channel");
        return;
    };
    match serde_json::from_str::<JsonValue>(payload) {
        Ok(value) => sink(value),
        Err(e) => warn!(channel, error = %e, "notification payload is not JSON"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_dispatch_routes_by_channel() {
        let hits = Arc::new(AtomicUsize::new(0));
        let sinks: SinkMap = Arc::new(DashMap::new());
        let counter = hits.clone();
        sinks.insert(
            "webhook_insert".to_string(),
            Arc::new(move |v: JsonValue| {
                assert_eq!(v["entity"], "application");
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        dispatch(&sinks, "webhook_insert", r#"{"entity":"application"}"#);
        dispatch(&sinks, "other", r#"{}"#);
        dispatch(&sinks, "webhook_insert", "not json");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
