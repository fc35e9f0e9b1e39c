//! Cross-process room delivery.
//!
//! Every broadcast is delivered to local room members first and then
//! published once on the bus. Each process re-delivers frames from other
//! processes to its own members. Connection ids are process-local, so
//! sender exclusion only ever applies on the origin process.

use crate::{
    config::ScaleOut,
    error::Result,
    hub::{ConnId, Hub},
};
use futures::{future::BoxFuture, StreamExt};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use uuid::Uuid;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Envelope published on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomFrame {
    pub origin: Uuid,
    pub room: String,
    pub payload: String,
}

/// Publishing side of a pub/sub broker.
pub trait RoomBus: Send + Sync {
    fn publish<'a>(&'a self, frame: &'a RoomFrame) -> BoxFuture<'a, Result<()>>;
}

pub struct Fanout {
    node: Uuid,
    hub: Arc<Hub>,
    bus: Option<Arc<dyn RoomBus>>,
}

impl Fanout {
    /// Fan-out confined to this process.
    pub fn local(hub: Arc<Hub>) -> Self {
        Self {
            node: Uuid::new_v4(),
            hub,
            bus: None,
        }
    }

    pub fn with_bus(hub: Arc<Hub>, bus: Arc<dyn RoomBus>) -> Self {
        Self {
            node: Uuid::new_v4(),
            hub,
            bus: Some(bus),
        }
    }

    pub fn node_id(&self) -> Uuid {
        self.node
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn is_scaled_out(&self) -> bool {
        self.bus.is_some()
    }

    pub async fn broadcast(&self, room: &str, except: Option<ConnId>, payload: Arc<str>) {
        let local = self.hub.deliver(room, except, &payload);
        tracing::trace!(room, local, "room broadcast");
        let Some(bus) = &self.bus else {
            return;
        };
        let frame = RoomFrame {
            origin: self.node,
            room: room.to_string(),
            payload: payload.to_string(),
        };
        if let Err(e) = bus.publish(&frame).await {
            tracing::warn!(room, error = %e, "cross-process publish failed");
        }
    }

    /// Deliver a frame received from the bus. Frames this process published
    /// itself were already delivered locally and are ignored.
    pub fn receive(&self, frame: RoomFrame) -> usize {
        if frame.origin == self.node {
            return 0;
        }
        self.hub.deliver(&frame.room, None, &Arc::from(frame.payload))
    }
}

/// Redis pub/sub backed bus.
pub struct RedisBus {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
    channel: String,
}

impl RedisBus {
    pub async fn connect(settings: &ScaleOut) -> Result<Self> {
        let client = redis::Client::open(settings.redis_url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            client,
            conn,
            channel: settings.channel.clone(),
        })
    }

    /// Keep a subscription open for the life of the process, re-delivering
    /// foreign frames through `fanout`. A dropped broker connection is
    /// retried after a fixed backoff; frames published meanwhile are lost.
    pub fn spawn_subscriber(&self, fanout: Arc<Fanout>) -> JoinHandle<()> {
        let client = self.client.clone();
        let channel = self.channel.clone();
        tokio::spawn(async move {
            loop {
                match subscribe(&client, &channel, &fanout).await {
                    Ok(()) => tracing::warn!(%channel, "redis subscription closed"),
                    Err(e) => tracing::warn!(%channel, error = %e, "redis subscription failed"),
                }
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        })
    }
}

async fn subscribe(client: &redis::Client, channel: &str, fanout: &Fanout) -> Result<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    tracing::info!(channel, "subscribed to room bus");
    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, "non-text bus payload");
                continue;
            }
        };
        match serde_json::from_str::<RoomFrame>(&payload) {
            Ok(frame) => {
                fanout.receive(frame);
            }
            Err(e) => tracing::debug!(error = %e, "malformed bus frame"),
        }
    }
    Ok(())
}

impl RoomBus for RedisBus {
    fn publish<'a>(&'a self, frame: &'a RoomFrame) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let payload = serde_json::to_string(frame)?;
            let mut conn = self.conn.clone();
            let _: i64 = redis::cmd("PUBLISH")
                .arg(&self.channel)
                .arg(payload)
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
    }
}
