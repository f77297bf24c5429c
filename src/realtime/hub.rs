//! Connection registry and tenant-scoped fan-out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::RealtimeConfig;
use crate::observability::metrics;
use crate::realtime::backbone::{Backbone, Envelope, Target};
use crate::realtime::connection::{ConnectionHandle, ConnectionId, ConnectionState};
use crate::realtime::protocol::ServerMessage;
use crate::resilience::backoff::Backoff;
use crate::security::identity::Identity;
use crate::store::StoreHealth;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),

    #[error("subscription limit of {0} topics reached")]
    TooManyTopics(usize),

    #[error("invalid topic '{0}'")]
    InvalidTopic(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub instance: Uuid,
    pub connections: usize,
    pub users: usize,
    pub groups: usize,
    pub subscriptions: usize,
    pub delivered: u64,
    pub dropped: u64,
    pub backbone: Option<&'static str>,
    pub backbone_degraded: bool,
}

/// `(tenant, topic)`.
type GroupKey = (String, String);
/// `(tenant, user)`; user ids are only unique within a tenant.
type UserKey = (String, String);

pub struct FanoutHub {
    instance: Uuid,
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    groups: DashMap<GroupKey, DashSet<ConnectionId>>,
    users: DashMap<UserKey, DashSet<ConnectionId>>,
    backbone: Option<Arc<dyn Backbone>>,
    health: StoreHealth,
    client_buffer: usize,
    idle_timeout: Duration,
    max_topics: usize,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl FanoutHub {
    pub fn new(config: &RealtimeConfig, backbone: Option<Arc<dyn Backbone>>, retry_after: Duration) -> Self {
        Self {
            instance: Uuid::new_v4(),
            connections: DashMap::new(),
            groups: DashMap::new(),
            users: DashMap::new(),
            backbone,
            health: StoreHealth::new("backbone", retry_after),
            client_buffer: config.client_buffer,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            max_topics: config.max_topics_per_connection,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Register an authenticated connection. The receiver feeds its socket writer.
    pub fn register(&self, identity: Identity) -> (Arc<ConnectionHandle>, mpsc::Receiver<Arc<ServerMessage>>) {
        let (tx, rx) = mpsc::channel(self.client_buffer);
        let handle = Arc::new(ConnectionHandle::new(identity, tx));
        let identity = handle.identity();
        self.users
            .entry((identity.tenant_id.clone(), identity.user_id.clone()))
            .or_default()
            .insert(handle.id());
        self.connections.insert(handle.id(), handle.clone());
        metrics::set_ws_connections(self.connections.len());
        tracing::info!(
            connection = %handle.id(),
            user = %handle.identity().user_id,
            tenant = %handle.identity().tenant_id,
            "Realtime connection registered"
        );
        (handle, rx)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|c| c.clone())
    }

    /// Join `(tenant, topic)` for each topic. Returns the topics now held.
    pub fn subscribe(&self, id: ConnectionId, topics: &[String]) -> Result<Vec<String>, HubError> {
        if let Some(bad) = topics.iter().find(|t| t.trim().is_empty() || t.len() > 256) {
            return Err(HubError::InvalidTopic(bad.clone()));
        }
        let handle = self.get(id).ok_or(HubError::UnknownConnection(id))?;
        let tenant = handle.identity().tenant_id.clone();

        let mut membership = handle.membership.lock();
        if membership.state != ConnectionState::Authenticated {
            return Err(HubError::UnknownConnection(id));
        }
        let new_topics = topics.iter().filter(|t| !membership.topics.contains(*t)).count();
        if membership.topics.len() + new_topics > self.max_topics {
            return Err(HubError::TooManyTopics(self.max_topics));
        }
        for topic in topics {
            if membership.topics.insert(topic.clone()) {
                self.groups
                    .entry((tenant.clone(), topic.clone()))
                    .or_default()
                    .insert(id);
            }
        }
        Ok(topics.to_vec())
    }

    pub fn unsubscribe(&self, id: ConnectionId, topics: &[String]) -> Result<Vec<String>, HubError> {
        let handle = self.get(id).ok_or(HubError::UnknownConnection(id))?;
        let tenant = handle.identity().tenant_id.clone();

        let mut membership = handle.membership.lock();
        for topic in topics {
            if membership.topics.remove(topic) {
                self.leave_group(&(tenant.clone(), topic.clone()), id);
            }
        }
        Ok(topics.to_vec())
    }

    fn leave_group(&self, key: &GroupKey, id: ConnectionId) {
        if let Some(members) = self.groups.get(key) {
            members.remove(&id);
        }
        self.groups.remove_if(key, |_, members| members.is_empty());
    }

    /// Remove a connection and every membership it holds.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let Some((_, handle)) = self.connections.remove(&id) else {
            return false;
        };
        let tenant = handle.identity().tenant_id.clone();
        let user = handle.identity().user_id.clone();
        let user_key = (tenant.clone(), user.clone());
        {
            let mut membership = handle.membership.lock();
            membership.state = ConnectionState::Disconnected;
            for topic in membership.topics.drain() {
                self.leave_group(&(tenant.clone(), topic), id);
            }
        }
        if let Some(conns) = self.users.get(&user_key) {
            conns.remove(&id);
        }
        self.users.remove_if(&user_key, |_, conns| conns.is_empty());
        handle.close();

        metrics::set_ws_connections(self.connections.len());
        tracing::info!(connection = %id, user = %user, "Realtime connection removed");
        true
    }

    pub fn touch(&self, id: ConnectionId) {
        if let Some(handle) = self.connections.get(&id) {
            handle.touch();
        }
    }

    /// Deliver to every member of `(tenant, topic)` on every instance.
    /// Returns the number of local deliveries.
    pub async fn broadcast(&self, tenant_id: &str, topic: &str, event: &str, payload: Value) -> usize {
        let target = Target::Group {
            tenant_id: tenant_id.to_string(),
            topic: topic.to_string(),
        };
        self.fan_out(target, event, payload).await
    }

    /// Deliver to every connection of `user_id` within `tenant_id` on every instance.
    pub async fn send_to_user(&self, tenant_id: &str, user_id: &str, event: &str, payload: Value) -> usize {
        let target = Target::User {
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
        };
        self.fan_out(target, event, payload).await
    }

    async fn fan_out(&self, target: Target, event: &str, payload: Value) -> usize {
        let delivered = self.deliver_local(&target, event, payload.clone());

        if let Some(backbone) = &self.backbone {
            if self.health.should_try() {
                let envelope = Envelope {
                    origin: self.instance,
                    target,
                    event: event.to_string(),
                    payload,
                };
                match backbone.publish(&envelope).await {
                    Ok(()) => self.health.record_ok(),
                    Err(e) => self.health.record_err(&e),
                }
            }
        }
        delivered
    }

    /// Deliver to members connected to this instance only.
    pub fn deliver_local(&self, target: &Target, event: &str, payload: Value) -> usize {
        let (ids, topic): (Vec<ConnectionId>, Option<String>) = match target {
            Target::Group { tenant_id, topic } => (
                self.groups
                    .get(&(tenant_id.clone(), topic.clone()))
                    .map(|members| members.iter().map(|id| *id).collect())
                    .unwrap_or_default(),
                Some(topic.clone()),
            ),
            Target::User { tenant_id, user_id } => (
                self.users
                    .get(&(tenant_id.clone(), user_id.clone()))
                    .map(|conns| conns.iter().map(|id| *id).collect())
                    .unwrap_or_default(),
                None,
            ),
        };
        if ids.is_empty() {
            return 0;
        }

        let message = Arc::new(ServerMessage::Event {
            topic,
            event: event.to_string(),
            payload,
        });
        let (mut delivered, mut dropped) = (0, 0);
        for id in ids {
            let Some(handle) = self.get(id) else { continue };
            match handle.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped += 1;
                    tracing::debug!(connection = %id, "Subscriber queue full, dropping event");
                }
                // writer gone; the socket task will disconnect it
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        self.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        metrics::record_fanout_delivered(delivered);
        if dropped > 0 {
            metrics::record_fanout_dropped(dropped);
        }
        delivered
    }

    fn handle_envelope(&self, envelope: Envelope) {
        if envelope.origin == self.instance {
            return;
        }
        self.deliver_local(&envelope.target, &envelope.event, envelope.payload);
    }

    /// Consume the backbone until shutdown, reconnecting with backoff.
    pub async fn run_backbone_listener(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let Some(backbone) = self.backbone.clone() else {
            return;
        };
        let mut backoff = Backoff::new(250, 30_000);

        loop {
            let subscribed = tokio::select! {
                _ = shutdown.recv() => break,
                result = backbone.subscribe() => result,
            };

            match subscribed {
                Ok(mut stream) => {
                    self.health.record_ok();
                    backoff.reset();
                    loop {
                        tokio::select! {
                            _ = shutdown.recv() => {
                                tracing::info!("Backbone listener stopped");
                                return;
                            }
                            next = stream.next() => match next {
                                Some(envelope) => self.handle_envelope(envelope),
                                None => break,
                            }
                        }
                    }
                    self.health.record_err(&"subscription closed");
                }
                Err(e) => self.health.record_err(&e),
            }

            let delay = backoff.next_delay();
            tracing::debug!(attempt = backoff.attempts(), delay_ms = delay.as_millis() as u64, "Reconnecting to backbone");
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::info!("Backbone listener stopped");
    }

    /// Disconnect connections idle longer than the configured timeout.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let idle: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|c| c.value().idle_for(now) >= self.idle_timeout)
            .map(|c| *c.key())
            .collect();
        for id in &idle {
            tracing::debug!(connection = %id, "Disconnecting idle connection");
            self.disconnect(*id);
        }
        idle.len()
    }

    /// Close every connection; used on shutdown.
    pub fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|c| *c.key()).collect();
        for id in &ids {
            self.disconnect(*id);
        }
        ids.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            instance: self.instance,
            connections: self.connections.len(),
            users: self.users.len(),
            groups: self.groups.len(),
            subscriptions: self.groups.iter().map(|g| g.value().len()).sum(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            backbone: self.backbone.as_ref().map(|b| b.name()),
            backbone_degraded: self.health.is_degraded(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::backbone::MemoryBackbone;
    use serde_json::json;

    fn config() -> RealtimeConfig {
        RealtimeConfig {
            client_buffer: 4,
            idle_timeout_secs: 60,
            max_topics_per_connection: 3,
            ..RealtimeConfig::default()
        }
    }

    fn hub(backbone: Option<Arc<dyn Backbone>>) -> Arc<FanoutHub> {
        Arc::new(FanoutHub::new(&config(), backbone, Duration::from_secs(5)))
    }

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn event_of(message: &ServerMessage) -> (&Option<String>, &str) {
        match message {
            ServerMessage::Event { topic, event, .. } => (topic, event.as_str()),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_is_tenant_scoped() {
        let hub = hub(None);
        let (a, mut rx_a) = hub.register(Identity::new("alice", "tenant-a"));
        let (b, mut rx_b) = hub.register(Identity::new("bob", "tenant-b"));
        hub.subscribe(a.id(), &topics(&["orders"])).unwrap();
        hub.subscribe(b.id(), &topics(&["orders"])).unwrap();

        let delivered = hub.broadcast("tenant-a", "orders", "order.created", json!({"id": 1})).await;
        assert_eq!(delivered, 1);

        let message = rx_a.try_recv().unwrap();
        assert_eq!(event_of(&message), (&Some("orders".to_string()), "order.created"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_user_reaches_every_connection() {
        let hub = hub(None);
        let (_a1, mut rx1) = hub.register(Identity::new("alice", "t"));
        let (_a2, mut rx2) = hub.register(Identity::new("alice", "t"));
        let (_b, mut rx_b) = hub.register(Identity::new("bob", "t"));

        assert_eq!(hub.send_to_user("t", "alice", "notice", json!("hi")).await, 2);
        assert_eq!(event_of(&rx1.try_recv().unwrap()).0, &None);
        assert!(rx2.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_user_stays_within_tenant() {
        let hub = hub(None);
        let (_a, mut rx_a) = hub.register(Identity::new("admin", "tenant-a"));
        let (b, mut rx_b) = hub.register(Identity::new("admin", "tenant-b"));
        assert_eq!(hub.stats().users, 2);

        assert_eq!(hub.send_to_user("tenant-a", "admin", "account.updated", json!({"plan": "pro"})).await, 1);
        assert_eq!(event_of(&rx_a.try_recv().unwrap()).1, "account.updated");
        assert!(rx_b.try_recv().is_err());

        // envelopes from other instances are scoped the same way
        let foreign = Target::User {
            tenant_id: "tenant-c".into(),
            user_id: "admin".into(),
        };
        assert_eq!(hub.deliver_local(&foreign, "account.updated", json!(null)), 0);

        hub.disconnect(b.id());
        assert_eq!(hub.send_to_user("tenant-b", "admin", "account.updated", json!(null)).await, 0);
        assert_eq!(hub.stats().users, 1);
    }

    #[tokio::test]
    async fn test_disconnect_removes_all_memberships() {
        let hub = hub(None);
        let (a, _rx) = hub.register(Identity::new("alice", "t"));
        hub.subscribe(a.id(), &topics(&["x", "y"])).unwrap();
        assert_eq!(hub.stats().subscriptions, 2);

        assert!(hub.disconnect(a.id()));
        assert!(!hub.disconnect(a.id()));
        let stats = hub.stats();
        assert_eq!((stats.connections, stats.users, stats.groups, stats.subscriptions), (0, 0, 0, 0));
        assert_eq!(a.state(), ConnectionState::Disconnected);
        assert_eq!(
            hub.subscribe(a.id(), &topics(&["z"])),
            Err(HubError::UnknownConnection(a.id()))
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_and_topic_limit() {
        let hub = hub(None);
        let (a, mut rx) = hub.register(Identity::new("alice", "t"));
        hub.subscribe(a.id(), &topics(&["a", "b", "c"])).unwrap();
        assert_eq!(hub.subscribe(a.id(), &topics(&["d"])), Err(HubError::TooManyTopics(3)));
        // re-subscribing to held topics does not count against the limit
        assert!(hub.subscribe(a.id(), &topics(&["a"])).is_ok());
        assert!(matches!(hub.subscribe(a.id(), &topics(&[" "])), Err(HubError::InvalidTopic(_))));

        hub.unsubscribe(a.id(), &topics(&["a"])).unwrap();
        assert_eq!(a.topics(), topics(&["b", "c"]));
        assert_eq!(hub.broadcast("t", "a", "e", json!(null)).await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let hub = hub(None);
        let (a, _rx) = hub.register(Identity::new("alice", "t"));
        hub.subscribe(a.id(), &topics(&["busy"])).unwrap();
        for _ in 0..6 {
            hub.broadcast("t", "busy", "tick", json!(null)).await;
        }
        let stats = hub.stats();
        assert_eq!(stats.delivered, 4);
        assert_eq!(stats.dropped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweep() {
        let hub = hub(None);
        let (idle, _rx1) = hub.register(Identity::new("alice", "t"));
        let (active, _rx2) = hub.register(Identity::new("bob", "t"));

        tokio::time::advance(Duration::from_secs(45)).await;
        hub.touch(active.id());
        tokio::time::advance(Duration::from_secs(20)).await;

        assert_eq!(hub.sweep_idle(), 1);
        assert!(hub.get(idle.id()).is_none());
        assert!(hub.get(active.id()).is_some());
        // the socket task is woken to close
        idle.closed().await;
    }

    #[tokio::test]
    async fn test_cross_instance_delivery_over_backbone() {
        let bus = MemoryBackbone::default();
        let hub_one = hub(Some(Arc::new(bus.clone())));
        let hub_two = hub(Some(Arc::new(bus.clone())));
        let (shutdown_tx, _) = broadcast::channel(1);
        tokio::spawn(hub_one.clone().run_backbone_listener(shutdown_tx.subscribe()));
        tokio::spawn(hub_two.clone().run_backbone_listener(shutdown_tx.subscribe()));

        let (local, mut local_rx) = hub_one.register(Identity::new("alice", "acme"));
        let (remote, mut remote_rx) = hub_two.register(Identity::new("bob", "acme"));
        hub_one.subscribe(local.id(), &topics(&["orders"])).unwrap();
        hub_two.subscribe(remote.id(), &topics(&["orders"])).unwrap();

        // wait for both listeners to subscribe
        while bus_receivers(&bus) < 2 {
            tokio::task::yield_now().await;
        }

        hub_one.broadcast("acme", "orders", "order.created", json!({"id": 9})).await;

        let remote_msg = tokio::time::timeout(Duration::from_secs(1), remote_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event_of(&remote_msg).1, "order.created");

        // exactly one local copy: the origin skips its own envelope
        assert!(local_rx.try_recv().is_ok());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(local_rx.try_recv().is_err());

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_backbone_outage_falls_back_to_local() {
        let bus = MemoryBackbone::default();
        bus.set_available(false);
        let hub = hub(Some(Arc::new(bus)));
        let (a, mut rx) = hub.register(Identity::new("alice", "t"));
        hub.subscribe(a.id(), &topics(&["x"])).unwrap();

        assert_eq!(hub.broadcast("t", "x", "e", json!(1)).await, 1);
        assert!(rx.try_recv().is_ok());
        assert!(hub.stats().backbone_degraded);
    }

    fn bus_receivers(bus: &MemoryBackbone) -> usize {
        bus.receiver_count()
    }
}
