// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process publish/subscribe bus.
//!
//! Each subscriber owns a bounded queue. `publish` resolves once every
//! subscriber of the event's topic has accepted the event into its queue,
//! so per-topic ordering is FIFO for every subscriber. A subscriber whose
//! queue has been dropped is logged and pruned; it never blocks the
//! publisher.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::NaiveDate;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::model::{PlanStatus, SensorData, SensorStatus};

/// Default queue depth for a subscriber.
pub const DEFAULT_CAPACITY: usize = 256;

/// Event kinds a subscriber can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    SensorDataArrived,
    SensorStatusChanged,
    TreeCreated,
    TreeUpdated,
    TreeDeleted,
    WateringPlanUpdated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    SensorDataArrived {
        sensor_id: String,
        data: SensorData,
    },
    SensorStatusChanged {
        sensor_id: String,
        old_status: SensorStatus,
        new_status: SensorStatus,
    },
    TreeCreated {
        id: i32,
    },
    TreeUpdated {
        id: i32,
        old_cluster_id: Option<i32>,
        new_cluster_id: Option<i32>,
    },
    TreeDeleted {
        id: i32,
        cluster_id: Option<i32>,
    },
    WateringPlanUpdated {
        id: i32,
        date: NaiveDate,
        old_status: PlanStatus,
        new_status: PlanStatus,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::SensorDataArrived { .. } => Topic::SensorDataArrived,
            Event::SensorStatusChanged { .. } => Topic::SensorStatusChanged,
            Event::TreeCreated { .. } => Topic::TreeCreated,
            Event::TreeUpdated { .. } => Topic::TreeUpdated,
            Event::TreeDeleted { .. } => Topic::TreeDeleted,
            Event::WateringPlanUpdated { .. } => Topic::WateringPlanUpdated,
        }
    }
}

#[derive(Debug, Clone)]
struct Subscriber {
    name: Arc<str>,
    tx: mpsc::Sender<Event>,
}

/// Cloneable handle to the bus.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    topics: Arc<RwLock<HashMap<Topic, Vec<Subscriber>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named subscriber for the given topics.
    pub fn subscribe(&self, name: &str, topics: &[Topic]) -> mpsc::Receiver<Event> {
        self.subscribe_with_capacity(name, topics, DEFAULT_CAPACITY)
    }

    pub fn subscribe_with_capacity(
        &self,
        name: &str,
        topics: &[Topic],
        capacity: usize,
    ) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let subscriber = Subscriber {
            name: Arc::from(name),
            tx,
        };
        match self.topics.write() {
            Ok(mut map) => {
                for topic in topics {
                    map.entry(*topic).or_default().push(subscriber.clone());
                }
            }
            Err(_) => warn!(subscriber = name, "Event bus registry poisoned"),
        }
        rx
    }

    /// Number of live subscribers for a topic.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topics
            .read()
            .map(|map| map.get(&topic).map_or(0, |subs| subs.len()))
            .unwrap_or(0)
    }

    /// Deliver an event to every subscriber of its topic.
    ///
    /// Returns the number of subscribers that accepted the event.
    pub async fn publish(&self, event: Event) -> usize {
        let topic = event.topic();
        let subscribers = match self.topics.read() {
            Ok(map) => map.get(&topic).cloned().unwrap_or_default(),
            Err(_) => {
                warn!(?topic, "Event bus registry poisoned, dropping event");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for subscriber in &subscribers {
            match subscriber.tx.send(event.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => {
                    warn!(
                        subscriber = %subscriber.name,
                        ?topic,
                        "Subscriber queue closed, removing subscriber"
                    );
                    closed.push(subscriber.name.clone());
                }
            }
        }

        if !closed.is_empty() {
            self.prune(topic);
        }
        debug!(?topic, delivered, "Published event");
        delivered
    }

    fn prune(&self, topic: Topic) {
        if let Ok(mut map) = self.topics.write() {
            if let Some(subs) = map.get_mut(&topic) {
                subs.retain(|s| !s.tx.is_closed());
            }
        }
    }
}
