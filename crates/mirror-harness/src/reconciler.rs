// Copyright (c) The Mirror Developers
// SPDX-License-Identifier: Apache-2.0

//! Expected-state reconciliation from the journal's statistics topic.
//!
//! The statistics producer appends one terminal [`OriginStats`] record per
//! origin per run, keyed by origin URL. A fresh consumer group drains the
//! topic from the earliest retained offset, tracking per-partition
//! end-of-stream markers, and returns the resulting origin map as ground
//! truth for the walker's independently computed counts.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::executor::block_on;
use rdkafka::{
    admin::{AdminClient, AdminOptions},
    client::DefaultClientContext,
    config::ClientConfig,
    consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance},
    error::KafkaError,
    ClientContext, Message,
};
use tracing::{debug, info, warn};

use crate::{
    error::{ReconcileError, ReconcileResult},
    model::OriginStats,
};

/// How long one poll cycle may wait before it is considered idle.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for the journal broker.
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub broker: String,
    pub username: String,
    pub password: String,
}

impl KafkaSettings {
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.broker)
            .set("sasl.username", &self.username)
            .set("sasl.password", &self.password)
            .set("security.protocol", "sasl_ssl")
            .set("sasl.mechanism", "SCRAM-SHA-512")
            .set("session.timeout.ms", "600000")
            .set("max.poll.interval.ms", "3600000")
            .set("message.max.bytes", "1000000000");
        config
    }
}

/// One abstract event of the drain loop.
///
/// Keeping the loop pure over these events makes the partition-EOF state
/// machine testable without a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// Partitions were (re)assigned to the consumer.
    Assigned(Vec<i32>),
    /// A data record: origin key plus its packed statistics record.
    Record {
        partition: i32,
        key: String,
        value: OriginStats,
    },
    /// A partition reported end of stream.
    PartitionEof(i32),
    /// A poll cycle elapsed without any message.
    Idle,
}

/// Drains `events` until every assigned partition has reported end of
/// stream, building the origin-to-stats map.
///
/// Termination: a partition-EOF that empties the pending set ends the drain,
/// as does an idle cycle with an empty pending set during which no partition
/// was newly assigned. The first idle cycle is always given grace so the
/// drain cannot end before assignment had a chance to complete.
///
/// Every record's key must equal its value's embedded origin; a mismatch is
/// a producer bug and fails the drain.
pub fn drain<I>(events: I) -> ReconcileResult<BTreeMap<String, OriginStats>>
where
    I: IntoIterator<Item = ReconcileResult<LogEvent>>,
{
    let mut stats = BTreeMap::new();
    let mut pending: BTreeSet<i32> = BTreeSet::new();
    let mut assignment_seen = false;
    let mut newly_assigned = true;

    for event in events {
        match event? {
            LogEvent::Assigned(partitions) => {
                debug!(?partitions, "partitions assigned");
                pending.extend(partitions);
                assignment_seen = true;
                newly_assigned = true;
            }
            LogEvent::Record {
                partition,
                key,
                value,
            } => {
                debug!(partition, %key, "stats record");
                if key != value.origin {
                    return Err(ReconcileError::OriginKeyMismatch {
                        key,
                        origin: value.origin,
                    });
                }
                // Last write wins: the topic carries one terminal record per
                // origin per run.
                stats.insert(key, value);
            }
            LogEvent::PartitionEof(partition) => {
                pending.remove(&partition);
                if assignment_seen && pending.is_empty() {
                    break;
                }
            }
            LogEvent::Idle => {
                if pending.is_empty() && !newly_assigned {
                    break;
                }
                newly_assigned = false;
            }
        }
    }
    Ok(stats)
}

/// Consumer context recording partition assignments for the drain loop.
struct AssignmentContext {
    assigned: Arc<Mutex<Vec<i32>>>,
}

impl ClientContext for AssignmentContext {}

impl ConsumerContext for AssignmentContext {
    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(partitions) = rebalance {
            let mut assigned = self.assigned.lock().expect("no poisoned lock");
            assigned.extend(partitions.elements().iter().map(|e| e.partition()));
        }
    }
}

/// A blocking consumer of the statistics topic.
pub struct StatsConsumer {
    consumer: BaseConsumer<AssignmentContext>,
    assigned: Arc<Mutex<Vec<i32>>>,
    topic: String,
}

impl StatsConsumer {
    /// Subscribes to `topic` as a fresh consumer group named `group_id`.
    ///
    /// The group id must be unique per run: offsets committed by an earlier
    /// run would otherwise hide records from this one.
    pub fn new(settings: &KafkaSettings, group_id: &str, topic: &str) -> ReconcileResult<Self> {
        let assigned = Arc::new(Mutex::new(Vec::new()));
        let context = AssignmentContext {
            assigned: Arc::clone(&assigned),
        };
        let consumer: BaseConsumer<AssignmentContext> = settings
            .client_config()
            .set("group.id", group_id)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "true")
            .set("enable.partition.eof", "true")
            .create_with_context(context)?;
        consumer.subscribe(&[topic])?;
        Ok(Self {
            consumer,
            assigned,
            topic: topic.to_owned(),
        })
    }

    /// Drains the topic to its logical end and returns the origin map.
    pub fn expected_stats(self) -> ReconcileResult<BTreeMap<String, OriginStats>> {
        info!(topic = %self.topic, "draining expected statistics");
        let events = std::iter::from_fn(|| Some(self.next_event()));
        let stats = drain(events)?;
        self.consumer.unsubscribe();
        info!(origins = stats.len(), "expected statistics drained");
        Ok(stats)
    }

    fn next_event(&self) -> ReconcileResult<LogEvent> {
        let newly_assigned: Vec<i32> = {
            let mut assigned = self.assigned.lock().expect("no poisoned lock");
            std::mem::take(&mut *assigned)
        };
        if !newly_assigned.is_empty() {
            return Ok(LogEvent::Assigned(newly_assigned));
        }

        match self.consumer.poll(POLL_TIMEOUT) {
            None => Ok(LogEvent::Idle),
            Some(Err(KafkaError::PartitionEOF(partition))) => {
                Ok(LogEvent::PartitionEof(partition))
            }
            Some(Err(err)) => Err(err.into()),
            Some(Ok(message)) => {
                let key_bytes =
                    message
                        .key()
                        .ok_or_else(|| ReconcileError::EmptyRecord {
                            topic: message.topic().to_owned(),
                            partition: message.partition(),
                            offset: message.offset(),
                            field: "key",
                        })?;
                let payload =
                    message
                        .payload()
                        .ok_or_else(|| ReconcileError::EmptyRecord {
                            topic: message.topic().to_owned(),
                            partition: message.partition(),
                            offset: message.offset(),
                            field: "value",
                        })?;
                let key: String = rmp_serde::from_slice(key_bytes)?;
                let value: OriginStats = rmp_serde::from_slice(payload)?;
                debug!(
                    topic = message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    %key,
                    "received stats record"
                );
                Ok(LogEvent::Record {
                    partition: message.partition(),
                    key,
                    value,
                })
            }
        }
    }
}

/// Deletes every consumer group whose name starts with `prefix`.
///
/// Best effort: intended for end-of-run cleanup of the groups created under
/// this run's unique prefix, so brokers do not accumulate stale groups.
pub fn purge_consumer_groups(settings: &KafkaSettings, prefix: &str) -> ReconcileResult<()> {
    let admin: AdminClient<DefaultClientContext> = settings.client_config().create()?;
    let groups = admin
        .inner()
        .fetch_group_list(None, POLL_TIMEOUT)?
        .groups()
        .iter()
        .map(|group| group.name().to_owned())
        .filter(|name| name.starts_with(prefix))
        .collect::<Vec<_>>();
    if groups.is_empty() {
        return Ok(());
    }
    info!(?groups, "deleting consumer groups");
    let names: Vec<&str> = groups.iter().map(String::as_str).collect();
    let results = block_on(admin.delete_groups(&names, &AdminOptions::new()))?;
    for result in results {
        if let Err((group, error)) = result {
            warn!(%group, %error, "failed to delete consumer group");
        }
    }
    Ok(())
}
