use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pickup_core::{Clock, EventPublisher, PublishError};
use pickup_shared::{EventKind, ParcelEvent, ParcelRecord};
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::app_config::KafkaConfig;

#[derive(Clone)]
pub struct EventProducer {
    producer: FutureProducer,
    app_name: String,
}

impl EventProducer {
    pub fn new(brokers: &str, app_name: &str) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self {
            producer,
            app_name: app_name.to_string(),
        })
    }

    pub async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<(), rdkafka::error::KafkaError> {
        let headers = OwnedHeaders::new().insert(Header {
            key: "app-name",
            value: Some(self.app_name.as_str()),
        });
        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload)
            .headers(headers);

        match self.producer.send(record, Timeout::After(Duration::from_secs(0))).await {
            Ok(delivery) => {
                info!(
                    topic,
                    key,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Event delivered"
                );
                Ok(())
            }
            Err((e, _msg)) => {
                error!(topic, key, error = %e, "Failed to deliver event");
                Err(e)
            }
        }
    }
}

/// Publishes lifecycle events as JSON to one Kafka topic, keyed by parcel id
pub struct KafkaEventPublisher {
    producer: EventProducer,
    topic: String,
    clock: Arc<dyn Clock>,
}

impl KafkaEventPublisher {
    pub fn new(producer: EventProducer, topic: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            producer,
            topic: topic.into(),
            clock,
        }
    }

    pub fn from_config(cfg: &KafkaConfig, clock: Arc<dyn Clock>) -> Result<Self, rdkafka::error::KafkaError> {
        let producer = EventProducer::new(&cfg.brokers, &cfg.app_name)?;
        Ok(Self::new(producer, cfg.topic.clone(), clock))
    }
}

pub(crate) fn encode_event(
    parcel: &ParcelRecord,
    kind: EventKind,
    moment: DateTime<Utc>,
) -> Result<String, PublishError> {
    serde_json::to_string(&ParcelEvent::new(parcel.clone(), kind, moment)).map_err(|source| {
        PublishError::Encode {
            parcel_id: parcel.order_id,
            kind,
            source,
        }
    })
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish(&self, parcel: &ParcelRecord, kind: EventKind) -> Result<(), PublishError> {
        let payload = encode_event(parcel, kind, self.clock.now())?;
        let key = parcel.order_id.to_string();

        self.producer
            .publish(&self.topic, &key, &payload)
            .await
            .map_err(|e| PublishError::Delivery {
                parcel_id: parcel.order_id,
                kind,
                topic: self.topic.clone(),
                source: Box::new(e),
            })
    }
}
