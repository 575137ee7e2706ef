//! Fire-and-forget notification dispatch through a transactional outbox.
//! Handlers insert rows in the same transaction as the business mutation;
//! a background worker drains unpublished rows to Kafka. Delivery is
//! at-least-once; consumers key on the notification id.

use crate::models::{NewNotification, Notification};
use crate::schema::notifications;
use anyhow::Result;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection, RunQueryDsl};
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tokio::time;
use tracing::{error, info};
use uuid::Uuid;

type DbPool = Pool<AsyncPgConnection>;

/// Queue a notification inside the caller's transaction.
pub async fn enqueue(
    conn: &mut AsyncPgConnection,
    user_id: Uuid,
    kind: &str,
    title: &str,
    body: String,
    data: serde_json::Value,
) -> Result<(), diesel::result::Error> {
    let row = NewNotification {
        id: Uuid::new_v4(),
        user_id,
        kind: kind.to_string(),
        title: title.to_string(),
        body,
        data,
    };
    diesel::insert_into(notifications::table)
        .values(&row)
        .execute(conn)
        .await?;
    Ok(())
}

pub struct NotificationPublisher {
    pool: DbPool,
    producer: FutureProducer,
    topic: String,
}

impl NotificationPublisher {
    pub fn new(pool: DbPool, producer: FutureProducer, topic: String) -> Self {
        Self {
            pool,
            producer,
            topic,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;

            if let Err(e) = self.publish_pending().await {
                error!("Error publishing notifications: {}", e);
            }
        }
    }

    async fn publish_pending(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;

        let pending = notifications::table
            .filter(notifications::published.eq(false))
            .order(notifications::created_at.asc())
            .limit(100)
            .load::<Notification>(&mut conn)
            .await?;

        for notification in pending {
            if let Err(e) = self.publish(&notification).await {
                error!("Failed to publish notification {}: {}", notification.id, e);
                continue;
            }

            diesel::update(notifications::table.filter(notifications::id.eq(notification.id)))
                .set(notifications::published.eq(true))
                .execute(&mut conn)
                .await?;

            info!("Published notification: {}", notification.id);
        }

        Ok(())
    }

    async fn publish(&self, notification: &Notification) -> Result<()> {
        let json = serde_json::to_string(notification)?;
        let key = notification.user_id.to_string();
        let record = FutureRecord::to(&self.topic).payload(&json).key(&key);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to publish notification: {}", e))?;

        Ok(())
    }
}
