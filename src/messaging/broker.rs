use crate::config::{BrokerKind, MessageBrokerConfig};
use crate::error::Error;
use crate::messaging::event::EventMessage;
use anyhow::Result;
use async_trait::async_trait;
use deadpool_lapin::{Config, Manager, Pool};
use lapin::{
    options::{BasicPublishOptions, ExchangeDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, ConnectionProperties, ExchangeKind,
};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

/// Message broker service trait
#[async_trait]
pub trait MessageBrokerTrait: Send + Sync {
    /// Publish an event
    async fn publish(&self, event: EventMessage) -> Result<()>;
}

/// In-process broker. Messages fan out to every current subscriber and are
/// dropped when nobody listens.
pub struct LocalBroker {
    sender: broadcast::Sender<EventMessage>,
}

impl LocalBroker {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventMessage> {
        self.sender.subscribe()
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl MessageBrokerTrait for LocalBroker {
    async fn publish(&self, event: EventMessage) -> Result<()> {
        let routing_key = event.routing_key();
        match self.sender.send(event) {
            Ok(receivers) => debug!("Delivered {} to {} subscribers", routing_key, receivers),
            Err(_) => debug!("No subscribers for {}", routing_key),
        }
        Ok(())
    }
}

/// RabbitMQ message broker implementation
pub struct MessageBroker {
    /// Connection pool
    pool: Pool,
    config: MessageBrokerConfig,
    /// Default channel
    channel: Arc<Mutex<Option<Channel>>>,
}

impl MessageBroker {
    /// Create a new message broker
    pub async fn new(config: MessageBrokerConfig) -> Result<Self> {
        let pool_config = Config {
            url: Some(config.uri.clone()),
            pool: Some(deadpool_lapin::PoolConfig {
                max_size: config.pool_size as usize,
                queue_mode: deadpool::managed::QueueMode::Fifo,
                timeouts: deadpool::managed::Timeouts {
                    wait: Some(Duration::from_millis(config.timeout_ms)),
                    create: Some(Duration::from_millis(config.timeout_ms)),
                    recycle: Some(Duration::from_millis(config.timeout_ms)),
                },
            }),
            connection_properties: ConnectionProperties::default(),
        };
        let pool = pool_config.create_pool(Some(deadpool_lapin::Runtime::Tokio1))?;

        let broker = Self {
            pool,
            config,
            channel: Arc::new(Mutex::new(None)),
        };

        broker.init().await?;

        Ok(broker)
    }

    /// Declare the topic exchange and keep a default channel
    async fn init(&self) -> Result<()> {
        let channel = self.open_channel().await?;

        channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Service(format!("Failed to declare exchange: {}", e)))?;

        let mut default_channel = self.channel.lock().await;
        *default_channel = Some(channel);

        info!(
            "RabbitMQ message broker initialized on exchange {}",
            self.config.exchange
        );

        Ok(())
    }

    /// Get a connection from the pool with retry
    async fn get_connection(&self) -> Result<deadpool::managed::Object<Manager>> {
        let mut attempts = 0;
        let max_attempts = self.config.retry_attempts.max(1);

        loop {
            attempts += 1;
            match self.pool.get().await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    if attempts >= max_attempts {
                        return Err(Error::Service(format!(
                            "Failed to get RabbitMQ connection after {} attempts: {}",
                            attempts, err
                        ))
                        .into());
                    }

                    warn!(
                        "Failed to get RabbitMQ connection (attempt {}/{}): {}",
                        attempts, max_attempts, err
                    );

                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
            }
        }
    }

    async fn open_channel(&self) -> Result<Channel> {
        let conn = self.get_connection().await?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| Error::Service(format!("Failed to create RabbitMQ channel: {}", e)))?;
        Ok(channel)
    }

    /// Get the default channel or create a new one
    async fn get_channel(&self) -> Result<Channel> {
        let mut channel_guard = self.channel.lock().await;

        if let Some(channel) = &*channel_guard {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let channel = self.open_channel().await?;
        *channel_guard = Some(channel.clone());

        Ok(channel)
    }
}

#[async_trait]
impl MessageBrokerTrait for MessageBroker {
    async fn publish(&self, event: EventMessage) -> Result<()> {
        let message = serde_json::to_vec(&event)?;
        let channel = self.get_channel().await?;
        let routing_key = event.routing_key();

        channel
            .basic_publish(
                &self.config.exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &message,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| Error::Service(format!("Failed to publish message: {}", e)))?;

        debug!(
            "Published event: {} with routing key: {}",
            event.id, routing_key
        );

        Ok(())
    }
}

/// Create the message broker selected by configuration
pub async fn create_message_broker(
    config: MessageBrokerConfig,
) -> Result<Arc<dyn MessageBrokerTrait>> {
    match config.kind {
        BrokerKind::Local => {
            info!("Using in-process message broker");
            Ok(Arc::new(LocalBroker::default()))
        }
        BrokerKind::Rabbitmq => {
            let broker = MessageBroker::new(config).await?;
            Ok(Arc::new(broker))
        }
    }
}
