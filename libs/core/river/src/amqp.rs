//! AMQP 0.9.1 transport backend over `lapin`.

use crate::transport::{
    Channel, Delivery, QueueArguments, Session, Transport, TransportError,
};
use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicPublishOptions, BasicQosOptions, BasicRejectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};

const CLOSE_REPLY_CODE: u16 = 200;

fn map_lapin(error: lapin::Error) -> TransportError {
    use lapin::Error;
    match &error {
        Error::IOError(_)
        | Error::InvalidConnectionState(_)
        | Error::InvalidChannelState(_) => TransportError::connection(error.to_string()),
        Error::ProtocolError(_) => TransportError::protocol(error.to_string()),
        _ => TransportError::broker(error.to_string()),
    }
}

/// Transport backed by a real AMQP broker.
#[derive(Clone, Debug, Default)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    type Session = AmqpSession;
    type Channel = AmqpChannel;

    async fn open(&self, url: &str) -> Result<AmqpSession, TransportError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(map_lapin)?;
        Ok(AmqpSession { connection })
    }
}

pub struct AmqpSession {
    connection: Connection,
}

#[async_trait]
impl Session for AmqpSession {
    type Channel = AmqpChannel;

    async fn create_channel(&self, prefetch: Option<u16>) -> Result<AmqpChannel, TransportError> {
        let channel = self.connection.create_channel().await.map_err(map_lapin)?;
        if let Some(prefetch) = prefetch {
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(map_lapin)?;
        }
        Ok(AmqpChannel { inner: channel })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connection
            .close(CLOSE_REPLY_CODE, "closing")
            .await
            .map_err(map_lapin)
    }
}

#[derive(Clone)]
pub struct AmqpChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_exchange(&self, name: &str) -> Result<(), TransportError> {
        self.inner
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin)
    }

    async fn declare_queue(
        &self,
        name: &str,
        arguments: &QueueArguments,
    ) -> Result<(), TransportError> {
        let mut table = FieldTable::default();
        if let Some(ttl) = arguments.message_ttl {
            table.insert(
                "x-message-ttl".into(),
                AMQPValue::LongLongInt(ttl.as_millis() as i64),
            );
        }
        if let Some(exchange) = &arguments.dead_letter_exchange {
            table.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(exchange.clone().into()),
            );
        }
        if let Some(key) = &arguments.dead_letter_routing_key {
            table.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(key.clone().into()),
            );
        }
        self.inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                table,
            )
            .await
            .map_err(map_lapin)?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        persistent: bool,
    ) -> Result<(), TransportError> {
        let delivery_mode = if persistent { 2 } else { 1 };
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(delivery_mode);
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(map_lapin)?
            .await
            .map_err(map_lapin)?;
        Ok(())
    }

    async fn poll(&self, queue: &str) -> Result<Option<Delivery>, TransportError> {
        let message = self
            .inner
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(map_lapin)?;
        Ok(message.map(|message| Delivery {
            delivery_tag: message.delivery.delivery_tag,
            routing_key: message.delivery.routing_key.as_str().to_string(),
            payload: message.delivery.data,
        }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(map_lapin)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(map_lapin)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner
            .close(CLOSE_REPLY_CODE, "closing")
            .await
            .map_err(map_lapin)
    }
}

// Exercising this backend needs a running broker; the crate's own test
// suite runs against the in-memory transport instead.
