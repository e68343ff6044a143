//! [`lapin`]-backed implementation of the transport traits.
use super::{
    Acker, Channel, Confirmation, Connection, Delivery, DeliveryStream, PublishOptions,
    TransportError,
};
use crate::topology::{ExchangeDeclaration, ExchangeKind, QueueDeclaration};
use amq_protocol_types::FieldTable;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm, BasicProperties,
};
use std::sync::Arc;

// AMQP reply code for a clean shutdown.
const REPLY_SUCCESS: u16 = 200;

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::InvalidChannel(_) => Self::Closed,
            lapin::Error::IOError(e) => Self::Io(anyhow::anyhow!(e)),
            lapin::Error::ProtocolError(e) => Self::Refused(e.to_string()),
            err => Self::Other(err.into()),
        }
    }
}

pub(crate) fn lapin_connection(connection: lapin::Connection) -> Arc<dyn Connection> {
    Arc::new(LapinConnection(connection))
}

struct LapinConnection(lapin::Connection);

#[async_trait::async_trait]
impl Connection for LapinConnection {
    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let channel = self.0.create_channel().await?;
        Ok(Arc::new(LapinChannel(channel)))
    }

    fn is_connected(&self) -> bool {
        self.0.status().connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.0.close(REPLY_SUCCESS, "Bye").await?;
        Ok(())
    }
}

struct LapinChannel(lapin::Channel);

#[async_trait::async_trait]
impl Channel for LapinChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        self.0
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), TransportError> {
        // See https://www.rabbitmq.com/amqp-0-9-1-reference.html#confirm.select.nowait
        self.0
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_declare_exchange", skip(self, declaration))]
    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: &ExchangeKind,
        declaration: &ExchangeDeclaration,
    ) -> Result<(), TransportError> {
        let options = ExchangeDeclareOptions {
            passive: declaration.passive,
            durable: declaration.durable,
            auto_delete: declaration.auto_delete,
            internal: declaration.internal,
            nowait: false,
        };
        self.0
            .exchange_declare(
                exchange,
                kind.clone().into(),
                options,
                declaration.arguments.clone(),
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_declare_queue", skip(self, declaration))]
    async fn queue_declare(
        &self,
        queue: &str,
        declaration: &QueueDeclaration,
    ) -> Result<String, TransportError> {
        let options = QueueDeclareOptions {
            passive: declaration.passive,
            durable: declaration.durable,
            exclusive: declaration.exclusive,
            auto_delete: declaration.auto_delete,
            nowait: false,
        };
        let queue = self
            .0
            .queue_declare(queue, options, declaration.arguments.clone())
            .await?;
        Ok(queue.name().to_string())
    }

    #[tracing::instrument(name = "rabbitmq_bind_queue", skip(self))]
    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.0
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, payload, properties))]
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<Confirmation, TransportError> {
        let options = BasicPublishOptions {
            mandatory: options.mandatory,
            immediate: options.immediate,
        };
        let confirm = self
            .0
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await?
            .await?;

        Ok(match confirm {
            publisher_confirm::Confirmation::Ack(None) => Confirmation::Ack,
            publisher_confirm::Confirmation::Ack(Some(returned)) => Confirmation::Returned {
                reply_code: returned.reply_code,
                reply_text: returned.reply_text.to_string(),
            },
            publisher_confirm::Confirmation::Nack(_) => Confirmation::Nack,
            publisher_confirm::Confirmation::NotRequested => Confirmation::NotRequested,
        })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
        arguments: FieldTable,
    ) -> Result<DeliveryStream, TransportError> {
        let options = BasicConsumeOptions {
            no_ack,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .0
            .basic_consume(queue, consumer_tag, options, arguments)
            .await?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|delivery| Delivery {
                        delivery_tag: delivery.delivery_tag,
                        exchange: delivery.exchange,
                        routing_key: delivery.routing_key,
                        redelivered: delivery.redelivered,
                        properties: delivery.properties,
                        data: delivery.data,
                        acker: Box::new(LapinAcker(delivery.acker)),
                    })
                    .map_err(TransportError::from)
            })
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.0
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.0.status().connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.0.close(REPLY_SUCCESS, "Bye").await?;
        Ok(())
    }
}

struct LapinAcker(lapin::acker::Acker);

#[async_trait::async_trait]
impl Acker for LapinAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.0.ack(BasicAckOptions { multiple: false }).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.0.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}
