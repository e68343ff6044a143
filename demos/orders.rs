use burrow::amqp::configuration::RabbitMqSettings;
use burrow::consumers::hooks::transient_error::AlwaysRequeue;
use burrow::consumers::{ConsumerSpec, HandlerError, IncomingMessage, StopOptions};
use burrow::publishers::{OutgoingMessage, PublisherSpec};
use burrow::topology::{ExchangeDeclaration, ExchangeKind, QueueDeclaration};
use burrow::Broker;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // First of all we build the configuration for our broker.
    // We are using the out-of-the-box parameters for the default RabbitMq Docker image.
    let settings = RabbitMqSettings::default();
    let broker = Broker::from_settings(&settings)?;

    // Registration performs no I/O: we describe what we want, the broker declares it on `start`.
    //
    // Our consumer owns the durable `orders.q` queue, bound to the durable `orders.x` topic
    // exchange with the `orders.created` routing key.
    // At most 10 messages are processed concurrently.
    let consumer = broker.register_consumer(
        ConsumerSpec::builder("orders.q", "orders.x")
            .exchange_kind(ExchangeKind::Topic)
            .exchange_declaration(ExchangeDeclaration::durable())
            .queue_declaration(QueueDeclaration::durable())
            .routing_key("orders.created")
            .prefetch_count(10)
            // Failed messages end up in `orders.q.deadletter` instead of being discarded.
            .with_dead_letter_queue()
            .handler(handle_order),
    )?;

    // A second consumer on the same exchange, requeueing messages that fail transiently.
    broker.register_consumer(
        ConsumerSpec::builder("orders.audit.q", "orders.x")
            .exchange_kind(ExchangeKind::Topic)
            .exchange_declaration(ExchangeDeclaration::durable())
            .routing_key("#")
            .transient_error_hook(AlwaysRequeue)
            .handler(|message: IncomingMessage| async move {
                println!("[audit] {}", message.routing_key());
                Ok::<_, HandlerError>(())
            }),
    )?;

    // Publishers own an exchange as well. The declaration must match the consumers' one.
    let publisher = broker.register_publisher(
        PublisherSpec::builder("orders.x")
            .exchange_kind(ExchangeKind::Topic)
            .exchange_declaration(ExchangeDeclaration::durable())
            .default_routing_key("orders.created")
            .build(),
    )?;

    // The connection attempt is retried while RabbitMq is unreachable, up to the timeout.
    broker.connect(settings.connection_timeout()).await?;
    // Exchanges, queues and bindings are declared here, then consumers start pulling messages.
    broker.start().await?;
    println!("`orders.q` is {:?}", consumer.state());

    for id in 0..3 {
        publisher
            .publish(
                OutgoingMessage::new(format!(r#"{{"id": {id}}}"#))
                    .with_content_type("application/json"),
                None,
            )
            .await?;
    }

    tokio::time::sleep(Duration::from_secs(1)).await;

    // Stop pulling messages, give in-flight ones up to 5 seconds to complete, then close.
    // In a long-running service you would use `broker.run_until_sigterm(..)` instead.
    broker
        .stop(StopOptions::with_timeout(Duration::from_secs(5)))
        .await;
    broker.close().await?;
    Ok(())
}

async fn handle_order(message: IncomingMessage) -> Result<(), HandlerError> {
    let order: serde_json::Value = serde_json::from_slice(message.body())
        // Retrying will not fix a malformed payload.
        .map_err(HandlerError::fatal)?;
    println!("[orders] {order}");
    Ok(())
}
