use crate::consumers::orders_consumer;
use crate::helpers::{connected_broker, eventually, InMemoryBroker, Settlement};
use burrow::amqp::convenience::BasicPropertiesExt;
use burrow::amqp::types::AMQPValue;
use burrow::consumers::IncomingMessage;
use burrow::publishers::{OutgoingMessage, PublishOptions, PublisherSpec};
use burrow::topology::{ExchangeDeclaration, ExchangeKind};
use burrow::Error;
use std::time::{Duration, Instant};

fn orders_publisher() -> PublisherSpec {
    PublisherSpec::builder("orders.x")
        .exchange_kind(ExchangeKind::Topic)
        .exchange_declaration(ExchangeDeclaration::durable())
        .default_routing_key("orders.created")
        .build()
}

#[tokio::test]
async fn published_messages_reach_bound_consumers() {
    // Arrange
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let publisher = broker.register_publisher(orders_publisher()).unwrap();
    broker
        .register_consumer(orders_consumer(|message: IncomingMessage| async move {
            assert_eq!(
                message.properties().get_header_str("tenant").as_deref(),
                Some("acme")
            );
            assert!(message.properties().message_id().is_some());
            Ok(())
        }))
        .unwrap();
    broker.start().await.unwrap();
    assert!(publisher.is_active());

    // Act
    publisher
        .publish(
            OutgoingMessage::new(r#"{"id": 7}"#)
                .with_header("tenant", AMQPValue::LongString("acme".into())),
            None,
        )
        .await
        .unwrap();

    // Assert
    eventually(|| !transport.settlements().is_empty()).await;
    assert_eq!(
        transport.settlements(),
        vec![(r#"{"id": 7}"#.to_owned(), Settlement::Ack)]
    );
    let (exchange, routing_key, properties) = transport.published().remove(0);
    assert_eq!(exchange, "orders.x");
    assert_eq!(routing_key, "orders.created");
    assert_eq!(*properties.delivery_mode(), Some(2));
    assert!(properties.timestamp().is_some());
}

#[tokio::test]
async fn unroutable_messages_are_reported() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let publisher = broker.register_publisher(orders_publisher()).unwrap();
    broker.start().await.unwrap();

    let outcome = publisher
        .publish(OutgoingMessage::new("nobody listens"), Some("orders.lost"))
        .await;

    assert!(matches!(
        outcome,
        Err(Error::Unroutable {
            reply_code: 312,
            ..
        })
    ));
}

#[tokio::test]
async fn unroutable_messages_are_dropped_silently_when_not_mandatory() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let publisher = broker.register_publisher(orders_publisher()).unwrap();
    broker.start().await.unwrap();

    publisher
        .publish_with_options(
            OutgoingMessage::new("nobody listens"),
            Some("orders.lost"),
            PublishOptions {
                mandatory: false,
                immediate: false,
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn publishing_without_any_routing_key_fails_before_touching_the_network() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let publisher = broker
        .register_publisher(PublisherSpec::builder("audit.x").build())
        .unwrap();
    broker.start().await.unwrap();

    let outcome = publisher.publish(OutgoingMessage::new("audit"), None).await;

    assert!(matches!(outcome, Err(Error::Configuration(_))));
    assert!(transport.published().is_empty());
}

#[tokio::test]
async fn starting_a_publisher_twice_reuses_its_channel() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let publisher = broker.register_publisher(orders_publisher()).unwrap();
    let connection = broker.connection().unwrap();

    publisher.start(connection.as_ref()).await.unwrap();
    publisher.start(connection.as_ref()).await.unwrap();

    assert_eq!(transport.open_channels(), 1);
    assert_eq!(transport.declarations(), vec!["exchange orders.x topic"]);
}

#[tokio::test]
async fn publishing_after_the_connection_is_lost_fails_fast() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let publisher = broker.register_publisher(orders_publisher()).unwrap();
    publisher
        .start(broker.connection().unwrap().as_ref())
        .await
        .unwrap();

    transport.kill_connection();
    let outcome = publisher.publish(OutgoingMessage::new("late"), None).await;

    assert!(matches!(outcome, Err(Error::ConnectionLost)));
    assert!(!publisher.is_active());
}

#[tokio::test]
async fn a_publisher_swaps_its_dead_channel_for_a_new_one() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let publisher = broker.register_publisher(orders_publisher()).unwrap();
    publisher
        .start(broker.connection().unwrap().as_ref())
        .await
        .unwrap();
    transport.kill_connection();
    broker.connect(Duration::from_secs(1)).await.unwrap();

    // Closing the dead channel fails, which does not prevent the restart.
    publisher
        .start(broker.connection().unwrap().as_ref())
        .await
        .unwrap();

    assert!(publisher.is_active());
    assert_eq!(transport.open_channels(), 1);
    publisher
        .publish_with_options(
            OutgoingMessage::new("on the new channel"),
            None,
            PublishOptions {
                mandatory: false,
                immediate: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(transport.published().len(), 1);
}

#[tokio::test]
async fn publishing_gives_up_after_the_publish_timeout() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let publisher = broker
        .register_publisher(
            PublisherSpec::builder("orders.x")
                .default_routing_key("orders.created")
                .publish_timeout(Duration::from_millis(100))
                .build(),
        )
        .unwrap();
    broker.start().await.unwrap();
    transport.hang_publishes();

    let started_at = Instant::now();
    let outcome = publisher.publish(OutgoingMessage::new("stuck"), None).await;

    assert!(matches!(outcome, Err(Error::PublishTimeout)));
    assert!(started_at.elapsed() < Duration::from_secs(1));
    assert!(transport.published().is_empty());
}

#[tokio::test]
async fn a_passive_declaration_of_a_missing_exchange_fails_to_start() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    broker
        .register_publisher(
            PublisherSpec::builder("legacy.x")
                .exchange_declaration(ExchangeDeclaration::passive())
                .default_routing_key("legacy")
                .build(),
        )
        .unwrap();

    let outcome = broker.start().await;

    assert!(matches!(
        outcome,
        Err(Error::Declaration {
            object: "exchange",
            ..
        })
    ));
    assert_eq!(transport.open_channels(), 0);
    // The broker was not started: it can be retried.
    assert!(matches!(
        broker.start().await,
        Err(Error::Declaration { .. })
    ));
}
