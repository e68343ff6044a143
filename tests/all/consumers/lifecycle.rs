use super::orders_consumer;
use crate::helpers::{connected_broker, eventually, InMemoryBroker, Settlement};
use burrow::consumers::{ConsumerSpec, ConsumerState, HandlerError, IncomingMessage, StopOptions};
use burrow::topology::QueueDeclaration;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn a_published_message_is_handled_once_and_acked() {
    // Arrange
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let consumer = broker
        .register_consumer(orders_consumer({
            let calls = Arc::clone(&calls);
            move |message: IncomingMessage| {
                let calls = Arc::clone(&calls);
                async move {
                    assert_eq!(message.routing_key(), "orders.created");
                    assert_eq!(message.exchange(), "orders.x");
                    assert_eq!(message.queue_name(), "orders.q");
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        }))
        .unwrap();
    assert_eq!(consumer.state(), ConsumerState::Registered);

    // Act
    broker.start().await.unwrap();
    transport.inject("orders.x", "orders.created", r#"{"id": 42}"#);

    // Assert
    eventually(|| !transport.settlements().is_empty()).await;
    assert_eq!(consumer.state(), ConsumerState::Consuming);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        transport.settlements(),
        vec![(r#"{"id": 42}"#.to_owned(), Settlement::Ack)]
    );
    assert_eq!(transport.qos(), vec![10]);
    assert_eq!(
        transport.declarations(),
        vec![
            "exchange orders.x topic",
            "queue orders.q",
            "bind orders.q orders.x orders.created",
        ]
    );
}

#[tokio::test]
async fn messages_routed_elsewhere_are_not_delivered() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    broker
        .register_consumer(orders_consumer(|_| async { Ok(()) }))
        .unwrap();
    broker.start().await.unwrap();

    transport.inject("orders.x", "orders.cancelled", "ignored");
    transport.inject("orders.x", "orders.created", "handled");

    eventually(|| !transport.settlements().is_empty()).await;
    assert_eq!(
        transport.settlements(),
        vec![("handled".to_owned(), Settlement::Ack)]
    );
}

#[tokio::test]
async fn the_routing_key_defaults_to_the_exchange_name() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    broker
        .register_consumer(
            ConsumerSpec::builder("audit.q", "audit").handler(|_| async {
                Ok::<_, HandlerError>(())
            }),
        )
        .unwrap();

    broker.start().await.unwrap();

    assert!(transport
        .declarations()
        .contains(&"bind audit.q audit audit".to_owned()));
}

#[tokio::test]
async fn the_broker_names_queues_registered_without_a_name() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let consumer = broker
        .register_consumer(
            ConsumerSpec::builder("", "notifications")
                .queue_declaration(QueueDeclaration::default().exclusive())
                .handler(|message: IncomingMessage| async move {
                    assert_eq!(message.queue_name(), "amq.gen-1");
                    Ok::<_, HandlerError>(())
                }),
        )
        .unwrap();

    broker.start().await.unwrap();
    transport.inject("notifications", "notifications", "ping");

    eventually(|| !transport.settlements().is_empty()).await;
    assert_eq!(consumer.state(), ConsumerState::Consuming);
    assert_eq!(
        transport.settlements(),
        vec![("ping".to_owned(), Settlement::Ack)]
    );
}

#[tokio::test]
async fn a_consumer_goes_through_all_states_and_can_be_restarted() {
    // Arrange
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let consumer = broker
        .register_consumer(orders_consumer(|_| async { Ok(()) }))
        .unwrap();
    let mut states = consumer.watch_state();
    let connection = broker.connection().unwrap();

    // Act
    consumer.start(connection.as_ref()).await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConsumerState::Consuming);
    consumer.stop(StopOptions::default()).await;
    assert_eq!(*states.borrow_and_update(), ConsumerState::Stopped);
    assert!(!transport.has_subscriber("orders.q"));
    assert_eq!(transport.open_channels(), 0);

    consumer.start(connection.as_ref()).await.unwrap();
    transport.inject("orders.x", "orders.created", "after restart");

    // Assert
    assert_eq!(consumer.state(), ConsumerState::Consuming);
    eventually(|| !transport.settlements().is_empty()).await;
    assert_eq!(
        transport.settlements(),
        vec![("after restart".to_owned(), Settlement::Ack)]
    );
}

#[tokio::test]
async fn starting_a_consuming_consumer_is_a_no_op() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let consumer = broker
        .register_consumer(orders_consumer(|_| async { Ok(()) }))
        .unwrap();
    let connection = broker.connection().unwrap();

    consumer.start(connection.as_ref()).await.unwrap();
    consumer.start(connection.as_ref()).await.unwrap();

    assert_eq!(consumer.state(), ConsumerState::Consuming);
    assert_eq!(transport.open_channels(), 1);
}

#[tokio::test]
async fn stopping_twice_is_a_no_op() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let consumer = broker
        .register_consumer(orders_consumer(|_| async { Ok(()) }))
        .unwrap();

    // Never started
    consumer.stop(StopOptions::default()).await;
    assert_eq!(consumer.state(), ConsumerState::Registered);

    broker.start().await.unwrap();
    consumer.stop(StopOptions::default()).await;
    consumer.stop(StopOptions::nowait()).await;
    assert_eq!(consumer.state(), ConsumerState::Stopped);
}

#[tokio::test]
async fn stop_waits_for_in_flight_messages_by_default() {
    // Arrange
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let consumer = broker
        .register_consumer(orders_consumer(|_| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }))
        .unwrap();
    broker.start().await.unwrap();
    transport.inject("orders.x", "orders.created", "slow");
    eventually(|| transport.pending("orders.q") == 0).await;
    // Give the loop a chance to hand the message over.
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Act
    consumer.stop(StopOptions::default()).await;

    // Assert
    assert_eq!(consumer.state(), ConsumerState::Stopped);
    assert_eq!(
        transport.settlements(),
        vec![("slow".to_owned(), Settlement::Ack)]
    );
}

#[tokio::test]
async fn stop_with_nowait_abandons_in_flight_messages() {
    // Arrange
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let consumer = broker
        .register_consumer(orders_consumer(|_| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(())
        }))
        .unwrap();
    broker.start().await.unwrap();
    transport.inject("orders.x", "orders.created", "abandoned");
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Act
    let started_at = Instant::now();
    consumer.stop(StopOptions::nowait()).await;

    // Assert
    assert!(started_at.elapsed() < Duration::from_millis(200));
    assert_eq!(consumer.state(), ConsumerState::Stopped);
    assert_eq!(transport.open_channels(), 0);
    // Closing the channel put the message back in the queue.
    assert_eq!(transport.pending("orders.q"), 1);
    // Settling later on is a no-op.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(transport.settlements().is_empty());
    assert_eq!(transport.pending("orders.q"), 1);
}

#[tokio::test]
async fn a_stopped_consumer_leaves_new_messages_in_the_queue() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let consumer = broker
        .register_consumer(orders_consumer({
            let calls = Arc::clone(&calls);
            move |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        }))
        .unwrap();
    broker.start().await.unwrap();

    consumer.stop(StopOptions::nowait()).await;
    transport.inject("orders.x", "orders.created", "while stopped");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(transport.pending("orders.q"), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(transport.settlements().is_empty());
}

#[tokio::test]
async fn settled_messages_are_not_redelivered_after_a_restart() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let consumer = broker
        .register_consumer(orders_consumer(|message: IncomingMessage| async move {
            if message.body() == b"rejected" {
                Err(HandlerError::transient(anyhow::anyhow!("Not today")))
            } else {
                Ok(())
            }
        }))
        .unwrap();
    let connection = broker.connection().unwrap();
    consumer.start(connection.as_ref()).await.unwrap();
    transport.inject("orders.x", "orders.created", "acked");
    transport.inject("orders.x", "orders.created", "rejected");
    eventually(|| transport.settlements().len() == 2).await;

    consumer.stop(StopOptions::default()).await;
    consumer.start(connection.as_ref()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(transport.settlements().len(), 2);
    assert_eq!(transport.redeliveries(), 0);
    assert_eq!(transport.pending("orders.q"), 0);
}

#[tokio::test]
async fn stop_with_a_timeout_gives_up_on_slow_handlers() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let consumer = broker
        .register_consumer(orders_consumer(|_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }))
        .unwrap();
    broker.start().await.unwrap();
    transport.inject("orders.x", "orders.created", "too slow");
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started_at = Instant::now();
    consumer
        .stop(StopOptions::with_timeout(Duration::from_millis(100)))
        .await;

    let elapsed = started_at.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(consumer.state(), ConsumerState::Stopped);
}

#[tokio::test]
async fn stop_honours_its_timeout_after_the_subscription_ended() {
    // Arrange
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let consumer = broker
        .register_consumer(orders_consumer({
            let calls = Arc::clone(&calls);
            move |_| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
            }
        }))
        .unwrap();
    broker.start().await.unwrap();
    transport.inject("orders.x", "orders.created", "stuck");
    eventually(|| calls.load(Ordering::SeqCst) == 1).await;

    // The loop is now waiting for the stuck handler.
    transport.cancel_subscription("orders.q");
    eventually(|| consumer.state() == ConsumerState::Stopping).await;

    // Act
    let outcome = tokio::time::timeout(
        Duration::from_secs(3),
        consumer.stop(StopOptions::with_timeout(Duration::from_millis(100))),
    )
    .await;

    // Assert
    assert!(outcome.is_ok(), "stop ignored its timeout");
    assert_eq!(consumer.state(), ConsumerState::Stopped);
    assert_eq!(transport.open_channels(), 0);
    assert_eq!(transport.pending("orders.q"), 1);
}

#[tokio::test]
async fn restarting_after_the_subscription_ended_does_not_wait_for_stuck_handlers() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let consumer = broker
        .register_consumer(orders_consumer({
            let calls = Arc::clone(&calls);
            move |_| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    Ok(())
                }
            }
        }))
        .unwrap();
    broker.start().await.unwrap();
    transport.inject("orders.x", "orders.created", "stuck");
    eventually(|| calls.load(Ordering::SeqCst) == 1).await;
    transport.cancel_subscription("orders.q");
    eventually(|| consumer.state() == ConsumerState::Stopping).await;

    let outcome = tokio::time::timeout(
        Duration::from_secs(3),
        consumer.start(broker.connection().unwrap().as_ref()),
    )
    .await;

    assert!(matches!(outcome, Ok(Ok(()))));
    assert_eq!(consumer.state(), ConsumerState::Consuming);
    // The abandoned message is redelivered on the new subscription.
    eventually(|| !transport.settlements().is_empty()).await;
    assert_eq!(
        transport.settlements(),
        vec![("stuck".to_owned(), Settlement::Ack)]
    );
    assert_eq!(transport.redeliveries(), 1);
}

#[tokio::test]
async fn the_consumer_stops_when_the_broker_cancels_the_subscription() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let consumer = broker
        .register_consumer(orders_consumer(|_| async { Ok(()) }))
        .unwrap();
    broker.start().await.unwrap();

    transport.cancel_subscription("orders.q");

    eventually(|| consumer.state() == ConsumerState::Stopped).await;
    assert_eq!(transport.open_channels(), 0);

    // It can be brought back.
    consumer
        .start(broker.connection().unwrap().as_ref())
        .await
        .unwrap();
    assert_eq!(consumer.state(), ConsumerState::Consuming);
}

#[tokio::test]
async fn the_consumer_stops_when_the_connection_is_lost() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let consumer = broker
        .register_consumer(orders_consumer(|_| async { Ok(()) }))
        .unwrap();
    // Started on its own: nothing supervises the connection.
    consumer
        .start(broker.connection().unwrap().as_ref())
        .await
        .unwrap();

    transport.kill_connection();

    eventually(|| consumer.state() == ConsumerState::Stopped).await;
    assert!(!broker.is_connected());
}

#[tokio::test]
async fn dead_letter_topology_is_declared_before_the_queue() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    broker
        .register_consumer(
            ConsumerSpec::builder("payments.q", "payments.x")
                .with_dead_letter_queue()
                .handler(|_| async { Ok::<_, HandlerError>(()) }),
        )
        .unwrap();

    broker.start().await.unwrap();

    assert_eq!(
        transport.declarations(),
        vec![
            "exchange payments.x direct",
            "exchange payments.q.deadletter fanout",
            "queue payments.q.deadletter",
            "bind payments.q.deadletter payments.q.deadletter ",
            "queue payments.q",
            "bind payments.q payments.x payments.x",
        ]
    );
}

#[tokio::test]
async fn a_failed_start_closes_the_channel_and_can_be_retried() {
    let transport = InMemoryBroker::default();
    let broker = connected_broker(&transport).await;
    let consumer = broker
        .register_consumer(orders_consumer(|_| async { Ok(()) }))
        .unwrap();
    let connection = broker.connection().unwrap();
    transport.refuse_queue("orders.q");

    let outcome = consumer.start(connection.as_ref()).await;

    assert!(matches!(
        outcome,
        Err(burrow::Error::Declaration { object: "queue", .. })
    ));
    assert_eq!(consumer.state(), ConsumerState::Registered);
    assert_eq!(transport.open_channels(), 0);

    transport.accept_queue("orders.q");
    consumer.start(connection.as_ref()).await.unwrap();

    assert_eq!(consumer.state(), ConsumerState::Consuming);
    assert_eq!(transport.open_channels(), 1);
    assert!(transport.has_subscriber("orders.q"));
}
