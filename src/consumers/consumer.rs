use crate::consumers::{
    settlement::settle, ConsumerSpec, ConsumerTransientErrorHook, Handler, HandlerError,
    IncomingMessage, MessageHandler,
};
use crate::topology::{ExchangeDeclaration, ExchangeKind, QueueDeclaration};
use crate::transport::{Channel, Connection, DeliveryStream, TransportError};
use crate::Error;
use futures_util::{stream::FuturesUnordered, FutureExt, StreamExt};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Upper bound on the teardown operations (cancel, close) performed when a consumer stops.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The lifecycle of a [`Consumer`].
///
/// ```text
/// Registered -> Starting -> Consuming -> Stopping -> Stopped
///                   |                                  |
///                   +--> Registered (start failed)     +--> Starting (restart)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerState {
    /// Registered with the broker, no I/O performed yet.
    Registered,
    /// Declaring the topology and subscribing to the queue.
    Starting,
    /// Messages are being pulled from the queue and dispatched to the handler.
    Consuming,
    /// No new messages are pulled; waiting for in-flight messages before closing the channel.
    Stopping,
    /// The channel is closed. The consumer can be started again.
    Stopped,
}

/// How a [`Consumer`] should stop consuming.
///
/// Stopping is best-effort graceful, not guaranteed graceful: the subscription is cancelled
/// straight away, then in-flight messages get a chance to complete - for at most `timeout`,
/// if one is set, or not at all with `nowait`. The channel is closed afterwards: messages
/// that were not settled by then are requeued by the broker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// How long to wait for in-flight messages to be processed. Forever if `None`.
    pub timeout: Option<Duration>,
    /// Close the channel without waiting for in-flight messages.
    pub nowait: bool,
}

impl StopOptions {
    /// Wait for in-flight messages for at most `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            nowait: false,
        }
    }

    /// Do not wait for in-flight messages.
    pub fn nowait() -> Self {
        Self {
            timeout: None,
            nowait: true,
        }
    }
}

/// A RabbitMq consumer: it owns a queue, bound to an exchange, and a dedicated channel to pull
/// messages from it.
///
/// [`Broker`](crate::Broker) instantiates a `Consumer` for each registered [`MessageHandler`]
/// and takes care of starting and stopping it.
/// You get a shared handle back from [`Broker::register_consumer`](crate::Broker::register_consumer)
/// to inspect its [`state`](Consumer::state) or to control it individually.
pub struct Consumer {
    spec: ConsumerSpec,
    /// `handler` determines what processing will be run on each incoming message.
    /// See `Handler`'s documentation for more information.
    handler: Arc<dyn Handler>,
    /// `transient_error_hook` specifies behaviour to be executed when message processing fails due to
    /// an error labelled as `transient`.
    transient_error_hook: Arc<dyn ConsumerTransientErrorHook>,
    state: Arc<watch::Sender<ConsumerState>>,
    /// Serializes `start` and `stop`.
    running: tokio::sync::Mutex<Option<Running>>,
    /// Set by a successful `start`, cleared by `stop`.
    resume_on_reconnect: AtomicBool,
}

struct Running {
    stop: oneshot::Sender<StopOptions>,
    task: JoinHandle<()>,
}

impl Consumer {
    pub(crate) fn new(message_handler: MessageHandler) -> Self {
        let MessageHandler {
            spec,
            transient_error_hook,
            handler,
        } = message_handler;
        let (state, _) = watch::channel(ConsumerState::Registered);
        Self {
            spec,
            handler,
            transient_error_hook,
            state: Arc::new(state),
            running: tokio::sync::Mutex::new(None),
            resume_on_reconnect: AtomicBool::new(false),
        }
    }

    pub fn spec(&self) -> &ConsumerSpec {
        &self.spec
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Get notified of every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// `true` if the consumer was started and not stopped since: the broker starts it again
    /// on the new connection when the previous one drops.
    pub(crate) fn resumes_on_reconnect(&self) -> bool {
        self.resume_on_reconnect.load(Ordering::SeqCst)
    }

    /// Open a dedicated channel on `connection`, declare the topology, subscribe to the queue
    /// and spawn the consumption loop.
    ///
    /// On failure the channel is closed, the consumer goes back to [`ConsumerState::Registered`]
    /// and the error is returned: `start` can be retried.
    /// Starting a consumer that is already consuming is a no-op. Restarting a consumer whose
    /// subscription ended does not wait for the messages it was still processing.
    #[tracing::instrument(skip_all, name = "consumer_start", fields(queue_name = %self.spec.queue_name))]
    pub async fn start(&self, connection: &dyn Connection) -> Result<(), Error> {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            if self.state() == ConsumerState::Consuming {
                tracing::debug!("The consumer is already consuming");
                *running = Some(previous);
                return Ok(());
            }
            // The subscription ended on its own. Messages it left in flight are abandoned,
            // the new subscription does not wait for them.
            let Running { stop, task } = previous;
            let _ = stop.send(StopOptions::nowait());
            if let Err(e) = task.await {
                tracing::error!(error = %e, "The consumption loop panicked");
            }
        }

        self.state.send_replace(ConsumerState::Starting);
        match self.subscribe(connection).await {
            Ok(started) => {
                *running = Some(started);
                self.resume_on_reconnect.store(true, Ordering::SeqCst);
                tracing::info!("Consumer started");
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(ConsumerState::Registered);
                Err(e)
            }
        }
    }

    /// Stop consuming. See [`StopOptions`] for the available knobs.
    ///
    /// `stop` returns once the channel has been closed.
    /// Stopping a consumer that is not running is a no-op.
    #[tracing::instrument(skip_all, name = "consumer_stop", fields(queue_name = %self.spec.queue_name))]
    pub async fn stop(&self, options: StopOptions) {
        let mut running = self.running.lock().await;
        self.resume_on_reconnect.store(false, Ordering::SeqCst);
        let Running { stop, task } = match running.take() {
            Some(running) => running,
            None => {
                tracing::debug!("The consumer is not running, nothing to stop");
                return;
            }
        };
        // The loop might have exited already if the subscription ended on its own.
        let _ = stop.send(options);
        if let Err(e) = task.await {
            tracing::error!(error = %e, "The consumption loop panicked");
            self.state.send_replace(ConsumerState::Stopped);
        }
    }

    async fn subscribe(&self, connection: &dyn Connection) -> Result<Running, Error> {
        let channel = connection.create_channel().await?;
        let consumer_tag = Uuid::new_v4().to_string();

        let (queue_name, deliveries) =
            match self.declare_and_consume(channel.as_ref(), &consumer_tag).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    close_quietly(channel.as_ref()).await;
                    return Err(e);
                }
            };

        let (stop, stop_requests) = oneshot::channel();
        let consumption = ConsumptionLoop {
            queue_name,
            consumer_tag,
            auto_ack: self.spec.auto_ack,
            channel,
            handler: Arc::clone(&self.handler),
            transient_error_hook: Arc::clone(&self.transient_error_hook),
            in_flight_limit: self
                .spec
                .prefetch_count
                .map(|prefetch_count| Arc::new(Semaphore::new(prefetch_count.into()))),
            state: Arc::clone(&self.state),
        };
        self.state.send_replace(ConsumerState::Consuming);
        let task = tokio::spawn(consumption.run(deliveries, stop_requests));
        Ok(Running { stop, task })
    }

    /// Returns the name of the queue - the broker generates one when the queue name is empty.
    async fn declare_and_consume(
        &self,
        channel: &dyn Channel,
        consumer_tag: &str,
    ) -> Result<(String, DeliveryStream), Error> {
        let spec = &self.spec;
        if let Some(prefetch_count) = spec.prefetch_count {
            channel.basic_qos(prefetch_count).await?;
        }

        channel
            .exchange_declare(
                &spec.exchange_name,
                &spec.exchange_kind,
                &spec.exchange_declaration,
            )
            .await
            .map_err(|e| Error::declaration("exchange", &spec.exchange_name, e))?;

        if let Some(dead_letter) = spec.dead_letter_name() {
            channel
                .exchange_declare(
                    &dead_letter,
                    &ExchangeKind::Fanout,
                    &ExchangeDeclaration::durable(),
                )
                .await
                .map_err(|e| Error::declaration("exchange", &dead_letter, e))?;
            channel
                .queue_declare(&dead_letter, &QueueDeclaration::durable())
                .await
                .map_err(|e| Error::declaration("queue", &dead_letter, e))?;
            channel
                .queue_bind(&dead_letter, &dead_letter, "")
                .await
                .map_err(|e| Error::declaration("binding", &dead_letter, e))?;
        }

        let queue_name = channel
            .queue_declare(&spec.queue_name, &spec.effective_queue_declaration())
            .await
            .map_err(|e| Error::declaration("queue", &spec.queue_name, e))?;
        channel
            .queue_bind(&queue_name, &spec.exchange_name, &spec.routing_key)
            .await
            .map_err(|e| Error::declaration("binding", &queue_name, e))?;

        let deliveries = channel
            .basic_consume(
                &queue_name,
                consumer_tag,
                spec.auto_ack,
                spec.arguments.clone(),
            )
            .await?;
        Ok((queue_name, deliveries))
    }
}

/// Everything the spawned consumption task needs, detached from the [`Consumer`] borrow.
struct ConsumptionLoop {
    queue_name: String,
    consumer_tag: String,
    auto_ack: bool,
    channel: Arc<dyn Channel>,
    handler: Arc<dyn Handler>,
    transient_error_hook: Arc<dyn ConsumerTransientErrorHook>,
    /// One permit per in-flight message.
    in_flight_limit: Option<Arc<Semaphore>>,
    state: Arc<watch::Sender<ConsumerState>>,
}

enum Exit {
    StopRequested(StopOptions),
    SubscriptionEnded(Option<TransportError>),
}

impl ConsumptionLoop {
    #[tracing::instrument(skip_all, name = "consumer_run", fields(queue_name = %self.queue_name))]
    async fn run(
        self,
        mut deliveries: DeliveryStream,
        mut stop_requests: oneshot::Receiver<StopOptions>,
    ) {
        let mut in_flight = FuturesUnordered::new();
        let mut permit: Option<OwnedSemaphorePermit> = None;

        let exit = 'event_loop: loop {
            // Do not pull another message until there is room for it.
            if permit.is_none() {
                if let Some(limit) = &self.in_flight_limit {
                    tokio::select! {
                        biased;

                        options = &mut stop_requests => {
                            break 'event_loop Exit::StopRequested(options.unwrap_or_else(|_| StopOptions::nowait()));
                        }
                        _ = in_flight.next(), if !in_flight.is_empty() => continue 'event_loop,
                        acquired = Arc::clone(limit).acquire_owned() => match acquired {
                            Ok(acquired) => permit = Some(acquired),
                            // The semaphore is never closed.
                            Err(_) => break 'event_loop Exit::SubscriptionEnded(None),
                        },
                    }
                }
            }

            tokio::select! {
                // we want to poll in the specified order - preferring the handling of stop
                // requests before going on with processing more messages
                biased;

                options = &mut stop_requests => {
                    break 'event_loop Exit::StopRequested(options.unwrap_or_else(|_| StopOptions::nowait()));
                }

                // clear out some of our task handles
                _ = in_flight.next(), if !in_flight.is_empty() => {}

                delivery = deliveries.next() => match delivery {
                    None => break 'event_loop Exit::SubscriptionEnded(None),
                    Some(Err(e)) => break 'event_loop Exit::SubscriptionEnded(Some(e)),
                    Some(Ok(delivery)) => {
                        let message = IncomingMessage::new(delivery, &self.queue_name, self.auto_ack);
                        // Spawn up the message handler as its own task in order to process
                        // multiple messages concurrently.
                        //
                        // This also isolates failures: failing to process one message (even with
                        // a panic!) does not tear the whole consumer down.
                        in_flight.push(tokio::spawn(process(
                            message,
                            Arc::clone(&self.handler),
                            Arc::clone(&self.transient_error_hook),
                            self.auto_ack,
                            permit.take(),
                        )));
                    }
                },
            }
        };
        self.state.send_replace(ConsumerState::Stopping);

        match exit {
            Exit::StopRequested(options) => {
                tracing::info!("Stop requested, cancelling the subscription");
                bounded(
                    "cancel the subscription",
                    self.channel.basic_cancel(&self.consumer_tag),
                )
                .await;
                wind_down(&mut in_flight, options).await;
            }
            Exit::SubscriptionEnded(cause) => {
                match cause {
                    Some(e) => tracing::error!(error = ?e, "The subscription failed"),
                    None => tracing::warn!(
                        "The subscription was cancelled by the broker or its channel was closed"
                    ),
                }
                // A stop request coming in while draining takes over: its timeout applies.
                let late_request = tokio::select! {
                    _ = drain(&mut in_flight, None) => None,
                    options = &mut stop_requests => {
                        Some(options.unwrap_or_else(|_| StopOptions::nowait()))
                    }
                };
                if let Some(options) = late_request {
                    wind_down(&mut in_flight, options).await;
                }
            }
        }

        bounded("close the channel", self.channel.close()).await;
        self.state.send_replace(ConsumerState::Stopped);
        tracing::info!("Consumer stopped");
    }
}

async fn wind_down(in_flight: &mut FuturesUnordered<JoinHandle<()>>, options: StopOptions) {
    if !options.nowait {
        return drain(in_flight, options.timeout).await;
    }
    if !in_flight.is_empty() {
        tracing::warn!(
            in_flight = in_flight.len(),
            "Abandoning in-flight messages, they will be requeued by the broker"
        );
    }
}

/// Wait for in-flight messages to be processed, for at most `timeout` if one is set.
async fn drain(in_flight: &mut FuturesUnordered<JoinHandle<()>>, timeout: Option<Duration>) {
    let all_processed = async {
        while in_flight.next().await.is_some() {}
    };
    match timeout {
        None => all_processed.await,
        Some(timeout) => {
            if tokio::time::timeout(timeout, all_processed).await.is_err() {
                tracing::warn!(
                    in_flight = in_flight.len(),
                    "Timed out after {timeout:?} while waiting for in-flight messages, closing the channel anyway"
                );
            }
        }
    }
}

async fn bounded(operation: &str, teardown: impl Future<Output = Result<(), TransportError>>) {
    match tokio::time::timeout(TEARDOWN_TIMEOUT, teardown).await {
        Ok(Ok(())) | Ok(Err(TransportError::Closed)) => {}
        Ok(Err(e)) => tracing::warn!(error = ?e, "Failed to {operation}"),
        Err(_) => tracing::warn!("Timed out while trying to {operation}"),
    }
}

async fn close_quietly(channel: &dyn Channel) {
    bounded("close the channel", channel.close()).await;
}

/// Process an incoming message - handler, then ack/nack against the AMQP broker.
///
/// `_permit` is released once the message has been settled.
#[tracing::instrument(
    name = "process_message",
    skip_all,
    fields(delivery_tag = message.delivery_tag()),
    level = tracing::Level::DEBUG
)]
async fn process(
    message: IncomingMessage,
    handler: Arc<dyn Handler>,
    transient_error_hook: Arc<dyn ConsumerTransientErrorHook>,
    auto_ack: bool,
    _permit: Option<OwnedSemaphorePermit>,
) {
    let outcome = match AssertUnwindSafe(handler.handle(message.clone()))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(panic) => Err(HandlerError::transient(anyhow::anyhow!(
            "The message handler panicked: {}",
            panic_message(panic.as_ref())
        ))),
    };

    if let Err(e) = &outcome {
        if auto_ack {
            tracing::error!(
                error = %e,
                "Failed to process an auto-acked message, it cannot be retried"
            );
        } else {
            tracing::warn!(error = %e, "Failed to process the message");
        }
    }

    match settle(&message, &outcome, transient_error_hook.as_ref()).await {
        Ok(Some(action)) => tracing::debug!(?action, "Message settled"),
        Ok(None) => {}
        Err(e) => tracing::error!(error = ?e, "Failed to settle the message with the broker"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}
