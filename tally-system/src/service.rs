use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::statsd::SystemGauges;

/// Interval for recording backlog metrics on service channels.
const BACKLOG_INTERVAL: Duration = Duration::from_secs(1);

/// A message interface for [services](Service).
///
/// Most commonly, this interface is an enumeration of messages, but it can also be implemented
/// on a single message. For each individual message, this type needs to implement the
/// [`FromMessage`] trait.
///
/// # Implementating Interfaces
///
/// There are three main ways to implement interfaces, which depends on the number of messages and
/// their return values. The simplest way is an interface consisting of a **single message** with
/// **no return value**. For this case, use the message directly as interface and choose
/// [`NoResponse`] as response:
///
/// ```
/// use tally_system::{FromMessage, Interface, NoResponse};
///
/// #[derive(Debug)]
/// pub struct MyMessage;
///
/// impl Interface for MyMessage {}
///
/// impl FromMessage<Self> for MyMessage {
///     type Response = NoResponse;
///
///     fn from_message(message: Self, _: ()) -> Self {
///         message
///     }
/// }
/// ```
///
/// If there is a **single message with a return value**, implement the interface as a wrapper for
/// the message and the return [`Sender`]:
///
/// ```
/// use tally_system::{AsyncResponse, FromMessage, Interface, Sender};
///
/// pub struct MyMessage;
///
/// pub struct MyInterface(MyMessage, Sender<bool>);
///
/// impl Interface for MyInterface {}
///
/// impl FromMessage<MyMessage> for MyInterface {
///     type Response = AsyncResponse<bool>;
///
///     fn from_message(message: MyMessage, sender: Sender<bool>) -> Self {
///         Self(message, sender)
///     }
/// }
/// ```
///
/// Finally, interfaces can have **multiple messages** of either kind. Choose the appropriate
/// response type for each message, and wrap the sender where a return value exists:
///
/// ```
/// use tally_system::{AsyncResponse, FromMessage, Interface, NoResponse, Sender};
///
/// pub struct GetFlag;
///
/// pub struct SetFlag(pub bool);
///
/// pub enum MyInterface {
///     Get(GetFlag, Sender<bool>),
///     Set(SetFlag),
/// }
///
/// impl Interface for MyInterface {}
///
/// impl FromMessage<GetFlag> for MyInterface {
///     type Response = AsyncResponse<bool>;
///
///     fn from_message(message: GetFlag, sender: Sender<bool>) -> Self {
///         Self::Get(message, sender)
///     }
/// }
///
/// impl FromMessage<SetFlag> for MyInterface {
///     type Response = NoResponse;
///
///     fn from_message(message: SetFlag, _: ()) -> Self {
///         Self::Set(message)
///     }
/// }
/// ```
pub trait Interface: Send + 'static {}

/// An error when [sending](Addr::send) a message to a service fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendError;

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to send message to service")
    }
}

impl std::error::Error for SendError {}

/// An error when [trying to send](Addr::try_send) a message without waiting for capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrySendError {
    /// The inbox of the service is full.
    Full,
    /// The service has shut down and no longer accepts messages.
    Closed,
}

impl fmt::Display for TrySendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "service inbox is full"),
            Self::Closed => write!(f, "failed to send message to service"),
        }
    }
}

impl std::error::Error for TrySendError {}

/// Response behavior of an [`Interface`] message.
///
/// It defines how a service handles and responds to messages, such as through asynchronous
/// responses or fire-and-forget without responding. [`FromMessage`] implementations declare this
/// behavior on the interface.
pub trait MessageResponse {
    /// Sends responses from the service back to the waiting recipient.
    type Sender;

    /// The type returned from [`Addr::send`].
    type Output;

    /// Returns the response channel for an interface message.
    fn channel() -> (Self::Sender, Self::Output);
}

/// The request when sending an asynchronous message to a service.
///
/// This is returned from [`Addr::send`] when the message responds asynchronously through
/// [`AsyncResponse`]. It is a future that resolves once the service has handled the message.
/// Dropping the request does not cancel the message, it only discards the response.
pub struct Request<T>(oneshot::Receiver<T>);

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request").finish_non_exhaustive()
    }
}

impl<T> Future for Request<T> {
    type Output = Result<T, SendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|result| result.map_err(|_| SendError))
    }
}

/// Sends a message response from a service back to the waiting [`Request`].
///
/// The sender is part of an [`AsyncResponse`] and should be moved into the service interface
/// type. If this sender is dropped without calling [`send`](Self::send), the request fails with
/// [`SendError`].
pub struct Sender<T>(oneshot::Sender<T>);

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("open", &!self.0.is_closed())
            .finish()
    }
}

impl<T> Sender<T> {
    /// Sends the response value and closes the [`Request`].
    ///
    /// This silently drops the value if the request has been dropped.
    pub fn send(self, value: T) {
        self.0.send(value).ok();
    }

    /// Returns `true` if the waiting [`Request`] has been dropped.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Message response resulting in an asynchronous [`Request`].
///
/// The sender must be placed on the interface in [`FromMessage::from_message`].
pub struct AsyncResponse<T>(PhantomData<fn(T)>);

impl<T> fmt::Debug for AsyncResponse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AsyncResponse")
    }
}

impl<T> MessageResponse for AsyncResponse<T> {
    type Sender = Sender<T>;
    type Output = Request<T>;

    fn channel() -> (Self::Sender, Self::Output) {
        let (tx, rx) = oneshot::channel();
        (Sender(tx), Request(rx))
    }
}

/// Message response for fire-and-forget messages with no output.
///
/// There is no sender associated to this response. When implementing [`FromMessage`], the sender
/// can be ignored.
#[derive(Debug)]
pub struct NoResponse;

impl MessageResponse for NoResponse {
    type Sender = ();
    type Output = ();

    fn channel() -> (Self::Sender, Self::Output) {
        ((), ())
    }
}

/// Declares a message as part of an [`Interface`].
///
/// Messages have an associated `Response` type that determines the return value of sending the
/// message. Within an interface, the responder can vary for each message. There are two provided
/// responders:
///
/// - [`NoResponse`] for fire-and-forget messages that do not return any information.
/// - [`AsyncResponse`] for asynchronous responses, returning a [`Request`].
pub trait FromMessage<M>: Interface {
    /// The behavior declaring the return value when sending this message.
    type Response: MessageResponse;

    /// Converts the message into the service interface.
    fn from_message(message: M, sender: <Self::Response as MessageResponse>::Sender) -> Self;
}

/// The address of a [`Service`].
///
/// Addresses allow to [send](Self::send) messages to a service that implements a corresponding
/// [`Interface`] as long as the service is running. The inbox is bounded: once it holds as many
/// messages as its capacity allows, sending waits until the service has taken a message out.
///
/// Addresses can be freely cloned. When the last clone of an address is dropped, the inbox closes
/// and the service observes the end of its message stream.
pub struct Addr<I: Interface> {
    tx: mpsc::Sender<I>,
    name: &'static str,
}

impl<I: Interface> fmt::Debug for Addr<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr")
            .field("name", &self.name)
            .field("open", &!self.tx.is_closed())
            .field("queue_len", &self.queue_len())
            .finish()
    }
}

// Manually derive `Clone` since we do not require `I: Clone` and the Clone derive adds this
// constraint.
impl<I: Interface> Clone for Addr<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            name: self.name,
        }
    }
}

impl<I: Interface> Addr<I> {
    /// Sends a message to the service and returns the response.
    ///
    /// Depending on the message's response behavior, this either returns a future resolving to
    /// the return value, or does not return anything for fire-and-forget messages. The message is
    /// handled regardless of whether the response is awaited.
    ///
    /// If the inbox is full, this waits until capacity becomes available. Sending fails with
    /// [`SendError`] if the service has shut down.
    pub async fn send<M>(
        &self,
        message: M,
    ) -> Result<<I::Response as MessageResponse>::Output, SendError>
    where
        I: FromMessage<M>,
    {
        let (sender, output) = <I::Response as MessageResponse>::channel();
        self.tx
            .send(I::from_message(message, sender))
            .await
            .map_err(|_| SendError)?;
        Ok(output)
    }

    /// Sends a message to the service without waiting for capacity.
    ///
    /// Fails with [`TrySendError::Full`] if the inbox holds as many messages as its capacity.
    pub fn try_send<M>(
        &self,
        message: M,
    ) -> Result<<I::Response as MessageResponse>::Output, TrySendError>
    where
        I: FromMessage<M>,
    {
        let (sender, output) = <I::Response as MessageResponse>::channel();
        match self.tx.try_send(I::from_message(message, sender)) {
            Ok(()) => Ok(output),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TrySendError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TrySendError::Closed),
        }
    }

    /// Returns the number of messages waiting in the inbox of the service.
    pub fn queue_len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Returns the maximum number of messages the inbox can hold.
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Returns `true` if the service no longer accepts messages.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Inbound channel for messages sent through an [`Addr`].
///
/// This channel is meant to be polled in a [`Service`]. Instances are created automatically when
/// [starting](Service::start) a service, or can be created through [`channel`].
pub struct Receiver<I: Interface> {
    rx: mpsc::Receiver<I>,
    name: &'static str,
    last_report: Instant,
}

impl<I: Interface> fmt::Debug for Receiver<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name)
            .field("queue_len", &self.rx.len())
            .finish()
    }
}

impl<I: Interface> Receiver<I> {
    /// Receives the next value for this receiver.
    ///
    /// This method returns `None` if the channel has been closed and there are no remaining
    /// messages in the channel's buffer. This indicates that no further values can ever be
    /// received from this `Receiver`. The channel is closed when all senders have been dropped,
    /// or when [`close`](Self::close) is called.
    pub async fn recv(&mut self) -> Option<I> {
        let message = self.rx.recv().await;
        self.report_backlog();
        message
    }

    /// Closes the inbox without dropping buffered messages.
    ///
    /// Pending and future sends fail with [`SendError`], while messages already in the buffer
    /// can still be received until [`recv`](Self::recv) returns `None`.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Returns the number of buffered messages.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns `true` if there are no buffered messages.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    fn report_backlog(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_report) < BACKLOG_INTERVAL {
            return;
        }

        self.last_report = now;
        tally_statsd::metric!(
            gauge(SystemGauges::ServiceBackPressure) = self.rx.len() as u64,
            service = self.name
        );
    }
}

/// Creates a bounded channel for communicating with a [`Service`].
///
/// The `Addr` as the sending part provides public access to the service, while the `Receiver`
/// should remain internal to the service. At most `capacity` messages are buffered.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn channel<I: Interface>(name: &'static str, capacity: usize) -> (Addr<I>, Receiver<I>) {
    let (tx, rx) = mpsc::channel(capacity);
    let addr = Addr { tx, name };
    let receiver = Receiver {
        rx,
        name,
        last_report: Instant::now(),
    };
    (addr, receiver)
}

/// An asynchronous unit responding to messages.
///
/// Services receive messages conforming to some [`Interface`] through an [`Addr`] and handle them
/// one by one. Internally, services are free to concurrently process these messages or not.
///
/// The standard way to implement services is through the `run` function, which receives the
/// inbox and typically loops until the inbox closes or a shutdown is signalled:
///
/// ```
/// use tally_system::{FromMessage, Interface, NoResponse, Receiver, Service};
///
/// struct MyMessage;
///
/// impl Interface for MyMessage {}
///
/// impl FromMessage<Self> for MyMessage {
///     type Response = NoResponse;
///
///     fn from_message(message: Self, _: ()) -> Self {
///         message
///     }
/// }
///
/// struct MyService;
///
/// impl Service for MyService {
///     type Interface = MyMessage;
///
///     async fn run(self, mut rx: Receiver<Self::Interface>) {
///         while let Some(message) = rx.recv().await {
///             // handle the message
///         }
///     }
/// }
///
/// let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
/// runtime.block_on(async {
///     let (addr, handle) = MyService.start(16);
///     addr.send(MyMessage).await.unwrap();
///     drop(addr);
///     handle.await.unwrap();
/// });
/// ```
pub trait Service: Sized + Send + 'static {
    /// The interface of messages this service implements.
    ///
    /// The interface can be a single message type or an enumeration of all the messages that
    /// can be handled by this service.
    type Interface: Interface;

    /// Runs the service until its inbox closes or it decides to stop.
    fn run(self, rx: Receiver<Self::Interface>) -> impl Future<Output = ()> + Send + 'static;

    /// Starts the service in the current runtime and returns an address for it.
    ///
    /// The returned join handle resolves once [`run`](Self::run) has returned, which allows
    /// callers to wait for a service to drain its inbox during shutdown.
    fn start(self, capacity: usize) -> (Addr<Self::Interface>, JoinHandle<()>) {
        let (addr, rx) = channel(Self::name(), capacity);
        let handle = tokio::spawn(self.run(rx));
        (addr, handle)
    }

    /// Returns a unique name for this service implementation.
    ///
    /// This is used for internal diagnostics and uses the fully qualified type name of the service
    /// implementor by default.
    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    struct Ping(u64);

    enum Counter {
        Add(Ping),
        Get(Sender<u64>),
    }

    struct Get;

    impl Interface for Counter {}

    impl FromMessage<Ping> for Counter {
        type Response = NoResponse;

        fn from_message(message: Ping, _: ()) -> Self {
            Self::Add(message)
        }
    }

    impl FromMessage<Get> for Counter {
        type Response = AsyncResponse<u64>;

        fn from_message(_: Get, sender: Sender<u64>) -> Self {
            Self::Get(sender)
        }
    }

    struct CounterService;

    impl Service for CounterService {
        type Interface = Counter;

        async fn run(self, mut rx: Receiver<Self::Interface>) {
            let mut count = 0;
            while let Some(message) = rx.recv().await {
                match message {
                    Counter::Add(Ping(value)) => count += value,
                    Counter::Get(sender) => sender.send(count),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_send_and_respond() {
        let (addr, handle) = CounterService.start(4);

        addr.send(Ping(2)).await.unwrap();
        addr.send(Ping(3)).await.unwrap();
        let count = addr.send(Get).await.unwrap().await.unwrap();
        assert_eq!(count, 5);

        drop(addr);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_waits_for_capacity() {
        let (addr, mut rx) = channel::<Counter>("test", 2);

        addr.send(Ping(1)).await.unwrap();
        addr.send(Ping(2)).await.unwrap();
        assert_eq!(addr.queue_len(), 2);

        // The inbox is full, so the third message must wait for the consumer.
        let mut pending = Box::pin(addr.send(Ping(3)));
        assert!((&mut pending).now_or_never().is_none());
        assert_eq!(addr.try_send(Ping(4)).unwrap_err(), TrySendError::Full);

        assert!(matches!(rx.recv().await, Some(Counter::Add(Ping(1)))));
        assert!(pending.await.is_ok());
        assert_eq!(addr.queue_len(), 2);
    }

    #[tokio::test]
    async fn test_close_drains_buffer() {
        let (addr, mut rx) = channel::<Counter>("test", 4);
        addr.send(Ping(1)).await.unwrap();

        rx.close();
        assert_eq!(addr.send(Ping(2)).await.unwrap_err(), SendError);
        assert!(matches!(rx.recv().await, Some(Counter::Add(Ping(1)))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_sender_fails_request() {
        let (addr, mut rx) = channel::<Counter>("test", 4);
        let request = addr.send(Get).await.unwrap();

        // Receive and drop the message without responding.
        drop(rx.recv().await);
        assert_eq!(request.await.unwrap_err(), SendError);
    }

    #[test]
    fn test_backlog_metric() {
        let captures = tally_statsd::with_capturing_test_client(|| {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            runtime.block_on(async {
                let (addr, mut rx) = channel::<Counter>("test", 4);
                addr.send(Ping(1)).await.unwrap();
                addr.send(Ping(2)).await.unwrap();

                tokio::time::advance(BACKLOG_INTERVAL).await;
                rx.recv().await;
            });
        });

        assert_eq!(captures, ["service.back_pressure:1|g|#service:test"]);
    }
}
