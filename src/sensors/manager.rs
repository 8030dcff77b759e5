//! Connection manager for a single cadence sensor session.
//!
//! The manager is a handle to a background task that owns the [`Session`]
//! and the [`ConnectionState`]. Commands from the handle and events from
//! the transport are processed one at a time, in arrival order. Connect
//! and recovery attempts run through a [`BackoffRetrier`] whose waits are
//! cancelled by `disconnect()`.

use crate::metrics::cadence::{CadenceCalculator, CadenceEstimate};
use crate::sensors::csc::{
    parse_csc_measurement, PayloadLayout, CSC_MEASUREMENT_UUID, CSC_SERVICE_UUID,
};
use crate::sensors::retry::{BackoffRetrier, CancelToken, RetryError, RetryPolicy};
use crate::sensors::transport::{
    DeviceFilter, DeviceInfo, NotificationStream, SensorTransport, TransportEvent,
};
use crate::sensors::types::{ConnectionState, SensorError, SessionInput, SessionUpdate};
use futures::stream::StreamExt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Capacity of the update broadcast channel.
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Configuration for a sensor session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Which device to pick during discovery
    pub filter: DeviceFilter,
    /// Where crank fields sit in the measurement payload
    pub layout: PayloadLayout,
    /// Budget for a user-requested connect
    pub connect_policy: RetryPolicy,
    /// Budget for recovering a dropped link
    pub recovery_policy: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            filter: DeviceFilter::for_service(CSC_SERVICE_UUID),
            layout: PayloadLayout::default(),
            connect_policy: RetryPolicy::default(),
            recovery_policy: RetryPolicy::session_recovery(),
        }
    }
}

/// Requests from the handle to the session task.
#[derive(Debug)]
enum Command {
    Connect,
    Disconnect(oneshot::Sender<()>),
}

/// Live resources of one sensor session.
pub struct Session {
    /// Device chosen by discovery
    device: Option<DeviceInfo>,
    /// Active measurement subscription
    notifications: Option<NotificationStream>,
    /// Whether the transport link may still be up
    link_up: bool,
    /// Cadence derived from this link's samples
    calculator: CadenceCalculator,
    /// Payload layout for decoding
    layout: PayloadLayout,
}

impl Session {
    /// Create an empty session.
    pub fn create(layout: PayloadLayout) -> Self {
        Self {
            device: None,
            notifications: None,
            link_up: false,
            calculator: CadenceCalculator::new(),
            layout,
        }
    }

    /// Decode one notification and update cadence.
    ///
    /// Malformed payloads are logged and dropped.
    pub fn handle_notification(&mut self, data: &[u8]) -> Option<CadenceEstimate> {
        match parse_csc_measurement(data, self.layout) {
            Ok(measurement) => {
                let estimate = self.calculator.update(&measurement);
                tracing::debug!(
                    crank = ?measurement.crank,
                    rpm = estimate.rpm,
                    "CSC measurement"
                );
                estimate.present.then_some(estimate)
            }
            Err(e) => {
                tracing::warn!("Dropping CSC notification {:02x?}: {}", data, e);
                let estimate = self.calculator.estimate();
                estimate.present.then_some(estimate)
            }
        }
    }

    /// Release the subscription, the link and the device. Failures are
    /// logged only. The link is only dropped if it may still be up.
    pub async fn teardown<T: SensorTransport>(&mut self, transport: &T) {
        self.calculator.reset();
        let link_up = std::mem::take(&mut self.link_up);

        let Some(device) = self.device.take() else {
            self.notifications = None;
            return;
        };

        if self.notifications.take().is_some() {
            match transport
                .stop_notifications(&device, CSC_MEASUREMENT_UUID)
                .await
            {
                Ok(()) => tracing::info!("Notifications stopped"),
                Err(e) => tracing::error!("Failed to stop notifications: {}", e),
            }
        }

        if link_up {
            if let Err(e) = transport.disconnect(&device).await {
                tracing::warn!("Failed to disconnect from {}: {}", device.name, e);
            }
        }

        transport.release_device(&device).await;
    }
}

/// Current state plus the broadcast of every change.
struct StatusBoard {
    snapshot: watch::Sender<SessionUpdate>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl StatusBoard {
    fn current(&self) -> SessionUpdate {
        *self.snapshot.borrow()
    }

    fn state(&self) -> ConnectionState {
        self.current().state
    }

    /// Apply a state machine input, publishing if the state changed.
    fn apply(&self, input: SessionInput) {
        let current = self.current();
        let next = current.state.next(input);
        if next != current.state {
            tracing::info!("Connection state: {} -> {} ({:?})", current.state, next, input);
            self.publish(SessionUpdate {
                state: next,
                ..current
            });
        }
    }

    fn set_cadence(&self, cadence: Option<CadenceEstimate>) {
        let current = self.current();
        if current.cadence != cadence {
            self.publish(SessionUpdate { cadence, ..current });
        }
    }

    fn publish(&self, update: SessionUpdate) {
        self.snapshot.send_replace(update);
        // No subscribers is fine
        let _ = self.updates.send(update);
    }
}

/// Everything the session task shares with an in-flight episode.
struct Shared<T> {
    transport: Arc<T>,
    config: SessionConfig,
    board: StatusBoard,
}

impl<T: SensorTransport> Shared<T> {
    /// One connect + subscribe attempt.
    async fn open_link(&self, device: &DeviceInfo) -> Result<NotificationStream, SensorError> {
        self.board.apply(SessionInput::AttemptStarted);
        tracing::info!("Connecting to {}...", device.name);

        self.transport.connect(device).await?;
        self.board.apply(SessionInput::TransportConnected);

        tracing::info!("Starting CSC measurement notifications");
        let stream = match self
            .transport
            .start_notifications(device, CSC_SERVICE_UUID, CSC_MEASUREMENT_UUID)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                if let Err(disconnect_err) = self.transport.disconnect(device).await {
                    tracing::debug!("Disconnect after failed subscribe: {}", disconnect_err);
                }
                return Err(e);
            }
        };

        self.board.apply(SessionInput::SubscriptionConfirmed);
        tracing::info!("Cadence sensor connected: {}", device.name);
        Ok(stream)
    }

    /// One backoff episode: discover if needed, then connect and subscribe.
    ///
    /// Returns the device whenever one was found, so a cancelled or failed
    /// episode can still release it.
    async fn establish(
        &self,
        known_device: Option<DeviceInfo>,
        policy: RetryPolicy,
        cancel: &CancelToken,
    ) -> (
        Option<DeviceInfo>,
        Result<NotificationStream, RetryError<SensorError>>,
    ) {
        let device = match known_device {
            Some(device) => device,
            None => {
                tracing::info!("Requesting cadence sensor...");
                match cancel
                    .run_until_cancelled(self.transport.request_device(&self.config.filter))
                    .await
                {
                    None => return (None, Err(RetryError::Cancelled)),
                    Some(Err(e)) => {
                        tracing::error!("Device discovery failed: {}", e);
                        return (
                            None,
                            Err(RetryError::Exhausted {
                                attempts: 1,
                                last_error: e,
                            }),
                        );
                    }
                    Some(Ok(device)) => {
                        tracing::info!("Found cadence sensor {} ({})", device.name, device.device_id);
                        device
                    }
                }
            }
        };

        let retrier = BackoffRetrier::new(policy);
        let device_ref = &device;
        let result = retrier
            .run_observed(
                move || self.open_link(device_ref),
                cancel,
                move |_| {
                    self.board.apply(SessionInput::AttemptFailed {
                        retry_pending: true,
                    })
                },
            )
            .await;

        (Some(device), result)
    }
}

/// Background task that owns the session.
struct SessionDriver<T> {
    shared: Shared<T>,
    session: Session,
    commands: mpsc::UnboundedReceiver<Command>,
}

/// What woke the driver up.
enum Step {
    Command(Option<Command>),
    Transport(Option<TransportEvent>),
}

impl<T: SensorTransport> SessionDriver<T> {
    async fn run(mut self) {
        loop {
            let step = match self.session.notifications.as_mut() {
                Some(stream) => tokio::select! {
                    command = self.commands.recv() => Step::Command(command),
                    event = stream.next() => Step::Transport(event),
                },
                None => Step::Command(self.commands.recv().await),
            };

            match step {
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Command(None) => break,
                Step::Transport(Some(TransportEvent::Notification(data))) => {
                    let cadence = self.session.handle_notification(&data);
                    self.shared.board.set_cadence(cadence);
                }
                Step::Transport(Some(TransportEvent::Disconnected) | None) => {
                    self.on_link_lost().await;
                }
            }
        }

        tracing::info!("Shutting down sensor session");
        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                let state = self.shared.board.state();
                if !state.accepts_connect() {
                    tracing::debug!("Connect ignored while {}", state);
                    return;
                }
                self.shared.board.apply(SessionInput::ConnectRequested);
                let policy = self.shared.config.connect_policy;
                self.run_episode(policy).await;
            }
            Command::Disconnect(ack) => {
                tracing::info!("Disconnecting from cadence sensor");
                self.shutdown().await;
                let _ = ack.send(());
            }
        }
    }

    async fn on_link_lost(&mut self) {
        tracing::warn!("Cadence sensor disconnected");
        self.session.notifications = None;
        self.session.link_up = false;
        self.session.calculator.reset();
        self.shared.board.set_cadence(None);
        self.shared.board.apply(SessionInput::LinkLost);

        let policy = self.shared.config.recovery_policy;
        self.run_episode(policy).await;
    }

    /// Run an episode while still serving commands. A disconnect
    /// cancels the episode and is acknowledged after teardown.
    async fn run_episode(&mut self, policy: RetryPolicy) {
        let cancel = CancelToken::new();
        let mut acks = Vec::new();
        let mut closed = false;

        let (device, result) = {
            let episode = self
                .shared
                .establish(self.session.device.clone(), policy, &cancel);
            tokio::pin!(episode);

            loop {
                tokio::select! {
                    outcome = &mut episode => break outcome,
                    command = self.commands.recv(), if !closed => match command {
                        Some(Command::Connect) => {
                            tracing::debug!("Connect ignored, attempt already in progress");
                        }
                        Some(Command::Disconnect(ack)) => {
                            cancel.cancel();
                            acks.push(ack);
                        }
                        None => {
                            closed = true;
                            cancel.cancel();
                        }
                    },
                }
            }
        };

        if device.is_some() {
            self.session.device = device;
        }

        if !acks.is_empty() || closed {
            // A disconnect raced the episode; it wins even over success.
            // A cancelled attempt may have left the link half open.
            match result {
                Ok(stream) => {
                    self.session.notifications = Some(stream);
                    self.session.link_up = true;
                }
                Err(RetryError::Cancelled) => self.session.link_up = true,
                Err(RetryError::Exhausted { .. }) => {}
            }
            self.shutdown().await;
            for ack in acks {
                let _ = ack.send(());
            }
            return;
        }

        match result {
            Ok(stream) => {
                self.session.calculator.reset();
                self.session.notifications = Some(stream);
                self.session.link_up = true;
            }
            Err(RetryError::Cancelled) => {
                self.session.link_up = true;
                self.shutdown().await;
            }
            Err(RetryError::Exhausted { attempts, last_error }) => {
                tracing::error!(
                    "Failed to connect after {} attempts: {}",
                    attempts,
                    last_error
                );
                self.session.teardown(self.shared.transport.as_ref()).await;
                self.shared.board.set_cadence(None);
                self.shared.board.apply(SessionInput::AttemptFailed {
                    retry_pending: false,
                });
            }
        }
    }

    /// Tear everything down and settle in `Disconnected`.
    async fn shutdown(&mut self) {
        self.session.teardown(self.shared.transport.as_ref()).await;
        self.shared.board.set_cadence(None);
        self.shared.board.apply(SessionInput::ManualDisconnect);
    }
}

/// Handle to a cadence sensor session.
///
/// Dropping the handle stops the session task after tearing down.
pub struct ConnectionManager {
    /// Channel to the session task
    commands: mpsc::UnboundedSender<Command>,
    /// Latest state and cadence
    snapshot: watch::Receiver<SessionUpdate>,
    /// Source for update subscriptions
    updates: broadcast::Sender<SessionUpdate>,
    /// Session task
    task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Start a session task on the current tokio runtime.
    pub fn spawn<T: SensorTransport>(transport: T, config: SessionConfig) -> Self {
        Self::spawn_shared(Arc::new(transport), config)
    }

    /// Start a session task over a transport the caller keeps a handle to.
    pub fn spawn_shared<T: SensorTransport>(transport: Arc<T>, config: SessionConfig) -> Self {
        let initial = SessionUpdate {
            state: ConnectionState::Disconnected,
            cadence: None,
        };
        let (snapshot_tx, snapshot) = watch::channel(initial);
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let (commands, command_rx) = mpsc::unbounded_channel();

        let driver = SessionDriver {
            session: Session::create(config.layout),
            shared: Shared {
                transport,
                config,
                board: StatusBoard {
                    snapshot: snapshot_tx,
                    updates: updates.clone(),
                },
            },
            commands: command_rx,
        };

        tracing::info!("Starting sensor session");
        let task = tokio::spawn(driver.run());

        Self {
            commands,
            snapshot,
            updates,
            task,
        }
    }

    /// Start connecting. Ignored while connecting or connected.
    pub fn connect(&self) -> Result<(), SensorError> {
        self.commands
            .send(Command::Connect)
            .map_err(|_| SensorError::SessionClosed)
    }

    /// Tear down the session, cancelling any pending retry.
    ///
    /// Resolves once the session has reached `Disconnected`. Safe to call
    /// in any state and any number of times.
    pub async fn disconnect(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect(ack_tx)).is_err() {
            tracing::debug!("Disconnect on a closed session");
            return;
        }
        let _ = ack_rx.await;
    }

    /// Subscribe to every state transition and cadence change.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    /// Watch the latest update.
    pub fn watch(&self) -> watch::Receiver<SessionUpdate> {
        self.snapshot.clone()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    /// Latest cadence (if any).
    pub fn cadence(&self) -> Option<CadenceEstimate> {
        self.snapshot.borrow().cadence
    }

    /// Disconnect and wait for the session task to finish.
    pub async fn shutdown(self) {
        self.disconnect().await;
        let Self { commands, task, .. } = self;
        drop(commands);
        if let Err(e) = task.await {
            tracing::error!("Sensor session task failed: {}", e);
        }
    }
}
