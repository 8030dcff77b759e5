//! Sensor session types: connection state machine, updates and errors.

use crate::metrics::cadence::CadenceEstimate;
use thiserror::Error;

/// Connection state of the cadence sensor session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Establishing the transport link
    Connecting,
    /// Link up, enabling measurement notifications
    Subscribing,
    /// Notifications flowing
    Connected,
    /// Waiting out a backoff delay before the next attempt
    Reconnecting,
    /// Retry budget exhausted; needs a manual connect
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting..."),
            ConnectionState::Subscribing => write!(f, "Subscribing..."),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting..."),
            ConnectionState::Failed => write!(f, "Failed"),
        }
    }
}

/// Inputs that drive [`ConnectionState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInput {
    /// User asked to connect
    ConnectRequested,
    /// A new attempt is starting
    AttemptStarted,
    /// Transport link established
    TransportConnected,
    /// Notifications enabled
    SubscriptionConfirmed,
    /// Connect or subscribe failed
    AttemptFailed {
        /// Whether the retry budget allows another attempt
        retry_pending: bool,
    },
    /// Transport reported the link dropped
    LinkLost,
    /// User asked to disconnect
    ManualDisconnect,
}

impl ConnectionState {
    /// State after applying `input`. Inputs with no meaning in the
    /// current state leave it unchanged.
    pub fn next(self, input: SessionInput) -> ConnectionState {
        use ConnectionState::*;
        use SessionInput::*;

        match (self, input) {
            (_, ManualDisconnect) => Disconnected,

            (Disconnected | Failed, ConnectRequested) => Connecting,

            (Reconnecting, AttemptStarted) => Connecting,
            (Connecting, TransportConnected) => Subscribing,
            (Subscribing, SubscriptionConfirmed) => Connected,

            (Connecting | Subscribing, AttemptFailed { retry_pending: true }) => Reconnecting,
            (Connecting | Subscribing, AttemptFailed { retry_pending: false }) => Failed,

            (Connected, LinkLost) => Reconnecting,

            (state, _) => state,
        }
    }

    /// Whether a connect request should start a new episode.
    pub fn accepts_connect(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

/// Published on every state transition and every cadence change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionUpdate {
    /// Current connection state
    pub state: ConnectionState,
    /// Latest cadence (if one has been computed this link)
    pub cadence: Option<CadenceEstimate>,
}

impl SessionUpdate {
    /// Display line for the cadence, `0.0 rpm` when none.
    pub fn cadence_text(&self) -> String {
        self.cadence.unwrap_or_default().to_string()
    }
}

/// Errors that can occur in the sensor system.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    /// BLE adapter not found or unavailable
    #[error("Bluetooth adapter not found")]
    AdapterNotFound,

    /// No device matched the discovery filter
    #[error("No cadence sensor found: {0}")]
    DeviceNotFound(String),

    /// Connection to sensor failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connected device lacks the CSC service
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Service lacks the CSC Measurement characteristic
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),

    /// Failed to subscribe to sensor notifications
    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    /// Failed to stop sensor notifications
    #[error("Failed to stop notifications: {0}")]
    UnsubscribeFailed(String),

    /// Session task is no longer running
    #[error("Sensor session closed")]
    SessionClosed,

    /// Generic BLE error
    #[error("BLE error: {0}")]
    BleError(String),
}
