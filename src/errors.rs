// src/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use std::time::Duration;
use thiserror::Error;
use tokio::time::error::Elapsed;

use crate::acknowledger::TicketKey;

#[derive(Debug, Error)]
pub enum BusError {
    /// Fatal setup problem such as conflicting topology or an invalid config.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Broker channel error: {0}")]
    Channel(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] SerdeError),

    #[error("Publish confirm not received within {0:?}")]
    AcknowledgementTimeout(Duration),

    #[error("Broker rejected publish (nack) for {0}")]
    NegativeAcknowledgement(TicketKey),

    #[error("Request {correlation_id} got no reply within {after:?}")]
    RequestTimeout { correlation_id: String, after: Duration },

    #[error("Reply to request {correlation_id} is not a {expected}")]
    UndecodableReply { correlation_id: String, expected: String },

    #[error("A request with correlation id {0} is already pending")]
    DuplicateCorrelation(String),

    #[error("A confirm ticket is already pending for {0}")]
    DuplicateTicket(TicketKey),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Bus is shutting down")]
    Shutdown,
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, BusError>;

impl BusError {
    /// True for both confirm and reply deadlines.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            BusError::AcknowledgementTimeout(_) | BusError::RequestTimeout { .. }
        )
    }

    /// Connection-level failures are the only ones recovery can fix.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BusError::Connection(_) | BusError::Channel(_))
    }
}

// Converting from lapin errors
impl From<LapinError> for BusError {
    fn from(error: LapinError) -> Self {
        match error {
            LapinError::ProtocolError(ref amqp) => {
                // 406 PRECONDITION_FAILED is what the broker answers for
                // redeclaring an entity with different properties.
                if amqp.get_id() == 406 {
                    BusError::Configuration(error.to_string())
                } else {
                    BusError::Channel(error.to_string())
                }
            }
            LapinError::InvalidChannel(_)
            | LapinError::InvalidChannelState(_)
            | LapinError::ChannelsLimitReached => BusError::Channel(error.to_string()),
            _ => BusError::Connection(error.to_string()),
        }
    }
}

impl From<Elapsed> for BusError {
    fn from(_: Elapsed) -> Self {
        BusError::Connection("Broker operation timed out".to_string())
    }
}
