//! Error types.
//!
//! [`BleError`] is what a [`crate::central::BleCentral`] reports.
//! [`SessionError`] classifies those failures by the session phase they
//! interrupted, which is what decides whether the supervisor recovers.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a BLE collaborator.
#[derive(Debug, Error)]
pub enum BleError {
    #[error(transparent)]
    Btleplug(#[from] btleplug::Error),

    #[error("no Bluetooth adapter found")]
    NoAdapter,

    #[error("adapter has not been enabled")]
    AdapterNotEnabled,

    #[error("device {0} is not known to the adapter")]
    UnknownDevice(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("{0}")]
    Other(String),
}

/// The byte stream behind a [`crate::bridge::ByteSource`] has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("link closed")]
pub struct LinkClosed;

/// Failure of one supervisor phase.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Adapter enable or scan start failed.
    #[error("bluetooth adapter error: {0}")]
    Adapter(#[source] BleError),

    #[error("could not connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: BleError,
    },

    #[error("transparent UART service not found on {address}")]
    ServiceDiscovery {
        address: String,
        #[source]
        source: Option<BleError>,
    },

    #[error("TX/RX characteristics not found on {address}")]
    CharacteristicDiscovery {
        address: String,
        #[source]
        source: Option<BleError>,
    },

    #[error("could not enable TX notifications on {address}: {source}")]
    NotificationSetup {
        address: String,
        #[source]
        source: BleError,
    },

    /// Writing a reading to the output sink failed.
    #[error("output error: {0}")]
    Output(#[from] std::io::Error),
}

impl SessionError {
    /// `true` for failures the supervisor handles by backing off and
    /// rescanning.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SessionError::Adapter(_) | SessionError::Output(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_phase_failures_are_recoverable() {
        let connect = SessionError::Connect {
            address: "00:A0:50:C8:E7:31".into(),
            source: BleError::UnknownDevice("00:A0:50:C8:E7:31".into()),
        };
        assert!(connect.is_recoverable());
        assert!(!SessionError::Adapter(BleError::NoAdapter).is_recoverable());
        let output = SessionError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(!output.is_recoverable());
    }

    #[test]
    fn messages_name_the_device() {
        let err = SessionError::ServiceDiscovery {
            address: "00:A0:50:C8:E7:31".into(),
            source: None,
        };
        assert_eq!(
            err.to_string(),
            "transparent UART service not found on 00:A0:50:C8:E7:31"
        );
    }
}
