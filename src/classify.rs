// =============================================================================
// classify.rs - THE FAILURE TAXONOMIST
// =============================================================================
//
// Every way an MQTT session can die, sorted into a small closed vocabulary.
// The broker speaks in return codes, the transport speaks in io errors, the
// client library speaks in three different error enums, and the dashboard
// wants exactly one short word. This module is the translator.
//
// The taxonomy is closed on purpose: `disconnect_causes` is a histogram,
// and histograms over open vocabularies turn into confetti. Each tag below
// is the only spelling of its failure class that is allowed to reach the
// aggregator.
//
//   ok, auth, protocol, client-id, broker, network, network-timeout, tls,
//   payload, client-memory, client-backpressure, client, client-request,
//   internal-error, unknown
// =============================================================================

use rumqttc::{ClientError, ConnectReturnCode, ConnectionError, StateError};
use std::io;

use crate::models::FailureStage;

/// A classified failure: the compact reason tag (one of the closed set
/// above) and a short human-readable detail string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub reason: &'static str,
    pub detail: String,
}

impl Classification {
    fn new(reason: &'static str, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

/// The low-level cause handed to [`classify`]: a numeric broker return
/// code, or one of rumqttc's error types.
#[derive(Debug)]
pub enum FailureCause<'a> {
    Code(u8),
    Connection(&'a ConnectionError),
    Client(&'a ClientError),
}

/// Terminal disconnect reasons that do NOT count as failures. Anything
/// else that reaches `record_client_disconnected` lands in the failure
/// taxonomy and may mark a collapse.
pub fn is_graceful_reason(reason: &str) -> bool {
    matches!(reason, "graceful" | "loop_exit" | "stopped" | "cancelled")
}

/// Map a low-level MQTT outcome into a taxonomy bucket.
///
/// Pure function: same inputs, same bucket, no side effects. Error-typed
/// causes win over return codes, mirroring how the client library reports
/// them (a transport error never comes with a broker code attached).
pub fn classify(stage: FailureStage, cause: Option<FailureCause<'_>>) -> Classification {
    match cause {
        Some(FailureCause::Connection(err)) => classify_connection_error(err),
        Some(FailureCause::Client(err)) => Classification::new(
            "client-backpressure",
            format!("request channel rejected operation: {err}"),
        ),
        Some(FailureCause::Code(rc)) => classify_code(stage, rc),
        None => Classification::new("unknown", "Unknown failure cause"),
    }
}

/// CONNACK return codes as defined by MQTT 3.1.1, plus the catch-all for
/// brokers with creative ideas about return codes.
pub fn classify_connect_code(rc: u8) -> Classification {
    match rc {
        0 => Classification::new("ok", "Connected successfully"),
        1 => Classification::new("protocol", "Unacceptable protocol version"),
        2 => Classification::new("client-id", "Client identifier rejected"),
        3 => Classification::new("broker", "Server unavailable"),
        4 => Classification::new("auth", "Bad username or password"),
        5 => Classification::new("auth", "Not authorized"),
        other => Classification::new("broker", format!("connect return code {other}")),
    }
}

/// Collapse rumqttc's `ConnectReturnCode` into the wire-level numeric code
/// the classifier speaks.
pub fn connack_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

fn classify_code(stage: FailureStage, rc: u8) -> Classification {
    match stage {
        FailureStage::Connect => classify_connect_code(rc),
        FailureStage::Disconnect if rc == 0 => {
            Classification::new("client-request", "Client requested disconnect")
        }
        _ => Classification::new("broker", format!("rc={rc}")),
    }
}

fn classify_connection_error(err: &ConnectionError) -> Classification {
    match err {
        ConnectionError::ConnectionRefused(code) => classify_connect_code(connack_code(*code)),
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
            Classification::new("network-timeout", err.to_string())
        }
        ConnectionError::Io(io_err) => classify_io_error(io_err),
        ConnectionError::MqttState(StateError::Io(io_err)) => classify_io_error(io_err),
        ConnectionError::MqttState(state_err) => {
            Classification::new("protocol", state_err.to_string())
        }
        ConnectionError::NotConnAck(packet) => Classification::new(
            "protocol",
            format!("expected CONNACK, received {packet:?}"),
        ),
        ConnectionError::RequestsDone => {
            Classification::new("client-request", "Request stream closed")
        }
        other => {
            // Feature-gated variants (TLS, websocket) land here; sniff the
            // rendering so a handshake failure still gets its own bucket.
            let detail = other.to_string();
            if detail.to_lowercase().contains("tls") {
                Classification::new("tls", detail)
            } else {
                Classification::new("internal-error", detail)
            }
        }
    }
}

fn classify_io_error(err: &io::Error) -> Classification {
    let reason = match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => "network-timeout",
        io::ErrorKind::OutOfMemory => "client-memory",
        io::ErrorKind::InvalidData => "protocol",
        _ => "network",
    };
    Classification::new(reason, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_codes_map_to_spec_taxonomy() {
        let expected = [
            (0u8, "ok"),
            (1, "protocol"),
            (2, "client-id"),
            (3, "broker"),
            (4, "auth"),
            (5, "auth"),
            (42, "broker"),
        ];
        for (code, reason) in expected {
            let cls = classify(FailureStage::Connect, Some(FailureCause::Code(code)));
            assert_eq!(cls.reason, reason, "code {code}");
        }
    }

    #[test]
    fn test_clean_disconnect_is_client_request() {
        let cls = classify(FailureStage::Disconnect, Some(FailureCause::Code(0)));
        assert_eq!(cls.reason, "client-request");
    }

    #[test]
    fn test_nonzero_disconnect_is_broker() {
        let cls = classify(FailureStage::Disconnect, Some(FailureCause::Code(7)));
        assert_eq!(cls.reason, "broker");
        assert_eq!(cls.detail, "rc=7");
    }

    #[test]
    fn test_missing_cause_is_unknown() {
        let cls = classify(FailureStage::Exception, None);
        assert_eq!(cls.reason, "unknown");
    }

    #[test]
    fn test_io_timeout_is_network_timeout() {
        let io_err = ConnectionError::Io(io::Error::new(io::ErrorKind::TimedOut, "deadline"));
        let cls = classify(FailureStage::Connect, Some(FailureCause::Connection(&io_err)));
        assert_eq!(cls.reason, "network-timeout");
    }

    #[test]
    fn test_connection_refused_is_network() {
        let io_err = ConnectionError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "nobody home",
        ));
        let cls = classify(FailureStage::Connect, Some(FailureCause::Connection(&io_err)));
        assert_eq!(cls.reason, "network");
    }

    #[test]
    fn test_refused_connack_routes_through_connect_codes() {
        let err = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        let cls = classify(FailureStage::Connect, Some(FailureCause::Connection(&err)));
        assert_eq!(cls.reason, "auth");
    }

    #[test]
    fn test_graceful_reason_set() {
        for reason in ["graceful", "loop_exit", "stopped", "cancelled"] {
            assert!(is_graceful_reason(reason));
        }
        assert!(!is_graceful_reason("mqtt_error:network"));
        assert!(!is_graceful_reason("auth"));
    }

    #[test]
    fn test_connack_code_is_wire_faithful() {
        assert_eq!(connack_code(ConnectReturnCode::Success), 0);
        assert_eq!(connack_code(ConnectReturnCode::BadUserNamePassword), 4);
        assert_eq!(connack_code(ConnectReturnCode::NotAuthorized), 5);
    }
}
