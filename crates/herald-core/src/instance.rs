use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::InstanceId;

/// Connection lifecycle of a single messaging instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Uninitialized,
    Initializing,
    AwaitingQrScan,
    Ready,
    Disconnected,
    AuthFailure,
}

impl ConnectionState {
    /// Whether `self -> next` is an edge of the lifecycle graph.
    ///
    /// `Disconnected` and `AuthFailure` only leave through an explicit
    /// `initialize`; nothing reconnects on its own.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Uninitialized, Initializing)
                | (Initializing, AwaitingQrScan)
                | (Initializing, Ready)
                | (Initializing, AuthFailure)
                | (Initializing, Disconnected)
                | (AwaitingQrScan, Ready)
                | (AwaitingQrScan, AuthFailure)
                | (AwaitingQrScan, Disconnected)
                | (Ready, Disconnected)
                | (Disconnected, Initializing)
                | (AuthFailure, Initializing)
        )
    }

    /// A handshake is in flight; `initialize` is a no-op here.
    pub fn is_handshaking(self) -> bool {
        matches!(self, Self::Initializing | Self::AwaitingQrScan)
    }

    pub fn is_initialized(self) -> bool {
        matches!(self, Self::Initializing | Self::AwaitingQrScan | Self::Ready)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::AwaitingQrScan => "awaiting_qr_scan",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::AuthFailure => "auth_failure",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ConnectionState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uninitialized" => Ok(Self::Uninitialized),
            "initializing" => Ok(Self::Initializing),
            "awaiting_qr_scan" => Ok(Self::AwaitingQrScan),
            "ready" => Ok(Self::Ready),
            "disconnected" => Ok(Self::Disconnected),
            "auth_failure" => Ok(Self::AuthFailure),
            other => Err(format!("unknown connection state: {other}")),
        }
    }
}

/// One logical connection to a messaging account.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagingInstance {
    pub id: InstanceId,
    pub phone_number: String,
    pub display_name: String,
    pub connection_state: ConnectionState,
    pub qr_code: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessagingInstance {
    pub fn new(phone_number: impl Into<String>, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::new(),
            phone_number: phone_number.into(),
            display_name: display_name.into(),
            connection_state: ConnectionState::Uninitialized,
            qr_code: None,
            last_connected_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Ready
    }

    pub fn status(&self) -> InstanceStatus {
        InstanceStatus {
            instance_id: self.id.clone(),
            state: self.connection_state,
            is_connected: self.is_connected(),
            is_initialized: self.connection_state.is_initialized(),
            qr_code: self.qr_code.clone(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Externally visible status of an instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub instance_id: InstanceId,
    pub state: ConnectionState,
    pub is_connected: bool,
    pub is_initialized: bool,
    pub qr_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    const ALL: [ConnectionState; 6] = [
        Uninitialized,
        Initializing,
        AwaitingQrScan,
        Ready,
        Disconnected,
        AuthFailure,
    ];

    #[test]
    fn legal_edges() {
        assert!(Uninitialized.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(AwaitingQrScan));
        assert!(Initializing.can_transition_to(Ready));
        assert!(AwaitingQrScan.can_transition_to(Ready));
        assert!(AwaitingQrScan.can_transition_to(AuthFailure));
        assert!(Ready.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Initializing));
        assert!(AuthFailure.can_transition_to(Initializing));
    }

    #[test]
    fn illegal_edges() {
        assert!(!Uninitialized.can_transition_to(Ready));
        assert!(!Uninitialized.can_transition_to(AwaitingQrScan));
        assert!(!Ready.can_transition_to(AwaitingQrScan));
        assert!(!Ready.can_transition_to(AuthFailure));
        assert!(!Ready.can_transition_to(Initializing));
        assert!(!Disconnected.can_transition_to(Ready));
        assert!(!AuthFailure.can_transition_to(Ready));
    }

    #[test]
    fn no_self_loops() {
        for state in ALL {
            assert!(!state.can_transition_to(state), "{state} -> {state}");
        }
    }

    #[test]
    fn ready_only_reachable_from_handshake() {
        for state in ALL {
            if state.can_transition_to(Ready) {
                assert!(state.is_handshaking(), "{state} reaches ready");
            }
        }
    }

    #[test]
    fn display_and_parse_agree() {
        for state in ALL {
            let parsed: ConnectionState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("bogus".parse::<ConnectionState>().is_err());
    }

    #[test]
    fn status_reflects_state() {
        let mut inst = MessagingInstance::new("+15550001", "Front desk");
        let status = inst.status();
        assert!(!status.is_connected);
        assert!(!status.is_initialized);

        inst.connection_state = AwaitingQrScan;
        inst.qr_code = Some("2@abc".into());
        let status = inst.status();
        assert!(!status.is_connected);
        assert!(status.is_initialized);
        assert_eq!(status.qr_code.as_deref(), Some("2@abc"));

        inst.connection_state = Ready;
        assert!(inst.status().is_connected);
    }
}
