//! Call-state event and enforcement wire types

use acm_core::Msisdn;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::error::{Error, Result};

/// SIP dialog state as reported by the SBC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Active,
    Completed,
    Disconnected,
}

impl CallStatus {
    /// Ordering of states within one dialog, used to keep per-call-id order.
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::Ringing => 0,
            Self::Active => 1,
            Self::Completed => 2,
            Self::Disconnected => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Disconnected)
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ringing => "ringing",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ringing" => Ok(Self::Ringing),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "disconnected" => Ok(Self::Disconnected),
            other => Err(format!("unknown call status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// A validated call-state event. Immutable once observed.
#[derive(Debug, Clone, Serialize)]
pub struct CallEvent {
    pub call_id: String,
    pub a_number: Msisdn,
    pub b_number: Msisdn,
    pub timestamp: DateTime<Utc>,
    pub status: CallStatus,
    pub source_ip: Option<IpAddr>,
    pub switch_id: Option<String>,
    pub direction: Option<Direction>,
    pub sip_method: Option<String>,
    pub user_agent: Option<String>,
    /// Known for completed calls; feeds ACD and Wangiri analysis
    pub duration_secs: Option<f64>,
}

/// Inbound event as posted by the SBC; numbers and enum literals arrive as
/// strings and are validated here so malformed input gets a structured 400
/// instead of a deserializer error.
#[derive(Debug, Clone, Deserialize)]
pub struct CallEventRequest {
    pub call_id: String,
    pub a_number: String,
    pub b_number: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub status: String,
    #[serde(default)]
    pub source_ip: Option<String>,
    #[serde(default)]
    pub switch_id: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub sip_method: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
}

impl CallEventRequest {
    /// Validate and normalize into a [`CallEvent`]. Rejection here keeps
    /// malformed input away from the detector entirely.
    pub fn validate(self) -> Result<CallEvent> {
        if self.call_id.trim().is_empty() {
            return Err(Error::InvalidRequest("call_id must not be empty".into()));
        }
        let a_number = Msisdn::parse(&self.a_number)?;
        let b_number = Msisdn::parse(&self.b_number)?;
        let status: CallStatus = self.status.parse().map_err(Error::InvalidRequest)?;
        let direction = match self.direction.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(raw.parse::<Direction>().map_err(Error::InvalidRequest)?),
        };
        let source_ip = match self.source_ip.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(
                raw.parse::<IpAddr>()
                    .map_err(|_| Error::InvalidRequest(format!("invalid source_ip: {raw}")))?,
            ),
        };
        if let Some(d) = self.duration_secs {
            if !d.is_finite() || d < 0.0 {
                return Err(Error::InvalidRequest(format!("invalid duration_secs: {d}")));
            }
        }

        Ok(CallEvent {
            call_id: self.call_id,
            a_number,
            b_number,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            status,
            source_ip,
            switch_id: self.switch_id,
            direction,
            sip_method: self.sip_method,
            user_agent: self.user_agent,
            duration_secs: self.duration_secs,
        })
    }
}

/// A currently ringing or answered call tracked by the registry
#[derive(Debug, Clone, Serialize)]
pub struct ActiveCall {
    pub call_id: String,
    pub a_number: Msisdn,
    pub b_number: Msisdn,
    pub started_at: DateTime<Utc>,
    pub switch_id: Option<String>,
    pub status: CallStatus,
}

// ============================================
// Disconnect dispatch
// ============================================

#[derive(Debug, Clone, Deserialize)]
pub struct DisconnectRequest {
    pub call_ids: Vec<String>,
    #[serde(default)]
    pub alert_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectResult {
    pub call_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisconnectResponse {
    pub requested: usize,
    pub disconnected: usize,
    pub failed: usize,
    pub results: Vec<DisconnectResult>,
}

// ============================================
// Webhook ingestion
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventType {
    FraudDetected,
    FraudCleared,
}

/// Alert notification pushed by detector-side producers
#[derive(Debug, Clone, Deserialize)]
pub struct FraudAlertWebhook {
    pub event_type: WebhookEventType,
    pub alert: serde_json::Value,
}

/// Per-callee multiplicity row for `/fraud/calls/stats`
#[derive(Debug, Clone, Serialize)]
pub struct BNumberStats {
    pub b_number: String,
    pub call_count: usize,
    pub unique_a_numbers: usize,
    pub is_flagged: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallStats {
    pub active_calls: usize,
    pub top_b_numbers: Vec<BNumberStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(a: &str, b: &str) -> CallEventRequest {
        CallEventRequest {
            call_id: "call-1".into(),
            a_number: a.into(),
            b_number: b.into(),
            timestamp: None,
            status: "ringing".into(),
            source_ip: Some("10.1.2.3".into()),
            switch_id: Some("sw-1".into()),
            direction: Some("inbound".into()),
            sip_method: Some("INVITE".into()),
            user_agent: None,
            duration_secs: None,
        }
    }

    #[test]
    fn validates_and_normalizes_numbers() {
        let event = request("08031234567", "+2348099999999").validate().unwrap();
        assert_eq!(event.a_number.as_str(), "+2348031234567");
        assert_eq!(event.b_number.as_str(), "+2348099999999");
        assert_eq!(event.source_ip.unwrap().to_string(), "10.1.2.3");
        assert_eq!(event.status, CallStatus::Ringing);
        assert_eq!(event.direction, Some(Direction::Inbound));
    }

    #[test]
    fn rejects_unknown_status_and_direction_literals() {
        let mut req = request("08031234567", "+2348099999999");
        req.status = "ended".into();
        assert!(req.validate().is_err());

        let mut req = request("08031234567", "+2348099999999");
        req.direction = Some("sideways".into());
        assert!(req.validate().is_err());
    }

    #[test]
    fn rejects_bad_msisdn_and_ip() {
        assert!(request("not-a-number", "+2348099999999").validate().is_err());

        let mut req = request("08031234567", "+2348099999999");
        req.source_ip = Some("999.1.2.3".into());
        assert!(req.validate().is_err());
    }

    #[test]
    fn rejects_empty_call_id() {
        let mut req = request("08031234567", "+2348099999999");
        req.call_id = "  ".into();
        assert!(req.validate().is_err());
    }

    #[test]
    fn status_literals_are_lowercase_on_the_wire() {
        let status: CallStatus = serde_json::from_str("\"ringing\"").unwrap();
        assert_eq!(status, CallStatus::Ringing);
        assert!(serde_json::from_str::<CallStatus>("\"RINGING\"").is_err());
        assert_eq!(serde_json::to_string(&CallStatus::Disconnected).unwrap(), "\"disconnected\"");
    }

    #[test]
    fn terminal_states() {
        assert!(CallStatus::Completed.is_terminal());
        assert!(CallStatus::Disconnected.is_terminal());
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(CallStatus::Ringing.ordinal() < CallStatus::Active.ordinal());
    }
}
