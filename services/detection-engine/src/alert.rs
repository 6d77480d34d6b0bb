//! Fraud alert aggregate
//!
//! The alert workflow is a state machine kept as data: states are a tagged
//! enum and transitions go through one pure function. The aggregate is the
//! only writer of alert state; persistence wraps the pure transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertEventType {
    CliMasking,
    Simbox,
    Wangiri,
    Refiling,
    CpmExceeded,
    AcdLow,
    BlacklistHit,
}

impl AlertEventType {
    /// Precedence when one event trips several rules; used only to choose
    /// the primary label for metrics.
    pub fn precedence(&self) -> u8 {
        match self {
            Self::BlacklistHit => 0,
            Self::Simbox => 1,
            Self::CliMasking => 2,
            Self::CpmExceeded => 3,
            Self::AcdLow => 4,
            Self::Wangiri => 5,
            Self::Refiling => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CliMasking => "CLI_MASKING",
            Self::Simbox => "SIMBOX",
            Self::Wangiri => "WANGIRI",
            Self::Refiling => "REFILING",
            Self::CpmExceeded => "CPM_EXCEEDED",
            Self::AcdLow => "ACD_LOW",
            Self::BlacklistHit => "BLACKLIST_HIT",
        }
    }
}

impl std::fmt::Display for AlertEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlertEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CLI_MASKING" => Ok(Self::CliMasking),
            "SIMBOX" => Ok(Self::Simbox),
            "WANGIRI" => Ok(Self::Wangiri),
            "REFILING" => Ok(Self::Refiling),
            "CPM_EXCEEDED" => Ok(Self::CpmExceeded),
            "ACD_LOW" => Ok(Self::AcdLow),
            "BLACKLIST_HIT" => Ok(Self::BlacklistHit),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Fixed mapping from detection confidence
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.9 {
            Self::Critical
        } else if confidence >= 0.75 {
            Self::High
        } else if confidence >= 0.5 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Pending,
    Acknowledged,
    Investigating,
    Resolved,
    ReportedNcc,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Acknowledged => "acknowledged",
            Self::Investigating => "investigating",
            Self::Resolved => "resolved",
            Self::ReportedNcc => "reported_ncc",
        }
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "acknowledged" => Ok(Self::Acknowledged),
            "investigating" => Ok(Self::Investigating),
            "resolved" => Ok(Self::Resolved),
            "reported_ncc" => Ok(Self::ReportedNcc),
            other => Err(format!("unknown alert status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    ConfirmedFraud,
    FalsePositive,
    Escalated,
    Whitelisted,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfirmedFraud => "confirmed_fraud",
            Self::FalsePositive => "false_positive",
            Self::Escalated => "escalated",
            Self::Whitelisted => "whitelisted",
        }
    }
}

impl std::str::FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmed_fraud" => Ok(Self::ConfirmedFraud),
            "false_positive" => Ok(Self::FalsePositive),
            "escalated" => Ok(Self::Escalated),
            "whitelisted" => Ok(Self::Whitelisted),
            other => Err(format!("unknown resolution: {other}")),
        }
    }
}

/// Workflow commands applied to an alert
#[derive(Debug, Clone)]
pub enum AlertCommand {
    Acknowledge { user_id: String },
    StartInvestigation,
    Resolve {
        user_id: String,
        resolution: Resolution,
        notes: Option<String>,
    },
    ReportNcc { report_id: String },
}

impl AlertCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Acknowledge { .. } => "acknowledge",
            Self::StartInvestigation => "start_investigation",
            Self::Resolve { .. } => "resolve",
            Self::ReportNcc { .. } => "report_ncc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("alert is already {0}")]
    AlreadyInState(AlertStatus),
    #[error("illegal transition from {from} on {command}")]
    IllegalTransition { from: AlertStatus, command: &'static str },
}

/// The transition function. Pure: no clocks, no side effects. Repeating a
/// command from its own target state is `AlreadyInState`; anything else off
/// the allowed graph is `IllegalTransition`. Status never moves backwards.
pub fn next_status(
    current: AlertStatus,
    command: &AlertCommand,
) -> Result<AlertStatus, TransitionError> {
    use AlertStatus::*;

    match (current, command) {
        (Pending, AlertCommand::Acknowledge { .. }) => Ok(Acknowledged),
        (Acknowledged, AlertCommand::Acknowledge { .. }) => Err(TransitionError::AlreadyInState(Acknowledged)),

        (Acknowledged, AlertCommand::StartInvestigation) => Ok(Investigating),
        (Investigating, AlertCommand::StartInvestigation) => Err(TransitionError::AlreadyInState(Investigating)),

        (Pending | Acknowledged | Investigating, AlertCommand::Resolve { .. }) => Ok(Resolved),
        (Resolved, AlertCommand::Resolve { .. }) => Err(TransitionError::AlreadyInState(Resolved)),

        (Acknowledged | Investigating | Resolved, AlertCommand::ReportNcc { .. }) => Ok(ReportedNcc),
        (ReportedNcc, AlertCommand::ReportNcc { .. }) => Err(TransitionError::AlreadyInState(ReportedNcc)),

        (from, command) => Err(TransitionError::IllegalTransition {
            from,
            command: command.name(),
        }),
    }
}

/// Aggregate root for a detected fraud incident
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudAlert {
    pub id: Uuid,
    /// Representative dialog that triggered the detection
    pub call_id: String,
    pub event_type: AlertEventType,
    pub severity: Severity,
    pub a_numbers: Vec<String>,
    pub b_number: Option<String>,
    pub source_ip: Option<IpAddr>,
    pub gateway_id: Option<Uuid>,
    pub confidence: f64,
    pub detection_method: String,
    pub matched_patterns: Vec<String>,
    /// Call-ids that contributed to the triggering window
    pub contributing_call_ids: Vec<String>,
    pub should_auto_escalate: bool,

    pub status: AlertStatus,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<Resolution>,
    pub resolution_notes: Option<String>,

    pub ncc_reported: bool,
    pub ncc_report_id: Option<String>,
    pub ncc_reported_at: Option<DateTime<Utc>>,

    pub detected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FraudAlert {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        call_id: String,
        event_type: AlertEventType,
        a_numbers: Vec<String>,
        b_number: Option<String>,
        source_ip: Option<IpAddr>,
        gateway_id: Option<Uuid>,
        confidence: f64,
        detection_method: String,
        matched_patterns: Vec<String>,
        contributing_call_ids: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        let severity = Severity::from_confidence(confidence);
        Self {
            id: Uuid::new_v4(),
            call_id,
            event_type,
            severity,
            a_numbers,
            b_number,
            source_ip,
            gateway_id,
            confidence,
            detection_method,
            matched_patterns,
            contributing_call_ids,
            should_auto_escalate: severity == Severity::Critical && confidence >= 0.95,
            status: AlertStatus::Pending,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            resolved_at: None,
            resolution: None,
            resolution_notes: None,
            ncc_reported: false,
            ncc_report_id: None,
            ncc_reported_at: None,
            detected_at: now,
            updated_at: now,
        }
    }

    /// Apply a workflow command. The pure transition validates; the
    /// aggregate records the side fields for the new state.
    pub fn apply(&mut self, command: &AlertCommand) -> Result<AuditEntry, TransitionError> {
        let from = self.status;
        let to = next_status(from, command)?;
        let now = Utc::now();
        let mut user = None;

        match command {
            AlertCommand::Acknowledge { user_id } => {
                self.acknowledged_by = Some(user_id.clone());
                self.acknowledged_at = Some(now);
                user = Some(user_id.clone());
            }
            AlertCommand::StartInvestigation => {}
            AlertCommand::Resolve {
                user_id,
                resolution,
                notes,
            } => {
                self.resolved_by = Some(user_id.clone());
                self.resolved_at = Some(now);
                self.resolution = Some(*resolution);
                self.resolution_notes = notes.clone();
                user = Some(user_id.clone());
            }
            AlertCommand::ReportNcc { report_id } => {
                self.ncc_reported = true;
                self.ncc_report_id = Some(report_id.clone());
                self.ncc_reported_at = Some(now);
            }
        }

        self.status = to;
        self.updated_at = now;
        Ok(AuditEntry {
            alert_id: self.id,
            user,
            from_state: from,
            to_state: to,
            at: now,
        })
    }
}

/// One row of the append-only alert transition log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub alert_id: Uuid,
    pub user: Option<String>,
    pub from_state: AlertStatus,
    pub to_state: AlertStatus,
    pub at: DateTime<Utc>,
}
