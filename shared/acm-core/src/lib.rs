//! Shared domain types and service infrastructure for the ACM platform.

pub mod domain;
pub mod error;
pub mod metrics;
pub mod telemetry;

pub use domain::{Msisdn, MsisdnError, Operator};
pub use error::{AcmError, Result};
pub use metrics::{Counter, Gauge, Histogram};
