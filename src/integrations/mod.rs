//! Vendor adapters for the health-data and task platforms.
//!
//! Every call is a single attempt: failures come back to the caller, which
//! logs them and carries on.

pub mod nokia;
pub mod oauth1;
pub mod salesforce;
pub mod vitadock;
pub mod wunderlist;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use nokia::NokiaClient;
pub use oauth1::{Credentials, OAuthError};
pub use salesforce::SalesforceClient;
pub use vitadock::VitadockClient;
pub use wunderlist::WunderlistClient;

/// Provider names as stored in `oauth_tokens.provider`.
pub const PROVIDER_NOKIA: &str = "nokia";
pub const PROVIDER_VITADOCK: &str = "vitadock";
pub const PROVIDER_WUNDERLIST: &str = "wunderlist";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BloodPressureReading {
    pub measured_at: DateTime<Utc>,
    pub systolic: f64,
    pub diastolic: f64,
    pub pulse: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightReading {
    pub measured_at: DateTime<Utc>,
    pub kg: f64,
}

/// Readings pulled from a device platform in one fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Readings {
    pub blood_pressure: Vec<BloodPressureReading>,
    pub weight: Vec<WeightReading>,
}

impl Readings {
    pub fn is_empty(&self) -> bool {
        self.blood_pressure.is_empty() && self.weight.is_empty()
    }
}

/// Newest stored reading per series. Each mark bounds the next fetch of its
/// own series only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncMarks {
    pub blood_pressure: Option<DateTime<Utc>>,
    pub weight: Option<DateTime<Utc>>,
}

impl SyncMarks {
    /// Older of the two marks; `None` while either series is still empty.
    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        Some(self.blood_pressure?.min(self.weight?))
    }
}
