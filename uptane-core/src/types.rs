//! Core types used across the update framework.

use chrono::{DateTime, Duration, Months, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Team identifier (tenant owning both repositories)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TeamId(pub String);

impl fmt::Display for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Robot identifier (unique per team)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RobotId(pub String);

impl fmt::Display for RobotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ECU serial, as reported by the primary
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EcuSerial(pub String);

impl fmt::Display for EcuSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hardware identifier of an ECU (matches images to ECUs)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HardwareId(pub String);

impl fmt::Display for HardwareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One of the two logical repositories each team owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Repo {
    /// Vendor-uploaded firmware targets
    Image,
    /// Per-robot targets generated server-side
    Director,
}

impl Repo {
    pub const ALL: [Repo; 2] = [Repo::Image, Repo::Director];
}

impl fmt::Display for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Repo::Image => write!(f, "image"),
            Repo::Director => write!(f, "director"),
        }
    }
}

/// Top-level TUF role.
///
/// Serializes as the capitalized `_type` value the agents expect
/// (`"Root"`, `"Targets"`, ...); `Display` yields the lowercase role name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    Root,
    Targets,
    Snapshot,
    Timestamp,
}

impl Role {
    /// Roles in dependency order: each role is only referenced by roles after it.
    pub const ALL: [Role; 4] = [Role::Root, Role::Targets, Role::Snapshot, Role::Timestamp];

    /// Metadata filename, as referenced from snapshot/timestamp `meta`.
    pub fn filename(&self) -> &'static str {
        match self {
            Role::Root => "root.json",
            Role::Targets => "targets.json",
            Role::Snapshot => "snapshot.json",
            Role::Timestamp => "timestamp.json",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Root => "root",
            Role::Targets => "targets",
            Role::Snapshot => "snapshot",
            Role::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "root" => Ok(Role::Root),
            "targets" => Ok(Role::Targets),
            "snapshot" => Ok(Role::Snapshot),
            "timestamp" => Ok(Role::Timestamp),
            other => Err(ParseError::UnknownRole(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Invalid ttl '{0}', expected '<amount> <unit>'")]
    InvalidTtl(String),

    #[error("Unknown ttl unit: {0}")]
    UnknownUnit(String),
}

/// Unit of a metadata time-to-live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtlUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl FromStr for TtlUnit {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unit = s.to_ascii_lowercase();
        let unit = unit.strip_suffix('s').unwrap_or(&unit);
        match unit {
            "second" => Ok(TtlUnit::Seconds),
            "minute" => Ok(TtlUnit::Minutes),
            "hour" => Ok(TtlUnit::Hours),
            "day" => Ok(TtlUnit::Days),
            "week" => Ok(TtlUnit::Weeks),
            "month" => Ok(TtlUnit::Months),
            "year" => Ok(TtlUnit::Years),
            _ => Err(ParseError::UnknownUnit(s.to_string())),
        }
    }
}

/// A `(n, unit)` time-to-live, e.g. `(7, days)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ttl {
    pub amount: u32,
    pub unit: TtlUnit,
}

impl Ttl {
    pub const fn new(amount: u32, unit: TtlUnit) -> Self {
        Self { amount, unit }
    }

    pub const fn seconds(amount: u32) -> Self {
        Self::new(amount, TtlUnit::Seconds)
    }

    pub const fn hours(amount: u32) -> Self {
        Self::new(amount, TtlUnit::Hours)
    }

    pub const fn days(amount: u32) -> Self {
        Self::new(amount, TtlUnit::Days)
    }

    pub const fn years(amount: u32) -> Self {
        Self::new(amount, TtlUnit::Years)
    }

    /// Add this ttl to `from`, truncated to whole seconds.
    ///
    /// Month and year arithmetic is calendar based and clamps to the last day
    /// of the month.
    pub fn after(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let from = from.trunc_subsecs(0);
        let n = i64::from(self.amount);
        let shifted = match self.unit {
            TtlUnit::Seconds => from.checked_add_signed(Duration::seconds(n)),
            TtlUnit::Minutes => from.checked_add_signed(Duration::minutes(n)),
            TtlUnit::Hours => from.checked_add_signed(Duration::hours(n)),
            TtlUnit::Days => from.checked_add_signed(Duration::days(n)),
            TtlUnit::Weeks => from.checked_add_signed(Duration::weeks(n)),
            TtlUnit::Months => from.checked_add_months(Months::new(self.amount)),
            TtlUnit::Years => from.checked_add_months(Months::new(self.amount.saturating_mul(12))),
        };
        shifted.unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Expiry for a document signed now.
    pub fn expiry_from_now(&self) -> DateTime<Utc> {
        self.after(Utc::now())
    }

    /// Approximate length, used to compare ttls against each other.
    pub fn approx_duration(&self) -> Duration {
        let n = i64::from(self.amount);
        match self.unit {
            TtlUnit::Seconds => Duration::seconds(n),
            TtlUnit::Minutes => Duration::minutes(n),
            TtlUnit::Hours => Duration::hours(n),
            TtlUnit::Days => Duration::days(n),
            TtlUnit::Weeks => Duration::weeks(n),
            TtlUnit::Months => Duration::days(30 * n),
            TtlUnit::Years => Duration::days(365 * n),
        }
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.unit {
            TtlUnit::Seconds => "seconds",
            TtlUnit::Minutes => "minutes",
            TtlUnit::Hours => "hours",
            TtlUnit::Days => "days",
            TtlUnit::Weeks => "weeks",
            TtlUnit::Months => "months",
            TtlUnit::Years => "years",
        };
        write!(f, "{} {}", self.amount, unit)
    }
}

impl FromStr for Ttl {
    type Err = ParseError;

    /// Parses `"7 days"`, `"1 year"`, `"30 minutes"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let (Some(amount), Some(unit), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ParseError::InvalidTtl(s.to_string()));
        };
        let amount = amount
            .parse::<u32>()
            .map_err(|_| ParseError::InvalidTtl(s.to_string()))?;
        Ok(Ttl::new(amount, unit.parse()?))
    }
}

/// Serde support for TUF timestamps (`YYYY-MM-DDTHH:MM:SSZ`, no fractional seconds).
pub mod tuf_datetime {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

    pub fn format(value: &DateTime<Utc>) -> String {
        value.format(FORMAT).to_string()
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT)
            .map(|naive| naive.and_utc())
            .or_else(|_| DateTime::parse_from_rfc3339(&raw).map(|dt| dt.with_timezone(&Utc)))
            .map_err(|_| serde::de::Error::custom(format!("Invalid TUF timestamp: {}", raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_role_display_and_wire_form() {
        assert_eq!(Role::Targets.to_string(), "targets");
        assert_eq!(serde_json::to_string(&Role::Targets).unwrap(), "\"Targets\"");
        assert_eq!("Snapshot".parse::<Role>().unwrap(), Role::Snapshot);
        assert!("delegation".parse::<Role>().is_err());
    }

    #[test]
    fn test_ttl_parse() {
        assert_eq!("7 days".parse::<Ttl>().unwrap(), Ttl::days(7));
        assert_eq!("1 year".parse::<Ttl>().unwrap(), Ttl::years(1));
        assert_eq!("30 Minutes".parse::<Ttl>().unwrap(), Ttl::new(30, TtlUnit::Minutes));
        assert!("days".parse::<Ttl>().is_err());
        assert!("7 fortnights".parse::<Ttl>().is_err());
        assert!("7 days extra".parse::<Ttl>().is_err());
    }

    #[test]
    fn test_ttl_after() {
        let start = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        assert_eq!(
            Ttl::days(1).after(start),
            Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap()
        );
        // calendar months clamp to the end of February
        assert_eq!(
            Ttl::new(1, TtlUnit::Months).after(start),
            Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap()
        );
        assert_eq!(
            Ttl::years(1).after(start),
            Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_tuf_datetime_format() {
        let ts = Utc.with_ymd_and_hms(2030, 5, 6, 7, 8, 9).unwrap();
        assert_eq!(tuf_datetime::format(&ts), "2030-05-06T07:08:09Z");
    }

    #[test]
    fn test_robot_id() {
        let id = RobotId("R-001".to_string());
        assert_eq!(id.to_string(), "R-001");
    }
}
