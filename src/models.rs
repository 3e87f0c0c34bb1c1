use chrono::{DateTime, Utc};
use std::fmt;

/// Address family of a container interface address, stored as `inet` / `inet6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    Inet,
    Inet6,
}

impl IpFamily {
    /// Exact, case-sensitive match on the store's textual form.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "inet" => Some(Self::Inet),
            "inet6" => Some(Self::Inet6),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inet => "inet",
            Self::Inet6 => "inet6",
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpAddress {
    pub ip_address: String,
    pub family: IpFamily,
    pub scope: Option<String>,
}

/// A validated inventory record. `(name, created_at)` is the business key;
/// `created_at` is always UTC with at most microsecond precision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub name: String,
    pub status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub cpu_usage: Option<i64>,
    pub memory_usage_bytes: Option<i64>,
    pub ips: Vec<IpAddress>,
}

impl ContainerRecord {
    pub fn business_key(&self) -> (&str, DateTime<Utc>) {
        (self.name.as_str(), self.created_at)
    }
}
