//! Typed decode of raw inventory rows and their validation into [`ContainerRecord`].
//!
//! Every optional JSON field is decoded into a [`RawField`], so absence and
//! type mismatch are explicit cases instead of ad-hoc probing. Validation is a
//! pure function over the decoded row.

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use indexmap::IndexMap;
use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::{Number, Value};

use super::timestamp::normalize_created_at;
use crate::models::{ContainerRecord, IpAddress, IpFamily};

/// One decoded JSON field.
#[derive(Debug, Clone, PartialEq)]
pub enum RawField<T> {
    /// Key missing or `null`.
    Absent,
    /// Present but not decodable as `T`.
    WrongType,
    Present(T),
}

// Written out so `T` needs no `Default` bound; `serde_json::Number` has none.
impl<T> Default for RawField<T> {
    fn default() -> Self {
        RawField::Absent
    }
}

impl<T> RawField<T> {
    pub fn present(self) -> Option<T> {
        match self {
            RawField::Present(v) => Some(v),
            RawField::Absent | RawField::WrongType => None,
        }
    }
}

impl RawField<String> {
    /// Text the store can hold: present and free of NUL characters.
    fn text(self) -> Option<String> {
        self.present().filter(|s| !s.contains('\0'))
    }
}

impl<T: DeserializeOwned> RawField<T> {
    fn decode(value: Value) -> Self {
        match value {
            Value::Null => RawField::Absent,
            other => match serde_json::from_value(other) {
                Ok(v) => RawField::Present(v),
                Err(_) => RawField::WrongType,
            },
        }
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for RawField<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(RawField::decode)
    }
}

/// Decodes a mapping-shaped field; anything but a JSON object is `WrongType`.
/// Derived struct decoding would otherwise also accept JSON arrays.
fn mapping<'de, D, T>(deserializer: D) -> Result<RawField<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => RawField::Absent,
        Value::Object(_) => RawField::decode(value),
        _ => RawField::WrongType,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappingEntry<T>(pub RawField<T>);

impl<'de, T: DeserializeOwned> Deserialize<'de> for MappingEntry<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        mapping(deserializer).map(MappingEntry)
    }
}

/// Shapes `created_at` may arrive in. JSON input only yields `Absent`, `Text`
/// or `Unrecognized`; the typed variants serve programmatic callers.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RawTimestamp {
    #[default]
    Absent,
    Text(String),
    Zoned(DateTime<FixedOffset>),
    Naive(NaiveDateTime),
    Unrecognized,
}

impl<'de> Deserialize<'de> for RawTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Null => RawTimestamp::Absent,
            Value::String(text) => RawTimestamp::Text(text),
            _ => RawTimestamp::Unrecognized,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawRow {
    pub name: RawField<String>,
    pub status: RawField<String>,
    pub created_at: RawTimestamp,
    #[serde(deserialize_with = "mapping")]
    pub state: RawField<RawState>,
}

impl RawRow {
    /// Rows that are not JSON objects decode to an all-absent row.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(_) => serde_json::from_value(value).unwrap_or_default(),
            _ => RawRow::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawState {
    #[serde(deserialize_with = "mapping")]
    pub cpu: RawField<RawUsage>,
    #[serde(deserialize_with = "mapping")]
    pub memory: RawField<RawUsage>,
    #[serde(deserialize_with = "mapping")]
    pub network: RawField<IndexMap<String, MappingEntry<RawInterface>>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawUsage {
    pub usage: RawField<Number>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawInterface {
    pub addresses: RawField<Vec<MappingEntry<RawAddress>>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawAddress {
    pub family: RawField<String>,
    pub address: RawField<String>,
    pub scope: RawField<String>,
}

/// Validates one decoded row. `None` means the row is skipped.
pub fn validate_row(row: RawRow) -> Option<ContainerRecord> {
    let name = row.name.text().filter(|n| !n.is_empty())?;
    let created_at = normalize_created_at(&row.created_at)?;

    let (cpu_usage, memory_usage_bytes, ips) = match row.state.present() {
        Some(state) => (
            usage_of(state.cpu),
            usage_of(state.memory),
            addresses_of(state.network),
        ),
        None => (None, None, Vec::new()),
    };

    Some(ContainerRecord {
        name,
        status: row.status.text(),
        created_at,
        cpu_usage,
        memory_usage_bytes,
        ips,
    })
}

fn usage_of(field: RawField<RawUsage>) -> Option<i64> {
    field
        .present()
        .and_then(|u| u.usage.present())
        .and_then(|n| integral(&n))
}

/// Integers that fit `i64`, or floats with no fractional part inside that range.
fn integral(n: &Number) -> Option<i64> {
    if let Some(v) = n.as_i64() {
        return Some(v);
    }
    let f = n.as_f64()?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn addresses_of(
    network: RawField<IndexMap<String, MappingEntry<RawInterface>>>,
) -> Vec<IpAddress> {
    let Some(interfaces) = network.present() else {
        return Vec::new();
    };
    interfaces
        .into_values()
        .filter_map(|MappingEntry(iface)| iface.present())
        .filter_map(|iface| iface.addresses.present())
        .flatten()
        .filter_map(|MappingEntry(entry)| entry.present())
        .filter_map(address_of)
        .collect()
}

fn address_of(raw: RawAddress) -> Option<IpAddress> {
    let family = raw.family.present().and_then(|f| IpFamily::parse(&f))?;
    let ip_address = raw.address.text().filter(|a| !a.is_empty())?;
    Some(IpAddress {
        ip_address,
        family,
        scope: raw.scope.text(),
    })
}
