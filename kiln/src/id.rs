use crate::errors::{ErrorKind, KilnError, KilnResult};
use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::Rng;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use itertools::Itertools;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

static PROCESS_UNIQUE: Lazy<[u8; 5]> = Lazy::new(|| OsRng.gen::<[u8; 5]>());

static COUNTER: Lazy<AtomicU32> = Lazy::new(|| AtomicU32::new(OsRng.gen_range(0..0x00FF_FFFF)));

/// A globally orderable document identifier.
///
/// An `ID` is 12 bytes: a 4 byte big-endian creation timestamp in seconds, 5
/// random bytes unique to the process and a 3 byte big-endian counter. Ordering
/// IDs orders them by creation time (at second granularity, then by counter).
///
/// IDs are stored and serialized as 24 character lowercase hex strings. The
/// zero ID (all bytes zero, also the `Default`) marks a model that has not
/// been persisted yet; the manager assigns a fresh ID on insert.
///
/// # Examples
///
/// ```rust
/// use kiln::id::ID;
///
/// let id = ID::new();
/// assert!(ID::is_valid(&id.to_hex()));
/// assert_eq!(ID::parse(&id.to_hex()).unwrap(), id);
/// assert!(ID::default().is_zero());
/// ```
#[derive(PartialEq, Eq, Ord, PartialOrd, Hash, Clone, Copy, Default)]
pub struct ID {
    bytes: [u8; 12],
}

impl ID {
    /// Generates a new ID using the current time.
    pub fn new() -> Self {
        ID::from_timestamp(Utc::now())
    }

    /// Generates a new ID using the provided timestamp.
    pub fn from_timestamp(timestamp: DateTime<Utc>) -> Self {
        let mut bytes = [0u8; 12];

        let seconds = timestamp.timestamp().clamp(0, u32::MAX as i64) as u32;
        bytes[0..4].copy_from_slice(&seconds.to_be_bytes());
        bytes[4..9].copy_from_slice(&*PROCESS_UNIQUE);

        let counter = COUNTER.fetch_add(1, Ordering::SeqCst) & 0x00FF_FFFF;
        bytes[9..12].copy_from_slice(&counter.to_be_bytes()[1..4]);

        ID { bytes }
    }

    /// Creates an ID from its raw bytes.
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        ID { bytes }
    }

    /// Parses a 24 character hex string.
    pub fn parse(hex: &str) -> KilnResult<ID> {
        if hex.len() != 24 {
            return Err(KilnError::new(
                &format!("invalid id \"{}\": expected 24 hex characters", hex),
                ErrorKind::InvalidId,
            ));
        }

        let mut bytes = [0u8; 12];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let high = hex_value(chunk[0]);
            let low = hex_value(chunk[1]);
            match (high, low) {
                (Some(high), Some(low)) => bytes[i] = (high << 4) | low,
                _ => {
                    return Err(KilnError::new(
                        &format!("invalid id \"{}\": not a hex string", hex),
                        ErrorKind::InvalidId,
                    ))
                }
            }
        }

        Ok(ID { bytes })
    }

    /// Returns whether the provided string is a valid hex encoded ID.
    pub fn is_valid(hex: &str) -> bool {
        ID::parse(hex).is_ok()
    }

    pub fn to_hex(&self) -> String {
        let mut hex = String::with_capacity(24);
        for byte in self.bytes.iter() {
            hex.push_str(&format!("{:02x}", byte));
        }
        hex
    }

    pub fn bytes(&self) -> &[u8; 12] {
        &self.bytes
    }

    /// Returns the creation time encoded in the ID.
    pub fn timestamp(&self) -> DateTime<Utc> {
        let mut seconds = [0u8; 4];
        seconds.copy_from_slice(&self.bytes[0..4]);
        Utc.timestamp_opt(u32::from_be_bytes(seconds) as i64, 0)
            .single()
            .unwrap_or_default()
    }

    /// Returns whether this is the zero ID.
    pub fn is_zero(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl Display for ID {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Debug for ID {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ID({})", self.to_hex())
    }
}

impl FromStr for ID {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ID::parse(s)
    }
}

impl From<ID> for serde_json::Value {
    fn from(id: ID) -> Self {
        serde_json::Value::String(id.to_hex())
    }
}

impl Serialize for ID {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

struct IdVisitor;

impl<'de> Visitor<'de> for IdVisitor {
    type Value = ID;

    fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
        formatter.write_str("a 24 character hex string")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<ID, E> {
        ID::parse(value).map_err(|err| E::custom(err.message()))
    }
}

impl<'de> Deserialize<'de> for ID {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(IdVisitor)
    }
}

/// Returns the list of IDs without duplicates, keeping the first occurrence.
pub fn unique(ids: &[ID]) -> Vec<ID> {
    ids.iter().unique().copied().collect()
}

/// Returns whether the list contains the specified ID.
pub fn contains(list: &[ID], id: &ID) -> bool {
    list.iter().any(|item| item == id)
}

/// Returns whether `all` includes every ID of `subset`.
pub fn includes(all: &[ID], subset: &[ID]) -> bool {
    subset.iter().all(|id| contains(all, id))
}
