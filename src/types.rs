//! Record types shared by the routing, health and fan-out layers.
//!
//! Wire field names follow the catalog and shard collections (`_id`, `s`,
//! `bl`, ...). Fields the typed records don't know about are preserved in
//! an `extra` map so newer writers don't lose data through older readers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

// ── Identifiers ────────────────────────────────────────────────────

/// Length of a document identifier in bytes.
pub const DOCUMENT_ID_LEN: usize = 12;

/// Opaque 12-byte document identifier, written as 24 hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId([u8; DOCUMENT_ID_LEN]);

impl DocumentId {
    pub const fn from_bytes(bytes: [u8; DOCUMENT_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DOCUMENT_ID_LEN] {
        &self.0
    }

    /// Parse from hex. Upper and lower case are both accepted.
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = s.as_bytes();
        if raw.len() != DOCUMENT_ID_LEN * 2 {
            return Err(StoreError::InvalidId(s.to_string()));
        }
        let mut bytes = [0u8; DOCUMENT_ID_LEN];
        for (i, pair) in raw.chunks_exact(2).enumerate() {
            let hi = hex_value(pair[0]).ok_or_else(|| StoreError::InvalidId(s.to_string()))?;
            let lo = hex_value(pair[1]).ok_or_else(|| StoreError::InvalidId(s.to_string()))?;
            bytes[i] = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        self.to_string()
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

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl FromStr for DocumentId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for DocumentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DocumentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DocumentId::from_hex(&s).map_err(de::Error::custom)
    }
}

/// Numeric shard identifier, as stored in the shard catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric content-origin identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub i64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Block Filter ───────────────────────────────────────────────────

/// Block-level status value of an actively served document.
pub const BLOCK_SERVED: i32 = 0;

/// Restriction on a document's block-level status flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlockFilter {
    /// No restriction.
    Any,
    /// Only documents whose flag equals the value.
    Exactly(i32),
    /// Only actively served documents (`Exactly(0)`).
    #[default]
    Served,
}

impl BlockFilter {
    pub fn value(&self) -> Option<i32> {
        match self {
            BlockFilter::Any => None,
            BlockFilter::Exactly(v) => Some(*v),
            BlockFilter::Served => Some(BLOCK_SERVED),
        }
    }

    pub fn matches(&self, block: i32) -> bool {
        self.value().map_or(true, |v| v == block)
    }
}

impl From<Option<i32>> for BlockFilter {
    fn from(value: Option<i32>) -> Self {
        match value {
            None => BlockFilter::Any,
            Some(v) => BlockFilter::Exactly(v),
        }
    }
}

// ── Documents ──────────────────────────────────────────────────────

/// A document stored on one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: DocumentId,

    /// Shard holding the document.
    #[serde(rename = "s")]
    pub shard: ShardId,

    /// Block-level status: 0 = actively served, anything else is pending
    /// moderation or removed.
    #[serde(rename = "bl", default)]
    pub block: i32,

    /// Old sequential identifier, when the document predates hex ids.
    #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
    pub legacy_id: Option<i64>,

    /// Descriptive fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document {
    pub fn new(id: DocumentId, shard: ShardId) -> Self {
        Self {
            id,
            shard,
            block: BLOCK_SERVED,
            legacy_id: None,
            extra: Map::new(),
        }
    }

    pub fn with_block(mut self, block: i32) -> Self {
        self.block = block;
        self
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(name.to_string(), value.into());
        self
    }

    pub fn is_served(&self) -> bool {
        self.block == BLOCK_SERVED
    }

    /// Apply set/unset semantics in place. Identity fields cannot be changed.
    pub fn apply(&mut self, update: &FieldUpdate) -> Result<()> {
        for (key, value) in &update.set {
            match key.as_str() {
                "_id" | "s" => {}
                "bl" => {
                    self.block = value
                        .as_i64()
                        .and_then(|v| i32::try_from(v).ok())
                        .ok_or_else(|| StoreError::InvalidField {
                            field: key.clone(),
                            reason: format!("expected 32-bit integer, got {}", value),
                        })?;
                }
                "i" => self.legacy_id = value.as_i64(),
                _ => {
                    self.extra.insert(key.clone(), value.clone());
                }
            }
        }
        for key in &update.unset {
            match key.as_str() {
                "bl" => self.block = BLOCK_SERVED,
                "i" => self.legacy_id = None,
                _ => {
                    self.extra.remove(key);
                }
            }
        }
        Ok(())
    }
}

/// Field-level modification: set these fields, remove those.
///
/// The only write shape shard collections accept; whole-document
/// replacement is not supported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    #[serde(default)]
    pub set: Map<String, Value>,
    #[serde(default)]
    pub unset: Vec<String>,
}

impl FieldUpdate {
    /// Build an update from a field map, moving `remove` from set to unset.
    pub fn from_fields(mut fields: Map<String, Value>, remove: &[String]) -> Self {
        let mut unset = Vec::with_capacity(remove.len());
        for name in remove {
            fields.remove(name);
            if !unset.contains(name) {
                unset.push(name.clone());
            }
        }
        Self { set: fields, unset }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }
}

/// Write request for one document.
///
/// Built from a loosely typed field map: `_id` is mandatory, `s` is an
/// optional routing hint that saves a lookup when present.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentUpdate {
    pub id: DocumentId,
    pub shard: Option<ShardId>,
    pub fields: FieldUpdate,
}

impl DocumentUpdate {
    pub fn new(id: DocumentId, fields: FieldUpdate) -> Self {
        Self { id, shard: None, fields }
    }

    pub fn from_fields(mut data: Map<String, Value>, remove: &[String]) -> Result<Self> {
        let id = match data.remove("_id") {
            Some(Value::String(hex)) => DocumentId::from_hex(&hex)?,
            Some(other) => return Err(StoreError::InvalidId(other.to_string())),
            None => {
                return Err(StoreError::InvalidField {
                    field: "_id".to_string(),
                    reason: "missing".to_string(),
                })
            }
        };
        let shard = match data.remove("s") {
            None | Some(Value::Null) => None,
            Some(value) => Some(parse_shard_id(&value)?),
        };
        Ok(Self {
            id,
            shard,
            fields: FieldUpdate::from_fields(data, remove),
        })
    }
}

fn parse_shard_id(value: &Value) -> Result<ShardId> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v >= 0.0 && v <= u32::MAX as f64 => Ok(ShardId(v as u32)),
        _ => Err(StoreError::InvalidField {
            field: "s".to_string(),
            reason: format!("not a shard id: {}", value),
        }),
    }
}

// ── Catalog Records ────────────────────────────────────────────────

/// One shard as described by the control catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    #[serde(rename = "_id")]
    pub id: ShardId,

    /// Public-facing replica address.
    #[serde(rename = "rip")]
    pub public_host: String,
    #[serde(rename = "rp")]
    pub public_port: u16,

    /// Internal-facing (master) replica address.
    #[serde(rename = "ip")]
    pub internal_host: String,
    #[serde(rename = "p")]
    pub internal_port: u16,

    /// Last time the shard received documents. Absent for shards never written.
    #[serde(rename = "lt", default, skip_serializing_if = "Option::is_none")]
    pub last_touched: Option<DateTime<Utc>>,

    /// Number of documents the shard reports holding.
    #[serde(rename = "c", default)]
    pub document_count: u64,
}

impl ShardDescriptor {
    pub fn new(id: ShardId, public: (&str, u16), internal: (&str, u16)) -> Self {
        Self {
            id,
            public_host: public.0.to_string(),
            public_port: public.1,
            internal_host: internal.0.to_string(),
            internal_port: internal.1,
            last_touched: None,
            document_count: 0,
        }
    }

    pub fn with_last_touched(mut self, at: DateTime<Utc>) -> Self {
        self.last_touched = Some(at);
        self
    }

    pub fn public_address(&self) -> String {
        format!("db://{}:{}", self.public_host, self.public_port)
    }

    pub fn internal_address(&self) -> String {
        format!("db://{}:{}", self.internal_host, self.internal_port)
    }

    /// Endpoint addresses in access order: public first, master last.
    pub fn addresses(&self) -> [String; 2] {
        [self.public_address(), self.internal_address()]
    }
}

/// Alias record: which shard holds a raw id, optionally under another id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectionRecord {
    #[serde(rename = "_id")]
    pub id: DocumentId,
    #[serde(rename = "s")]
    pub shard: ShardId,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub target: Option<DocumentId>,
}

impl IndirectionRecord {
    pub fn direct(id: DocumentId, shard: ShardId) -> Self {
        Self { id, shard, target: None }
    }

    pub fn redirect(id: DocumentId, shard: ShardId, target: DocumentId) -> Self {
        Self { id, shard, target: Some(target) }
    }

    /// The id to look up on the shard: the redirect target if any.
    pub fn canonical_id(&self) -> DocumentId {
        self.target.unwrap_or(self.id)
    }
}

/// A content origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    #[serde(rename = "_id")]
    pub id: SourceId,

    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// Group tags.
    #[serde(rename = "g", default)]
    pub groups: Vec<String>,

    /// Crawl block flag. Missing and 0 both mean not blocked.
    #[serde(rename = "crbl", default)]
    pub blocked: i64,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Source {
    pub fn is_blocked(&self) -> bool {
        self.blocked != 0
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}
