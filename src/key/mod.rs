//! Request fingerprints: stable cache keys derived from a request's semantic inputs.
//!
//! A [`FingerprintKey`] identifies one semantically-unique read request: the endpoint
//! plus its canonicalized query parameters (pagination included). Raw query strings go
//! through an [`EndpointSchema`], which knows the kind of every parameter the endpoint
//! accepts and normalizes each value into a [`ParamValue`]:
//!
//! | Kind                      | Raw input              | Canonical value         |
//! |---------------------------|------------------------|-------------------------|
//! | [`ParamKind::Integer`]    | ` 007 `                | `Number("7")`           |
//! | [`ParamKind::Float`]      | `2.50`                 | `Number("2.5")`         |
//! | [`ParamKind::Coordinates`]| `38.90749,-77.03731`   | `Text("38.9074,-77.0373")` |
//! | [`ParamKind::IntList`]    | `3, 1,2,1`             | `List(["1","2","3"])`   |
//! | [`ParamKind::Keyword`]    | `DESC`                 | `Text("desc")`          |
//!
//! Anything the schema does not recognise yields a [`KeyError`]. Callers treat that as
//! "do not cache this request" rather than as a failure of the request itself.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod schema;

pub use schema::{EndpointSchema, SchemaRegistry};

/// Default page size applied to paged endpoints when `limit` is absent.
pub const DEFAULT_LIMIT: u32 = 100;

/// Default page applied to paged endpoints when `page` is absent.
pub const DEFAULT_PAGE: u32 = 1;

/// Decimal places kept for coordinate pairs.
const COORDINATE_PRECISION: f64 = 10_000.0;

/// Errors produced while turning raw request parameters into a [`FingerprintKey`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("no cache schema registered for endpoint {0}")]
    UnknownEndpoint(String),

    #[error("endpoint {endpoint} does not accept parameter `{name}`")]
    UnknownParameter { endpoint: String, name: String },

    #[error("parameter `{name}` has unsupported value {value:?} (expected {expected})")]
    InvalidValue {
        name: String,
        value: String,
        expected: ParamKind,
    },
}

/// The shape a query parameter takes once parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// A signed integer, e.g. `radius=1000`.
    Integer,
    /// A finite decimal number.
    Float,
    /// `latitude,longitude` in WGS84, truncated to four decimal places.
    Coordinates,
    /// `minx,miny,maxx,maxy` bounding box. Order is significant.
    Bbox,
    /// Comma separated integers, e.g. `parameters_id=2,1`. Order is not significant.
    IntList,
    /// Comma separated free text. Order is not significant.
    TextList,
    /// A case-insensitive word such as a sort direction or ISO code.
    Keyword,
    /// `true`/`false` in any casing, also `1`/`0` and `yes`/`no`.
    Bool,
    /// An ISO-8601 date or datetime.
    Date,
    /// Case-sensitive free text.
    Text,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Integer => "integer",
            Self::Float => "number",
            Self::Coordinates => "latitude,longitude",
            Self::Bbox => "minx,miny,maxx,maxy",
            Self::IntList => "comma separated integers",
            Self::TextList => "comma separated list",
            Self::Keyword => "keyword",
            Self::Bool => "boolean",
            Self::Date => "ISO-8601 date",
            Self::Text => "text",
        };
        f.write_str(name)
    }
}

/// A canonicalized parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamValue {
    Text(String),
    /// Canonical decimal rendering of a number.
    Number(String),
    /// Sorted, de-duplicated items.
    List(Vec<String>),
}

impl ParamValue {
    /// Returns the value as a single string, joining list items with commas.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(s) | Self::Number(s) => s.clone(),
            Self::List(items) => items.join(","),
        }
    }

    /// Returns the value as an integer when it is a whole number.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

/// A 128-bit request fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    fn of(canonical: &str) -> Self {
        let digest = Sha256::digest(canonical.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Page selection for paged endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
}

impl Pagination {
    /// Row offset of the first result on this page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            limit: DEFAULT_LIMIT,
        }
    }
}

/// Immutable cache key for one semantically-unique request.
///
/// Equality and hashing use the endpoint and the 128-bit fingerprint only; two keys
/// with equal fingerprints are treated as the same request.
///
/// # Examples
///
/// ```
/// use aqcache::key::{FingerprintKey, ParamValue};
///
/// let a = FingerprintKey::new("/v3/locations", [
///     ("iso", ParamValue::Text("us".into())),
///     ("limit", ParamValue::Number("100".into())),
/// ]);
/// let b = FingerprintKey::new("/v3/locations", [
///     ("limit", ParamValue::Number("100".into())),
///     ("iso", ParamValue::Text("us".into())),
/// ]);
/// assert_eq!(a, b);
/// assert!(a.to_string().starts_with("/v3/locations#"));
/// ```
#[derive(Clone)]
pub struct FingerprintKey {
    endpoint: Arc<str>,
    params: Arc<BTreeMap<String, ParamValue>>,
    canonical: Arc<str>,
    fingerprint: Fingerprint,
}

impl FingerprintKey {
    /// Builds a key from already-canonical parameter values. Pure and infallible.
    pub fn new<K, I>(endpoint: impl AsRef<str>, params: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ParamValue)>,
    {
        let endpoint = endpoint.as_ref().trim();
        let params: BTreeMap<String, ParamValue> =
            params.into_iter().map(|(k, v)| (k.into(), v)).collect();

        // JSON keeps the rendering unambiguous when values contain separators.
        let encoded = serde_json::to_string(&params).unwrap_or_default();
        let canonical = format!("{endpoint}?{encoded}");
        let fingerprint = Fingerprint::of(&canonical);

        Self {
            endpoint: Arc::from(endpoint),
            params: Arc::new(params),
            canonical: Arc::from(canonical),
            fingerprint,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// The canonical `endpoint?{params}` string the fingerprint was hashed from.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Returns the canonical value of a parameter.
    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    /// Iterates parameters in name order.
    pub fn params(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns the page selection when the key carries `page` and `limit`.
    pub fn pagination(&self) -> Option<Pagination> {
        let page = self.param("page")?.as_i64()?;
        let limit = self.param("limit")?.as_i64()?;
        Some(Pagination {
            page: u32::try_from(page).ok()?,
            limit: u32::try_from(limit).ok()?,
        })
    }

    /// Returns `true` if this key belongs to `prefix` (an endpoint or endpoint family).
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        self.endpoint.starts_with(prefix)
    }
}

impl PartialEq for FingerprintKey {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint && self.endpoint == other.endpoint
    }
}

impl Eq for FingerprintKey {}

impl std::hash::Hash for FingerprintKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
    }
}

impl fmt::Display for FingerprintKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.endpoint, self.fingerprint)
    }
}

impl fmt::Debug for FingerprintKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintKey")
            .field("endpoint", &self.endpoint)
            .field("fingerprint", &self.fingerprint)
            .field("canonical", &self.canonical)
            .finish()
    }
}

/// Builds a key for `endpoint` from raw query parameters, canonicalizing each value
/// with the endpoint's registered schema.
///
/// # Errors
///
/// - [`KeyError::UnknownEndpoint`]: no schema is registered for `endpoint`.
/// - [`KeyError::UnknownParameter`]: a parameter the schema does not declare.
/// - [`KeyError::InvalidValue`]: a value that does not parse as its declared kind.
pub fn make_key(
    registry: &SchemaRegistry,
    endpoint: &str,
    params: &HashMap<String, String>,
) -> Result<FingerprintKey, KeyError> {
    let schema = registry
        .get(endpoint)
        .ok_or_else(|| KeyError::UnknownEndpoint(endpoint.to_owned()))?;
    schema.key(params)
}

/// Canonicalizes one raw value. Returns `Ok(None)` for values that are empty after
/// trimming, which the caller treats as an absent parameter.
pub(crate) fn canonicalize(
    name: &str,
    kind: ParamKind,
    raw: &str,
) -> Result<Option<ParamValue>, KeyError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    let invalid = || KeyError::InvalidValue {
        name: name.to_owned(),
        value: raw.to_owned(),
        expected: kind,
    };

    let value = match kind {
        ParamKind::Integer => {
            let n: i64 = raw.parse().map_err(|_| invalid())?;
            ParamValue::Number(n.to_string())
        }
        ParamKind::Float => ParamValue::Number(canonical_float(raw).ok_or_else(invalid)?),
        ParamKind::Coordinates => {
            let (lat, lon) = raw.split_once(',').ok_or_else(invalid)?;
            let lat = parse_finite(lat).filter(|v| v.abs() <= 90.0).ok_or_else(invalid)?;
            let lon = parse_finite(lon).filter(|v| v.abs() <= 180.0).ok_or_else(invalid)?;
            ParamValue::Text(format!(
                "{},{}",
                format_float(truncate_coordinate(lat)),
                format_float(truncate_coordinate(lon))
            ))
        }
        ParamKind::Bbox => {
            let parts = raw
                .split(',')
                .map(canonical_float)
                .collect::<Option<Vec<_>>>()
                .filter(|parts| parts.len() == 4)
                .ok_or_else(invalid)?;
            ParamValue::Text(parts.join(","))
        }
        ParamKind::IntList => {
            let mut items = split_list(raw)
                .map(|item| item.parse::<i64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| invalid())?;
            if items.is_empty() {
                return Ok(None);
            }
            items.sort_unstable();
            items.dedup();
            ParamValue::List(items.into_iter().map(|n| n.to_string()).collect())
        }
        ParamKind::TextList => {
            let mut items: Vec<String> = split_list(raw).map(str::to_owned).collect();
            if items.is_empty() {
                return Ok(None);
            }
            items.sort();
            items.dedup();
            ParamValue::List(items)
        }
        ParamKind::Keyword => {
            if raw.chars().any(char::is_whitespace) {
                return Err(invalid());
            }
            ParamValue::Text(raw.to_lowercase())
        }
        ParamKind::Bool => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => ParamValue::Text("true".to_owned()),
            "false" | "0" | "no" => ParamValue::Text("false".to_owned()),
            _ => return Err(invalid()),
        },
        ParamKind::Date => {
            if !looks_like_iso_date(raw) {
                return Err(invalid());
            }
            ParamValue::Text(raw.to_ascii_uppercase())
        }
        ParamKind::Text => ParamValue::Text(raw.to_owned()),
    };

    Ok(Some(value))
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn parse_finite(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn canonical_float(raw: &str) -> Option<String> {
    parse_finite(raw).map(format_float)
}

// Shortest round-trip rendering; `-0` and `0.0` both become `0`.
fn format_float(value: f64) -> String {
    if value == 0.0 {
        return "0".to_owned();
    }
    format!("{value}")
}

fn truncate_coordinate(value: f64) -> f64 {
    (value * COORDINATE_PRECISION).trunc() / COORDINATE_PRECISION
}

// `YYYY-MM-DD` optionally followed by a time part.
fn looks_like_iso_date(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    if bytes.len() < 10 {
        return false;
    }
    let (date, time) = bytes.split_at(10);
    let date_ok = date.iter().enumerate().all(|(i, b)| match i {
        4 | 7 => *b == b'-',
        _ => b.is_ascii_digit(),
    });
    let time_ok = time
        .iter()
        .all(|b| b.is_ascii_digit() || b"Tt:Zz.+-".contains(b));
    date_ok && time_ok
}
