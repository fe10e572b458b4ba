use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SimforgeError};

/// A single simulation parameter value.
///
/// Covers the field types the solver accepts: material constants and
/// geometry as numbers, element types and labels as strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Float(x) => write!(f, "{x}"),
            ParamValue::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

/// The parameter set of one simulation job.
///
/// Backed by a `BTreeMap` so iteration (and therefore serialization) is
/// always in lexicographic key order regardless of insertion order. The
/// map is immutable once a job is submitted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(BTreeMap<String, ParamValue>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    /// Reject parameter sets the hasher cannot encode deterministically.
    ///
    /// Non-finite floats have no JSON representation and empty keys are
    /// almost certainly caller bugs; both abort submission.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in &self.0 {
            if key.is_empty() {
                return Err(SimforgeError::InvalidParameters(
                    "parameter name must not be empty".to_string(),
                ));
            }
            if let ParamValue::Float(x) = value {
                if !x.is_finite() {
                    return Err(SimforgeError::InvalidParameters(format!(
                        "parameter '{key}' is not a finite number"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Compute the content fingerprint of this parameter set.
    ///
    /// The canonical encoding is the JSON serialization of the sorted map;
    /// serde_json formats numbers with ryu/itoa, which is stable across
    /// platforms and process restarts. The digest is SHA-256.
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        self.validate()?;
        let canonical = serde_json::to_vec(&self.0)
            .map_err(|e| SimforgeError::InvalidParameters(e.to_string()))?;
        let digest = Sha256::digest(&canonical);
        Ok(Fingerprint(digest.into()))
    }
}

impl FromIterator<(String, ParamValue)> for Parameters {
    fn from_iter<T: IntoIterator<Item = (String, ParamValue)>>(iter: T) -> Self {
        Parameters(iter.into_iter().collect())
    }
}

/// SHA-256 digest of a canonicalized parameter set, used as the cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        use fmt::Write;
        let mut s = String::with_capacity(64);
        for byte in self.0 {
            // Writing to a String cannot fail.
            let _ = write!(s, "{byte:02x}");
        }
        s
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}
