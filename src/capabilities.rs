//! WebDriver capability parsing and merging.
//!
//! Clients send capabilities in one or both of two shapes: the legacy
//! JSON Wire Protocol `desiredCapabilities` object and the W3C
//! `capabilities: {alwaysMatch, firstMatch}` structure. Both are kept as
//! raw JSON maps so vendor extensions survive the trip into the pod
//! annotations untouched.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

const BROWSER_NAME: &str = "browserName";
const BROWSER_VERSION: &str = "browserVersion";
const VERSION: &str = "version";
const PLATFORM_NAME: &str = "platformName";
const PLATFORM: &str = "platform";
const DEVICE_NAME: &str = "deviceName";

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("missing capabilities")]
    Missing,
    #[error("failed to parse request: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("request capabilities must be a JSON object")]
    NotAnObject,
}

/// A single candidate capability set, after merging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capabilities(pub Map<String, Value>);

impl Capabilities {
    fn str_field(&self, key: &str) -> &str {
        self.0.get(key).and_then(Value::as_str).unwrap_or("")
    }

    fn bool_field(&self, key: &str) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// `browserName`, falling back to `deviceName` for mobile payloads.
    pub fn browser_name(&self) -> &str {
        let name = self.str_field(BROWSER_NAME);
        if name.is_empty() {
            self.str_field(DEVICE_NAME)
        } else {
            name
        }
    }

    /// `browserVersion`, falling back to the legacy `version` key.
    pub fn browser_version(&self) -> &str {
        let version = self.str_field(BROWSER_VERSION);
        if version.is_empty() {
            self.str_field(VERSION)
        } else {
            version
        }
    }

    pub fn test_name(&self) -> &str {
        self.str_field("name")
    }

    pub fn screen_resolution(&self) -> &str {
        self.str_field("screenResolution")
    }

    pub fn time_zone(&self) -> &str {
        self.str_field("timeZone")
    }

    pub fn vnc_enabled(&self) -> bool {
        self.bool_field("enableVNC")
    }

    pub fn video_enabled(&self) -> bool {
        self.bool_field("enableVideo")
    }

    /// Mirror modern keys onto their legacy aliases so images that read
    /// either shape see a consistent set.
    pub fn normalize_aliases(&mut self) {
        if let Some(v) = self.0.get(BROWSER_VERSION).cloned() {
            self.0.entry(VERSION).or_insert(v);
        }
        if let Some(v) = self.0.get(PLATFORM_NAME).cloned() {
            self.0.entry(PLATFORM).or_insert(v);
        }
        if !self.0.contains_key(BROWSER_NAME) {
            if let Some(v) = self.0.get(DEVICE_NAME).cloned() {
                self.0.insert(BROWSER_NAME.to_string(), v);
            }
        }
    }

    /// Scalar view of the capabilities, used for the pod `capabilities`
    /// annotation. Nested structures are serialized compactly.
    pub fn to_label_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(k, v)| {
                let rendered = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), rendered)
            })
            .collect()
    }
}

/// Parsed session-creation request: the promoted base capability set and
/// the ordered `firstMatch` candidates.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    base: Map<String, Value>,
    first_match: Vec<Map<String, Value>>,
}

impl SessionRequest {
    /// Parse a session-creation body.
    ///
    /// An empty body is rejected outright. An empty JSON object is
    /// accepted and resolves to a single empty candidate, which the
    /// catalog will then refuse with an unknown-browser error.
    pub fn parse(body: &[u8]) -> Result<Self, CapabilityError> {
        if body.is_empty() {
            return Err(CapabilityError::Missing);
        }

        let root: Value = serde_json::from_slice(body)?;
        let root = root.as_object().ok_or(CapabilityError::NotAnObject)?;

        let mut base = root
            .get("desiredCapabilities")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let w3c = root.get("capabilities").and_then(Value::as_object);

        if let Some(always) = w3c.and_then(|c| c.get("alwaysMatch")).and_then(Value::as_object) {
            // The legacy shape wins only when it actually names a browser.
            let always_caps = Capabilities(always.clone());
            if !always_caps.browser_name().is_empty()
                && Capabilities(base.clone()).browser_name().is_empty()
            {
                base = always.clone();
            }
        }

        let mut first_match: Vec<Map<String, Value>> = w3c
            .and_then(|c| c.get("firstMatch"))
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_object)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if first_match.is_empty() {
            first_match.push(Map::new());
        }

        Ok(Self { base, first_match })
    }

    /// Merged candidates in `firstMatch` order, aliases normalized.
    pub fn candidates(&self) -> Vec<Capabilities> {
        self.first_match
            .iter()
            .map(|fm| {
                let mut merged = self.base.clone();
                deep_merge(&mut merged, fm);
                let mut caps = Capabilities(merged);
                caps.normalize_aliases();
                caps
            })
            .collect()
    }
}

/// Merge `overlay` into `base`. Overlay wins at the key level; nested
/// objects are merged recursively.
pub fn deep_merge(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}
