//! Fault code classification.
//!
//! A [`FaultPolicyTable`] maps raw driver fault codes onto an ordered set of
//! [`FaultType`] categories. Lookups scan categories from most to least
//! severe and the first category intersecting the input wins, so the result
//! never depends on the order of the codes themselves.
//!
//! [`PolicyRegistry`] owns the active table. A reload that fails keeps the
//! previous table; with no table at all, classification answers with the
//! most conservative category.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::errors::ConfigError;

/// Default location of the fault code document.
pub const DEFAULT_FAULT_CODE_FILE: &str = "/usr/local/faultCode.json";

/// Key of the nested network section in the fault code document.
const NETWORK_SECTION_KEY: &str = "NetworkFaultCodes";

// ── Fault types ────────────────────────────────────────────────────────────

/// Fault category, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FaultType {
    #[serde(rename = "NormalNPU")]
    Normal,
    #[serde(rename = "NotHandleFault")]
    NotHandled,
    RecoverRestartBusiness,
    RestartRequest,
    RestartBusiness,
    #[serde(rename = "FreeRestartNPU")]
    FreeRestart,
    #[serde(rename = "RestartNPU")]
    Reset,
    #[serde(rename = "PreSeparateNPU")]
    PreSeparate,
    #[serde(rename = "SeparateNPU")]
    Isolate,
}

/// Categories in lookup order (most severe first) with their document keys.
const CATEGORY_KEYS: [(FaultType, &str); 8] = [
    (FaultType::Isolate, "SeparateNPUCodes"),
    (FaultType::PreSeparate, "PreSeparateNPUCodes"),
    (FaultType::Reset, "RestartNPUCodes"),
    (FaultType::FreeRestart, "FreeRestartNPUCodes"),
    (FaultType::RestartBusiness, "RestartBusinessCodes"),
    (FaultType::RestartRequest, "RestartRequestCodes"),
    (FaultType::RecoverRestartBusiness, "RecoverRestartBusinessCodes"),
    (FaultType::NotHandled, "NotHandleFaultCodes"),
];

impl fmt::Display for FaultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultType::Normal => "NormalNPU",
            FaultType::NotHandled => "NotHandleFault",
            FaultType::RecoverRestartBusiness => "RecoverRestartBusiness",
            FaultType::RestartRequest => "RestartRequest",
            FaultType::RestartBusiness => "RestartBusiness",
            FaultType::FreeRestart => "FreeRestartNPU",
            FaultType::Reset => "RestartNPU",
            FaultType::PreSeparate => "PreSeparateNPU",
            FaultType::Isolate => "SeparateNPU",
        };
        f.write_str(s)
    }
}

// ── Device policies ────────────────────────────────────────────────────────

/// Remediation a device (and by extension its task) needs.
///
/// Variant order is severity order; `Ord` is the comparison used when
/// resolving a task's policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyLevel {
    #[default]
    Empty,
    Ignore,
    RestartRequest,
    #[serde(rename = "restart")]
    RestartBusiness,
    Reset,
    Isolate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown policy '{0}'")]
pub struct UnknownPolicy(pub String);

impl PolicyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyLevel::Empty => "empty",
            PolicyLevel::Ignore => "ignore",
            PolicyLevel::RestartRequest => "restart_request",
            PolicyLevel::RestartBusiness => "restart",
            PolicyLevel::Reset => "reset",
            PolicyLevel::Isolate => "isolate",
        }
    }

    /// Numeric level, 0 for `Empty` up to 5 for `Isolate`.
    pub fn level(&self) -> u8 {
        *self as u8
    }

    /// Map a fault category onto the device policy it requires.
    pub fn from_fault_type(fault_type: FaultType) -> Self {
        match fault_type {
            FaultType::Normal | FaultType::NotHandled => PolicyLevel::Ignore,
            FaultType::RestartRequest => PolicyLevel::RestartRequest,
            FaultType::RestartBusiness | FaultType::RecoverRestartBusiness => PolicyLevel::RestartBusiness,
            FaultType::FreeRestart | FaultType::Reset => PolicyLevel::Reset,
            FaultType::PreSeparate | FaultType::Isolate => PolicyLevel::Isolate,
        }
    }

    /// Policies that are handled by resetting the device's whole ring.
    pub fn needs_ring_reset(&self) -> bool {
        matches!(
            self,
            PolicyLevel::RestartRequest | PolicyLevel::RestartBusiness | PolicyLevel::Reset
        )
    }

    /// Policies that count as a real fault (anything above `Ignore`).
    pub fn is_fault(&self) -> bool {
        *self > PolicyLevel::Ignore
    }
}

impl FromStr for PolicyLevel {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "empty" => Ok(PolicyLevel::Empty),
            "ignore" => Ok(PolicyLevel::Ignore),
            "restart_request" => Ok(PolicyLevel::RestartRequest),
            "restart" => Ok(PolicyLevel::RestartBusiness),
            "reset" => Ok(PolicyLevel::Reset),
            "isolate" => Ok(PolicyLevel::Isolate),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for PolicyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Table ──────────────────────────────────────────────────────────────────

/// Immutable fault code lookup table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPolicyTable {
    device: Vec<(FaultType, BTreeSet<i64>)>,
    network: Vec<(FaultType, BTreeSet<String>)>,
}

impl FaultPolicyTable {
    /// Read and parse a fault code document from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&bytes)
    }

    /// Parse a fault code document.
    ///
    /// Category lists hold hexadecimal strings (`"0x8C204E00"` or
    /// `"8C204E00"`) or plain JSON integers. The optional
    /// `NetworkFaultCodes` object uses the same keys with string codes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        let doc: Value = serde_json::from_slice(bytes)?;
        let Some(root) = doc.as_object() else {
            return Err(ConfigError::Invalid(
                "fault code document must be a JSON object".to_string(),
            ));
        };

        let mut device = Vec::with_capacity(CATEGORY_KEYS.len());
        for (fault_type, key) in CATEGORY_KEYS {
            let codes = match root.get(key) {
                Some(list) => parse_device_codes(key, list)?,
                None => BTreeSet::new(),
            };
            device.push((fault_type, codes));
        }

        let mut network = Vec::with_capacity(CATEGORY_KEYS.len());
        if let Some(section) = root.get(NETWORK_SECTION_KEY) {
            let Some(section) = section.as_object() else {
                return Err(ConfigError::Invalid(format!("{NETWORK_SECTION_KEY} must be an object")));
            };
            for (fault_type, key) in CATEGORY_KEYS {
                let codes = match section.get(key) {
                    Some(list) => parse_network_codes(key, list)?,
                    None => BTreeSet::new(),
                };
                network.push((fault_type, codes));
            }
        }

        for key in root.keys() {
            if key != NETWORK_SECTION_KEY && !CATEGORY_KEYS.iter().any(|(_, k)| k == key) {
                debug!(key = %key, "ignoring unknown fault code category");
            }
        }

        let table = Self { device, network };
        if table.device_code_count() == 0 {
            return Err(ConfigError::EmptyTable);
        }
        Ok(table)
    }

    pub fn device_code_count(&self) -> usize {
        self.device.iter().map(|(_, codes)| codes.len()).sum()
    }

    pub fn network_code_count(&self) -> usize {
        self.network.iter().map(|(_, codes)| codes.len()).sum()
    }

    /// Classify a device's fault codes. Unrecognised codes are `NotHandled`.
    pub fn classify(&self, codes: &BTreeSet<i64>) -> FaultType {
        if codes.is_empty() {
            return FaultType::Normal;
        }
        for (fault_type, known) in &self.device {
            if !known.is_disjoint(codes) {
                return *fault_type;
            }
        }
        warn!(?codes, "fault codes not recorded in policy table, treating as NotHandleFault");
        FaultType::NotHandled
    }

    /// Classify network fault codes. Unrecognised codes are `PreSeparate`.
    pub fn classify_network(&self, codes: &BTreeSet<String>) -> FaultType {
        if codes.is_empty() {
            return FaultType::Normal;
        }
        for (fault_type, known) in &self.network {
            if !known.is_disjoint(codes) {
                return *fault_type;
            }
        }
        warn!(?codes, "network fault codes not recorded in policy table, treating as PreSeparateNPU");
        FaultType::PreSeparate
    }
}

fn parse_device_codes(category: &str, list: &Value) -> Result<BTreeSet<i64>, ConfigError> {
    let items = list.as_array().ok_or_else(|| ConfigError::InvalidCode {
        category: category.to_string(),
        code: list.to_string(),
    })?;
    items
        .iter()
        .map(|item| {
            let parsed = match item {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => parse_hex_code(s),
                _ => None,
            };
            parsed.ok_or_else(|| ConfigError::InvalidCode {
                category: category.to_string(),
                code: item.to_string(),
            })
        })
        .collect()
}

fn parse_network_codes(category: &str, list: &Value) -> Result<BTreeSet<String>, ConfigError> {
    let items = list.as_array().ok_or_else(|| ConfigError::InvalidCode {
        category: category.to_string(),
        code: list.to_string(),
    })?;
    items
        .iter()
        .map(|item| match item {
            Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            _ => Err(ConfigError::InvalidCode {
                category: format!("{NETWORK_SECTION_KEY}.{category}"),
                code: item.to_string(),
            }),
        })
        .collect()
}

/// Parse `0x8C204E00`, `0X8c204e00` or `8C204E00`.
pub fn parse_hex_code(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return None;
    }
    i64::from_str_radix(digits, 16).ok()
}

// ── Registry ───────────────────────────────────────────────────────────────

/// Holder of the active [`FaultPolicyTable`].
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    table: RwLock<Option<Arc<FaultPolicyTable>>>,
}

impl PolicyRegistry {
    /// Registry with no table loaded.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(table: FaultPolicyTable) -> Self {
        Self {
            table: RwLock::new(Some(Arc::new(table))),
        }
    }

    /// Load (or reload) the table from `path`.
    ///
    /// On failure the previously loaded table, if any, stays active.
    pub fn load(&self, path: &Path) -> Result<Arc<FaultPolicyTable>, ConfigError> {
        match FaultPolicyTable::load(path) {
            Ok(table) => {
                let table = Arc::new(table);
                info!(
                    path = %path.display(),
                    device_codes = table.device_code_count(),
                    network_codes = table.network_code_count(),
                    "loaded fault policy table"
                );
                *self.table.write().unwrap_or_else(|e| e.into_inner()) = Some(table.clone());
                Ok(table)
            }
            Err(err) => {
                if self.is_loaded() {
                    warn!(path = %path.display(), error = %err, "fault policy reload failed, keeping previous table");
                } else {
                    error!(path = %path.display(), error = %err, "fault policy load failed, classifying conservatively");
                }
                Err(err)
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.table.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    pub fn current(&self) -> Option<Arc<FaultPolicyTable>> {
        self.table.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Classify device fault codes; `Isolate` for any fault while no table is loaded.
    pub fn classify(&self, codes: &BTreeSet<i64>) -> FaultType {
        match self.current() {
            Some(table) => table.classify(codes),
            None if codes.is_empty() => FaultType::Normal,
            None => FaultType::Isolate,
        }
    }

    /// Classify network fault codes; `PreSeparate` for any fault while no table is loaded.
    pub fn classify_network(&self, codes: &BTreeSet<String>) -> FaultType {
        match self.current() {
            Some(table) => table.classify_network(codes),
            None if codes.is_empty() => FaultType::Normal,
            None => FaultType::PreSeparate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "NotHandleFaultCodes": ["0x80E01801"],
        "RestartRequestCodes": ["0x80C98009"],
        "RestartBusinessCodes": ["0x80CB8009"],
        "RecoverRestartBusinessCodes": ["0x8C0E4E00"],
        "RestartNPUCodes": ["0x8C204E00", "8C1F8609"],
        "FreeRestartNPUCodes": [2350927361],
        "PreSeparateNPUCodes": [],
        "SeparateNPUCodes": ["0x80E18401", "0x80E01801"],
        "NetworkFaultCodes": {
            "PreSeparateNPUCodes": ["81078603"],
            "NotHandleFaultCodes": ["80C98000"]
        }
    }"#;

    fn sample() -> FaultPolicyTable {
        FaultPolicyTable::from_json(SAMPLE.as_bytes()).unwrap()
    }

    #[test]
    fn test_empty_codes_are_normal() {
        assert_eq!(sample().classify(&BTreeSet::new()), FaultType::Normal);
        assert_eq!(sample().classify_network(&BTreeSet::new()), FaultType::Normal);
    }

    #[test]
    fn test_reset_code_classifies_as_reset() {
        let table = sample();
        let fault = table.classify(&BTreeSet::from([0x8C204E00]));
        assert_eq!(fault, FaultType::Reset);
        assert_eq!(PolicyLevel::from_fault_type(fault), PolicyLevel::Reset);
        assert_eq!(table.classify(&BTreeSet::from([0x8C1F8609])), FaultType::Reset);
    }

    #[test]
    fn test_most_severe_category_wins() {
        // 0x80E01801 is listed both as NotHandle and Separate.
        let table = sample();
        assert_eq!(table.classify(&BTreeSet::from([0x80E01801])), FaultType::Isolate);
        assert_eq!(
            table.classify(&BTreeSet::from([0x80CB8009, 0x8C204E00])),
            FaultType::Reset
        );
    }

    #[test]
    fn test_unknown_codes_default_per_axis() {
        let table = sample();
        assert_eq!(table.classify(&BTreeSet::from([0x1234])), FaultType::NotHandled);
        assert_eq!(
            table.classify_network(&BTreeSet::from(["DEADBEEF".to_string()])),
            FaultType::PreSeparate
        );
        assert_eq!(
            table.classify_network(&BTreeSet::from(["80C98000".to_string()])),
            FaultType::NotHandled
        );
    }

    #[test]
    fn test_numeric_codes_accepted() {
        assert_eq!(
            sample().classify(&BTreeSet::from([2350927361])),
            FaultType::FreeRestart
        );
    }

    #[test]
    fn test_restart_request_is_distinct() {
        let fault = sample().classify(&BTreeSet::from([0x80C98009]));
        assert_eq!(fault, FaultType::RestartRequest);
        assert_eq!(PolicyLevel::from_fault_type(fault), PolicyLevel::RestartRequest);
        assert!(PolicyLevel::RestartRequest < PolicyLevel::RestartBusiness);
    }

    #[test]
    fn test_empty_document_rejected() {
        let err = FaultPolicyTable::from_json(br#"{"SeparateNPUCodes": []}"#).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyTable));
    }

    #[test]
    fn test_bad_code_rejected() {
        let err = FaultPolicyTable::from_json(br#"{"SeparateNPUCodes": ["zz"]}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCode { .. }));
        let err = FaultPolicyTable::from_json(b"[1, 2]").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = FaultPolicyTable::from_json(b"{not json").unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)));
    }

    #[test]
    fn test_parse_hex_code_forms() {
        assert_eq!(parse_hex_code("0x8C204E00"), Some(0x8C204E00));
        assert_eq!(parse_hex_code("0X8c204e00"), Some(0x8C204E00));
        assert_eq!(parse_hex_code(" 8C204E00 "), Some(0x8C204E00));
        assert_eq!(parse_hex_code("0x"), None);
        assert_eq!(parse_hex_code("xyz"), None);
    }

    #[test]
    fn test_device_policy_remap() {
        use FaultType::*;
        let cases = [
            (Normal, PolicyLevel::Ignore),
            (NotHandled, PolicyLevel::Ignore),
            (RecoverRestartBusiness, PolicyLevel::RestartBusiness),
            (RestartBusiness, PolicyLevel::RestartBusiness),
            (RestartRequest, PolicyLevel::RestartRequest),
            (FreeRestart, PolicyLevel::Reset),
            (Reset, PolicyLevel::Reset),
            (PreSeparate, PolicyLevel::Isolate),
            (Isolate, PolicyLevel::Isolate),
        ];
        for (fault, policy) in cases {
            assert_eq!(PolicyLevel::from_fault_type(fault), policy, "{fault}");
        }
    }

    #[test]
    fn test_policy_string_round_trip() {
        for policy in [
            PolicyLevel::Empty,
            PolicyLevel::Ignore,
            PolicyLevel::RestartRequest,
            PolicyLevel::RestartBusiness,
            PolicyLevel::Reset,
            PolicyLevel::Isolate,
        ] {
            assert_eq!(policy.as_str().parse::<PolicyLevel>(), Ok(policy));
            assert_eq!(serde_json::to_value(policy).unwrap(), policy.as_str());
        }
        assert_eq!(
            "reboot".parse::<PolicyLevel>(),
            Err(UnknownPolicy("reboot".to_string()))
        );
    }

    #[test]
    fn test_registry_without_table_is_conservative() {
        let registry = PolicyRegistry::new();
        assert!(!registry.is_loaded());
        assert_eq!(registry.classify(&BTreeSet::new()), FaultType::Normal);
        assert_eq!(registry.classify(&BTreeSet::from([1])), FaultType::Isolate);
        assert_eq!(
            registry.classify_network(&BTreeSet::from(["1".to_string()])),
            FaultType::PreSeparate
        );
    }

    #[test]
    fn test_registry_reload_failure_keeps_previous_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faultCode.json");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(SAMPLE.as_bytes())
            .unwrap();

        let registry = PolicyRegistry::new();
        registry.load(&path).unwrap();
        assert_eq!(registry.classify(&BTreeSet::from([0x8C204E00])), FaultType::Reset);

        std::fs::write(&path, b"{ truncated").unwrap();
        assert!(registry.load(&path).is_err());
        assert_eq!(registry.classify(&BTreeSet::from([0x8C204E00])), FaultType::Reset);

        assert!(matches!(
            registry.load(&dir.path().join("missing.json")),
            Err(ConfigError::Read { .. })
        ));
        assert!(registry.is_loaded());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn test_classify_total(codes in prop::collection::btree_set(any::<i64>(), 0..8)) {
            let fault = sample().classify(&codes);
            prop_assert_eq!(codes.is_empty(), fault == FaultType::Normal);
        }

        #[test]
        fn test_isolate_code_dominates(extra in prop::collection::btree_set(any::<i64>(), 0..8)) {
            let mut codes = extra;
            codes.insert(0x80E18401);
            prop_assert_eq!(sample().classify(&codes), FaultType::Isolate);
        }
    }
}
