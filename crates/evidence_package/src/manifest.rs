// Evidence archive manifest structure

use crate::canonical::canonicalize;
use crate::hash::{digest, ContentHash};
use crate::{PackageError, PackageResult, FORMAT_VERSION};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Authoritative metadata record for one recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub workflow_id: Uuid,
    pub cli_command: String,
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, MetricValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,

    /// Entry name -> lowercase hex SHA-256, for every entry except the manifest
    #[serde(default)]
    pub digests: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureBlock>,

    /// Fields written by other producers. Kept so they stay covered by the signature.
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

/// Metric value: a JSON number (integer or float, preserved exactly) or text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(serde_json::Number),
    Text(String),
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        Self::Number(v.into())
    }
}

impl From<f64> for MetricValue {
    /// Non-finite floats have no JSON number form and are kept as text.
    fn from(v: f64) -> Self {
        match serde_json::Number::from_f64(v) {
            Some(n) => Self::Number(n),
            None => Self::Text(v.to_string()),
        }
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Signature attached to a sealed manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBlock {
    pub signer: String,
    pub algorithm: String,
    /// Base64 signature over the manifest signing target
    pub signature: String,
    pub signed_at: DateTime<Utc>,
    /// Base64 public key of the signing key. Informational only, never trusted for identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl Manifest {
    pub fn new(cli_command: impl Into<String>) -> Self {
        Self::builder(cli_command).build()
    }

    pub fn builder(cli_command: impl Into<String>) -> ManifestBuilder {
        ManifestBuilder::new(cli_command)
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Canonical bytes of the manifest with the signature block removed
    pub fn canonical_body(&self) -> PackageResult<Vec<u8>> {
        let mut value = serde_json::to_value(self)?;
        match value {
            Value::Object(ref mut map) => {
                map.remove("signature");
            }
            _ => {
                return Err(PackageError::InvalidInput(
                    "manifest did not serialize to an object".to_string(),
                ))
            }
        }
        Ok(serde_json::to_vec(&canonicalize(&value))?)
    }

    /// Digest that a signature covers
    pub fn signing_target(&self) -> PackageResult<ContentHash> {
        Ok(digest(&self.canonical_body()?))
    }

    /// Copy of this manifest without its signature block
    pub fn unsigned(&self) -> Self {
        let mut copy = self.clone();
        copy.signature = None;
        copy
    }

    /// Self-describing text form stored in the archive
    pub fn to_json_pretty(&self) -> PackageResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> PackageResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Builder for manifest templates handed to the packer
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    cli_command: String,
    workflow_id: Option<Uuid>,
    created_at: Option<DateTime<Utc>>,
    goal: Option<String>,
    notes: Option<String>,
    metrics: Option<BTreeMap<String, MetricValue>>,
    approved_by: Option<String>,
    tags: Option<Vec<String>>,
}

impl ManifestBuilder {
    pub fn new(cli_command: impl Into<String>) -> Self {
        Self {
            cli_command: cli_command.into(),
            workflow_id: None,
            created_at: None,
            goal: None,
            notes: None,
            metrics: None,
            approved_by: None,
            tags: None,
        }
    }

    pub fn workflow_id(mut self, id: Uuid) -> Self {
        self.workflow_id = Some(id);
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn metric(mut self, name: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        self.metrics
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn metrics(mut self, metrics: BTreeMap<String, MetricValue>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn approved_by(mut self, who: impl Into<String>) -> Self {
        self.approved_by = Some(who.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.get_or_insert_with(Vec::new).push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn build(self) -> Manifest {
        Manifest {
            format_version: FORMAT_VERSION,
            workflow_id: self.workflow_id.unwrap_or_else(Uuid::new_v4),
            cli_command: self.cli_command,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            goal: self.goal,
            notes: self.notes,
            metrics: self.metrics,
            approved_by: self.approved_by,
            tags: self.tags,
            digests: BTreeMap::new(),
            signature: None,
            extensions: BTreeMap::new(),
        }
    }
}

/// Parse `key=value` metric text. The value becomes a number when it parses as one.
pub fn parse_metric(text: &str) -> PackageResult<(String, MetricValue)> {
    let (key, value) = text
        .split_once('=')
        .ok_or_else(|| PackageError::InvalidInput(format!("metric must be key=value: {text}")))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(PackageError::InvalidInput(format!(
            "metric name is empty: {text}"
        )));
    }

    let value = if let Ok(i) = value.parse::<i64>() {
        MetricValue::from(i)
    } else if let Ok(f) = value.parse::<f64>() {
        MetricValue::from(f)
    } else {
        MetricValue::from(value)
    };
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_manifest() -> Manifest {
        Manifest::builder("python demo.py")
            .workflow_id(Uuid::nil())
            .created_at(Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap())
            .build()
    }

    #[test]
    fn signing_target_is_sha256_of_canonical_body() {
        let m = fixed_manifest();
        let body = m.canonical_body().expect("canonical body");
        assert_eq!(m.signing_target().unwrap(), digest(&body));
        assert_eq!(m.signing_target().unwrap().to_hex().len(), 64);
    }

    #[test]
    fn metric_insertion_order_does_not_change_body() {
        let base = fixed_manifest();
        let mut a = base.clone();
        let mut b = base;
        let mut ma = BTreeMap::new();
        ma.insert("accuracy".to_string(), MetricValue::from(0.92));
        ma.insert("latency".to_string(), MetricValue::from(210));
        let mut mb = BTreeMap::new();
        mb.insert("latency".to_string(), MetricValue::from(210));
        mb.insert("accuracy".to_string(), MetricValue::from(0.92));
        a.metrics = Some(ma);
        b.metrics = Some(mb);
        assert_eq!(a.canonical_body().unwrap(), b.canonical_body().unwrap());
    }

    #[test]
    fn absent_and_empty_goal_differ() {
        let absent = fixed_manifest();
        let mut empty = fixed_manifest();
        empty.goal = Some(String::new());
        assert_ne!(
            absent.canonical_body().unwrap(),
            empty.canonical_body().unwrap()
        );

        let mut no_tags = fixed_manifest();
        no_tags.tags = Some(vec![]);
        assert_ne!(
            absent.canonical_body().unwrap(),
            no_tags.canonical_body().unwrap()
        );
    }

    #[test]
    fn tag_order_is_preserved() {
        let a = Manifest::builder("x").workflow_id(Uuid::nil()).tags(["a", "b"]);
        let b = Manifest::builder("x").workflow_id(Uuid::nil()).tags(["b", "a"]);
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let a = a.created_at(at).build();
        let b = b.created_at(at).build();
        assert_eq!(a.tags.as_deref(), Some(&["a".to_string(), "b".to_string()][..]));
        assert_ne!(a.canonical_body().unwrap(), b.canonical_body().unwrap());
    }

    #[test]
    fn signature_is_excluded_from_body() {
        let unsigned = fixed_manifest();
        let mut signed = fixed_manifest();
        signed.signature = Some(SignatureBlock {
            signer: "default".to_string(),
            algorithm: "ed25519".to_string(),
            signature: "AAAA".to_string(),
            signed_at: Utc::now(),
            public_key: None,
        });
        assert_eq!(
            unsigned.canonical_body().unwrap(),
            signed.canonical_body().unwrap()
        );
    }

    #[test]
    fn json_roundtrip_preserves_fields_and_body() {
        let m = Manifest::builder("python demo.py")
            .goal("improve accuracy")
            .notes("")
            .metric("accuracy", 0.92)
            .metric("latency", 210)
            .metric("model", "gpt")
            .approved_by("bob")
            .tags(["test", "v1"])
            .build();
        let json = m.to_json_pretty().unwrap();
        let back = Manifest::from_json(json.as_bytes()).unwrap();
        assert_eq!(back, m);
        assert_eq!(back.canonical_body().unwrap(), m.canonical_body().unwrap());
    }

    #[test]
    fn unknown_fields_are_kept_and_covered() {
        let m = fixed_manifest();
        let mut value = serde_json::to_value(&m).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("injected".to_string(), Value::Bool(true));
        let parsed: Manifest = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.extensions.get("injected"), Some(&Value::Bool(true)));
        assert_ne!(parsed.signing_target().unwrap(), m.signing_target().unwrap());
    }

    #[test]
    fn parse_metric_prefers_numbers() {
        let (k, v) = parse_metric("accuracy=0.92").unwrap();
        assert_eq!(k, "accuracy");
        assert_eq!(v, MetricValue::from(0.92));

        let (_, v) = parse_metric("latency=210").unwrap();
        assert_eq!(serde_json::to_string(&v).unwrap(), "210");

        let (_, v) = parse_metric("model=gpt-4=turbo").unwrap();
        assert_eq!(v, MetricValue::Text("gpt-4=turbo".to_string()));

        let (_, v) = parse_metric("score=NaN").unwrap();
        assert!(matches!(v, MetricValue::Text(_)));

        assert!(parse_metric("novalue").is_err());
        assert!(parse_metric("=1").is_err());
    }
}
