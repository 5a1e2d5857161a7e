use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::proto;

/// The two metric kinds. A metric is identified by `(kind, name)`, so the same
/// name may exist once as a gauge and once as a counter.
///
/// # Examples
///
/// ```
/// use mtrcs_common::types::MetricKind;
///
/// let kind: MetricKind = "counter".parse().unwrap();
/// assert_eq!(kind, MetricKind::Counter);
/// assert_eq!(kind.to_string(), "counter");
/// assert!("histogram".parse::<MetricKind>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Counter => write!(f, "counter"),
        }
    }
}

impl std::str::FromStr for MetricKind {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            _ => Err(RecordError::UnknownKind(s.to_string())),
        }
    }
}

/// Point-in-time reading. Every update overwrites the previous value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GaugeMetric {
    pub name: String,
    pub value: f64,
}

/// Running total. Updates add their delta to the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterMetric {
    pub name: String,
    pub value: i64,
}

/// Errors raised while validating an incoming [`MetricRecord`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("metric id must not be empty")]
    EmptyName,
    #[error("unknown metric type: {0}")]
    UnknownKind(String),
    #[error("{kind} metric {name} has no {field}")]
    MissingField {
        name: String,
        kind: MetricKind,
        field: &'static str,
    },
    #[error("invalid {kind} value {raw:?}")]
    InvalidValue { kind: MetricKind, raw: String },
}

/// Wire form shared by the JSON API, the batch endpoint and the gRPC service.
///
/// Gauge records carry `value`, counter records carry `delta`. On the wire the
/// name is `id` and the kind is `type`:
///
/// ```
/// use mtrcs_common::types::MetricRecord;
///
/// let rec: MetricRecord = serde_json::from_str(r#"{"id":"PollCount","type":"counter","delta":3}"#).unwrap();
/// assert_eq!(rec, MetricRecord::counter("PollCount", 3));
/// assert_eq!(
///     serde_json::to_string(&MetricRecord::gauge("Alloc", 1.5)).unwrap(),
///     r#"{"id":"Alloc","type":"gauge","value":1.5}"#
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    #[serde(rename = "id")]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
}

impl MetricRecord {
    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Gauge,
            value: Some(value),
            delta: None,
        }
    }

    pub fn counter(name: impl Into<String>, delta: i64) -> Self {
        Self {
            name: name.into(),
            kind: MetricKind::Counter,
            value: None,
            delta: Some(delta),
        }
    }

    /// Builds a record from the plain-text `/update/{kind}/{name}/{value}` form.
    pub fn parse(kind: &str, name: &str, raw: &str) -> Result<Self, RecordError> {
        let kind: MetricKind = kind.parse()?;
        if name.is_empty() {
            return Err(RecordError::EmptyName);
        }
        let invalid = || RecordError::InvalidValue {
            kind,
            raw: raw.to_string(),
        };
        match kind {
            MetricKind::Gauge => {
                let value: f64 = raw.parse().map_err(|_| invalid())?;
                if !value.is_finite() {
                    return Err(invalid());
                }
                Ok(Self::gauge(name, value))
            }
            MetricKind::Counter => Ok(Self::counter(name, raw.parse().map_err(|_| invalid())?)),
        }
    }

    /// Checks that the record is usable as an update: a non-empty name, the
    /// payload field its kind requires and, for gauges, a finite value.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.name.is_empty() {
            return Err(RecordError::EmptyName);
        }
        let missing = |field| RecordError::MissingField {
            name: self.name.clone(),
            kind: self.kind,
            field,
        };
        match self.kind {
            MetricKind::Gauge => match self.value {
                None => Err(missing("value")),
                Some(value) => check_gauge_value(value),
            },
            MetricKind::Counter if self.delta.is_none() => Err(missing("delta")),
            MetricKind::Counter => Ok(()),
        }
    }
}

/// Gauges must be finite: NaN and infinities have no JSON representation and
/// would make a saved snapshot unreadable.
pub fn check_gauge_value(value: f64) -> Result<(), RecordError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(RecordError::InvalidValue {
            kind: MetricKind::Gauge,
            raw: value.to_string(),
        })
    }
}

impl From<GaugeMetric> for MetricRecord {
    fn from(m: GaugeMetric) -> Self {
        Self::gauge(m.name, m.value)
    }
}

impl From<CounterMetric> for MetricRecord {
    fn from(m: CounterMetric) -> Self {
        Self::counter(m.name, m.value)
    }
}

impl From<MetricRecord> for proto::Metric {
    fn from(r: MetricRecord) -> Self {
        proto::Metric {
            id: r.name,
            r#type: r.kind.to_string(),
            value: r.value,
            delta: r.delta,
        }
    }
}

impl TryFrom<proto::Metric> for MetricRecord {
    type Error = RecordError;

    fn try_from(m: proto::Metric) -> Result<Self, Self::Error> {
        let record = MetricRecord {
            kind: m.r#type.parse()?,
            name: m.id,
            value: m.value,
            delta: m.delta,
        };
        record.validate()?;
        Ok(record)
    }
}

/// Response envelope of the batch endpoint and the gRPC `Update` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ApiResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

/// Full storage state at one instant, as written to the snapshot file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub gauge_metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub counter_metrics: BTreeMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_text_values() {
        assert_eq!(
            MetricRecord::parse("gauge", "Alloc", "12.5").unwrap(),
            MetricRecord::gauge("Alloc", 12.5)
        );
        assert_eq!(
            MetricRecord::parse("counter", "PollCount", "-2").unwrap(),
            MetricRecord::counter("PollCount", -2)
        );
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!(
            MetricRecord::parse("histogram", "x", "1"),
            Err(RecordError::UnknownKind("histogram".into()))
        );
        assert!(matches!(
            MetricRecord::parse("counter", "x", "1.5"),
            Err(RecordError::InvalidValue { .. })
        ));
        assert!(matches!(
            MetricRecord::parse("gauge", "x", "abc"),
            Err(RecordError::InvalidValue { .. })
        ));
        assert!(matches!(
            MetricRecord::parse("gauge", "x", "NaN"),
            Err(RecordError::InvalidValue { .. })
        ));
        assert_eq!(
            MetricRecord::parse("gauge", "", "1"),
            Err(RecordError::EmptyName)
        );
    }

    #[test]
    fn validate_requires_kind_payload() {
        let rec: MetricRecord = serde_json::from_str(r#"{"id":"temp","type":"gauge"}"#).unwrap();
        assert_eq!(
            rec.validate(),
            Err(RecordError::MissingField {
                name: "temp".into(),
                kind: MetricKind::Gauge,
                field: "value",
            })
        );

        let rec: MetricRecord =
            serde_json::from_str(r#"{"id":"reqs","type":"counter","value":1.0}"#).unwrap();
        assert!(rec.validate().is_err());

        assert!(MetricRecord::counter("reqs", 1).validate().is_ok());
        assert!(MetricRecord::gauge("", 1.0).validate().is_err());
    }

    #[test]
    fn validate_rejects_non_finite_gauges() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                MetricRecord::gauge("temp", value).validate(),
                Err(RecordError::InvalidValue { kind: MetricKind::Gauge, .. })
            ));
        }
        assert!(MetricRecord::gauge("temp", f64::MAX).validate().is_ok());

        let wire = proto::Metric {
            id: "temp".into(),
            r#type: "gauge".into(),
            value: Some(f64::NAN),
            delta: None,
        };
        assert!(MetricRecord::try_from(wire).is_err());
    }

    #[test]
    fn unknown_type_fails_to_deserialize() {
        let res: Result<MetricRecord, _> = serde_json::from_str(r#"{"id":"x","type":"summary","value":1}"#);
        assert!(res.is_err());
    }

    #[test]
    fn proto_conversion_validates() {
        let wire: proto::Metric = MetricRecord::counter("PollCount", 4).into();
        assert_eq!(wire.r#type, "counter");
        assert_eq!(MetricRecord::try_from(wire).unwrap(), MetricRecord::counter("PollCount", 4));

        let bad = proto::Metric {
            id: "x".into(),
            r#type: "gauge".into(),
            value: None,
            delta: Some(1),
        };
        assert!(MetricRecord::try_from(bad).is_err());
    }

    #[test]
    fn snapshot_json_shape() {
        let mut snap = Snapshot::default();
        snap.gauge_metrics.insert("temp".into(), 2.0);
        snap.counter_metrics.insert("reqs".into(), 6);
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["gauge_metrics"]["temp"], 2.0);
        assert_eq!(json["counter_metrics"]["reqs"], 6);
    }

    #[test]
    fn api_response_omits_empty_detail() {
        assert_eq!(serde_json::to_string(&ApiResponse::ok()).unwrap(), r#"{"ok":true}"#);
        assert_eq!(
            serde_json::to_string(&ApiResponse::failed("boom")).unwrap(),
            r#"{"ok":false,"detail":"boom"}"#
        );
    }
}
