//! Record types persisted by the storage backends

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::evaluation::{Comparator, Rule, Threshold};
use crate::{Job, JobId, Protocol, ResultValue};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Monitor {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub group_id: Option<i64>,
}

/// Definition of a job as supplied by an administrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub address: String,
    pub protocol: Protocol,
    pub frequency: u64,
    pub domain: String,
    pub resource: String,
    /// Jobs without a segment belong to the default segment.
    #[serde(default)]
    pub segment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub monitor_id: i64,
    #[serde(flatten)]
    pub spec: JobSpec,
}

impl JobRecord {
    pub fn to_job(&self, default_segment: &str) -> Job {
        Job {
            id: self.id,
            address: self.spec.address.clone(),
            protocol: self.spec.protocol,
            frequency: self.spec.frequency,
            domain: self.spec.domain.clone(),
            resource: self.spec.resource.clone(),
            segment: self
                .spec
                .segment
                .clone()
                .unwrap_or_else(|| default_segment.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub id: i64,
    pub job_id: JobId,
    pub comparator: Comparator,
    pub threshold: Threshold,
}

impl EvaluationRecord {
    pub fn rule(&self) -> Rule {
        Rule::new(self.comparator, self.threshold.clone())
    }
}

/// A scalar as stored in a result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl StoredValue {
    /// Scalar form of a probe value. Lists have none.
    pub fn from_result(value: &ResultValue) -> Option<Self> {
        match value {
            ResultValue::Int(v) => Some(StoredValue::Int(*v)),
            ResultValue::Float(v) => Some(StoredValue::Float(*v)),
            ResultValue::Text(v) => Some(StoredValue::Text(v.clone())),
            ResultValue::List(_) => None,
        }
    }
}

/// Row to insert. List results become a parent row without value followed by
/// one row per element pointing at it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewResult {
    pub job_id: JobId,
    pub recorded: DateTime<Utc>,
    pub value: Option<StoredValue>,
    pub parent: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub id: i64,
    pub job_id: JobId,
    pub recorded: DateTime<Utc>,
    pub value: Option<StoredValue>,
    pub parent: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBucket {
    pub start: DateTime<Utc>,
    pub value: StoredValue,
}

/// Fixed bucket layouts used by the summary queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketSpan {
    /// Twelve five-minute buckets from `start`.
    Hour,
    /// Twenty-four hourly buckets from midnight of `start`.
    Day,
    /// Seven daily buckets from midnight of `start`.
    Week,
}

impl BucketSpan {
    /// First bucket start, bucket width and bucket count.
    pub fn layout(&self, start: DateTime<Utc>) -> (DateTime<Utc>, Duration, usize) {
        match self {
            BucketSpan::Hour => (start, Duration::minutes(5), 12),
            BucketSpan::Day => (midnight(start), Duration::hours(1), 24),
            BucketSpan::Week => (midnight(start), Duration::days(1), 7),
        }
    }
}

fn midnight(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&at.date_naive().and_time(NaiveTime::MIN))
}

/// Average of the rows of a bucket. Integers win over floats, floats over
/// text; text buckets report their latest value.
pub fn summarize<'a>(values: impl IntoIterator<Item = &'a StoredValue>) -> Option<StoredValue> {
    let (mut ints, mut floats, mut text) = (Vec::new(), Vec::new(), None);
    for value in values {
        match value {
            StoredValue::Int(v) => ints.push(*v),
            StoredValue::Float(v) => floats.push(*v),
            StoredValue::Text(v) => text = Some(v),
        }
    }

    if !ints.is_empty() {
        let sum: i128 = ints.iter().map(|v| *v as i128).sum();
        return Some(StoredValue::Int((sum / ints.len() as i128) as i64));
    }
    if !floats.is_empty() {
        return Some(StoredValue::Float(
            floats.iter().sum::<f64>() / floats.len() as f64,
        ));
    }
    text.map(|v| StoredValue::Text(v.clone()))
}

/// Splits rows into the buckets of a layout, skipping empty buckets.
pub fn bucketize(
    rows: &[ResultRow],
    origin: DateTime<Utc>,
    width: Duration,
    count: usize,
) -> Vec<ResultBucket> {
    (0..count)
        .filter_map(|i| {
            let start = origin + width * i as i32;
            let end = start + width;
            let value = summarize(
                rows.iter()
                    .filter(|row| row.recorded >= start && row.recorded < end)
                    .filter_map(|row| row.value.as_ref()),
            )?;
            Some(ResultBucket { start, value })
        })
        .collect()
}
