use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use snmp::{SyncSession, Value};
use tracing::{error, trace};

use super::Probe;
use crate::{Job, ResultValue};

/// Converts a dotted OID (`.1.3.6.1.2.1.1.3.0`) into its sub-ids.
pub fn parse_oid(oid: &str) -> anyhow::Result<Vec<u32>> {
    let parts = oid
        .split('.')
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.trim()
                .parse::<u32>()
                .with_context(|| format!("invalid OID component '{part}' in {oid}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    if parts.is_empty() {
        return Err(anyhow!("empty OID"));
    }
    Ok(parts)
}

/// Integer if possible, then float, then the text itself.
pub fn coerce_text(text: &str) -> ResultValue {
    let trimmed = text.trim();
    if let Ok(v) = trimmed.parse::<i64>() {
        ResultValue::Int(v)
    } else if let Ok(v) = trimmed.parse::<f64>() {
        ResultValue::Float(v)
    } else {
        ResultValue::Text(text.to_string())
    }
}

/// `None` for an empty value.
fn coerce_value(value: &Value) -> Option<ResultValue> {
    let coerced = match value {
        Value::Integer(v) => ResultValue::Int(*v),
        Value::Counter32(v) | Value::Unsigned32(v) | Value::Timeticks(v) => {
            ResultValue::Int(i64::from(*v))
        }
        Value::Counter64(v) => match i64::try_from(*v) {
            Ok(v) => ResultValue::Int(v),
            Err(_) => ResultValue::Float(*v as f64),
        },
        Value::Boolean(v) => ResultValue::Int(i64::from(*v)),
        Value::OctetString(bytes) | Value::Opaque(bytes) => {
            coerce_text(&String::from_utf8_lossy(bytes))
        }
        Value::IpAddress([a, b, c, d]) => ResultValue::Text(format!("{a}.{b}.{c}.{d}")),
        Value::ObjectIdentifier(oid) => ResultValue::Text(format!("{oid:?}")),
        Value::Null => return None,
        other => ResultValue::Text(format!("{other:?}")),
    };
    Some(coerced)
}

/// SNMP v2c GET of `resource` (an OID) on `address`, with `domain` as the
/// community string.
#[derive(Debug, Clone)]
pub struct SnmpProbe {
    port: u16,
}

impl SnmpProbe {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    fn timeout(job: &Job) -> Duration {
        Duration::from_secs(job.frequency.clamp(1, 5))
    }
}

impl Default for SnmpProbe {
    fn default() -> Self {
        Self::new(161)
    }
}

#[async_trait]
impl Probe for SnmpProbe {
    async fn probe(&self, job: &Job) -> anyhow::Result<Option<ResultValue>> {
        let oid = parse_oid(&job.resource)?;
        let target = format!("{}:{}", job.address, self.port);
        let community = job.domain.clone().into_bytes();
        let timeout = Self::timeout(job);
        let job_id = job.id;

        tokio::task::spawn_blocking(move || -> anyhow::Result<Option<ResultValue>> {
            let mut session = SyncSession::new(target.as_str(), &community, Some(timeout), 0)
                .with_context(|| format!("unable to open SNMP session to {target}"))?;
            let mut response = session
                .get(&oid)
                .map_err(|e| anyhow!("SNMP GET on {target} failed: {e:?}"))?;

            match response.varbinds.next() {
                Some((name, value)) => {
                    trace!("job {job_id}: {name:?} = {value:?}");
                    let coerced = coerce_value(&value);
                    if coerced.is_none() {
                        error!("job {job_id}: can't resolve the provided OID on {target}");
                    }
                    Ok(coerced)
                }
                // noSuchObject and friends do not decode into a varbind.
                None => {
                    error!("job {job_id}: can't resolve the provided OID on {target}");
                    Ok(None)
                }
            }
        })
        .await
        .context("SNMP task panicked")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oid_with_leading_dot_parses() {
        assert_eq!(
            parse_oid(".1.3.6.1.2.1.1.3.0").unwrap(),
            vec![1, 3, 6, 1, 2, 1, 1, 3, 0]
        );
        assert_eq!(parse_oid("1.3.6").unwrap(), vec![1, 3, 6]);
    }

    #[test]
    fn malformed_oid_is_rejected() {
        assert!(parse_oid("1.3.x").is_err());
        assert!(parse_oid("...").is_err());
    }

    #[test]
    fn text_prefers_int_then_float() {
        assert_eq!(coerce_text("42"), ResultValue::Int(42));
        assert_eq!(coerce_text(" 4.5 "), ResultValue::Float(4.5));
        assert_eq!(coerce_text("up"), ResultValue::Text("up".into()));
    }

    #[test]
    fn null_values_produce_nothing() {
        assert_eq!(coerce_value(&Value::Null), None);
        assert_eq!(coerce_value(&Value::Integer(-3)), Some(ResultValue::Int(-3)));
        assert_eq!(coerce_value(&Value::Counter32(7)), Some(ResultValue::Int(7)));
        assert_eq!(
            coerce_value(&Value::OctetString(b"Linux box")),
            Some(ResultValue::Text("Linux box".into()))
        );
    }
}
