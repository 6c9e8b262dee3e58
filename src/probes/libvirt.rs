use std::collections::HashMap;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::error;

use super::Probe;
use crate::{Job, ResultValue};

/// Normalises a field name so `Max memory`, `max_memory` and `MAXMEMORY`
/// match.
pub fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Parses `virsh dominfo` output into normalised field names and raw values.
pub fn parse_dominfo(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (normalize_key(key), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// Numeric fields carry units (`1048576 KiB`, `12.3s`); the number in the
/// first word wins.
pub fn field_value(raw: &str) -> ResultValue {
    let number = raw
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_end_matches(|c: char| c.is_ascii_alphabetic());

    if let Ok(v) = number.parse::<i64>() {
        ResultValue::Int(v)
    } else if let Ok(v) = number.parse::<f64>() {
        ResultValue::Float(v)
    } else {
        ResultValue::Text(raw.trim().to_string())
    }
}

/// Reads one attribute of a domain through a read-only hypervisor
/// connection. `address` is the connection URI, `domain` the domain name and
/// `resource` the attribute.
#[derive(Debug, Clone)]
pub struct LibvirtProbe {
    virsh: String,
}

impl LibvirtProbe {
    pub fn new(virsh: impl Into<String>) -> Self {
        Self {
            virsh: virsh.into(),
        }
    }
}

impl Default for LibvirtProbe {
    fn default() -> Self {
        Self::new("virsh")
    }
}

#[async_trait]
impl Probe for LibvirtProbe {
    async fn probe(&self, job: &Job) -> anyhow::Result<Option<ResultValue>> {
        let output = Command::new(&self.virsh)
            .args(["--readonly", "--connect", &job.address, "dominfo", &job.domain])
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("unable to run {}", self.virsh))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                "failed to look up domain {} on {}: {}",
                job.domain,
                job.address,
                stderr.trim()
            );
            return Ok(None);
        }

        let fields = parse_dominfo(&String::from_utf8_lossy(&output.stdout));
        let raw = fields
            .get(&normalize_key(&job.resource))
            .ok_or_else(|| anyhow!("domain {} has no attribute {}", job.domain, job.resource))?;
        Ok(Some(field_value(raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMINFO: &str = "\
Id:             3
Name:           web01
UUID:           4dea22b3-1d52-d8f3-2516-782e98ab3fa0
OS Type:        hvm
State:          running
CPU(s):         2
CPU time:       1234.5s
Max memory:     1048576 KiB
Used memory:    524288 KiB
Persistent:     yes
Autostart:      disable
";

    #[test]
    fn keys_are_normalised() {
        let fields = parse_dominfo(DOMINFO);

        assert_eq!(fields.get("maxmemory").unwrap(), "1048576 KiB");
        assert_eq!(fields.get("ostype").unwrap(), "hvm");
        assert_eq!(fields.get("cpus").unwrap(), "2");
        assert_eq!(normalize_key("max_memory"), "maxmemory");
    }

    #[test]
    fn values_keep_their_type() {
        let fields = parse_dominfo(DOMINFO);

        assert_eq!(field_value(&fields["maxmemory"]), ResultValue::Int(1048576));
        assert_eq!(field_value(&fields["cputime"]), ResultValue::Float(1234.5));
        assert_eq!(
            field_value(&fields["state"]),
            ResultValue::Text("running".into())
        );
    }

    #[test]
    fn uuid_stays_text() {
        let fields = parse_dominfo(DOMINFO);
        assert_eq!(
            field_value(&fields["uuid"]),
            ResultValue::Text("4dea22b3-1d52-d8f3-2516-782e98ab3fa0".into())
        );
    }
}
