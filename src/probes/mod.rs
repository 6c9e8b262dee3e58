//! Value collection for the three job protocols.
//!
//! A probe turns a [`Job`] definition into at most one [`ResultValue`].
//! `Ok(None)` means the probe ran but had nothing to report (for example an
//! SNMP "no such object"); errors are logged by the job runner and never end
//! the job.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{Job, Protocol, ResultValue};

pub mod libvirt;
pub mod script;
pub mod snmp;

pub use libvirt::LibvirtProbe;
pub use script::{ScriptOutcome, ScriptProbe};
pub use snmp::SnmpProbe;

#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, job: &Job) -> anyhow::Result<Option<ResultValue>>;
}

/// The probe used for each protocol.
#[derive(Clone)]
pub struct ProbeSet {
    snmp: Arc<dyn Probe>,
    script: Arc<dyn Probe>,
    libvirt: Arc<dyn Probe>,
}

impl ProbeSet {
    /// Probes talking to real devices, scripts and hypervisors.
    pub fn system() -> Self {
        Self {
            snmp: Arc::new(SnmpProbe::default()),
            script: Arc::new(ScriptProbe),
            libvirt: Arc::new(LibvirtProbe::default()),
        }
    }

    /// Uses `probe` for every protocol.
    pub fn uniform(probe: Arc<dyn Probe>) -> Self {
        Self {
            snmp: probe.clone(),
            script: probe.clone(),
            libvirt: probe,
        }
    }

    pub fn for_protocol(&self, protocol: Protocol) -> &Arc<dyn Probe> {
        match protocol {
            Protocol::Snmp => &self.snmp,
            Protocol::Test => &self.script,
            Protocol::Libvirt => &self.libvirt,
        }
    }
}

impl Default for ProbeSet {
    fn default() -> Self {
        Self::system()
    }
}
