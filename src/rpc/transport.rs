use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::NodeRef;

use super::messages::Envelope;

/// Connection of one node to the messaging substrate.
///
/// Delivery is best effort. A transport reports presence of other members by
/// pushing presence envelopes into the inbound channel, and must announce the
/// local node as unavailable when it leaves or is lost.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local(&self) -> &NodeRef;

    /// Sends an envelope. Envelopes without a recipient go to every member.
    async fn send(&self, envelope: Envelope) -> anyhow::Result<()>;

    /// Announces the local node as unavailable and disconnects.
    async fn leave(&self) -> anyhow::Result<()>;
}

/// A joined transport together with the stream of envelopes addressed to us.
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
}

impl Connection {
    pub fn local(&self) -> &NodeRef {
        self.transport.local()
    }
}
