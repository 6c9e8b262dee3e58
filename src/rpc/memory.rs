//! In-process transport
//!
//! All members of a [`MemoryNetwork`] share one routing table. Joining
//! announces the new member to everyone and replays the presence of existing
//! members to the newcomer. A drop filter lets tests simulate message loss.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::NodeRef;

use super::messages::{Envelope, Stanza};
use super::transport::{Connection, Transport};

type DropFilter = Box<dyn Fn(&Envelope) -> bool + Send + Sync>;

#[derive(Default)]
struct NetworkState {
    members: BTreeMap<NodeRef, mpsc::UnboundedSender<Envelope>>,
    drop_filter: Option<DropFilter>,
    sent: Vec<Envelope>,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, local: NodeRef) -> Connection {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            for (member, member_tx) in &state.members {
                let _ = tx.send(Envelope::presence(member.clone(), true));
                let _ = member_tx.send(Envelope::presence(local.clone(), true));
            }
            state.members.insert(local.clone(), tx);
        }
        debug!("{local} joined the memory network");

        Connection {
            transport: Arc::new(MemoryTransport {
                network: self.clone(),
                local,
            }),
            inbound: rx,
        }
    }

    /// Removes a member without its cooperation, the way a crashed node
    /// disappears. Remaining members see it go unavailable.
    pub fn disconnect(&self, node: &NodeRef) {
        let mut state = self.state.lock();
        if let Some((gone, _)) = state.members.remove_entry(node) {
            for member_tx in state.members.values() {
                let _ = member_tx.send(Envelope::presence(gone.clone(), false));
            }
            debug!("{gone} disconnected from the memory network");
        }
    }

    /// Drops every envelope for which `filter` returns true.
    pub fn set_drop_filter(&self, filter: impl Fn(&Envelope) -> bool + Send + Sync + 'static) {
        self.state.lock().drop_filter = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        self.state.lock().drop_filter = None;
    }

    /// Every envelope sent so far, dropped ones included.
    pub fn sent(&self) -> Vec<Envelope> {
        self.state.lock().sent.clone()
    }

    pub fn is_member(&self, node: &NodeRef) -> bool {
        self.state.lock().members.contains_key(node)
    }

    fn route(&self, envelope: Envelope) {
        let mut state = self.state.lock();
        state.sent.push(envelope.clone());

        if state.drop_filter.as_ref().is_some_and(|drop| drop(&envelope)) {
            trace!(
                "dropping {} from {}",
                envelope.stanza.kind(),
                envelope.from
            );
            return;
        }

        match &envelope.to {
            Some(to) => match state.members.get(to) {
                Some(tx) => {
                    let _ = tx.send(envelope);
                }
                None => debug!("no member {to}, discarding {}", envelope.stanza.kind()),
            },
            None => {
                for (member, tx) in &state.members {
                    if *member != envelope.from {
                        let _ = tx.send(envelope.clone());
                    }
                }
            }
        }
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    local: NodeRef,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local(&self) -> &NodeRef {
        &self.local
    }

    async fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        if !self.network.is_member(&self.local) {
            anyhow::bail!("{} is not connected", self.local);
        }
        self.network.route(envelope);
        Ok(())
    }

    async fn leave(&self) -> anyhow::Result<()> {
        self.network.disconnect(&self.local);
        Ok(())
    }
}

/// Stanzas of a given kind sent to `to`, in order.
pub fn sent_to<'a>(envelopes: &'a [Envelope], to: &NodeRef) -> impl Iterator<Item = &'a Stanza> {
    envelopes
        .iter()
        .filter(move |e| e.to.as_ref() == Some(to))
        .map(|e| &e.stanza)
}
