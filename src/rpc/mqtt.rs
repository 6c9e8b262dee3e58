//! MQTT transport
//!
//! Each node subscribes to its own inbox topic and to the presence topics of
//! everyone else. Presence is published retained, and the broker publishes an
//! "unavailable" last will on our behalf when the connection is lost.
//!
//! ```text
//! {prefix}/inbox/{address}     envelopes addressed to a node
//! {prefix}/presence/{address}  retained presence of a node
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::NodeRef;
use crate::config::BrokerConfig;

use super::messages::Envelope;
use super::transport::{Connection, Transport};

pub struct MqttTransport {
    client: AsyncClient,
    local: NodeRef,
    prefix: String,
}

impl MqttTransport {
    #[instrument(skip_all, fields(node = %local))]
    pub async fn connect(config: &BrokerConfig, local: NodeRef) -> anyhow::Result<Connection> {
        let prefix = config.topic_prefix.clone();
        let presence_topic = presence_topic(&prefix, local.address());

        let mut options = MqttOptions::new(local.address(), &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_last_will(LastWill::new(
            &presence_topic,
            serde_json::to_vec(&Envelope::presence(local.clone(), false))?,
            QoS::AtLeastOnce,
            true,
        ));

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        client
            .subscribe(inbox_topic(&prefix, local.address()), QoS::AtLeastOnce)
            .await
            .context("failed to subscribe to inbox")?;
        client
            .subscribe(format!("{prefix}/presence/+"), QoS::AtLeastOnce)
            .await
            .context("failed to subscribe to presence")?;
        client
            .publish(
                &presence_topic,
                QoS::AtLeastOnce,
                true,
                serde_json::to_vec(&Envelope::presence(local.clone(), true))?,
            )
            .await
            .context("failed to announce presence")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let me = local.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        let envelope: Envelope = match serde_json::from_slice(&publish.payload) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                warn!("undecodable message on {}: {e}", publish.topic);
                                continue;
                            }
                        };
                        if envelope.from == me && envelope.to.is_none() {
                            continue;
                        }
                        trace!("received {} from {}", envelope.stanza.kind(), envelope.from);
                        if tx.send(envelope).is_err() {
                            debug!("inbound receiver dropped, stopping event loop");
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {e}");
                        if tx.is_closed() {
                            break;
                        }
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        info!("connected to broker at {}:{}", config.host, config.port);

        Ok(Connection {
            transport: Arc::new(MqttTransport {
                client,
                local,
                prefix,
            }),
            inbound: rx,
        })
    }
}

fn inbox_topic(prefix: &str, address: &str) -> String {
    format!("{prefix}/inbox/{address}")
}

fn presence_topic(prefix: &str, address: &str) -> String {
    format!("{prefix}/presence/{address}")
}

#[async_trait]
impl Transport for MqttTransport {
    fn local(&self) -> &NodeRef {
        &self.local
    }

    async fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(&envelope)?;
        let (topic, retain) = match &envelope.to {
            Some(to) => (inbox_topic(&self.prefix, to.address()), false),
            None => (presence_topic(&self.prefix, self.local.address()), true),
        };
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .context("failed to publish")?;
        Ok(())
    }

    async fn leave(&self) -> anyhow::Result<()> {
        self.send(Envelope::presence(self.local.clone(), false))
            .await?;
        self.client
            .disconnect()
            .await
            .context("failed to disconnect")?;
        Ok(())
    }
}
