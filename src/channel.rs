use crate::packet::Packet;
use thiserror::Error;

/// Identifier for a pending acknowledgement, assigned by the channel on send.
pub type AckId = u64;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is disconnected")]
    Disconnected,
    #[error("channel rejected the packet: {0}")]
    Rejected(String),
}

/// The abstract upstream publish boundary. The pipeline core only knows how
/// to hand a packet over and receive an ack id back; session negotiation,
/// TLS, and reconnects live behind the implementation.
pub trait PacketChannel {
    fn send(&mut self, packet: &Packet) -> Result<AckId, ChannelError>;
}

/// Asynchronous signals delivered by the channel driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected,
    PacketAcked(AckId),
    Disconnected,
}

#[cfg(feature = "mqtt")]
pub mod mqtt {
    //! rumqttc-backed [`PacketChannel`]. QoS 1 publish acknowledgements are
    //! mapped back to locally assigned ack ids in send order, which holds
    //! for a single MQTT session.

    use super::{AckId, ChannelError, ChannelEvent, PacketChannel};
    use crate::config::MqttConfig;
    use crate::packet::{Packet, QosLevel};
    use log::warn;
    use parking_lot::Mutex;
    use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    fn map_qos(qos: QosLevel) -> QoS {
        match qos {
            QosLevel::AtMostOnce => QoS::AtMostOnce,
            QosLevel::AtLeastOnce => QoS::AtLeastOnce,
            QosLevel::ExactlyOnce => QoS::ExactlyOnce,
        }
    }

    pub struct MqttChannel {
        client: AsyncClient,
        next_id: AckId,
        outstanding: Arc<Mutex<VecDeque<AckId>>>,
    }

    /// Translates raw eventloop notifications into [`ChannelEvent`]s for the
    /// pipeline driver. Shares the outstanding-id queue with its channel and
    /// re-establishes subscriptions after every connack.
    pub struct MqttEventBridge {
        outstanding: Arc<Mutex<VecDeque<AckId>>>,
        client: AsyncClient,
        subscriptions: Vec<String>,
    }

    pub fn connect(config: &MqttConfig) -> (MqttChannel, MqttEventBridge, EventLoop) {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        let (client, eventloop) = AsyncClient::new(options, 64);
        let outstanding = Arc::new(Mutex::new(VecDeque::new()));
        let subscriptions = config.actions_topic.iter().cloned().collect();
        (
            MqttChannel {
                client: client.clone(),
                next_id: 0,
                outstanding: outstanding.clone(),
            },
            MqttEventBridge {
                outstanding,
                client,
                subscriptions,
            },
            eventloop,
        )
    }

    impl PacketChannel for MqttChannel {
        fn send(&mut self, packet: &Packet) -> Result<AckId, ChannelError> {
            self.client
                .try_publish(
                    &packet.topic,
                    map_qos(packet.qos),
                    false,
                    packet.payload.clone(),
                )
                .map_err(|e| ChannelError::Rejected(e.to_string()))?;
            self.next_id += 1;
            if packet.qos != QosLevel::AtMostOnce {
                self.outstanding.lock().push_back(self.next_id);
            }
            Ok(self.next_id)
        }
    }

    impl MqttEventBridge {
        pub fn translate(&self, event: &Result<Event, rumqttc::ConnectionError>) -> Option<ChannelEvent> {
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    self.outstanding.lock().clear();
                    for topic in &self.subscriptions {
                        if let Err(err) = self.client.try_subscribe(topic, QoS::AtLeastOnce) {
                            warn!("subscribe to {topic} failed: {err}");
                        }
                    }
                    Some(ChannelEvent::Connected)
                }
                Ok(Event::Incoming(Incoming::PubAck(_))) => {
                    match self.outstanding.lock().pop_front() {
                        Some(id) => Some(ChannelEvent::PacketAcked(id)),
                        None => {
                            warn!("puback with no outstanding publish");
                            None
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => Some(ChannelEvent::Disconnected),
                Ok(_) => None,
                Err(_) => Some(ChannelEvent::Disconnected),
            }
        }
    }
}
