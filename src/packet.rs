use std::fmt;

/// Delivery guarantee requested for a published packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QosLevel {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl QosLevel {
    pub fn wire_value(self) -> u8 {
        match self {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(QosLevel::AtMostOnce),
            1 => Some(QosLevel::AtLeastOnce),
            2 => Some(QosLevel::ExactlyOnce),
            _ => None,
        }
    }
}

impl fmt::Display for QosLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_value())
    }
}

/// Serializer output unit: one serialized batch (or a slice of one) bound to
/// a topic and QoS level. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub topic: String,
    pub qos: QosLevel,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(topic: impl Into<String>, qos: QosLevel, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            qos,
            payload,
        }
    }

    /// Bytes this packet occupies inside a spill frame.
    pub fn wire_len(&self) -> usize {
        2 + self.topic.len() + 1 + 4 + self.payload.len()
    }

    /// Flat wire form: topic_len(u16) topic qos(u8) payload_len(u32) payload.
    pub fn encode_wire(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.topic.len() as u16).to_le_bytes());
        out.extend_from_slice(self.topic.as_bytes());
        out.push(self.qos.wire_value());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
    }

    pub fn decode_wire(bytes: &[u8]) -> Result<(Self, usize), PacketWireError> {
        if bytes.len() < 2 {
            return Err(PacketWireError::TooShort);
        }
        let topic_len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        let mut cursor = 2;
        if bytes.len() < cursor + topic_len + 1 + 4 {
            return Err(PacketWireError::TooShort);
        }
        let topic = std::str::from_utf8(&bytes[cursor..cursor + topic_len])
            .map_err(|_| PacketWireError::BadTopic)?
            .to_string();
        cursor += topic_len;
        let qos = QosLevel::from_wire(bytes[cursor]).ok_or(PacketWireError::BadQos)?;
        cursor += 1;
        let payload_len = u32::from_le_bytes(
            bytes[cursor..cursor + 4]
                .try_into()
                .map_err(|_| PacketWireError::TooShort)?,
        ) as usize;
        cursor += 4;
        if bytes.len() < cursor + payload_len {
            return Err(PacketWireError::TooShort);
        }
        let payload = bytes[cursor..cursor + payload_len].to_vec();
        cursor += payload_len;
        Ok((
            Packet {
                topic,
                qos,
                payload,
            },
            cursor,
        ))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum PacketWireError {
    #[error("packet frame too short")]
    TooShort,
    #[error("packet topic is not valid UTF-8")]
    BadTopic,
    #[error("unknown QoS wire value")]
    BadQos,
}
