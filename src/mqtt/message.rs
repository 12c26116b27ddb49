use rumqttc::QoS;
use std::fmt;

use crate::sensor::SensorKind;

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

const AVAILABILITY_SUFFIX: &str = "LWT";
const PREVIEW_LEN: usize = 120;

/// One message handed to the transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
    pub qos: QoS,
}

impl Outbound {
    /// Non-retained, QoS 0
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
            qos: QoS::AtMostOnce,
        }
    }

    pub fn retained(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

impl fmt::Display for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.payload);
        let preview: String = text.chars().take(PREVIEW_LEN).collect();
        write!(f, "{} (retain={}): {}", self.topic, self.retain, preview)
    }
}

/// Topic layout below the per-device root
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    root: String,
}

impl Topics {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn availability(&self) -> String {
        format!("{}{}", self.root, AVAILABILITY_SUFFIX)
    }

    pub fn for_kind(&self, kind: SensorKind) -> String {
        format!("{}{}", self.root, kind.topic_suffix())
    }
}
