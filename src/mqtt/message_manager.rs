use chrono::{DateTime, Local};
use std::fmt;

const PREVIEW_CHARS: usize = 48;

/// Publish received from the broker, stamped with its processing time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} - {}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            self.preview()
        )
    }
}

impl InboundMessage {
    pub fn from_publish(publish: &rumqttc::Publish, received_at: DateTime<Local>) -> Self {
        InboundMessage {
            topic: publish.topic.clone(),
            payload: publish.payload.to_vec(),
            received_at,
        }
    }

    /// Lossy, shortened payload text for log lines
    pub fn preview(&self) -> String {
        let text = String::from_utf8_lossy(&self.payload);
        let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
        if text.chars().count() > PREVIEW_CHARS {
            preview.push('…');
        }
        preview
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{Publish, QoS};

    #[test]
    fn preview_handles_short_and_long_payloads() {
        let short = InboundMessage::from_publish(
            &Publish::new("esp32/gps", QoS::AtMostOnce, "{}"),
            Local::now(),
        );
        assert_eq!(short.preview(), "{}");

        let long = InboundMessage::from_publish(
            &Publish::new("esp32/gps", QoS::AtMostOnce, "x".repeat(100)),
            Local::now(),
        );
        assert_eq!(long.preview().chars().count(), PREVIEW_CHARS + 1);
        assert!(long.to_string().contains("esp32/gps"));
    }
}
