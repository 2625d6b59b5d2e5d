//! Consumer-facing message records.

use crate::protocol::{Action, ErrorInfo, MessageFrame};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One delivered message, as handed to application callbacks.
///
/// A MESSAGE frame may batch several payloads; each payload is projected to
/// its own `Message` by [`Message::expand`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub id: String,
    pub timestamp: String,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    pub data: Value,
}

impl Message {
    /// Projects a MESSAGE frame into one record per payload, in payload
    /// order. When the frame carries more than one payload, each record's id
    /// is the frame id suffixed with `-<index>`; a single payload keeps the
    /// frame id untouched.
    pub fn expand(frame: &MessageFrame) -> Vec<Message> {
        let n = frame.messages.len();
        frame
            .messages
            .iter()
            .enumerate()
            .map(|(index, payload)| Message {
                action: Action::Message,
                error: None,
                id: if n > 1 { format!("{}-{index}", frame.id) } else { frame.id.clone() },
                timestamp: frame.timestamp.clone(),
                channel: frame.channel.clone(),
                alias: payload.alias.clone(),
                event: payload.event.clone(),
                data: payload.data.clone().unwrap_or(Value::Null),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessagePayload;
    use serde_json::json;

    fn frame(id: &str, payloads: Vec<MessagePayload>) -> MessageFrame {
        MessageFrame {
            id: id.into(),
            timestamp: "t".into(),
            channel: "c".into(),
            messages: payloads,
        }
    }

    #[test]
    fn multi_payload_frames_fan_out_with_suffixed_ids() {
        let messages = Message::expand(&frame(
            "m1",
            vec![
                MessagePayload::from_data(1),
                MessagePayload::from_data(2),
                MessagePayload::from_data(3),
            ],
        ));

        let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m1-0", "m1-1", "m1-2"]);
        let data: Vec<_> = messages.iter().map(|m| m.data.clone()).collect();
        assert_eq!(data, [json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn single_payload_keeps_the_frame_id() {
        let messages =
            Message::expand(&frame("m9", vec![MessagePayload::with_event("tick", json!(42))]));
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "m9");
        assert_eq!(messages[0].event.as_deref(), Some("tick"));
    }

    #[test]
    fn payload_without_data_delivers_null() {
        let messages = Message::expand(&frame("m2", vec![MessagePayload::default()]));
        assert_eq!(messages[0].data, Value::Null);
    }

    #[test]
    fn empty_frame_expands_to_nothing() {
        assert!(Message::expand(&frame("m3", vec![])).is_empty());
    }
}
