//! Event payload encoding.

use serde::{Serialize, de::DeserializeOwned};

use crate::Result;

/// Encodes events as JSON payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventSerializer;

impl EventSerializer {
    pub fn serialize<E: Serialize>(event: &E) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(event)?)
    }

    pub fn deserialize<E: DeserializeOwned>(payload: &[u8]) -> Result<E> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PipelineError;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Requested {
        image_id: String,
    }

    #[test]
    fn payload_uses_event_field_names() {
        let payload = EventSerializer::serialize(&Requested {
            image_id: "img-1".into(),
        })
        .unwrap();
        assert_eq!(payload, br#"{"imageId":"img-1"}"#);
    }

    #[test]
    fn malformed_payload_is_a_serialization_error() {
        let result = EventSerializer::deserialize::<Requested>(b"{not json");
        assert!(matches!(result, Err(PipelineError::Serialization(_))));
    }
}
