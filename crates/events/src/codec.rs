//! JSON codec for message bodies.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to serialize {type_name}: {source}")]
    Serialize {
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to deserialize {type_name}: {source}")]
    Deserialize {
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("message body is not a JSON document: {0}")]
    Parse(#[source] serde_json::Error),
}

pub fn serialize<E: Serialize>(event: &E) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(event).map_err(|source| CodecError::Serialize {
        type_name: std::any::type_name::<E>(),
        source,
    })
}

pub fn deserialize<E: DeserializeOwned>(body: &[u8]) -> Result<E, CodecError> {
    serde_json::from_slice(body).map_err(|source| CodecError::Deserialize {
        type_name: std::any::type_name::<E>(),
        source,
    })
}

/// Parse a body without a static type (dynamic handlers).
pub fn parse_document(body: &[u8]) -> Result<JsonValue, CodecError> {
    serde_json::from_slice(body).map_err(CodecError::Parse)
}
