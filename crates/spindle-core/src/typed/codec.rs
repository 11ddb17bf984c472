//! Payload codec: typed tasks <-> JSON payloads on task records.

use serde_json::Value;
use thiserror::Error;

use super::task::Task;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode {task_type}: {source}")]
    Encode {
        task_type: &'static str,
        source: serde_json::Error,
    },

    #[error("decode {task_type}: {source}")]
    Decode {
        task_type: &'static str,
        source: serde_json::Error,
    },
}

pub struct PayloadCodec;

impl PayloadCodec {
    pub fn encode<T: Task>(task: &T) -> Result<Value, CodecError> {
        serde_json::to_value(task).map_err(|source| CodecError::Encode {
            task_type: T::TYPE,
            source,
        })
    }

    pub fn decode<T: Task>(payload: &Value) -> Result<T, CodecError> {
        T::deserialize(payload).map_err(|source| CodecError::Decode {
            task_type: T::TYPE,
            source,
        })
    }
}
