use serde_json::{Map, Value};

use super::{message, text};
use crate::error::DecodeError;

/// The whole frame as one `message` field.
pub(super) fn decode(payload: &[u8], lossy: bool) -> Result<Vec<Map<String, Value>>, DecodeError> {
    Ok(vec![message(text(payload, lossy)?.into_owned())])
}
