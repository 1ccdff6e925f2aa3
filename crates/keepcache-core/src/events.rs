//! Event names and typed decoders for the keep contracts' event payloads.

use serde_json::Value;

use crate::error::CacheError;
use crate::types::{KeepStub, LedgerEvent};

/// Emitted by the keep factory for every new keep.
pub const KEEP_CREATED: &str = "BondedECDSAKeepCreated";
/// Emitted by a keep when it is closed gracefully.
pub const KEEP_CLOSED: &str = "KeepClosed";
/// Emitted by a keep when it is terminated.
pub const KEEP_TERMINATED: &str = "KeepTerminated";
/// Emitted by a keep when a signature over a digest is requested.
pub const SIGNATURE_REQUESTED: &str = "SignatureRequested";

fn decode_error(event: &str, log: &LedgerEvent, reason: impl Into<String>) -> CacheError {
    CacheError::EventDecode {
        event: event.to_string(),
        block_number: log.block_number,
        reason: reason.into(),
    }
}

fn string_field<'a>(event: &str, log: &'a LedgerEvent, field: &str) -> Result<&'a str, CacheError> {
    match log.return_values.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.as_str()),
        Some(_) => Err(decode_error(event, log, format!("`{field}` is not a non-empty string"))),
        None => Err(decode_error(event, log, format!("missing `{field}`"))),
    }
}

/// Decode a `BondedECDSAKeepCreated` event into a keep stub.
pub fn decode_keep_created(log: &LedgerEvent) -> Result<KeepStub, CacheError> {
    let address = string_field(KEEP_CREATED, log, "keepAddress")?;

    let members = match log.return_values.get("members") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|m| {
                m.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| decode_error(KEEP_CREATED, log, "member is not a string"))
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(decode_error(KEEP_CREATED, log, "`members` is not an array")),
        None => return Err(decode_error(KEEP_CREATED, log, "missing `members`")),
    };

    Ok(KeepStub {
        address: address.to_string(),
        members,
        creation_block: log.block_number,
    })
}

/// Extract the requested digest from a `SignatureRequested` event.
pub fn decode_signature_digest(log: &LedgerEvent) -> Result<String, CacheError> {
    string_field(SIGNATURE_REQUESTED, log, "digest").map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log(block: u64, values: Value) -> LedgerEvent {
        LedgerEvent {
            block_number: block,
            log_index: 0,
            return_values: values,
        }
    }

    #[test]
    fn decodes_keep_created() {
        let stub = decode_keep_created(&log(
            100,
            json!({"keepAddress": "0xkeep", "members": ["0xa", "0xb", "0xc"], "owner": "0xo"}),
        ))
        .unwrap();
        assert_eq!(stub.address, "0xkeep");
        assert_eq!(stub.members, vec!["0xa", "0xb", "0xc"]);
        assert_eq!(stub.creation_block, 100);
    }

    #[test]
    fn rejects_missing_keep_address() {
        let err = decode_keep_created(&log(7, json!({"members": []}))).unwrap_err();
        match err {
            CacheError::EventDecode { event, block_number, .. } => {
                assert_eq!(event, KEEP_CREATED);
                assert_eq!(block_number, 7);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_non_string_member() {
        let err = decode_keep_created(&log(7, json!({"keepAddress": "0xk", "members": [1]})));
        assert!(matches!(err, Err(CacheError::EventDecode { .. })));
    }

    #[test]
    fn decodes_digest() {
        let digest = decode_signature_digest(&log(9, json!({"digest": "0xd1"}))).unwrap();
        assert_eq!(digest, "0xd1");
        assert!(decode_signature_digest(&log(9, json!({"digest": ""}))).is_err());
    }
}
