use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use ciborium::Value;

use crate::types::ids::{id_to_hex, parse_operation_hash, OperationHash, GENESIS_HASH};
use crate::types::operation::{Action, Operation};

/// Schema version for operation hashing
pub const SCHEMA_VERSION: u8 = 1;

/// Where an operation sits in its (document, scope, branch) chain
pub struct ChainPosition<'a> {
    pub document_id: &'a str,
    pub scope: &'a str,
    pub branch: &'a str,
    pub index: u64,
    pub skip: u64,
    pub previous: Option<&'a OperationHash>,
}

/// Compute the operation hash using canonical CBOR + BLAKE2b-256
pub fn compute_operation_hash(position: &ChainPosition<'_>, action: &Action) -> OperationHash {
    let preimage = build_canonical_cbor(position, action);
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(&preimage);
    hasher.finalize().into()
}

/// Build the canonical CBOR preimage for hashing
/// Format: [schema_version, document_id, scope, branch, index, skip, previous, type, action_id, ts, input]
pub fn build_canonical_cbor(position: &ChainPosition<'_>, action: &Action) -> Vec<u8> {
    let previous = position.previous.unwrap_or(&GENESIS_HASH);
    // serde_json keeps object keys sorted (BTreeMap), so the input text is canonical
    let input = serde_json::to_string(&action.input).unwrap_or_default();

    let array = Value::Array(vec![
        Value::Integer(SCHEMA_VERSION.into()),
        Value::Text(position.document_id.to_string()),
        Value::Text(position.scope.to_string()),
        Value::Text(position.branch.to_string()),
        Value::Integer(position.index.into()),
        Value::Integer(position.skip.into()),
        Value::Bytes(previous.to_vec()),
        Value::Text(action.action_type.clone()),
        Value::Text(action.id.clone()),
        Value::Integer(action.timestamp_utc_ms.into()),
        Value::Text(input),
    ]);

    let mut buf = Vec::new();
    // Writing into a Vec cannot fail for a plain value tree
    let _ = ciborium::into_writer(&array, &mut buf);
    buf
}

/// Hex hash for an operation appended after `previous`
pub fn chain_hash(position: &ChainPosition<'_>, action: &Action) -> String {
    id_to_hex(&compute_operation_hash(position, action))
}

/// Verify that `operations` continue the chain ending at `previous`.
///
/// Returns the index of the first operation whose hash does not match.
pub fn verify_chain(
    document_id: &str,
    scope: &str,
    branch: &str,
    previous: Option<&str>,
    operations: &[Operation],
) -> Result<(), u64> {
    let mut prev: Option<OperationHash> = previous.and_then(|h| parse_operation_hash(h).ok());
    for op in operations {
        let position = ChainPosition {
            document_id,
            scope,
            branch,
            index: op.index,
            skip: op.skip,
            previous: prev.as_ref(),
        };
        let expected = compute_operation_hash(&position, &op.action);
        if id_to_hex(&expected) != op.hash {
            return Err(op.index);
        }
        prev = Some(expected);
    }
    Ok(())
}
