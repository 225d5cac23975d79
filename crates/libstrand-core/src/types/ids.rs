use thiserror::Error;

/// 256-bit operation hash (content-addressed BLAKE2b-256)
pub type OperationHash = [u8; 32];

/// Hash of the empty chain, used as `previous_hash` of the first operation
pub const GENESIS_HASH: OperationHash = [0u8; 32];

#[derive(Debug, Error)]
pub enum IdParseError {
    #[error("invalid hex string: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("invalid sync unit id: {0}")]
    InvalidSyncUnitId(String),
}

/// Generate a random identifier (UUID v4, hyphenated)
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Convert a fixed-size byte array to lowercase hex string
pub fn id_to_hex<const N: usize>(id: &[u8; N]) -> String {
    hex::encode(id)
}

/// Parse a hex string into a fixed-size byte array
pub fn hex_to_id<const N: usize>(hex_str: &str) -> Result<[u8; N], IdParseError> {
    let bytes = hex::decode(hex_str)?;
    if bytes.len() != N {
        return Err(IdParseError::InvalidLength {
            expected: N,
            actual: bytes.len(),
        });
    }
    let mut arr = [0u8; N];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// Parse an operation hash from hex string
pub fn parse_operation_hash(hex_str: &str) -> Result<OperationHash, IdParseError> {
    hex_to_id::<32>(hex_str)
}

/// Build the sync unit id for a (document, scope, branch) tuple.
///
/// Format: `<document_id>:<scope>:<branch>`. Scope and branch never contain `:`.
pub fn sync_unit_id(document_id: &str, scope: &str, branch: &str) -> String {
    format!("{}:{}:{}", document_id, scope, branch)
}

/// Split a sync unit id back into (document_id, scope, branch)
pub fn parse_sync_unit_id(id: &str) -> Result<(String, String, String), IdParseError> {
    let mut parts = id.rsplitn(3, ':');
    let branch = parts.next();
    let scope = parts.next();
    let document_id = parts.next();
    match (document_id, scope, branch) {
        (Some(d), Some(s), Some(b)) if !d.is_empty() && !s.is_empty() && !b.is_empty() => {
            Ok((d.to_string(), s.to_string(), b.to_string()))
        }
        _ => Err(IdParseError::InvalidSyncUnitId(id.to_string())),
    }
}

/// Collection id of a drive's contents on a branch
pub fn drive_collection_id(branch: &str, drive_id: &str) -> String {
    format!("{}:{}", branch, drive_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_is_random() {
        assert_ne!(new_id(), new_id());
    }

    #[test]
    fn test_id_to_hex() {
        let mut id = [0u8; 32];
        id[31] = 0xff;
        let hex = id_to_hex(&id);
        assert!(hex.ends_with("ff"));
        assert_eq!(hex.len(), 64);
    }

    #[test]
    fn test_hex_to_id_invalid_length() {
        let result: Result<[u8; 32], _> = hex_to_id("0001020304");
        assert!(matches!(result, Err(IdParseError::InvalidLength { .. })));
    }

    #[test]
    fn test_hex_to_id_invalid_hex() {
        let result = parse_operation_hash("not_valid_hex!");
        assert!(matches!(result, Err(IdParseError::InvalidHex(_))));
    }

    #[test]
    fn test_sync_unit_id_parse() {
        let id = sync_unit_id("doc:with:colons", "global", "main");
        let (doc, scope, branch) = parse_sync_unit_id(&id).unwrap();
        assert_eq!(doc, "doc:with:colons");
        assert_eq!(scope, "global");
        assert_eq!(branch, "main");
    }

    #[test]
    fn test_sync_unit_id_parse_invalid() {
        assert!(parse_sync_unit_id("doc:global").is_err());
        assert!(parse_sync_unit_id("::main").is_err());
    }

    #[test]
    fn test_drive_collection_id() {
        assert_eq!(drive_collection_id("main", "drive-1"), "main:drive-1");
    }
}
