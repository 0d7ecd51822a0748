//! Local syntax checks for DIDs and content identifiers.

use crate::error::{GatewayError, GatewayResult};

/// DID methods accepted by the gateway.
pub const SUPPORTED_DID_METHODS: &[&str] = &["key", "web", "ethr", "pkh", "peer"];

/// Length of a hex-encoded 32-byte CID.
const CID_HEX_LEN: usize = 64;

/// Check that `did` is `did:<method>:<id>` with a supported method and a non-empty id.
pub fn validate_did(did: &str) -> GatewayResult<()> {
    let invalid = |reason: String| GatewayError::InvalidDocument { field: "did", reason };

    let rest = did
        .strip_prefix("did:")
        .ok_or_else(|| invalid(format!("'{}' does not start with 'did:'", truncate(did))))?;

    let (method, id) = rest
        .split_once(':')
        .ok_or_else(|| invalid("missing method-specific identifier".to_string()))?;

    if !SUPPORTED_DID_METHODS.contains(&method) {
        return Err(invalid(format!("unsupported DID method '{}'", method)));
    }

    if id.trim().is_empty() {
        return Err(invalid("empty method-specific identifier".to_string()));
    }

    if did.chars().any(char::is_whitespace) {
        return Err(invalid("DID contains whitespace".to_string()));
    }

    Ok(())
}

/// Validate a 32-byte hex CID and return it without prefix, lowercased.
pub fn normalize_cid(field: &'static str, cid: &str) -> GatewayResult<String> {
    let hex_part = cid
        .strip_prefix("0x")
        .or_else(|| cid.strip_prefix("0X"))
        .unwrap_or(cid);

    if hex_part.len() != CID_HEX_LEN {
        return Err(GatewayError::InvalidDocument {
            field,
            reason: format!(
                "expected {} hex characters, got {}",
                CID_HEX_LEN,
                hex_part.len()
            ),
        });
    }

    if !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(GatewayError::InvalidDocument {
            field,
            reason: "contains non-hex characters".to_string(),
        });
    }

    Ok(hex_part.to_ascii_lowercase())
}

/// Shorten a DID for log output.
pub fn truncate(did: &str) -> String {
    const KEEP: usize = 24;
    if did.chars().count() <= KEEP {
        did.to_string()
    } else {
        let head: String = did.chars().take(KEEP).collect();
        format!("{}...", head)
    }
}
