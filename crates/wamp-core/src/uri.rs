//! URI validation for procedures and topics.

use crate::error::{WampError, WampResult};

/// Check a procedure or topic URI.
///
/// Components are dot-separated and may not contain whitespace or `#`.
/// Empty components are only legal in wildcard patterns.
pub fn validate_uri(uri: &str, allow_empty_components: bool) -> WampResult<()> {
    if uri.is_empty() {
        return Err(WampError::InvalidUri("uri is empty".into()));
    }

    for component in uri.split('.') {
        if component.is_empty() {
            if allow_empty_components {
                continue;
            }
            return Err(WampError::InvalidUri(format!(
                "'{uri}' has an empty component"
            )));
        }
        if component.chars().any(|c| c.is_whitespace() || c == '#') {
            return Err(WampError::InvalidUri(format!(
                "'{uri}' contains an illegal character"
            )));
        }
    }

    Ok(())
}
