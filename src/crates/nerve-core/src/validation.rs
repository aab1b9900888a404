//! Identifier validation shared by sessions, nodes, graphs and workflows.
//!
//! Identifiers double as path components (history files live at
//! `<base>/<server>/<session>/<node>.jsonl`), so validation also guards
//! against path traversal.

use crate::error::{CoreError, Result};

/// Maximum identifier length.
pub const MAX_NAME_LEN: usize = 64;

/// Validate an identifier slug.
///
/// Accepted: nonempty, at most [`MAX_NAME_LEN`] characters, restricted to
/// ASCII letters, digits, `-` and `_`. Case-sensitive.
pub fn validate_name(name: &str, kind: &'static str) -> Result<()> {
    if name.is_empty() {
        return Err(CoreError::InvalidName {
            kind,
            name: name.to_string(),
            reason: "name cannot be empty",
        });
    }
    if name.len() > MAX_NAME_LEN {
        return Err(CoreError::InvalidName {
            kind,
            name: name.to_string(),
            reason: "name exceeds maximum length",
        });
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CoreError::InvalidName {
            kind,
            name: name.to_string(),
            reason: "only letters, digits, '-' and '_' are allowed",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_slugs() {
        for name in ["a", "node-1", "my_node", "A9", "x".repeat(64).as_str()] {
            assert!(validate_name(name, "node").is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_empty() {
        assert!(validate_name("", "node").is_err());
    }

    #[test]
    fn rejects_path_separators() {
        for name in ["a/b", "..", "a\\b", "a.b", "has space", "emoji✨"] {
            assert!(validate_name(name, "node").is_err(), "{name}");
        }
    }

    #[test]
    fn rejects_overlong() {
        let name = "x".repeat(MAX_NAME_LEN + 1);
        assert!(validate_name(&name, "node").is_err());
    }
}
