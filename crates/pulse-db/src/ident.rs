//! SQL identifier checks for names that end up in `LISTEN` and DDL.
//!
//! Channel, table and column names come from configuration and cannot be
//! bound as query parameters, so they are restricted to plain lowercase
//! identifiers instead of being quoted.

use pulse_core::{Error, Result};

/// PostgreSQL truncates identifiers beyond this length.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Accept `[a-z_][a-z0-9_]*`, at most 63 bytes.
pub fn validate_identifier<'a>(kind: &str, name: &'a str) -> Result<&'a str> {
    let mut chars = name.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if !valid_start || !valid_rest || name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::Config(format!(
            "invalid {} '{}': expected a lowercase SQL identifier",
            kind, name
        )));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_identifiers() {
        assert!(validate_identifier("channel", "einsatz_events").is_ok());
        assert!(validate_identifier("table", "_t1").is_ok());
    }

    #[test]
    fn test_rejects_injection_and_odd_names() {
        for bad in ["", "1abc", "Einsatz", "a-b", "a;drop table x", "a b", "\"q\""] {
            assert!(
                matches!(validate_identifier("table", bad), Err(Error::Config(_))),
                "accepted {:?}",
                bad
            );
        }
        assert!(validate_identifier("table", &"a".repeat(64)).is_err());
    }
}
