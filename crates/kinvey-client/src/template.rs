//! Path template resolution
//!
//! Endpoint paths are declared as templates with `{name}` placeholders, for
//! example `appdata/{appKey}/{collection}/{id}`. Resolution substitutes bound
//! values, percent-encoding each one so it stays within a single path segment.

use std::collections::HashMap;
use std::fmt::Write;

use crate::error::{Error, Result};

/// Substitute `{name}` placeholders in a path template
///
/// Every recognized placeholder must have a value in `params`; a missing one
/// fails with [`Error::MissingPlaceholderValue`]. Braces that do not form a
/// recognized placeholder pass through unchanged, so literal `{` and `}` in
/// a path survive resolution.
pub fn resolve_template(template: &str, params: &HashMap<String, String>) -> Result<String> {
    let mut resolved = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        resolved.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if is_placeholder_name(&after[..close]) => {
                let name = &after[..close];
                match params.get(name) {
                    Some(value) => resolved.push_str(&encode_path_value(value)),
                    None => {
                        return Err(Error::MissingPlaceholderValue {
                            name: name.to_string(),
                            template: template.to_string(),
                        });
                    }
                }
                rest = &after[close + 1..];
            }
            // Unclosed or empty braces are literal text
            _ => {
                resolved.push('{');
                rest = after;
            }
        }
    }
    resolved.push_str(rest);
    Ok(resolved)
}

/// Percent-encode a value for use inside one path segment
///
/// Unreserved characters pass through; everything else, including `/` and
/// `?`, is encoded so a value can never extend or truncate the path.
pub fn encode_path_value(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for &byte in value.as_bytes() {
        if is_unreserved(byte) {
            encoded.push(byte as char);
        } else {
            let _ = write!(encoded, "%{byte:02X}");
        }
    }
    encoded
}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~')
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_resolves_all_placeholders() {
        let resolved = resolve_template(
            "appdata/{appKey}/{collection}",
            &params(&[("appKey", "k1"), ("collection", "notes")]),
        )
        .unwrap();
        assert_eq!(resolved, "appdata/k1/notes");
    }

    #[test]
    fn test_missing_value_names_the_placeholder() {
        let error = resolve_template(
            "appdata/{appKey}/{collection}",
            &params(&[("appKey", "k1")]),
        )
        .unwrap_err();
        match error {
            Error::MissingPlaceholderValue { name, template } => {
                assert_eq!(name, "collection");
                assert_eq!(template, "appdata/{appKey}/{collection}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_values_are_percent_encoded() {
        let resolved = resolve_template(
            "blob/{appKey}/{id}",
            &params(&[("appKey", "k1"), ("id", "my notes/1?x=y")]),
        )
        .unwrap();
        assert_eq!(resolved, "blob/k1/my%20notes%2F1%3Fx%3Dy");
    }

    #[test]
    fn test_unrecognized_braces_pass_through() {
        let resolved = resolve_template("rpc/{appKey}/custom/{not closed", &params(&[("appKey", "k1")]))
            .unwrap();
        assert_eq!(resolved, "rpc/k1/custom/{not closed");

        let resolved = resolve_template("a/{}/b", &params(&[])).unwrap();
        assert_eq!(resolved, "a/{}/b");

        let resolved = resolve_template("a/}b{", &params(&[])).unwrap();
        assert_eq!(resolved, "a/}b{");
    }

    #[test]
    fn test_placeholder_with_space_is_literal() {
        let resolved = resolve_template("a/{not a name}/b", &params(&[])).unwrap();
        assert_eq!(resolved, "a/{not a name}/b");
    }

    #[test]
    fn test_same_placeholder_twice() {
        let resolved = resolve_template(
            "user/{appKey}/echo/{appKey}",
            &params(&[("appKey", "k1")]),
        )
        .unwrap();
        assert_eq!(resolved, "user/k1/echo/k1");
    }
}
