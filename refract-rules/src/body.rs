//! Body mutation operators.
//!
//! Patches operate on the textual body so that aggregated rules see each
//! other's output without re-parsing between rules.

use crate::jsonptr;
use crate::matcher::cached_regex;
use crate::spec::BodyPatch;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::debug;

/// Apply one body patch to the current body text. Returns the replacement
/// bytes, or `None` when the patch does not apply (bad base64, regex that
/// fails to compile, JSON that does not parse, failed `test` op). A
/// non-applying patch contributes nothing; other mutation fields keep.
pub fn apply_body_patch(src: &str, patch: &BodyPatch) -> Option<Vec<u8>> {
    match patch {
        BodyPatch::Base64 { value } => match BASE64.decode(value) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                debug!(error = %err, "base64 body patch did not decode");
                None
            }
        },
        BodyPatch::TextRegex { pattern, replace } => {
            let re = cached_regex(pattern)?;
            Some(re.replace_all(src, replace.as_str()).into_owned().into_bytes())
        }
        BodyPatch::JsonPatch(ops) => {
            jsonptr::apply_patch(src, ops).map(String::into_bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{PatchOp, PatchOpKind};
    use serde_json::json;

    #[test]
    fn test_base64_replaces_wholesale() {
        let patch = BodyPatch::Base64 {
            value: BASE64.encode("replacement"),
        };
        assert_eq!(
            apply_body_patch("original", &patch).unwrap(),
            b"replacement"
        );
    }

    #[test]
    fn test_base64_invalid_input() {
        let patch = BodyPatch::Base64 {
            value: "!!not base64!!".into(),
        };
        assert!(apply_body_patch("original", &patch).is_none());
    }

    #[test]
    fn test_text_regex_with_backrefs() {
        let patch = BodyPatch::TextRegex {
            pattern: r"(\w+)=(\d+)".into(),
            replace: "$2=$1".into(),
        };
        assert_eq!(
            apply_body_patch("a=1&b=2", &patch).unwrap(),
            b"1=a&2=b"
        );
    }

    #[test]
    fn test_text_regex_invalid_pattern() {
        let patch = BodyPatch::TextRegex {
            pattern: "(".into(),
            replace: "x".into(),
        };
        assert!(apply_body_patch("abc", &patch).is_none());
    }

    #[test]
    fn test_json_patch_replace() {
        let patch = BodyPatch::JsonPatch(vec![PatchOp {
            op: PatchOpKind::Replace,
            path: "/a".into(),
            from: String::new(),
            value: json!(2),
        }]);
        assert_eq!(
            apply_body_patch(r#"{"a":1}"#, &patch).unwrap(),
            br#"{"a":2}"#
        );
    }

    #[test]
    fn test_json_patch_on_invalid_json() {
        let patch = BodyPatch::JsonPatch(vec![PatchOp {
            op: PatchOpKind::Add,
            path: "/a".into(),
            from: String::new(),
            value: json!(1),
        }]);
        assert!(apply_body_patch("not json", &patch).is_none());
    }
}
