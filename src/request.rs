//! C4 support: turning an inbound request's form fields into the
//! classification and parsed values the router dispatches on. Kept
//! transport-agnostic (`HashMap<String, String>`, not an axum type) so it
//! can be exercised without spinning up a router.

use crate::error::WcError;
use crate::framer::PaddingMode;
use serde_json::value::RawValue;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    BackChannel,
    Terminate,
    NewSession,
    Forward,
}

/// Classification table from spec.md §4.4.
pub fn classify(fields: &HashMap<String, String>) -> RequestKind {
    match fields.get("TYPE").map(String::as_str) {
        Some("xmlhttp") | Some("html") => RequestKind::BackChannel,
        Some("terminate") => RequestKind::Terminate,
        _ => match sid(fields) {
            Some(_) => RequestKind::Forward,
            None => RequestKind::NewSession,
        },
    }
}

pub fn sid(fields: &HashMap<String, String>) -> Option<String> {
    fields.get("SID").filter(|s| !s.is_empty()).cloned()
}

pub fn aid(fields: &HashMap<String, String>) -> Result<Option<u64>, WcError> {
    parse_u64(fields, "AID")
}

pub fn ci(fields: &HashMap<String, String>) -> bool {
    fields.get("CI").map(|v| v == "1").unwrap_or(false)
}

pub fn domain(fields: &HashMap<String, String>) -> Option<String> {
    fields.get("DOMAIN").cloned()
}

pub fn padding_mode(fields: &HashMap<String, String>) -> PaddingMode {
    PaddingMode::from_type_param(fields.get("TYPE").map(String::as_str))
}

fn parse_u64(fields: &HashMap<String, String>, key: &'static str) -> Result<Option<u64>, WcError> {
    match fields.get(key) {
        None => Ok(None),
        Some(v) => v
            .parse::<u64>()
            .map(Some)
            .map_err(|_| WcError::ParseField { field: key }),
    }
}

/// Parses the `count`/`ofs`/`reqN_*` triad into an ordered, id-assigned
/// batch (spec.md §4.5 forward branch). `count` absent or `0` yields an
/// empty batch — not an error, matching an ACK-only forward POST.
pub fn parse_forward_batch(
    fields: &HashMap<String, String>,
) -> Result<Vec<(u64, Box<RawValue>)>, WcError> {
    let count = parse_u64(fields, "count")?.unwrap_or(0);
    if count == 0 {
        return Ok(Vec::new());
    }
    let ofs = parse_u64(fields, "ofs")?.unwrap_or(0);

    let mut batch = Vec::with_capacity(count as usize);
    for i in 0..count {
        let prefix = format!("req{i}_");
        let mut entry = serde_json::Map::new();
        for (field_name, value) in fields {
            if let Some(key) = field_name.strip_prefix(prefix.as_str()) {
                entry.insert(key.to_string(), serde_json::Value::String(value.clone()));
            }
        }
        let raw = serde_json::value::to_raw_value(&entry)
            .map_err(|_| WcError::ParseField { field: "reqN_*" })?;
        batch.push((ofs + i, raw));
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn classify_back_channel_by_type() {
        assert_eq!(classify(&fields(&[("TYPE", "xmlhttp")])), RequestKind::BackChannel);
        assert_eq!(classify(&fields(&[("TYPE", "html")])), RequestKind::BackChannel);
    }

    #[test]
    fn classify_terminate_by_type() {
        assert_eq!(classify(&fields(&[("TYPE", "terminate")])), RequestKind::Terminate);
    }

    #[test]
    fn classify_new_session_when_sid_absent() {
        assert_eq!(classify(&fields(&[])), RequestKind::NewSession);
        assert_eq!(classify(&fields(&[("SID", "")])), RequestKind::NewSession);
    }

    #[test]
    fn classify_forward_when_sid_present() {
        assert_eq!(classify(&fields(&[("SID", "s1")])), RequestKind::Forward);
    }

    #[test]
    fn parse_forward_batch_assigns_ofs_plus_i_ids() {
        let f = fields(&[("count", "2"), ("ofs", "1"), ("req0_x", "a"), ("req1_y", "b")]);
        let batch = parse_forward_batch(&f).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].0, 1);
        assert_eq!(batch[0].1.get(), r#"{"x":"a"}"#);
        assert_eq!(batch[1].0, 2);
        assert_eq!(batch[1].1.get(), r#"{"y":"b"}"#);
    }

    #[test]
    fn parse_forward_batch_with_no_count_is_empty() {
        let f = fields(&[("SID", "s1"), ("AID", "3")]);
        assert!(parse_forward_batch(&f).unwrap().is_empty());
    }

    #[test]
    fn parse_forward_batch_does_not_confuse_prefixes() {
        // req1_x must not be picked up by the req10_ prefix check.
        let f = fields(&[("count", "1"), ("ofs", "10"), ("req10_x", "ten")]);
        let batch = parse_forward_batch(&f).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].1.get(), r#"{}"#);
    }

    #[test]
    fn malformed_count_is_a_parse_error() {
        let f = fields(&[("count", "not-a-number")]);
        assert!(parse_forward_batch(&f).is_err());
    }

    #[test]
    fn ci_only_true_on_literal_one() {
        assert!(ci(&fields(&[("CI", "1")])));
        assert!(!ci(&fields(&[("CI", "0")])));
        assert!(!ci(&fields(&[])));
    }
}
