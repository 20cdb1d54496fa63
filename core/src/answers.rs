use std::collections::BTreeMap;
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

/// One answered question as submitted by a client.
///
/// `answer` is opaque JSON — single choice, multi choice, free text, nested
/// matrices — the canonicalizer never interprets it, only orders it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AnswerEntry {
    /// Question identifier within the content pack
    pub question_id: String,
    /// Position of the question in the rendered form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_index: Option<i32>,
    /// Question kind (e.g. "single", "multi", "likert")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_type: Option<String>,
    /// Dimension/facet code the question contributes to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// The answer payload itself
    pub answer: serde_json::Value,
}

/// How a stored answer payload is encoded on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    Gzip,
    Plain,
}

impl PayloadEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            PayloadEncoding::Gzip => "gzip",
            PayloadEncoding::Plain => "plain",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AnswersError> {
        match s {
            "gzip" => Ok(PayloadEncoding::Gzip),
            "plain" => Ok(PayloadEncoding::Plain),
            other => Err(AnswersError::UnknownEncoding(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnswersError {
    #[error("unknown payload encoding '{0}'")]
    UnknownEncoding(String),
    #[error("failed to decompress answer payload: {0}")]
    Decompress(#[source] std::io::Error),
    #[error("answer payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("failed to serialize canonical answers: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to parse canonical answers: {0}")]
    Parse(#[source] serde_json::Error),
}

/// Canonicalize an answer list: drop entries without a question id, dedupe by
/// question id (last write wins), sort by question id, and normalize nested
/// JSON so object key order never influences the encoding.
pub fn canonicalize(entries: impl IntoIterator<Item = AnswerEntry>) -> Vec<AnswerEntry> {
    let mut by_id: BTreeMap<String, AnswerEntry> = BTreeMap::new();
    for mut entry in entries {
        let id = entry.question_id.trim();
        if id.is_empty() {
            continue;
        }
        entry.question_id = id.to_string();
        entry.answer = canonical_value(entry.answer);
        by_id.insert(entry.question_id.clone(), entry);
    }
    by_id.into_values().collect()
}

/// Merge final answers over draft answers, last write wins per question id.
/// Request-supplied (final) entries shadow draft entries; the result is
/// already canonical.
pub fn merge_answers(
    final_answers: Vec<AnswerEntry>,
    draft_answers: Vec<AnswerEntry>,
) -> Vec<AnswerEntry> {
    canonicalize(draft_answers.into_iter().chain(final_answers))
}

/// Deterministic JSON encoding of a canonical answer list.
pub fn canonical_json(entries: &[AnswerEntry]) -> Result<String, AnswersError> {
    serde_json::to_string(entries).map_err(AnswersError::Serialize)
}

/// Content digest of a canonical answer set, bound to the scale and content
/// pack version. A pack upgrade therefore invalidates the idempotency key even
/// for byte-identical answers.
pub fn answers_digest(
    scale_code: &str,
    pack_version: &str,
    entries: &[AnswerEntry],
) -> Result<String, AnswersError> {
    let encoded = canonical_json(entries)?;
    let mut hasher = Sha256::new();
    hasher.update(scale_code.as_bytes());
    hasher.update(b"\n");
    hasher.update(pack_version.as_bytes());
    hasher.update(b"\n");
    hasher.update(encoded.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Compress a canonical JSON document for storage. Falls back to the plain
/// encoding if compression fails — storage must never lose an answer set to a
/// codec error.
pub fn encode_payload(canonical: &str) -> (Vec<u8>, PayloadEncoding) {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let compressed = encoder
        .write_all(canonical.as_bytes())
        .and_then(|_| encoder.finish());
    match compressed {
        Ok(bytes) => (bytes, PayloadEncoding::Gzip),
        Err(_) => (canonical.as_bytes().to_vec(), PayloadEncoding::Plain),
    }
}

/// Decode a stored payload back into the canonical JSON string.
pub fn decode_payload(bytes: &[u8], encoding: PayloadEncoding) -> Result<String, AnswersError> {
    match encoding {
        PayloadEncoding::Gzip => {
            let mut out = String::new();
            GzDecoder::new(bytes)
                .read_to_string(&mut out)
                .map_err(AnswersError::Decompress)?;
            Ok(out)
        }
        PayloadEncoding::Plain => {
            String::from_utf8(bytes.to_vec()).map_err(|_| AnswersError::InvalidUtf8)
        }
    }
}

/// Parse a stored canonical payload into entries.
pub fn parse_entries(canonical: &str) -> Result<Vec<AnswerEntry>, AnswersError> {
    serde_json::from_str(canonical).map_err(AnswersError::Parse)
}

/// Rebuild a JSON value with all object keys in sorted order, recursively.
/// Array order is preserved — element order inside an answer is meaningful
/// (rankings, ordered selections).
fn canonical_value(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> = map
                .into_iter()
                .map(|(k, v)| (k, canonical_value(v)))
                .collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(canonical_value).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry(id: &str, answer: serde_json::Value) -> AnswerEntry {
        AnswerEntry {
            question_id: id.to_string(),
            question_index: None,
            question_type: None,
            code: None,
            answer,
        }
    }

    #[test]
    fn digest_is_order_independent() {
        let a = vec![entry("q1", json!("A")), entry("q2", json!("B")), entry("q3", json!(3))];
        let mut b = a.clone();
        b.reverse();
        let c = vec![a[1].clone(), a[2].clone(), a[0].clone()];

        let da = answers_digest("big5", "1.0.0", &canonicalize(a)).unwrap();
        let db = answers_digest("big5", "1.0.0", &canonicalize(b)).unwrap();
        let dc = answers_digest("big5", "1.0.0", &canonicalize(c)).unwrap();
        assert_eq!(da, db);
        assert_eq!(da, dc);
    }

    #[test]
    fn digest_ignores_nested_key_order() {
        let a = vec![entry("q1", json!({"score": 4, "label": "agree", "meta": {"x": 1, "y": 2}}))];
        let b = vec![entry("q1", json!({"meta": {"y": 2, "x": 1}, "label": "agree", "score": 4}))];

        let da = answers_digest("big5", "1.0.0", &canonicalize(a)).unwrap();
        let db = answers_digest("big5", "1.0.0", &canonicalize(b)).unwrap();
        assert_eq!(da, db);
    }

    #[test]
    fn digest_respects_array_order() {
        let a = vec![entry("q1", json!(["first", "second"]))];
        let b = vec![entry("q1", json!(["second", "first"]))];

        let da = answers_digest("big5", "1.0.0", &canonicalize(a)).unwrap();
        let db = answers_digest("big5", "1.0.0", &canonicalize(b)).unwrap();
        assert_ne!(da, db);
    }

    #[test]
    fn pack_version_invalidates_digest() {
        let answers = canonicalize(vec![entry("q1", json!("A"))]);
        let v1 = answers_digest("big5", "1.0.0", &answers).unwrap();
        let v2 = answers_digest("big5", "1.1.0", &answers).unwrap();
        assert_ne!(v1, v2);
    }

    #[test]
    fn entries_without_question_id_are_dropped() {
        let canonical = canonicalize(vec![
            entry("", json!("ghost")),
            entry("   ", json!("ghost")),
            entry("q1", json!("A")),
        ]);
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[0].question_id, "q1");
    }

    #[test]
    fn duplicate_question_ids_last_write_wins() {
        let canonical = canonicalize(vec![entry("q1", json!("old")), entry("q1", json!("new"))]);
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[0].answer, json!("new"));
    }

    #[test]
    fn merge_prefers_final_answers_and_fills_gaps_from_draft() {
        let draft = vec![entry("q1", json!("draft-A")), entry("q2", json!("B"))];
        let finals = vec![entry("q1", json!("final-A"))];

        let merged = merge_answers(finals, draft);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].question_id, "q1");
        assert_eq!(merged[0].answer, json!("final-A"));
        assert_eq!(merged[1].question_id, "q2");
        assert_eq!(merged[1].answer, json!("B"));
    }

    #[test]
    fn payload_roundtrips_through_gzip() {
        let canonical =
            canonical_json(&canonicalize(vec![entry("q1", json!({"a": 1, "b": [1, 2]}))])).unwrap();
        let (bytes, encoding) = encode_payload(&canonical);
        assert_eq!(encoding, PayloadEncoding::Gzip);
        assert_ne!(bytes, canonical.as_bytes());

        let decoded = decode_payload(&bytes, encoding).unwrap();
        assert_eq!(decoded, canonical);
        assert_eq!(parse_entries(&decoded).unwrap().len(), 1);
    }

    #[test]
    fn plain_payload_decodes_without_gzip() {
        let canonical = r#"[{"question_id":"q1","answer":"A"}]"#;
        let decoded = decode_payload(canonical.as_bytes(), PayloadEncoding::Plain).unwrap();
        assert_eq!(decoded, canonical);
    }

    #[test]
    fn unknown_encoding_is_rejected() {
        assert!(PayloadEncoding::parse("zstd").is_err());
        assert_eq!(PayloadEncoding::parse("gzip").unwrap(), PayloadEncoding::Gzip);
        assert_eq!(PayloadEncoding::parse("plain").unwrap(), PayloadEncoding::Plain);
    }
}
