//! Blob references
//!
//! Documents never embed blob content. They hold a small dict:
//!
//! ```text
//! {"@type": "blob", "digest": "sha256-...", "content_type": "image/png", "length": 1234}
//! ```

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec::{Dict, Value};

const TYPE_KEY: &str = "@type";
const BLOB_TYPE: &str = "blob";
const DIGEST_PREFIX: &str = "sha256-";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef {
    pub digest: String,
    pub content_type: Option<String>,
    pub length: u64,
}

impl BlobRef {
    /// Reference for `content`
    pub fn for_content(content: &[u8], content_type: Option<&str>) -> Self {
        Self {
            digest: digest_of(content),
            content_type: content_type.map(str::to_string),
            length: content.len() as u64,
        }
    }

    /// Dict form stored inside documents
    pub fn to_value(&self) -> Value {
        let mut dict = Dict::new();
        dict.insert(TYPE_KEY.to_string(), Value::from(BLOB_TYPE));
        dict.insert("digest".to_string(), Value::from(self.digest.as_str()));
        if let Some(ct) = &self.content_type {
            dict.insert("content_type".to_string(), Value::from(ct.as_str()));
        }
        dict.insert("length".to_string(), Value::Int(self.length as i64));
        Value::Dict(dict)
    }

    /// Parses the dict form; `None` if `value` is not a blob reference
    pub fn from_value(value: &Value) -> Option<Self> {
        let dict = value.as_dict()?;
        if dict.get(TYPE_KEY).and_then(Value::as_str) != Some(BLOB_TYPE) {
            return None;
        }
        let digest = dict.get("digest").and_then(Value::as_str)?;
        if !is_valid_digest(digest) {
            return None;
        }
        Some(Self {
            digest: digest.to_string(),
            content_type: dict
                .get("content_type")
                .and_then(Value::as_str)
                .map(str::to_string),
            length: dict
                .get("length")
                .and_then(Value::as_i64)
                .map(|l| l.max(0) as u64)
                .unwrap_or(0),
        })
    }

    /// Appends every blob reference found anywhere under `value`
    pub fn collect(value: &Value, out: &mut Vec<BlobRef>) {
        if let Some(blob) = BlobRef::from_value(value) {
            out.push(blob);
            return;
        }
        match value {
            Value::Array(items) => items.iter().for_each(|v| BlobRef::collect(v, out)),
            Value::Dict(dict) => dict.values().for_each(|v| BlobRef::collect(v, out)),
            _ => {}
        }
    }
}

/// Content digest: `sha256-` followed by URL-safe base64 of the hash
pub fn digest_of(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{}{}", DIGEST_PREFIX, URL_SAFE_NO_PAD.encode(hasher.finalize()))
}

/// Digests double as file names, so only the exact shape is accepted
pub fn is_valid_digest(digest: &str) -> bool {
    match digest.strip_prefix(DIGEST_PREFIX) {
        Some(rest) => {
            rest.len() == 43
                && rest
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_shape() {
        let digest = digest_of(b"hello");
        assert!(digest.starts_with("sha256-"));
        assert!(is_valid_digest(&digest));
        assert_eq!(digest, digest_of(b"hello"));
        assert_ne!(digest, digest_of(b"hello!"));
    }

    #[test]
    fn test_rejects_path_like_digest() {
        assert!(!is_valid_digest("sha256-../../etc/passwd"));
        assert!(!is_valid_digest("md5-abc"));
    }

    #[test]
    fn test_value_form() {
        let blob = BlobRef::for_content(b"image bytes", Some("image/png"));
        let value = blob.to_value();
        assert_eq!(value.get("@type").and_then(Value::as_str), Some("blob"));
        assert_eq!(BlobRef::from_value(&value), Some(blob));
        assert_eq!(BlobRef::from_value(&Value::from("nope")), None);
    }

    #[test]
    fn test_collect_nested() {
        let a = BlobRef::for_content(b"a", None);
        let b = BlobRef::for_content(b"b", Some("text/plain"));
        let mut inner = Dict::new();
        inner.insert("photo".into(), b.to_value());
        let mut root = Dict::new();
        root.insert("avatar".into(), a.to_value());
        root.insert("gallery".into(), Value::Array(vec![Value::Dict(inner)]));

        let mut found = Vec::new();
        BlobRef::collect(&Value::Dict(root), &mut found);
        assert_eq!(found, vec![a, b]);
    }
}
