//! Correlation-token extraction from response payloads.
//!
//! A response payload is expected to be a JSON document; the correlation
//! token is read out of it by walking a dotted path of object keys down to
//! a terminal string value. Anything else — malformed JSON, a missing key,
//! a non-string terminal value — silently yields no token rather than an
//! error, since a stray message on a shared subscription is routine, not
//! exceptional.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationPath(Vec<String>);

impl CorrelationPath {
	/// Parses a dotted path such as `"header.correlationId"` into its
	/// component keys. Rejects an empty path or one containing an empty
	/// segment (e.g. `"a..b"`, `".a"`, `"a."`).
	pub fn parse(raw: &str) -> Result<Self, String> {
		if raw.is_empty() {
			return Err("correlation path cannot be empty".into());
		}

		let segments: Vec<String> = raw.split('.').map(str::to_owned).collect();
		if segments.iter().any(String::is_empty) {
			return Err(format!("correlation path {raw:?} contains an empty segment"));
		}

		Ok(Self(segments))
	}

	/// Extracts the correlation token from a JSON payload, or `None` if the
	/// payload isn't valid JSON, the path doesn't resolve, or the terminal
	/// value isn't a string.
	pub fn extract(&self, payload: &[u8]) -> Option<String> {
		let root: Value = serde_json::from_slice(payload).ok()?;
		let mut cursor = &root;
		for key in &self.0 {
			cursor = cursor.as_object()?.get(key)?;
		}
		cursor.as_str().map(str::to_owned)
	}
}
