//! Kubernetes object names derived from manifest entities.

use sha2::{Digest, Sha256};

/// Prefix of secrets holding the value of a variable.
pub const VARIABLE_SECRET_PREFIX: &str = "var-";

/// Maximum length of a DNS subdomain name, see RFC 1123.
const MAX_NAME_LENGTH: usize = 253;

// Length of the hash suffix appended to names that had to be shortened.
const HASH_SUFFIX_LENGTH: usize = 8;

/// Returns the name of the secret holding the value of the variable `name`.
///
/// The result is a valid Kubernetes object name: lowercase, only alphanumerics, `-` and `.`,
/// starting and ending with an alphanumeric character and at most 253 characters long.
/// Names which need to be shortened get a hash suffix, so that they stay distinct.
pub fn secret_variable_name(name: &str) -> String {
    let name = name.strip_prefix(VARIABLE_SECRET_PREFIX).unwrap_or(name);
    sanitize(&format!("{VARIABLE_SECRET_PREFIX}{name}"))
}

fn sanitize(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '-' | '.') => c,
            _ => '-',
        })
        .collect();
    let sanitized = sanitized.trim_matches(|c: char| !c.is_ascii_alphanumeric());

    if sanitized.len() <= MAX_NAME_LENGTH {
        return sanitized.to_owned();
    }

    let hash = format!("{:x}", Sha256::digest(name.as_bytes()));
    let prefix = sanitized[..MAX_NAME_LENGTH - HASH_SUFFIX_LENGTH - 1]
        .trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    format!("{prefix}-{}", &hash[..HASH_SUFFIX_LENGTH])
}
