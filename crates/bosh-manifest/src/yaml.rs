//! Canonical YAML serialization of manifests.
//!
//! Manifests are serialized with all mapping keys sorted, so that semantically identical
//! documents always produce the same bytes (and therefore the same content hash).
//!
//! Deployment manifests tend to repeat large values (certificates, keys, config blobs) in many
//! places. To keep the persisted manifest small, every string longer than
//! [`ANCHOR_MIN_LENGTH`] which occurs more than once is written only once, as a YAML anchor,
//! and referenced via aliases afterwards:
//!
//! ```yaml
//! - name: nats
//!   properties:
//!     cert: &5d41402abc4b2a76b9719d911017c592... |-
//!       -----BEGIN CERTIFICATE-----
//!       ...
//! - name: router
//!   properties:
//!     cert: *5d41402abc4b2a76b9719d911017c592...
//! ```
//!
//! `serde_yaml` has no way to emit anchors. Instead the tree is marked before serialization:
//! the key of the first occurrence becomes `<key>=<hash>` and every later occurrence becomes
//! the string `*<hash>`. Both markers are turned into real anchor and alias syntax on the
//! serialized text.

use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use serde::{Serialize, de::DeserializeOwned};
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};

/// Strings need to be longer than this (in bytes) to be anchored.
pub const ANCHOR_MIN_LENGTH: usize = 64;

const SNIPPET_MAX_LENGTH: usize = 256;

// Longer keys would be emitted as complex keys (`? key`), which breaks the marker substitution.
const ANCHOR_KEY_MAX_LENGTH: usize = 48;

static ANCHOR_KEY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-/]*$").expect("failed to compile anchor key regex")
});

type Result<T, E = Error> = std::result::Result<T, E>;

/// Maps the hash of an anchored value to the key it was first seen at.
type AnchorTable = BTreeMap<String, String>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse YAML document {snippet:?}"))]
    ParseYaml {
        source: serde_yaml::Error,
        snippet: String,
    },

    #[snafu(display("failed to convert value into a YAML tree"))]
    BuildTree { source: serde_yaml::Error },

    #[snafu(display("failed to serialize YAML"))]
    SerializeYaml { source: serde_yaml::Error },
}

/// Parses a YAML document.
///
/// The error contains a truncated copy of the input, so that huge manifests don't end up in
/// logs verbatim.
pub fn from_slice<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    serde_yaml::from_slice(data).with_context(|_| ParseYamlSnafu {
        snippet: snippet(data),
    })
}

/// Serializes `value` into canonical YAML with duplicate large strings anchored.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut tree = serde_yaml::to_value(value).context(BuildTreeSnafu)?;
    sort_keys(&mut tree);

    let mut anchors = AnchorTable::new();
    mark_duplicates(&mut tree, &mut anchors);

    let mut yaml = serde_yaml::to_string(&tree).context(SerializeYamlSnafu)?;
    for (hash, key) in &anchors {
        let alias = format!("*{hash}");
        yaml = yaml
            .replace(&format!("'{alias}'"), &alias)
            .replace(&format!("\"{alias}\""), &alias)
            .replace(&format!("{key}={hash}: "), &format!("{key}: &{hash} "));
    }

    Ok(yaml.into_bytes())
}

/// Calculates the hex encoded SHA-256 digest of the canonical serialization of `value`.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String> {
    let yaml = to_vec(value)?;
    Ok(format!("{:x}", Sha256::digest(&yaml)))
}

fn sort_keys(value: &mut Value) {
    match value {
        Value::Sequence(sequence) => sequence.iter_mut().for_each(sort_keys),
        Value::Mapping(mapping) => {
            let mut entries: Vec<(Value, Value)> = std::mem::take(mapping).into_iter().collect();
            entries.sort_by_cached_key(|(key, _)| key_order(key));
            for (key, mut value) in entries {
                sort_keys(&mut value);
                mapping.insert(key, value);
            }
        }
        Value::Tagged(tagged) => sort_keys(&mut tagged.value),
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {}
    }
}

fn key_order(key: &Value) -> (u8, String) {
    match key {
        Value::String(name) => (1, name.clone()),
        other => (0, format!("{other:?}")),
    }
}

fn mark_duplicates(value: &mut Value, anchors: &mut AnchorTable) {
    match value {
        Value::Sequence(sequence) => {
            for item in sequence {
                mark_duplicates(item, anchors);
            }
        }
        Value::Mapping(mapping) => mark_mapping_duplicates(mapping, anchors),
        Value::Tagged(tagged) => mark_duplicates(&mut tagged.value, anchors),
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {}
    }
}

fn mark_mapping_duplicates(mapping: &mut Mapping, anchors: &mut AnchorTable) {
    for (key, mut value) in std::mem::take(mapping) {
        let hash = match &value {
            Value::String(text) if text.len() > ANCHOR_MIN_LENGTH => {
                Some(format!("{:x}", Sha256::digest(text.as_bytes())))
            }
            _ => None,
        };

        let key = match hash {
            None => {
                mark_duplicates(&mut value, anchors);
                key
            }
            Some(hash) if anchors.contains_key(&hash) => {
                value = Value::String(format!("*{hash}"));
                key
            }
            Some(hash) => match key.as_str().filter(|name| is_anchor_key(name)) {
                Some(name) => {
                    let marker = Value::String(format!("{name}={hash}"));
                    anchors.insert(hash, name.to_owned());
                    marker
                }
                None => key,
            },
        };

        mapping.insert(key, value);
    }
}

/// Only keys which are emitted as plain scalars can carry an anchor marker.
fn is_anchor_key(key: &str) -> bool {
    key.len() <= ANCHOR_KEY_MAX_LENGTH
        && ANCHOR_KEY_REGEX.is_match(key)
        && !matches!(
            key.to_ascii_lowercase().as_str(),
            "true" | "false" | "null" | "yes" | "no" | "on" | "off"
        )
}

fn snippet(data: &[u8]) -> String {
    let mut snippet = String::from_utf8_lossy(data).into_owned();
    truncate_with_ellipsis(&mut snippet, SNIPPET_MAX_LENGTH);
    snippet
}

fn truncate_with_ellipsis(text: &mut String, max_len: usize) {
    const ELLIPSIS: char = '…';
    if let Some((cutoff, _)) = text.char_indices().nth(max_len) {
        text.truncate(cutoff);
        text.push(ELLIPSIS);
    }
}
