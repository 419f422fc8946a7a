//! Ops files: structural patches of YAML documents.
//!
//! An ops file is a list of operations:
//!
//! ```yaml
//! - type: replace
//!   path: /instance_groups/name=nats/instances
//!   value: 3
//! - type: remove
//!   path: /instance_groups/name=nats/jobs/name=smoke_tests?
//! ```
//!
//! Paths consist of `/` separated tokens:
//!
//! - `key` selects a key of a mapping, `key?` makes the key (and everything after it)
//!   optional. Missing optional keys are created by `replace` and ignored by `remove`.
//! - `2` selects an element of a sequence by index, `-` appends to a sequence.
//! - `name=value` selects the element of a sequence whose `name` field equals `value`. If it
//!   is optional (`name=value?`) and missing, `replace` appends a new element.
//!
//! `~1` and `~0` escape `/` and `~` inside tokens.

use std::fmt::Display;

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

type Result<T, E = OpsError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum OpsError {
    #[snafu(display("failed to parse ops document"))]
    ParseOpsDocument { source: serde_yaml::Error },

    #[snafu(display("failed to parse operation {index}"))]
    ParseOp {
        source: serde_yaml::Error,
        index: usize,
    },

    #[snafu(display("invalid path {path:?} in operation {index}: {reason}"))]
    InvalidPath {
        path: String,
        index: usize,
        reason: &'static str,
    },

    #[snafu(display("expected to find a map at {token:?}"))]
    NotAMapping { token: String },

    #[snafu(display("expected to find a sequence at {token:?}"))]
    NotASequence { token: String },

    #[snafu(display("expected to find map key {key:?}"))]
    MissingKey { key: String },

    #[snafu(display("expected to find an element with {key}={value:?}"))]
    NoMatchingElement { key: String, value: String },

    #[snafu(display("expected index {index} to be less than sequence length {length}"))]
    IndexOutOfRange { index: usize, length: usize },

    #[snafu(display("cannot remove the element after the last one"))]
    RemoveAfterLast,

    #[snafu(display("cannot remove the whole document"))]
    RemoveRoot,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum OpDefinition {
    Replace { path: String, value: Value },
    Remove { path: String },
}

/// A single operation of an ops file.
#[derive(Clone, Debug, PartialEq)]
pub struct Op {
    kind: OpKind,
    path: Pointer,
}

#[derive(Clone, Debug, PartialEq)]
enum OpKind {
    Replace(Value),
    Remove,
}

impl Op {
    pub fn path(&self) -> &Pointer {
        &self.path
    }

    pub fn apply(&self, document: &mut Value) -> Result<()> {
        match &self.kind {
            OpKind::Replace(value) => replace(document, &self.path.tokens, value.clone(), false),
            OpKind::Remove => remove(document, &self.path.tokens, false),
        }
    }
}

/// Parses an ops file.
pub fn parse(ops: &[u8]) -> Result<Vec<Op>> {
    if ops.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let definitions: Option<Vec<Value>> =
        serde_yaml::from_slice(ops).context(ParseOpsDocumentSnafu)?;

    definitions
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(index, definition)| -> Result<Op> {
            let (kind, path) = match serde_yaml::from_value(definition)
                .context(ParseOpSnafu { index })?
            {
                OpDefinition::Replace { path, value } => (OpKind::Replace(value), path),
                OpDefinition::Remove { path } => (OpKind::Remove, path),
            };
            let path = Pointer::parse(&path).map_err(|reason| OpsError::InvalidPath {
                path,
                index,
                reason,
            })?;
            Ok(Op { kind, path })
        })
        .collect()
}

/// A parsed ops path.
#[derive(Clone, Debug, PartialEq)]
pub struct Pointer {
    raw: String,
    tokens: Vec<Token>,
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Key {
        name: String,
        optional: bool,
    },
    Index(usize),
    AfterLast,
    Matching {
        key: String,
        value: String,
        optional: bool,
    },
}

impl Token {
    fn is_optional(&self) -> bool {
        match self {
            Self::Key { optional, .. } | Self::Matching { optional, .. } => *optional,
            Self::Index(_) | Self::AfterLast => false,
        }
    }

    /// An empty container suitable to be navigated by this token.
    fn empty_container(&self) -> Value {
        match self {
            Self::Key { .. } => Value::Mapping(Mapping::new()),
            Self::Index(_) | Self::AfterLast | Self::Matching { .. } => Value::Sequence(Vec::new()),
        }
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Key { name, .. } => write!(f, "{name}"),
            Self::Index(index) => write!(f, "{index}"),
            Self::AfterLast => write!(f, "-"),
            Self::Matching { key, value, .. } => write!(f, "{key}={value}"),
        }
    }
}

impl Pointer {
    fn parse(path: &str) -> Result<Self, &'static str> {
        let Some(rest) = path.strip_prefix('/') else {
            return Err("expected path to start with '/'");
        };

        let mut tokens = Vec::new();
        let mut optional = false;
        if !rest.is_empty() {
            for raw in rest.split('/') {
                let raw = raw.replace("~1", "/").replace("~0", "~");
                let marked_optional = raw.ends_with('?');
                let raw = if marked_optional {
                    raw.trim_end_matches('?').to_owned()
                } else {
                    raw
                };
                optional = optional || marked_optional;

                let token = if raw.is_empty() {
                    return Err("expected non-empty path tokens");
                } else if raw == "-" {
                    Token::AfterLast
                } else if let Ok(index) = raw.parse::<usize>() {
                    Token::Index(index)
                } else if let Some((key, value)) = raw.split_once('=') {
                    Token::Matching {
                        key: key.to_owned(),
                        value: value.to_owned(),
                        optional,
                    }
                } else {
                    Token::Key {
                        name: raw,
                        optional,
                    }
                };
                tokens.push(token);
            }
        }

        Ok(Self {
            raw: path.to_owned(),
            tokens,
        })
    }
}

impl Display for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

fn as_mapping<'a>(node: &'a mut Value, token: &Token) -> Result<&'a mut Mapping> {
    if node.is_null() && token.is_optional() {
        *node = Value::Mapping(Mapping::new());
    }
    node.as_mapping_mut().context(NotAMappingSnafu {
        token: token.to_string(),
    })
}

fn as_sequence<'a>(node: &'a mut Value, token: &Token) -> Result<&'a mut Vec<Value>> {
    if node.is_null() && token.is_optional() {
        *node = Value::Sequence(Vec::new());
    }
    node.as_sequence_mut().context(NotASequenceSnafu {
        token: token.to_string(),
    })
}

fn matching_position(sequence: &[Value], key: &str, value: &str) -> Option<usize> {
    sequence.iter().position(|element| {
        element
            .get(key)
            .and_then(scalar_to_string)
            .is_some_and(|found| found == value)
    })
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(string) => Some(string.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(boolean) => Some(boolean.to_string()),
        _ => None,
    }
}

fn replace(node: &mut Value, tokens: &[Token], value: Value, optional: bool) -> Result<()> {
    let Some((token, rest)) = tokens.split_first() else {
        *node = value;
        return Ok(());
    };
    let optional = optional || token.is_optional();
    // Containers created for missing optional tokens depend on the token navigating into them.
    let created = || rest.first().map_or(Value::Null, Token::empty_container);

    match token {
        Token::Key { name, .. } => {
            let mapping = as_mapping(node, token)?;
            if !mapping.contains_key(name.as_str()) {
                ensure!(optional, MissingKeySnafu { key: name });
                mapping.insert(Value::String(name.clone()), created());
            }
            let child = mapping
                .get_mut(name.as_str())
                .context(MissingKeySnafu { key: name })?;
            replace(child, rest, value, optional)
        }
        Token::Index(index) => {
            let sequence = as_sequence(node, token)?;
            let length = sequence.len();
            let child = sequence.get_mut(*index).context(IndexOutOfRangeSnafu {
                index: *index,
                length,
            })?;
            replace(child, rest, value, optional)
        }
        Token::AfterLast => {
            let sequence = as_sequence(node, token)?;
            sequence.push(created());
            let child = sequence.last_mut().context(IndexOutOfRangeSnafu {
                index: 0_usize,
                length: 0_usize,
            })?;
            replace(child, rest, value, optional)
        }
        Token::Matching {
            key,
            value: expected,
            ..
        } => {
            let sequence = as_sequence(node, token)?;
            let position = match matching_position(sequence, key, expected) {
                Some(position) => position,
                None => {
                    ensure!(
                        optional,
                        NoMatchingElementSnafu {
                            key,
                            value: expected,
                        }
                    );
                    let mut element = Mapping::new();
                    element.insert(
                        Value::String(key.clone()),
                        Value::String(expected.clone()),
                    );
                    sequence.push(Value::Mapping(element));
                    sequence.len() - 1
                }
            };
            replace(&mut sequence[position], rest, value, optional)
        }
    }
}

fn remove(node: &mut Value, tokens: &[Token], optional: bool) -> Result<()> {
    let Some((token, rest)) = tokens.split_first() else {
        return RemoveRootSnafu.fail();
    };
    let optional = optional || token.is_optional();

    match token {
        Token::Key { name, .. } => {
            let mapping = as_mapping(node, token)?;
            if rest.is_empty() {
                let removed = mapping.remove(name.as_str());
                ensure!(
                    removed.is_some() || optional,
                    MissingKeySnafu { key: name }
                );
                return Ok(());
            }
            match mapping.get_mut(name.as_str()) {
                Some(child) => remove(child, rest, optional),
                None if optional => Ok(()),
                None => MissingKeySnafu { key: name }.fail(),
            }
        }
        Token::Index(index) => {
            let sequence = as_sequence(node, token)?;
            let length = sequence.len();
            ensure!(
                *index < length,
                IndexOutOfRangeSnafu {
                    index: *index,
                    length,
                }
            );
            if rest.is_empty() {
                sequence.remove(*index);
                return Ok(());
            }
            remove(&mut sequence[*index], rest, optional)
        }
        Token::AfterLast => RemoveAfterLastSnafu.fail(),
        Token::Matching {
            key,
            value: expected,
            ..
        } => {
            let sequence = as_sequence(node, token)?;
            match matching_position(sequence, key, expected) {
                Some(position) if rest.is_empty() => {
                    sequence.remove(position);
                    Ok(())
                }
                Some(position) => remove(&mut sequence[position], rest, optional),
                None if optional => Ok(()),
                None => NoMatchingElementSnafu {
                    key,
                    value: expected,
                }
                .fail(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;

    fn yaml(document: &str) -> Value {
        serde_yaml::from_str(document).expect("test YAML is valid")
    }

    fn apply(document: &str, ops: &str) -> Result<Value> {
        let mut document = yaml(document);
        for op in parse(ops.as_bytes())? {
            op.apply(&mut document)?;
        }
        Ok(document)
    }

    const DOCUMENT: &str = indoc! {"
        name: cf
        instance_groups:
        - name: api
          instances: 1
          jobs:
          - name: cloud_controller
            release: capi
        - name: nats
          instances: 2
          jobs: []
    "};

    #[rstest]
    #[case::replace_key(
        "- {type: replace, path: /name, value: renamed}",
        "name: renamed"
    )]
    #[case::replace_by_index(
        "- {type: replace, path: /instance_groups/1/instances, value: 4}",
        "instance_groups: [{name: api, instances: 1, jobs: [{name: cloud_controller, release: capi}]}, {name: nats, instances: 4, jobs: []}]"
    )]
    #[case::replace_by_name(
        "- {type: replace, path: /instance_groups/name=api/instances, value: 3}",
        "instance_groups: [{name: api, instances: 3, jobs: [{name: cloud_controller, release: capi}]}, {name: nats, instances: 2, jobs: []}]"
    )]
    #[case::append(
        "- {type: replace, path: /instance_groups/name=nats/jobs/-, value: {name: nats, release: nats}}",
        "instance_groups: [{name: api, instances: 1, jobs: [{name: cloud_controller, release: capi}]}, {name: nats, instances: 2, jobs: [{name: nats, release: nats}]}]"
    )]
    #[case::optional_keys_are_created(
        "- {type: replace, path: /properties?/nats/port, value: 4222}",
        "properties: {nats: {port: 4222}}"
    )]
    #[case::optional_elements_are_appended(
        "- {type: replace, path: /instance_groups/name=router?/instances, value: 1}",
        "instance_groups: [{name: api, instances: 1, jobs: [{name: cloud_controller, release: capi}]}, {name: nats, instances: 2, jobs: []}, {name: router, instances: 1}]"
    )]
    #[case::remove_by_name(
        "- {type: remove, path: /instance_groups/name=api}",
        "instance_groups: [{name: nats, instances: 2, jobs: []}]"
    )]
    #[case::remove_missing_optional(
        "- {type: remove, path: /instance_groups/name=router?}",
        "instance_groups: [{name: api, instances: 1, jobs: [{name: cloud_controller, release: capi}]}, {name: nats, instances: 2, jobs: []}]"
    )]
    #[case::remove_nested_job(
        "- {type: remove, path: /instance_groups/name=api/jobs/name=cloud_controller}",
        "instance_groups: [{name: api, instances: 1, jobs: []}, {name: nats, instances: 2, jobs: []}]"
    )]
    fn operations(#[case] ops: &str, #[case] expected_fields: &str) {
        let mut expected = yaml(DOCUMENT);
        let overrides = yaml(expected_fields);
        let (Some(expected_mapping), Some(overrides)) =
            (expected.as_mapping_mut(), overrides.as_mapping())
        else {
            panic!("test documents are mappings");
        };
        for (key, value) in overrides {
            expected_mapping.insert(key.clone(), value.clone());
        }

        assert_eq!(apply(DOCUMENT, ops).unwrap(), expected);
    }

    #[rstest]
    #[case::missing_key("- {type: replace, path: /missing/key, value: 1}")]
    #[case::missing_element("- {type: replace, path: /instance_groups/name=router/instances, value: 1}")]
    #[case::index_out_of_range("- {type: replace, path: /instance_groups/5, value: 1}")]
    #[case::remove_missing_key("- {type: remove, path: /missing}")]
    #[case::remove_after_last("- {type: remove, path: /instance_groups/-}")]
    #[case::key_on_sequence("- {type: replace, path: /instance_groups/name, value: 1}")]
    fn failing_operations(#[case] ops: &str) {
        assert!(apply(DOCUMENT, ops).is_err());
    }

    #[rstest]
    #[case::relative("- {type: replace, path: name, value: 1}")]
    #[case::empty_token("- {type: replace, path: /instance_groups//name, value: 1}")]
    #[case::unknown_type("- {type: move, path: /name}")]
    #[case::missing_value("- {type: replace, path: /name}")]
    fn invalid_operations(#[case] ops: &str) {
        assert!(parse(ops.as_bytes()).is_err());
    }

    #[test]
    fn escaped_tokens() {
        let document = apply(
            "properties: {}",
            "- {type: replace, path: /properties/a~1b, value: 1}",
        );
        assert!(document.is_err(), "non-optional keys must exist");

        let document = apply(
            "properties: {a/b: 0}",
            "- {type: replace, path: /properties/a~1b, value: 1}",
        )
        .unwrap();
        assert_eq!(document, yaml("properties: {a/b: 1}"));
    }

    #[test]
    fn replacing_the_root() {
        assert_eq!(
            apply(DOCUMENT, "- {type: replace, path: /, value: {name: new}}").unwrap(),
            yaml("name: new")
        );
    }

    #[test]
    fn empty_ops_files_are_valid() {
        assert!(parse(b"").unwrap().is_empty());
        assert!(parse(b"[]").unwrap().is_empty());
    }
}
