//! Template evaluation: applying ops files and substituting `((variable))` placeholders.
//!
//! The resolver only talks to the [`TemplateEvaluator`] and [`Interpolator`] traits.
//! [`YamlEvaluator`] implements both on top of `serde_yaml`, supporting the `replace` and
//! `remove` operations and BOSH style paths (see [`ops`]).

use std::collections::BTreeMap;

use serde_yaml::Value;
use snafu::{ResultExt, Snafu};

pub mod interpolate;
pub mod ops;

use self::{
    interpolate::{InterpolationError, interpolate_variables},
    ops::{Op, OpsError},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse ops file"))]
    ParseOps { source: OpsError },

    #[snafu(display("failed to apply operation {index} ({path})"))]
    ApplyOp {
        source: OpsError,
        index: usize,
        path: String,
    },

    #[snafu(display("failed to parse YAML document"))]
    ParseDocument { source: serde_yaml::Error },

    #[snafu(display("failed to serialize YAML document"))]
    SerializeDocument { source: serde_yaml::Error },

    #[snafu(display("failed to interpolate variables"))]
    Interpolate { source: InterpolationError },
}

/// Variable values, keyed by variable name.
pub type VariableTable = BTreeMap<String, Value>;

/// The variables available during an evaluation.
///
/// Variables are looked up in all tables in order, the first table defining a variable wins.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bindings(Vec<VariableTable>);

impl Bindings {
    pub fn single(table: VariableTable) -> Self {
        Self(vec![table])
    }

    pub fn multi(tables: Vec<VariableTable>) -> Self {
        Self(tables)
    }

    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.0.iter().find_map(|table| table.get(name))
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.0.iter().flat_map(BTreeMap::keys)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct EvaluateOptions {
    /// Fail if any placeholder can't be resolved.
    pub expect_all_keys: bool,

    /// Fail if any bound variable isn't used.
    pub expect_all_vars_used: bool,
}

/// Applies ops files to a document.
pub trait Interpolator {
    /// Adds the operations of an ops file, they are applied after all previously added ones.
    fn add_ops(&mut self, ops: &[u8]) -> Result<()>;

    /// Applies all added operations to `document`.
    ///
    /// Placeholders are left untouched.
    fn interpolate(&self, document: &[u8]) -> Result<Vec<u8>>;
}

pub trait TemplateEvaluator: Send + Sync {
    type Interpolator: Interpolator + Send;

    fn new_interpolator(&self) -> Self::Interpolator;

    /// Substitutes placeholders in `document` with the values from `bindings`.
    fn evaluate(
        &self,
        document: &[u8],
        bindings: &Bindings,
        options: EvaluateOptions,
    ) -> Result<Vec<u8>>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct YamlEvaluator;

impl TemplateEvaluator for YamlEvaluator {
    type Interpolator = YamlInterpolator;

    fn new_interpolator(&self) -> YamlInterpolator {
        YamlInterpolator::default()
    }

    fn evaluate(
        &self,
        document: &[u8],
        bindings: &Bindings,
        options: EvaluateOptions,
    ) -> Result<Vec<u8>> {
        let mut tree: Value = serde_yaml::from_slice(document).context(ParseDocumentSnafu)?;
        interpolate_variables(&mut tree, bindings, options).context(InterpolateSnafu)?;
        to_vec(&tree)
    }
}

#[derive(Clone, Debug, Default)]
pub struct YamlInterpolator {
    ops: Vec<Op>,
}

impl Interpolator for YamlInterpolator {
    fn add_ops(&mut self, ops: &[u8]) -> Result<()> {
        let parsed = ops::parse(ops).context(ParseOpsSnafu)?;
        self.ops.extend(parsed);
        Ok(())
    }

    fn interpolate(&self, document: &[u8]) -> Result<Vec<u8>> {
        let mut tree: Value = serde_yaml::from_slice(document).context(ParseDocumentSnafu)?;
        for (index, op) in self.ops.iter().enumerate() {
            op.apply(&mut tree).with_context(|_| ApplyOpSnafu {
                index,
                path: op.path().to_string(),
            })?;
        }
        to_vec(&tree)
    }
}

fn to_vec(tree: &Value) -> Result<Vec<u8>> {
    serde_yaml::to_string(tree)
        .map(String::into_bytes)
        .context(SerializeDocumentSnafu)
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn parse(document: &[u8]) -> Value {
        serde_yaml::from_slice(document).expect("evaluator output is valid YAML")
    }

    #[test]
    fn ops_files_are_applied_in_order() {
        let mut interpolator = YamlEvaluator.new_interpolator();
        interpolator
            .add_ops(indoc! {b"
                - type: replace
                  path: /instance_groups/name=nats/instances
                  value: 3
            "})
            .unwrap();
        interpolator
            .add_ops(indoc! {b"
                - type: replace
                  path: /instance_groups/name=nats/instances
                  value: 5
                - type: remove
                  path: /tags?
            "})
            .unwrap();

        let output = interpolator
            .interpolate(indoc! {b"
                name: test
                tags:
                  team: messaging
                instance_groups:
                - name: nats
                  instances: 1
                  jobs: []
            "})
            .unwrap();

        assert_eq!(
            parse(&output),
            parse(indoc! {b"
                name: test
                instance_groups:
                - name: nats
                  instances: 5
                  jobs: []
            "})
        );
    }

    #[test]
    fn failing_operations_are_named() {
        let mut interpolator = YamlEvaluator.new_interpolator();
        interpolator
            .add_ops(indoc! {b"
                - type: replace
                  path: /name
                  value: renamed
                - type: replace
                  path: /instance_groups/name=missing/instances
                  value: 3
            "})
            .unwrap();

        let err = interpolator
            .interpolate(b"name: test\ninstance_groups: []\n")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to apply operation 1 (/instance_groups/name=missing/instances)"
        );
    }

    #[test]
    fn invalid_ops_files_are_rejected() {
        let mut interpolator = YamlEvaluator.new_interpolator();
        let err = interpolator
            .add_ops(b"- type: move\n  path: /name\n")
            .unwrap_err();
        assert!(matches!(err, Error::ParseOps { .. }));
    }

    #[test]
    fn evaluate_substitutes_bindings() {
        let bindings = Bindings::single(VariableTable::from([(
            "system_domain".to_owned(),
            Value::String("example.com".to_owned()),
        )]));

        let output = YamlEvaluator
            .evaluate(
                b"api: api.((system_domain))\nother: ((other))\n",
                &bindings,
                EvaluateOptions::default(),
            )
            .unwrap();
        assert_eq!(
            parse(&output),
            parse(b"api: api.example.com\nother: ((other))\n")
        );
    }

    #[test]
    fn multi_bindings_prefer_earlier_tables() {
        let bindings = Bindings::multi(vec![
            VariableTable::from([("a".to_owned(), Value::from(1))]),
            VariableTable::from([
                ("a".to_owned(), Value::from(2)),
                ("b".to_owned(), Value::from(3)),
            ]),
        ]);

        assert_eq!(bindings.lookup("a"), Some(&Value::from(1)));
        assert_eq!(bindings.lookup("b"), Some(&Value::from(3)));
        assert_eq!(bindings.lookup("c"), None);
    }
}
