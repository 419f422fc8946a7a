//! Substitution of `((variable))` placeholders.

use std::{collections::BTreeSet, sync::LazyLock};

use const_format::concatcp;
use regex::{Captures, Regex};
use serde_yaml::Value;
use snafu::{Snafu, ensure};

use super::{Bindings, EvaluateOptions};

const PLACEHOLDER_FMT: &str = r"\(\((!?[-/\.\w\pL]+)\)\)";

static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(PLACEHOLDER_FMT).expect("failed to compile placeholder regex")
});

static WHOLE_PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concatcp!("^", PLACEHOLDER_FMT, "$"))
        .expect("failed to compile whole placeholder regex")
});

type Result<T, E = InterpolationError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum InterpolationError {
    #[snafu(display("expected to find variables: {}", names.join(", ")))]
    MissingVariables { names: Vec<String> },

    #[snafu(display("expected to use variables: {}", names.join(", ")))]
    UnusedVariables { names: Vec<String> },

    #[snafu(display(
        "variable {name:?} is used inside {text:?} and must be a string, number or boolean"
    ))]
    NonScalarValue { name: String, text: String },
}

/// Replaces all placeholders in `tree` with their values from `bindings`.
///
/// A string consisting of a single placeholder is replaced with the bound value, whatever its
/// type. Placeholders embedded in longer strings must refer to scalars. Unresolved placeholders
/// are kept, unless `options` demand otherwise.
pub fn interpolate_variables(
    tree: &mut Value,
    bindings: &Bindings,
    options: EvaluateOptions,
) -> Result<()> {
    let mut interpolation = Interpolation {
        bindings,
        used: BTreeSet::new(),
        missing: BTreeSet::new(),
    };
    interpolation.visit(tree)?;

    ensure!(
        !options.expect_all_keys || interpolation.missing.is_empty(),
        MissingVariablesSnafu {
            names: interpolation.missing.into_iter().collect::<Vec<_>>(),
        }
    );

    if options.expect_all_vars_used {
        let unused: BTreeSet<&String> = bindings
            .names()
            .filter(|name| !interpolation.used.contains(*name))
            .collect();
        ensure!(
            unused.is_empty(),
            UnusedVariablesSnafu {
                names: unused.into_iter().cloned().collect::<Vec<_>>(),
            }
        );
    }

    Ok(())
}

struct Interpolation<'a> {
    bindings: &'a Bindings,
    used: BTreeSet<String>,
    missing: BTreeSet<String>,
}

impl Interpolation<'_> {
    fn visit(&mut self, value: &mut Value) -> Result<()> {
        match value {
            Value::String(text) => {
                if let Some(replacement) = self.interpolate_text(text)? {
                    *value = replacement;
                }
            }
            Value::Sequence(sequence) => {
                for item in sequence {
                    self.visit(item)?;
                }
            }
            Value::Mapping(mapping) => {
                for (mut key, mut item) in std::mem::take(mapping) {
                    if let Value::String(text) = &key {
                        if let Some(replacement) = self.interpolate_text(text)? {
                            key = replacement;
                        }
                    }
                    self.visit(&mut item)?;
                    mapping.insert(key, item);
                }
            }
            Value::Tagged(tagged) => self.visit(&mut tagged.value)?,
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
        Ok(())
    }

    /// Returns the interpolated value of `text`, or [`None`] if nothing was replaced.
    fn interpolate_text(&mut self, text: &str) -> Result<Option<Value>> {
        if !text.contains("((") {
            return Ok(None);
        }

        if let Some(captures) = WHOLE_PLACEHOLDER_REGEX.captures(text) {
            return Ok(self.lookup(&captures[1]));
        }

        let mut replaced_any = false;
        let mut non_scalar = None;
        let interpolated = PLACEHOLDER_REGEX.replace_all(text, |captures: &Captures| {
            let Some(value) = self.lookup(&captures[1]) else {
                return captures[0].to_owned();
            };
            match value {
                Value::String(string) => {
                    replaced_any = true;
                    string
                }
                Value::Number(number) => {
                    replaced_any = true;
                    number.to_string()
                }
                Value::Bool(boolean) => {
                    replaced_any = true;
                    boolean.to_string()
                }
                _ => {
                    non_scalar.get_or_insert_with(|| captures[1].to_owned());
                    captures[0].to_owned()
                }
            }
        });

        if let Some(name) = non_scalar {
            return NonScalarValueSnafu { name, text }.fail();
        }
        Ok(replaced_any.then(|| Value::String(interpolated.into_owned())))
    }

    fn lookup(&mut self, placeholder: &str) -> Option<Value> {
        let name = placeholder.trim_start_matches('!');
        if let Some(value) = self.bindings.lookup(name) {
            self.used.insert(name.to_owned());
            return Some(value.clone());
        }

        // `((ca.certificate))` refers to the field `certificate` of the variable `ca`.
        if let Some((base, path)) = name.split_once('.') {
            if let Some(value) = self.bindings.lookup(base) {
                self.used.insert(base.to_owned());
                let field = path
                    .split('.')
                    .try_fold(value, |value, segment| value.get(segment));
                if let Some(field) = field {
                    return Some(field.clone());
                }
            }
        }

        self.missing.insert(name.to_owned());
        None
    }
}
