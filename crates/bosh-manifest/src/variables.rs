//! Discovery of variable placeholders in manifests.
//!
//! Placeholders look like `((name))`. Variables declared in the `variables` section of the
//! manifest are explicit, every other placeholder refers to an implicit variable, which is
//! backed by a secret named after the variable (see [`secret_variable_name`]).
//!
//! Implicit variables may select a key inside their secret with a single slash, e.g.
//! `((ca/certificate))` reads key `certificate` of secret `var-ca`. Without a slash the key
//! [`IMPLICIT_VARIABLE_KEY_NAME`] is used.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::LazyLock,
};

use regex::Regex;
use snafu::{ResultExt, Snafu, ensure};

use crate::{manifest::Manifest, names::secret_variable_name, yaml};

/// Key read from the secret of an implicit variable which doesn't select a key itself.
pub const IMPLICIT_VARIABLE_KEY_NAME: &str = "value";

static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(\((!?[-/\.\w\pL]+)\)\)").expect("failed to compile placeholder regex")
});

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize manifest to search for variables"))]
    SerializeManifest { source: yaml::Error },

    #[snafu(display(
        "expected exactly one separator in implicit variable {variable:?}, found {separators}"
    ))]
    TooManySeparators { variable: String, separators: usize },
}

impl Manifest {
    /// Returns the names of all implicit variables used in the manifest.
    ///
    /// Dotted names like `((ca.private_key))` refer to a field of the variable `ca`, while
    /// slashed names are returned unchanged.
    pub fn implicit_variables(&self) -> Result<BTreeSet<String>> {
        let yaml = self.to_yaml().context(SerializeManifestSnafu)?;
        let mut variables = placeholder_names(&String::from_utf8_lossy(&yaml));

        for variable in &self.variables {
            variables.remove(&variable.name);
        }

        Ok(variables)
    }
}

/// Returns the normalized names of all placeholders found in `text`.
pub fn placeholder_names(text: &str) -> BTreeSet<String> {
    PLACEHOLDER_REGEX
        .captures_iter(text)
        .filter_map(|captures| {
            let name = captures[1].trim_start_matches('!');
            if is_slashed(name) {
                return Some(name.to_owned());
            }
            // Leading dots don't start a field path, `((.foo))` refers to `foo`.
            name.split('.')
                .find(|part| !part.is_empty())
                .map(str::to_owned)
        })
        .collect()
}

pub fn is_slashed(variable: &str) -> bool {
    variable.contains('/')
}

/// The secret and key an implicit variable is read from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecretKey {
    pub secret: String,
    pub key: String,
}

/// Determines the secret and key backing the implicit variable `variable`.
pub fn classify(variable: &str) -> Result<SecretKey> {
    match variable.split_once('/') {
        Some((secret, key)) => {
            ensure!(
                !key.contains('/'),
                TooManySeparatorsSnafu {
                    variable,
                    separators: variable.matches('/').count(),
                }
            );
            Ok(SecretKey {
                secret: secret_variable_name(secret),
                key: key.to_owned(),
            })
        }
        None => Ok(SecretKey {
            secret: secret_variable_name(variable),
            key: IMPLICIT_VARIABLE_KEY_NAME.to_owned(),
        }),
    }
}

/// A variable read from a key of a secret.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecretRef {
    pub key: String,
    pub variable: String,
}

/// Implicit variables grouped by the secret they are read from.
///
/// One secret can back several variables, e.g. `((ca/certificate))` and `((ca/private_key))`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SecretRefs(BTreeMap<String, Vec<SecretRef>>);

impl SecretRefs {
    pub fn from_variables<'a>(variables: impl IntoIterator<Item = &'a String>) -> Result<Self> {
        let mut refs = Self::default();
        for variable in variables {
            let SecretKey { secret, key } = classify(variable)?;
            refs.0.entry(secret).or_default().push(SecretRef {
                key,
                variable: variable.clone(),
            });
        }
        Ok(refs)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<SecretRef>)> {
        self.0.iter()
    }

    /// Lists every referenced secret, as `secret` for the default key and as `secret/key`
    /// otherwise.
    pub fn secret_keys(&self) -> Vec<String> {
        self.iter()
            .flat_map(|(secret, refs)| {
                refs.iter().map(move |secret_ref| {
                    if secret_ref.key == IMPLICIT_VARIABLE_KEY_NAME {
                        secret.clone()
                    } else {
                        format!("{secret}/{}", secret_ref.key)
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("((foo))", &["foo"])]
    #[case("((foo/bar))", &["foo/bar"])]
    #[case("((foo.bar))", &["foo"])]
    #[case("((!foo))", &["foo"])]
    #[case("((ca.private_key)) ((ca.certificate)) ((ca))", &["ca"])]
    #[case("((grüße))", &["grüße"])]
    #[case("((.foo))", &["foo"])]
    #[case("((..foo.bar))", &["foo"])]
    #[case("((...))", &[])]
    #[case("(( spaced ))", &[])]
    #[case("plain text", &[])]
    fn placeholders_are_normalized(#[case] text: &str, #[case] expected: &[&str]) {
        let expected: BTreeSet<String> = expected.iter().map(|name| (*name).to_owned()).collect();
        assert_eq!(placeholder_names(text), expected);
    }

    #[rstest]
    #[case("foo", "var-foo", "value")]
    #[case("foo/bar", "var-foo", "bar")]
    #[case("nats_password/secret", "var-nats-password", "secret")]
    fn variables_are_classified(#[case] variable: &str, #[case] secret: &str, #[case] key: &str) {
        assert_eq!(
            classify(variable).unwrap(),
            SecretKey {
                secret: secret.to_owned(),
                key: key.to_owned(),
            }
        );
    }

    #[test]
    fn multiple_separators_are_rejected() {
        let err = classify("foo/bar/baz").unwrap_err();
        assert!(matches!(
            err,
            Error::TooManySeparators { separators: 2, .. }
        ));
        assert!(err.to_string().contains("expected exactly one separator"));
    }

    #[test]
    fn declared_variables_are_not_implicit() {
        let manifest = Manifest::from_yaml(
            indoc! {"
                name: test
                instance_groups:
                - name: nats
                  jobs:
                  - name: nats
                    release: nats
                    properties:
                      password: ((foo))
                      cert: ((ca.certificate))
                      user: ((system_domain))
                      key: ((router/key))
                variables:
                - name: foo
                  type: password
                - name: ca
                  type: certificate
            "}
            .as_bytes(),
        )
        .expect("test YAML is valid");

        assert_eq!(
            manifest.implicit_variables().unwrap(),
            BTreeSet::from(["router/key".to_owned(), "system_domain".to_owned()])
        );
    }

    #[test]
    fn secret_refs_group_keys_per_secret() {
        let variables = BTreeSet::from([
            "ca/certificate".to_owned(),
            "ca/private_key".to_owned(),
            "system_domain".to_owned(),
        ]);
        let refs = SecretRefs::from_variables(&variables).unwrap();

        let ca: Vec<_> = refs
            .iter()
            .find(|(secret, _)| *secret == "var-ca")
            .map(|(_, refs)| refs.iter().map(|r| r.key.as_str()).collect())
            .unwrap();
        assert_eq!(ca, ["certificate", "private_key"]);

        assert_eq!(
            refs.secret_keys(),
            [
                "var-ca/certificate",
                "var-ca/private_key",
                "var-system-domain",
            ]
        );
    }
}
