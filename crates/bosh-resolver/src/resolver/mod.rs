//! Resolution of a [`BOSHDeployment`] into its desired manifest.
//!
//! The manifest goes through these stages, each producing a fresh [`Manifest`]:
//!
//! 1. fetch the manifest and apply the ops files
//! 2. label instance groups with the images of their releases
//! 3. interpolate implicit variables, read from the secrets named after them
//! 4. apply addons
//! 5. interpolate explicit variables, read from the secrets listed in the deployment
//! 6. validate the DNS addons and propagate the update block

use bosh_manifest::{
    Manifest, PlacementContext, addon, manifest,
    names::secret_variable_name,
    variables::{self, SecretRefs},
    yaml,
};
use kube::ResourceExt;
use serde_yaml::{Mapping, Value};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::Display;
use tracing::{Span, debug, debug_span, info, instrument};

use crate::{
    crd::{BOSHDeployment, MANIFEST_SPEC_NAME, OPS_SPEC_NAME, ResourceReference},
    dns,
    evaluator::{self, Bindings, EvaluateOptions, Interpolator, TemplateEvaluator, VariableTable},
    fetch::{self, ResourceFetcher},
    secret::{self, SecretStore, StoredSecret},
};


/// A secret containing this key binds its value directly to the explicit variable, instead of
/// binding a map of all its keys.
const PASSWORD_KEY: &str = "password";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to resolve deployment {deployment:?} in namespace {namespace:?}"))]
    ResolveDeployment {
        source: StageError,
        deployment: String,
        namespace: String,
    },
}

#[derive(Debug, Snafu)]
pub enum StageError {
    #[snafu(display("failed to fetch manifest {name:?}"))]
    FetchManifest { source: fetch::Error, name: String },

    #[snafu(display("failed to fetch ops file {name:?}"))]
    FetchOps { source: fetch::Error, name: String },

    #[snafu(display("failed to add ops file {name:?}"))]
    AddOps {
        source: evaluator::Error,
        name: String,
    },

    #[snafu(display("failed to apply ops files"))]
    ApplyOps { source: evaluator::Error },

    #[snafu(display("failed to apply ops file {name:?}"))]
    ApplyOpsFile {
        source: evaluator::Error,
        name: String,
    },

    #[snafu(display("failed to parse manifest after {stage}"))]
    ParseManifest { source: yaml::Error, stage: Stage },

    #[snafu(display("failed to serialize manifest for {stage}"))]
    SerializeManifest { source: yaml::Error, stage: Stage },

    #[snafu(display("failed to add release labels"))]
    AddReleaseLabels { source: manifest::Error },

    #[snafu(display("failed to list implicit variables"))]
    ListImplicitVariables { source: variables::Error },

    #[snafu(display("failed to read secret {secret:?}"))]
    ReadSecret {
        source: secret::Error,
        secret: String,
    },

    #[snafu(display("secret {secret:?} doesn't contain key {key:?} of variable {variable:?}"))]
    MissingSecretKey {
        secret: String,
        key: String,
        variable: String,
    },

    #[snafu(display("failed to decode JSON value of variable {variable:?} in secret {secret:?}"))]
    DecodeJsonValue {
        source: serde_json::Error,
        secret: String,
        variable: String,
    },

    #[snafu(display("failed to interpolate implicit variables"))]
    EvaluateImplicitVariables { source: evaluator::Error },

    #[snafu(display("failed to apply addons"))]
    ApplyAddons { source: addon::Error },

    #[snafu(display("failed to interpolate explicit variables"))]
    EvaluateExplicitVariables { source: evaluator::Error },

    #[snafu(display("invalid DNS addon configuration"))]
    ValidateDns { source: dns::Error },
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Stage {
    #[strum(serialize = "applying ops files")]
    Ops,

    #[strum(serialize = "interpolating implicit variables")]
    ImplicitVariables,

    #[strum(serialize = "interpolating explicit variables")]
    ExplicitVariables,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResolverConfig {
    /// Apply every ops file on its own, which pinpoints the failing ops file but is slower.
    pub detailed_ops_evaluation: bool,

    /// Fail if explicit variables remain unresolved.
    pub expect_all_explicit_keys: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum OpsEvaluation {
    Batch,
    Detailed,
}

impl OpsEvaluation {
    fn addons_span(self) -> Span {
        match self {
            Self::Batch => debug_span!("manifest-addons"),
            Self::Detailed => debug_span!("detailed-manifest-addons"),
        }
    }
}

/// Resolves deployments into their desired manifests.
///
/// The resolver itself is stateless, a single instance can resolve any number of deployments
/// concurrently.
pub struct Resolver<F, S, E> {
    fetcher: F,
    secrets: S,
    evaluator: E,
    config: ResolverConfig,
}

impl<F, S, E> Resolver<F, S, E>
where
    F: ResourceFetcher,
    S: SecretStore,
    E: TemplateEvaluator,
{
    pub fn new(fetcher: F, secrets: S, evaluator: E, config: ResolverConfig) -> Self {
        Self {
            fetcher,
            secrets,
            evaluator,
            config,
        }
    }

    /// Resolves the desired manifest of `deployment`, evaluating ops files as configured.
    pub async fn resolve(&self, deployment: &BOSHDeployment, namespace: &str) -> Result<Manifest> {
        if self.config.detailed_ops_evaluation {
            self.manifest_detailed(deployment, namespace).await
        } else {
            self.manifest(deployment, namespace).await
        }
    }

    /// Resolves the desired manifest, applying all ops files at once.
    #[instrument(skip(self, deployment), fields(deployment = %deployment.name_any()))]
    pub async fn manifest(&self, deployment: &BOSHDeployment, namespace: &str) -> Result<Manifest> {
        self.resolve_with(deployment, namespace, OpsEvaluation::Batch)
            .await
            .with_context(|_| ResolveDeploymentSnafu {
                deployment: deployment.name_any(),
                namespace,
            })
    }

    /// Resolves the desired manifest, applying the ops files one by one.
    #[instrument(skip(self, deployment), fields(deployment = %deployment.name_any()))]
    pub async fn manifest_detailed(
        &self,
        deployment: &BOSHDeployment,
        namespace: &str,
    ) -> Result<Manifest> {
        self.resolve_with(deployment, namespace, OpsEvaluation::Detailed)
            .await
            .with_context(|_| ResolveDeploymentSnafu {
                deployment: deployment.name_any(),
                namespace,
            })
    }

    /// Lists the secrets backing the implicit variables of a deployment, without reading them.
    ///
    /// Entries are either `secret` or `secret/key`, for variables selecting a key.
    #[instrument(skip(self, deployment), fields(deployment = %deployment.name_any()))]
    pub async fn implicit_variables(
        &self,
        deployment: &BOSHDeployment,
        namespace: &str,
    ) -> Result<Vec<String>> {
        let refs = self
            .implicit_secret_refs(deployment, namespace)
            .await
            .with_context(|_| ResolveDeploymentSnafu {
                deployment: deployment.name_any(),
                namespace,
            })?;
        Ok(refs.secret_keys())
    }

    /// Interpolates the variables declared in the manifest, reading each one from the secret
    /// named after it. Every placeholder has to be resolved.
    ///
    /// Returns the canonical serialization of the interpolated manifest.
    #[instrument(skip(self, with_ops_manifest))]
    pub async fn interpolate_variables_from_secrets(
        &self,
        with_ops_manifest: &[u8],
        namespace: &str,
        deployment_name: &str,
    ) -> Result<Vec<u8>> {
        self.interpolate_declared_variables(with_ops_manifest, namespace)
            .await
            .context(ResolveDeploymentSnafu {
                deployment: deployment_name,
                namespace,
            })
    }

    async fn resolve_with(
        &self,
        deployment: &BOSHDeployment,
        namespace: &str,
        evaluation: OpsEvaluation,
    ) -> Result<Manifest, StageError> {
        let mut manifest = match evaluation {
            OpsEvaluation::Batch => self.load(deployment, namespace).await?,
            OpsEvaluation::Detailed => self.load_detailed(deployment, namespace).await?,
        };

        // Changing release images need to roll the pods, even if nothing else changed.
        manifest
            .add_release_labels()
            .context(AddReleaseLabelsSnafu)?;

        let manifest = self
            .apply_variables(deployment, namespace, manifest, evaluation)
            .await?;
        info!("Resolved manifest");
        Ok(manifest)
    }

    async fn fetch_manifest(
        &self,
        namespace: &str,
        reference: &ResourceReference,
    ) -> Result<String, StageError> {
        self.fetcher
            .fetch(namespace, reference, MANIFEST_SPEC_NAME)
            .await
            .context(FetchManifestSnafu {
                name: &reference.name,
            })
    }

    async fn fetch_ops(
        &self,
        namespace: &str,
        reference: &ResourceReference,
    ) -> Result<String, StageError> {
        self.fetcher
            .fetch(namespace, reference, OPS_SPEC_NAME)
            .await
            .context(FetchOpsSnafu {
                name: &reference.name,
            })
    }

    /// Fetches the manifest and applies all ops files with a single interpolator.
    async fn load(
        &self,
        deployment: &BOSHDeployment,
        namespace: &str,
    ) -> Result<Manifest, StageError> {
        let spec = &deployment.spec;
        let manifest = self.fetch_manifest(namespace, &spec.manifest).await?;

        let mut interpolator = self.evaluator.new_interpolator();
        for ops in &spec.ops {
            let ops_file = self.fetch_ops(namespace, ops).await?;
            interpolator
                .add_ops(ops_file.as_bytes())
                .context(AddOpsSnafu { name: &ops.name })?;
        }

        let document = if spec.ops.is_empty() {
            manifest.into_bytes()
        } else {
            interpolator
                .interpolate(manifest.as_bytes())
                .context(ApplyOpsSnafu)?
        };

        Manifest::from_yaml(&document).context(ParseManifestSnafu { stage: Stage::Ops })
    }

    /// Fetches the manifest and applies the ops files one after another.
    async fn load_detailed(
        &self,
        deployment: &BOSHDeployment,
        namespace: &str,
    ) -> Result<Manifest, StageError> {
        let spec = &deployment.spec;
        let mut document = self
            .fetch_manifest(namespace, &spec.manifest)
            .await?
            .into_bytes();

        for ops in &spec.ops {
            let ops_file = self.fetch_ops(namespace, ops).await?;

            let mut interpolator = self.evaluator.new_interpolator();
            interpolator
                .add_ops(ops_file.as_bytes())
                .context(AddOpsSnafu { name: &ops.name })?;
            document = interpolator
                .interpolate(&document)
                .context(ApplyOpsFileSnafu { name: &ops.name })?;
            debug!("Applied ops file {:?}", ops.name);
        }

        Manifest::from_yaml(&document).context(ParseManifestSnafu { stage: Stage::Ops })
    }

    async fn implicit_secret_refs(
        &self,
        deployment: &BOSHDeployment,
        namespace: &str,
    ) -> Result<SecretRefs, StageError> {
        let manifest = self.load(deployment, namespace).await?;
        secret_refs(&manifest)
    }

    async fn apply_variables(
        &self,
        deployment: &BOSHDeployment,
        namespace: &str,
        manifest: Manifest,
        evaluation: OpsEvaluation,
    ) -> Result<Manifest, StageError> {
        let refs = secret_refs(&manifest)?;
        let implicit = self.implicit_bindings(namespace, &refs).await?;

        let document = manifest.to_yaml().context(SerializeManifestSnafu {
            stage: Stage::ImplicitVariables,
        })?;
        let document = self
            .evaluator
            .evaluate(
                &document,
                &Bindings::single(implicit),
                EvaluateOptions::default(),
            )
            .context(EvaluateImplicitVariablesSnafu)?;
        let mut manifest = Manifest::from_yaml(&document).context(ParseManifestSnafu {
            stage: Stage::ImplicitVariables,
        })?;

        let placement = PlacementContext {
            deployment_name: deployment.name_any(),
            teams: Vec::new(),
        };
        evaluation
            .addons_span()
            .in_scope(|| manifest.apply_addons(&placement))
            .context(ApplyAddonsSnafu)?;

        let mut explicit = Vec::with_capacity(deployment.spec.vars.len());
        for var in &deployment.spec.vars {
            let secret = self.read_secret(namespace, &var.secret).await?;
            explicit.push(VariableTable::from([(
                var.name.clone(),
                explicit_binding(&secret),
            )]));
        }

        let document = manifest.to_yaml().context(SerializeManifestSnafu {
            stage: Stage::ExplicitVariables,
        })?;
        let options = EvaluateOptions {
            expect_all_keys: self.config.expect_all_explicit_keys,
            ..EvaluateOptions::default()
        };
        let document = self
            .evaluator
            .evaluate(&document, &Bindings::multi(explicit), options)
            .context(EvaluateExplicitVariablesSnafu)?;
        let mut manifest = Manifest::from_yaml(&document).context(ParseManifestSnafu {
            stage: Stage::ExplicitVariables,
        })?;

        dns::validate(&manifest).context(ValidateDnsSnafu)?;
        manifest.propagate_update_block();

        Ok(manifest)
    }

    /// Reads the values of all implicit variables.
    async fn implicit_bindings(
        &self,
        namespace: &str,
        refs: &SecretRefs,
    ) -> Result<VariableTable, StageError> {
        let mut bindings = VariableTable::new();

        for (secret_name, secret_refs) in refs.iter() {
            let secret = self.read_secret(namespace, secret_name).await?;
            let json_valued = secret.is_json_valued();

            for secret_ref in secret_refs {
                let value = secret
                    .data
                    .get(&secret_ref.key)
                    .context(MissingSecretKeySnafu {
                        secret: secret_name,
                        key: &secret_ref.key,
                        variable: &secret_ref.variable,
                    })?;

                let value = if json_valued {
                    serde_json::from_slice(value).context(DecodeJsonValueSnafu {
                        secret: secret_name,
                        variable: &secret_ref.variable,
                    })?
                } else {
                    Value::String(String::from_utf8_lossy(value).into_owned())
                };
                bindings.insert(secret_ref.variable.clone(), value);
            }
        }

        debug!("Read {} implicit variables", bindings.len());
        Ok(bindings)
    }

    async fn interpolate_declared_variables(
        &self,
        with_ops_manifest: &[u8],
        namespace: &str,
    ) -> Result<Vec<u8>, StageError> {
        let manifest = Manifest::from_yaml(with_ops_manifest)
            .context(ParseManifestSnafu { stage: Stage::Ops })?;

        let mut tables = Vec::with_capacity(manifest.variables.len());
        for variable in &manifest.variables {
            let secret = self
                .read_secret(namespace, &secret_variable_name(&variable.name))
                .await?;
            tables.push(VariableTable::from([(
                variable.name.clone(),
                explicit_binding(&secret),
            )]));
        }

        let options = EvaluateOptions {
            expect_all_keys: true,
            ..EvaluateOptions::default()
        };
        let document = self
            .evaluator
            .evaluate(with_ops_manifest, &Bindings::multi(tables), options)
            .context(EvaluateExplicitVariablesSnafu)?;

        Manifest::from_yaml(&document)
            .context(ParseManifestSnafu {
                stage: Stage::ExplicitVariables,
            })?
            .to_yaml()
            .context(SerializeManifestSnafu {
                stage: Stage::ExplicitVariables,
            })
    }

    async fn read_secret(&self, namespace: &str, name: &str) -> Result<StoredSecret, StageError> {
        self.secrets
            .get(namespace, name)
            .await
            .context(ReadSecretSnafu { secret: name })
    }
}

fn secret_refs(manifest: &Manifest) -> Result<SecretRefs, StageError> {
    let implicit = manifest
        .implicit_variables()
        .context(ListImplicitVariablesSnafu)?;
    SecretRefs::from_variables(&implicit).context(ListImplicitVariablesSnafu)
}

/// The value bound to an explicit variable backed by `secret`.
///
/// Secrets with a `password` key bind that value, all other secrets bind a map of their keys,
/// e.g. `certificate` and `private_key` for certificates.
fn explicit_binding(secret: &StoredSecret) -> Value {
    if let Some(password) = secret.data.get(PASSWORD_KEY) {
        return Value::String(String::from_utf8_lossy(password).into_owned());
    }

    let fields: Mapping = secret
        .data
        .iter()
        .map(|(key, value)| {
            (
                Value::String(key.clone()),
                Value::String(String::from_utf8_lossy(value).into_owned()),
            )
        })
        .collect();
    Value::Mapping(fields)
}
