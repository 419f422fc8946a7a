//! Access to the secrets backing variables.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::Api;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::crd::ANNOTATION_JSON_VALUE;

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to retrieve secret {namespace}/{name}"))]
    RetrieveSecret {
        source: kube::Error,
        namespace: String,
        name: String,
    },

    #[snafu(display("secret {namespace}/{name} not found"))]
    SecretNotFound { namespace: String, name: String },
}

/// The parts of a secret needed to bind variables.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StoredSecret {
    pub data: BTreeMap<String, Vec<u8>>,
    pub annotations: BTreeMap<String, String>,
}

impl StoredSecret {
    /// Whether the values of this secret are JSON documents.
    pub fn is_json_valued(&self) -> bool {
        self.annotations
            .get(ANNOTATION_JSON_VALUE)
            .is_some_and(|value| value == "true")
    }
}

impl From<Secret> for StoredSecret {
    fn from(secret: Secret) -> Self {
        Self {
            data: secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| (key, value.0))
                .collect(),
            annotations: secret.metadata.annotations.unwrap_or_default(),
        }
    }
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<StoredSecret>;
}

#[derive(Clone)]
pub struct KubeSecretStore {
    client: kube::Client,
}

impl KubeSecretStore {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<StoredSecret> {
        Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .context(RetrieveSecretSnafu { namespace, name })?
            .map(StoredSecret::from)
            .context(SecretNotFoundSnafu { namespace, name })
    }
}
