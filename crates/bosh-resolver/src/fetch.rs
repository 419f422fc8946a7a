//! Retrieval of manifests and ops files referenced by a deployment.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::Api;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::debug;

use crate::crd::{ReferenceType, ResourceReference};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to retrieve {kind} {namespace}/{name}"))]
    RetrieveResource {
        source: kube::Error,
        kind: ReferenceType,
        namespace: String,
        name: String,
    },

    #[snafu(display("{kind} {namespace}/{name} not found"))]
    ResourceNotFound {
        kind: ReferenceType,
        namespace: String,
        name: String,
    },

    #[snafu(display("{kind} {namespace}/{name} doesn't contain key {key:?}"))]
    MissingKey {
        kind: ReferenceType,
        namespace: String,
        name: String,
        key: String,
    },

    #[snafu(display("failed to fetch {key} from url {url:?}"))]
    FetchUrl {
        source: reqwest::Error,
        url: String,
        key: String,
    },
}

/// Reads the text of a referenced document.
///
/// `key` selects the entry of a config map or secret, it is ignored for URLs.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(
        &self,
        namespace: &str,
        reference: &ResourceReference,
        key: &str,
    ) -> Result<String>;
}

/// Fetches config maps and secrets from Kubernetes and URLs via HTTP.
#[derive(Clone)]
pub struct KubeResourceFetcher {
    client: kube::Client,
    http: reqwest::Client,
}

impl KubeResourceFetcher {
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            http: reqwest::Client::new(),
        }
    }

    async fn config_map_entry(&self, namespace: &str, name: &str, key: &str) -> Result<String> {
        let kind = ReferenceType::ConfigMap;
        let config_map = Api::<ConfigMap>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .context(RetrieveResourceSnafu {
                kind,
                namespace,
                name,
            })?
            .context(ResourceNotFoundSnafu {
                kind,
                namespace,
                name,
            })?;

        config_map
            .data
            .and_then(|mut data| data.remove(key))
            .context(MissingKeySnafu {
                kind,
                namespace,
                name,
                key,
            })
    }

    async fn secret_entry(&self, namespace: &str, name: &str, key: &str) -> Result<String> {
        let kind = ReferenceType::Secret;
        let secret = Api::<Secret>::namespaced(self.client.clone(), namespace)
            .get_opt(name)
            .await
            .context(RetrieveResourceSnafu {
                kind,
                namespace,
                name,
            })?
            .context(ResourceNotFoundSnafu {
                kind,
                namespace,
                name,
            })?;

        let value = secret
            .data
            .and_then(|mut data| data.remove(key))
            .context(MissingKeySnafu {
                kind,
                namespace,
                name,
                key,
            })?;
        Ok(String::from_utf8_lossy(&value.0).into_owned())
    }

    async fn url_body(&self, url: &str, key: &str) -> Result<String> {
        let fetch = async {
            self.http
                .get(url)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await
        };
        fetch.await.context(FetchUrlSnafu { url, key })
    }
}

#[async_trait]
impl ResourceFetcher for KubeResourceFetcher {
    async fn fetch(
        &self,
        namespace: &str,
        reference: &ResourceReference,
        key: &str,
    ) -> Result<String> {
        debug!("Fetching {key} from {} {:?}", reference.kind, reference.name);
        match reference.kind {
            ReferenceType::ConfigMap => {
                self.config_map_entry(namespace, &reference.name, key).await
            }
            ReferenceType::Secret => self.secret_entry(namespace, &reference.name, key).await,
            ReferenceType::Url => self.url_body(&reference.name, key).await,
        }
    }
}
