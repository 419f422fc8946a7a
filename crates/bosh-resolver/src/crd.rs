//! The `BOSHDeployment` custom resource.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::Display;

/// Key holding the manifest in a referenced config map or secret.
pub const MANIFEST_SPEC_NAME: &str = "manifest";

/// Key holding an ops file in a referenced config map or secret.
pub const OPS_SPEC_NAME: &str = "ops";

/// Marks secrets whose values are JSON documents rather than plain strings.
pub const ANNOTATION_JSON_VALUE: &str = "quarks.cloudfoundry.org/json-value";

/// A BOSH deployment, consisting of a manifest, ops files modifying it and explicit variables.
#[derive(Clone, CustomResource, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "quarks.cloudfoundry.org",
    version = "v1alpha1",
    kind = "BOSHDeployment",
    plural = "boshdeployments",
    shortname = "bdpl",
    crates(
        kube_core = "kube::core",
        k8s_openapi = "k8s_openapi",
        schemars = "schemars"
    ),
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BOSHDeploymentSpec {
    /// The BOSH manifest.
    pub manifest: ResourceReference,

    /// Ops files, applied to the manifest in the given order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ops: Vec<ResourceReference>,

    /// Secrets providing the values of explicit variables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vars: Vec<VarReference>,
}

/// Points to a config map, secret or URL holding a document.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct ResourceReference {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: ReferenceType,
}

#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReferenceType {
    #[serde(rename = "configmap")]
    #[strum(serialize = "configmap")]
    ConfigMap,
    Secret,
    Url,
}

/// Binds the explicit variable `name` to the contents of `secret`.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct VarReference {
    pub name: String,
    pub secret: String,
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use kube::ResourceExt;

    use super::*;

    #[test]
    fn deserialize_deployment() {
        let deployment: BOSHDeployment = serde_yaml::from_str(indoc! {"
            apiVersion: quarks.cloudfoundry.org/v1alpha1
            kind: BOSHDeployment
            metadata:
              name: nats-deployment
              namespace: cf
            spec:
              manifest:
                name: nats-manifest
                type: configmap
              ops:
              - name: scale
                type: secret
              - name: https://example.com/ops.yaml
                type: url
              vars:
              - name: nats_password
                secret: nats-credentials
        "})
        .expect("test YAML is valid");

        assert_eq!(deployment.name_any(), "nats-deployment");
        assert_eq!(deployment.spec.manifest.kind, ReferenceType::ConfigMap);
        assert_eq!(
            deployment
                .spec
                .ops
                .iter()
                .map(|ops| ops.kind)
                .collect::<Vec<_>>(),
            [ReferenceType::Secret, ReferenceType::Url]
        );
        assert_eq!(deployment.spec.vars[0].secret, "nats-credentials");
    }

    #[test]
    fn reference_types_display_like_their_serialization() {
        assert_eq!(ReferenceType::ConfigMap.to_string(), "configmap");
        assert_eq!(ReferenceType::Url.to_string(), "url");
    }
}
