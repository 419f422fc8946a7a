//! Instance groups and the jobs running in them.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Affinity, LocalObjectReference, Toleration};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use strum::{Display, EnumString};

use crate::{is_default, manifest::Update};

/// Label key prefix used to tag instance groups with the image of every release they use.
pub const RELEASE_IMAGE_LABEL_PREFIX: &str = "app.kubernetes.io/version-image-";

/// The lifecycle of an instance group.
///
/// An unspecified lifecycle is treated like [`InstanceGroupType::Service`] by BOSH.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum InstanceGroupType {
    Service,
    Errand,
    AutoErrand,

    #[default]
    #[serde(rename = "")]
    #[strum(serialize = "")]
    Unspecified,
}

impl InstanceGroupType {
    /// Returns the effective lifecycle, resolving [`InstanceGroupType::Unspecified`] to
    /// [`InstanceGroupType::Service`].
    pub fn effective(self) -> Self {
        match self {
            Self::Unspecified => Self::Service,
            other => other,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct InstanceGroup {
    pub name: String,

    #[serde(default)]
    pub instances: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub azs: Vec<String>,

    #[serde(default)]
    pub jobs: Vec<Job>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_type: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vm_extensions: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_resources: Option<VmResources>,

    /// Alias of the stemcell (see [`crate::manifest::Stemcell::alias`]).
    #[serde(default)]
    pub stemcell: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_disk: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_disk_type: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<Network>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Update>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub migrated_from: Vec<MigratedFrom>,

    #[serde(default, skip_serializing_if = "is_default")]
    pub lifecycle: InstanceGroupType,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "is_default")]
    pub env: AgentEnv,
}

impl InstanceGroup {
    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.name == name)
    }

    /// Labels applied to the pods of this instance group.
    pub fn labels_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.env.bosh.agent.settings.labels
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VmResources {
    pub cpu: i64,
    pub ram: i64,
    pub ephemeral_disk_size: i64,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Network {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_ips: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct MigratedFrom {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub az: Option<String>,
}

/// A job inside an instance group.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Job {
    pub name: String,
    pub release: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub consumes: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provides: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "is_default")]
    pub properties: JobProperties,
}

/// Job properties, consisting of the release specific properties and the `quarks` block, which
/// is interpreted by the operator itself.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct JobProperties {
    #[serde(rename = "quarks", default, skip_serializing_if = "is_default")]
    pub operator: OperatorProperties,

    #[serde(flatten)]
    pub properties: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct OperatorProperties {
    /// Set for jobs which were injected by an addon.
    #[serde(default, skip_serializing_if = "is_default")]
    pub is_addon: bool,

    /// Operator settings like ports, bpm processes or health checks, which are passed on as-is.
    #[serde(flatten)]
    pub settings: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct AgentEnv {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_disk_fs: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub persistent_disk_mount_options: Vec<String>,

    #[serde(default, skip_serializing_if = "is_default")]
    pub bosh: AgentEnvBoshConfig,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct AgentEnvBoshConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_root_password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_dev_tools: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_static_libraries: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_size: Option<i64>,

    #[serde(default, skip_serializing_if = "is_default")]
    pub ipv6: Ipv6,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_dir: Option<JobDir>,

    #[serde(default, skip_serializing_if = "is_default")]
    pub agent: Agent,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Ipv6 {
    #[serde(default)]
    pub enable: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct JobDir {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmpfs: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmpfs_size: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Agent {
    #[serde(default, skip_serializing_if = "is_default")]
    pub settings: AgentSettings,
}

/// Kubernetes specific settings of the pods running an instance group.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct AgentSettings {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    #[serde(default, skip_serializing_if = "is_default")]
    pub disable_log_sidecar: bool,

    #[serde(
        rename = "serviceAccountName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub service_account_name: Option<String>,

    #[serde(
        rename = "automountServiceAccountToken",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub automount_service_account_token: Option<bool>,

    #[serde(
        rename = "imagePullSecrets",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub image_pull_secrets: Vec<LocalObjectReference>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    #[serde(rename = "ephemeralAsPVC", default, skip_serializing_if = "is_default")]
    pub ephemeral_as_pvc: bool,

    #[serde(
        rename = "jobBackoffLimit",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub job_backoff_limit: Option<i32>,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use indoc::indoc;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("service", InstanceGroupType::Service)]
    #[case("errand", InstanceGroupType::Errand)]
    #[case("auto-errand", InstanceGroupType::AutoErrand)]
    #[case("", InstanceGroupType::Unspecified)]
    fn lifecycle_from_str(#[case] input: &str, #[case] expected: InstanceGroupType) {
        assert_eq!(InstanceGroupType::from_str(input).unwrap(), expected);
        assert_eq!(expected.to_string(), input);
    }

    #[test]
    fn unspecified_lifecycle_is_a_service() {
        assert_eq!(
            InstanceGroupType::Unspecified.effective(),
            InstanceGroupType::Service
        );
        assert_eq!(
            InstanceGroupType::Errand.effective(),
            InstanceGroupType::Errand
        );
    }

    #[test]
    fn job_properties_keep_operator_block_apart() {
        let job: Job = serde_yaml::from_str(indoc! {"
            name: nats
            release: nats
            properties:
              nats:
                port: 4222
              quarks:
                is_addon: true
                ports:
                - name: nats
                  internal: 4222
        "})
        .expect("test YAML is valid");

        assert!(job.properties.operator.is_addon);
        assert!(job.properties.operator.settings.contains_key("ports"));
        assert!(job.properties.properties.contains_key("nats"));
        assert!(!job.properties.properties.contains_key("quarks"));
    }

    #[test]
    fn agent_settings_use_kubernetes_field_names() {
        let ig: InstanceGroup = serde_yaml::from_str(indoc! {"
            name: nats
            env:
              bosh:
                agent:
                  settings:
                    serviceAccountName: nats
                    imagePullSecrets:
                    - name: registry
                    labels:
                      team: messaging
        "})
        .expect("test YAML is valid");

        let settings = &ig.env.bosh.agent.settings;
        assert_eq!(settings.service_account_name.as_deref(), Some("nats"));
        assert_eq!(settings.image_pull_secrets.len(), 1);
        assert_eq!(settings.labels["team"], "messaging");
    }
}
