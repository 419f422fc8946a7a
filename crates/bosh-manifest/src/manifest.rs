//! The BOSH deployment manifest and the lookups operating on it.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use snafu::{OptionExt, Snafu};

use crate::{
    addon::AddOn,
    instance_group::{InstanceGroup, Job, RELEASE_IMAGE_LABEL_PREFIX},
    is_default,
    merge::Merge,
    yaml,
};

/// Name of the key holding the desired manifest in its versioned secret.
pub const DESIRED_MANIFEST_KEY_NAME: &str = "manifest.yaml";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("instance group {instance_group:?} not found"))]
    InstanceGroupNotFound { instance_group: String },

    #[snafu(display("job {job:?} not found in instance group {instance_group:?}"))]
    JobNotFound { job: String, instance_group: String },

    #[snafu(display("release {release:?} not found"))]
    ReleaseNotFound { release: String },

    #[snafu(display("stemcell could not be resolved for instance group {instance_group:?}"))]
    StemcellNotResolved { instance_group: String },
}

/// A BOSH deployment manifest
///
/// Parsing and serialization go through [`Manifest::from_yaml`] and [`Manifest::to_yaml`],
/// which produce the canonical form used for hashing and persisting.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default)]
    pub director_uuid: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_groups: Vec<InstanceGroup>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Feature>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub releases: Vec<Release>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stemcells: Vec<Stemcell>,

    #[serde(rename = "addons", default, skip_serializing_if = "Vec::is_empty")]
    pub add_ons: Vec<AddOn>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Update>,

    /// Guards [`Manifest::apply_addons`], addons must only ever be applied once.
    #[serde(default, skip_serializing_if = "is_default")]
    pub addons_applied: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Feature {
    #[serde(default)]
    pub converge_variables: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub randomize_az_placement: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_dns_addresses: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_tmpfs_job_config: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Release {
    pub name: String,
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,

    /// Pins the stemcell the release was compiled against, takes precedence over the
    /// stemcell of the instance group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stemcell: Option<ReleaseStemcell>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ReleaseStemcell {
    pub os: String,
    pub version: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Stemcell {
    pub alias: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,

    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    ClientAuth,
    ServerAuth,
}

/// An explicit variable, declared in the `variables` section of the manifest.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Variable {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<VariableOptions>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VariableOptions {
    #[serde(default)]
    pub common_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternative_names: Vec<String>,

    #[serde(default)]
    pub is_ca: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extended_key_usage: Vec<AuthType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer_type: Option<String>,

    #[serde(rename = "serviceRef", default, skip_serializing_if = "Vec::is_empty")]
    pub service_ref: Vec<ServiceReference>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub copies: Vec<SecretCopy>,

    #[serde(
        rename = "activateEKSWorkaroundForSAN",
        default,
        skip_serializing_if = "is_default"
    )]
    pub activate_eks_workaround_for_san: bool,
}

/// A Kubernetes service whose addresses are added to a generated certificate.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServiceReference {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A target namespace the generated secret is copied to.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SecretCopy {
    pub name: String,
    pub namespace: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Update {
    #[serde(default)]
    pub canaries: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<IntOrString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary_watch_time: Option<IntOrString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_watch_time: Option<IntOrString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_strategy: Option<String>,
}

/// Only the watch times and the serial flag are inherited from the global update block.
impl Merge for Update {
    fn merge(&mut self, defaults: &Self) {
        self.canary_watch_time.merge(&defaults.canary_watch_time);
        self.update_watch_time.merge(&defaults.update_watch_time);
        self.serial.merge(&defaults.serial);
    }
}

/// The stemcell a job runs on, either pinned by its release or taken from its instance group.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct JobStemcell<'a> {
    pub release: &'a Release,
    pub os: &'a str,
    pub version: &'a str,
}

impl JobStemcell<'_> {
    /// The image tag of the release, e.g. `ubuntu-xenial-621.5-1.2.3`.
    pub fn image_tag(&self) -> String {
        format!("{}-{}-{}", self.os, self.version, self.release.version)
    }
}

impl Manifest {
    /// Parses a manifest from its YAML representation.
    pub fn from_yaml(data: &[u8]) -> Result<Self, yaml::Error> {
        yaml::from_slice(data)
    }

    /// Serializes the manifest into its canonical, anchored YAML representation.
    pub fn to_yaml(&self) -> Result<Vec<u8>, yaml::Error> {
        yaml::to_vec(self)
    }

    /// Calculates the SHA-256 digest of the canonical YAML representation.
    pub fn content_hash(&self) -> Result<String, yaml::Error> {
        yaml::content_hash(self)
    }

    pub fn instance_group(&self, name: &str) -> Option<&InstanceGroup> {
        self.instance_groups.iter().find(|ig| ig.name == name)
    }

    pub fn release(&self, name: &str) -> Option<&Release> {
        self.releases.iter().find(|release| release.name == name)
    }

    pub fn stemcell(&self, alias: &str) -> Option<&Stemcell> {
        self.stemcells.iter().find(|stemcell| stemcell.alias == alias)
    }

    /// Resolves the release and stemcell of `job` running in `instance_group`.
    pub fn job_stemcell<'a>(
        &'a self,
        instance_group: &InstanceGroup,
        job: &Job,
    ) -> Result<JobStemcell<'a>> {
        let release = self.release(&job.release).context(ReleaseNotFoundSnafu {
            release: &job.release,
        })?;

        if let Some(pinned) = &release.stemcell {
            return Ok(JobStemcell {
                release,
                os: &pinned.os,
                version: &pinned.version,
            });
        }

        let stemcell = self
            .stemcell(&instance_group.stemcell)
            .context(StemcellNotResolvedSnafu {
                instance_group: &instance_group.name,
            })?;

        Ok(JobStemcell {
            release,
            os: &stemcell.os,
            version: &stemcell.version,
        })
    }

    fn lookup_job(
        &self,
        instance_group_name: &str,
        job_name: &str,
    ) -> Result<(&InstanceGroup, &Job)> {
        let instance_group = self.instance_group(instance_group_name).context(
            InstanceGroupNotFoundSnafu {
                instance_group: instance_group_name,
            },
        )?;
        let job = instance_group.job(job_name).context(JobNotFoundSnafu {
            job: job_name,
            instance_group: instance_group_name,
        })?;

        Ok((instance_group, job))
    }

    /// Returns the container image of a job, e.g.
    /// `docker.io/cfcontainerization/nats:ubuntu-xenial-621.5-26`.
    pub fn release_image(&self, instance_group_name: &str, job_name: &str) -> Result<String> {
        let (instance_group, job) = self.lookup_job(instance_group_name, job_name)?;
        let stemcell = self.job_stemcell(instance_group, job)?;
        let registry = stemcell
            .release
            .url
            .as_deref()
            .unwrap_or_default()
            .trim_end_matches('/');

        Ok(format!(
            "{registry}/{name}:{tag}",
            name = stemcell.release.name,
            tag = stemcell.image_tag()
        ))
    }

    /// Returns the stemcell OS a job runs on. This is used to match addon placement rules.
    pub fn job_stemcell_os(&self, instance_group_name: &str, job_name: &str) -> Result<String> {
        let (instance_group, job) = self.lookup_job(instance_group_name, job_name)?;
        let stemcell = self.job_stemcell(instance_group, job)?;
        Ok(stemcell.os.to_owned())
    }

    /// Adds a label per used release to every instance group.
    ///
    /// The value of the label changes whenever the image of the release changes, which forces
    /// pods to be rolled even if nothing else in the instance group changed.
    pub fn add_release_labels(&mut self) -> Result<()> {
        let mut labels_per_group = Vec::with_capacity(self.instance_groups.len());
        for instance_group in &self.instance_groups {
            let mut labels = Vec::with_capacity(instance_group.jobs.len());
            for job in &instance_group.jobs {
                let stemcell = self.job_stemcell(instance_group, job)?;
                labels.push((
                    format!("{RELEASE_IMAGE_LABEL_PREFIX}{}", job.release),
                    stemcell.image_tag(),
                ));
            }
            labels_per_group.push(labels);
        }

        for (instance_group, labels) in self.instance_groups.iter_mut().zip(labels_per_group) {
            instance_group.labels_mut().extend(labels);
        }

        Ok(())
    }

    /// Copies the global update block into all instance groups.
    ///
    /// Instance groups without an update block get the global one as a whole, partial blocks
    /// only inherit the fields they don't set themselves.
    pub fn propagate_update_block(&mut self) {
        let Some(global) = &self.update else {
            return;
        };

        for instance_group in &mut self.instance_groups {
            match &mut instance_group.update {
                Some(update) => update.merge(global),
                None => instance_group.update = Some(global.clone()),
            }
        }
    }

    /// Returns the link names consumed via `from` which no job provides via `as`.
    pub fn list_missing_providers(&self) -> BTreeSet<String> {
        let mut provided = BTreeSet::new();
        let mut consumed = BTreeSet::new();

        for job in self.instance_groups.iter().flat_map(|ig| &ig.jobs) {
            provided.extend(link_names(&job.provides, "as"));
            consumed.extend(link_names(&job.consumes, "from"));
        }

        consumed.retain(|name| !provided.contains(name));
        consumed
    }
}

fn link_names<'a>(
    links: &'a BTreeMap<String, Value>,
    key: &'a str,
) -> impl Iterator<Item = String> + 'a {
    links
        .values()
        .filter_map(move |link| link.get(key)?.as_str())
        .filter(|name| !name.is_empty())
        .map(ToOwned::to_owned)
}
