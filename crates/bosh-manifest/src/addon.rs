//! Addons inject jobs into every instance group matching their placement rules.
//!
//! A rule set constrains any combination of the stemcell OS, deployment, jobs, instance
//! group, networks, teams and lifecycle. Every dimension which is set needs to match, unset
//! dimensions don't filter. An addon is applied to an instance group if it matches the
//! `include` rules (all instance groups if unset) and doesn't match the `exclude` rules (no
//! instance group if unset).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::{
    instance_group::{InstanceGroup, InstanceGroupType, Job, JobProperties},
    is_default,
    manifest::{self, Manifest},
};

/// Name of the BOSH DNS addon, which is handled by the operator itself and never injected.
pub const BOSH_DNS_ADDON_NAME: &str = "bosh-dns";

/// Name of the addon configuring DNS aliases.
pub const BOSH_DNS_ALIASES_ADDON_NAME: &str = "bosh-dns-aliases";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "failed to evaluate {rule} rules of addon {addon:?} for instance group {instance_group:?}"
    ))]
    EvaluatePlacement {
        source: manifest::Error,
        rule: RuleKind,
        addon: String,
        instance_group: String,
    },
}

#[derive(Clone, Copy, Debug, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum RuleKind {
    Include,
    Exclude,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct AddOn {
    pub name: String,

    #[serde(default)]
    pub jobs: Vec<AddOnJob>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<PlacementRules>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<PlacementRules>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct AddOnJob {
    pub name: String,
    pub release: String,

    #[serde(default, skip_serializing_if = "is_default")]
    pub properties: JobProperties,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub consumes: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provides: BTreeMap<String, Value>,
}

impl AddOnJob {
    /// Creates the job injected into an instance group, marked as coming from an addon.
    fn to_job(&self) -> Job {
        let mut properties = self.properties.clone();
        properties.operator.is_addon = true;

        Job {
            name: self.name.clone(),
            release: self.release.clone(),
            consumes: self.consumes.clone(),
            provides: self.provides.clone(),
            properties,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PlacementRules {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stemcell: Vec<PlacementStemcell>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployments: Vec<String>,

    #[serde(default, alias = "release", skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<PlacementJob>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_groups: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teams: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<InstanceGroupType>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PlacementStemcell {
    pub os: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PlacementJob {
    pub name: String,
    pub release: String,
}

/// Facts about the deployment which are not part of the manifest itself.
#[derive(Clone, Debug, Default)]
pub struct PlacementContext {
    pub deployment_name: String,
    pub teams: Vec<String>,
}

impl PlacementRules {
    /// Returns whether all dimensions set in the rules match `instance_group`.
    pub fn matches(
        &self,
        manifest: &Manifest,
        instance_group: &InstanceGroup,
        context: &PlacementContext,
    ) -> Result<bool, manifest::Error> {
        if !self.stemcell.is_empty() {
            let mut matched = false;
            for job in &instance_group.jobs {
                let os = manifest.job_stemcell(instance_group, job)?.os;
                if self.stemcell.iter().any(|stemcell| stemcell.os == os) {
                    matched = true;
                    break;
                }
            }
            if !matched {
                return Ok(false);
            }
        }

        if !self.jobs.is_empty()
            && !instance_group.jobs.iter().any(|job| {
                self.jobs
                    .iter()
                    .any(|rule| rule.name == job.name && rule.release == job.release)
            })
        {
            return Ok(false);
        }

        if !self.instance_groups.is_empty() && !self.instance_groups.contains(&instance_group.name)
        {
            return Ok(false);
        }

        if !self.networks.is_empty()
            && !instance_group
                .networks
                .iter()
                .any(|network| self.networks.contains(&network.name))
        {
            return Ok(false);
        }

        if !self.deployments.is_empty() && !self.deployments.contains(&context.deployment_name) {
            return Ok(false);
        }

        if !self.teams.is_empty() && !context.teams.iter().any(|team| self.teams.contains(team))
        {
            return Ok(false);
        }

        Ok(self
            .lifecycle
            .is_none_or(|lifecycle| lifecycle.effective() == instance_group.lifecycle.effective()))
    }
}

impl Manifest {
    /// Injects the jobs of all addons into the instance groups matching their placement rules.
    ///
    /// This only ever happens once per manifest, later calls are no-ops.
    pub fn apply_addons(&mut self, context: &PlacementContext) -> Result<()> {
        if self.addons_applied {
            debug!("Addons have already been applied, skipping");
            return Ok(());
        }

        // Addons are evaluated one after another, later addons see the jobs injected before.
        let add_ons = std::mem::take(&mut self.add_ons);
        let instance_groups = self.instance_groups.clone();
        let applied = add_ons
            .iter()
            .filter(|addon| addon.name != BOSH_DNS_ADDON_NAME)
            .try_for_each(|addon| self.apply_addon(addon, context));
        self.add_ons = add_ons;

        if let Err(err) = applied {
            // Jobs of the addons applied before the failing one must not stay injected.
            self.instance_groups = instance_groups;
            return Err(err);
        }

        self.addons_applied = true;
        Ok(())
    }

    fn apply_addon(&mut self, addon: &AddOn, context: &PlacementContext) -> Result<()> {
        let mut targets = Vec::new();
        for (index, instance_group) in self.instance_groups.iter().enumerate() {
            if self.addon_matches(addon, instance_group, context)? {
                targets.push(index);
            } else {
                debug!(
                    "Addon {:?} doesn't match instance group {:?}",
                    addon.name, instance_group.name
                );
            }
        }

        let jobs: Vec<Job> = addon.jobs.iter().map(AddOnJob::to_job).collect();
        for index in targets {
            let instance_group = &mut self.instance_groups[index];
            for job in &jobs {
                debug!(
                    "Applying addon job {}/{} to instance group {:?}",
                    addon.name, job.name, instance_group.name
                );
            }
            instance_group.jobs.extend(jobs.iter().cloned());
        }

        Ok(())
    }

    fn addon_matches(
        &self,
        addon: &AddOn,
        instance_group: &InstanceGroup,
        context: &PlacementContext,
    ) -> Result<bool> {
        let include = match &addon.include {
            Some(rules) => rules
                .matches(self, instance_group, context)
                .context(EvaluatePlacementSnafu {
                    rule: RuleKind::Include,
                    addon: &addon.name,
                    instance_group: &instance_group.name,
                })?,
            None => true,
        };
        let exclude = match &addon.exclude {
            Some(rules) => rules
                .matches(self, instance_group, context)
                .context(EvaluatePlacementSnafu {
                    rule: RuleKind::Exclude,
                    addon: &addon.name,
                    instance_group: &instance_group.name,
                })?,
            None => false,
        };

        Ok(include && !exclude)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;

    fn manifest(addons: &str) -> Manifest {
        let mut yaml = indoc! {"
            name: cf
            releases:
            - name: capi
              version: '1'
              url: docker.io/cf
            - name: nats
              version: '2'
              url: docker.io/cf
            - name: os-conf
              version: '3'
              url: docker.io/cf
              stemcell:
                os: opensuse
                version: '15'
            stemcells:
            - alias: default
              os: ubuntu-xenial
              version: '621'
            instance_groups:
            - name: web
              stemcell: default
              networks:
              - name: public
              jobs:
              - name: cloud_controller
                release: capi
            - name: nats
              stemcell: default
              lifecycle: service
              networks:
              - name: private
              jobs:
              - name: nats
                release: nats
            - name: smoke-tests
              stemcell: default
              lifecycle: errand
              jobs:
              - name: smoke_tests
                release: capi
        "}
        .to_owned();
        yaml.push_str(addons);
        Manifest::from_yaml(yaml.as_bytes()).expect("test YAML is valid")
    }

    fn job_names(manifest: &Manifest, instance_group: &str) -> Vec<String> {
        manifest
            .instance_group(instance_group)
            .unwrap()
            .jobs
            .iter()
            .map(|job| job.name.clone())
            .collect()
    }

    fn context() -> PlacementContext {
        PlacementContext {
            deployment_name: "cf".to_owned(),
            teams: vec!["platform".to_owned()],
        }
    }

    fn has_addon(manifest: &Manifest, instance_group: &str) -> bool {
        job_names(manifest, instance_group).contains(&"user_add".to_owned())
    }

    #[test]
    fn include_only_injects_into_matching_groups() {
        let mut manifest = manifest(indoc! {"
            addons:
            - name: os-configuration
              jobs:
              - name: user_add
                release: os-conf
                properties:
                  users:
                  - name: admin
              include:
                instance_groups: [web]
        "});
        manifest.apply_addons(&context()).unwrap();

        assert_eq!(job_names(&manifest, "web"), ["cloud_controller", "user_add"]);
        assert_eq!(job_names(&manifest, "nats"), ["nats"]);
        assert_eq!(job_names(&manifest, "smoke-tests"), ["smoke_tests"]);

        let injected = &manifest.instance_group("web").unwrap().jobs[1];
        assert!(injected.properties.operator.is_addon);
        assert!(injected.properties.properties.contains_key("users"));
        assert!(manifest.addons_applied);
    }

    #[test]
    fn exclude_removes_matching_groups() {
        let mut manifest = manifest(indoc! {"
            addons:
            - name: os-configuration
              jobs:
              - name: user_add
                release: os-conf
              exclude:
                instance_groups: [web]
        "});
        manifest.apply_addons(&context()).unwrap();

        assert!(!has_addon(&manifest, "web"));
        assert!(has_addon(&manifest, "nats"));
        assert!(has_addon(&manifest, "smoke-tests"));
    }

    #[test]
    fn applying_addons_twice_is_a_noop() {
        let mut manifest = manifest(indoc! {"
            addons:
            - name: os-configuration
              jobs:
              - name: user_add
                release: os-conf
        "});
        manifest.apply_addons(&context()).unwrap();
        let applied = manifest.clone();

        manifest.apply_addons(&context()).unwrap();
        assert_eq!(manifest, applied);
        assert_eq!(job_names(&manifest, "nats"), ["nats", "user_add"]);
    }

    #[test]
    fn bosh_dns_addon_is_skipped() {
        let mut manifest = manifest(indoc! {"
            addons:
            - name: bosh-dns
              jobs:
              - name: user_add
                release: os-conf
        "});
        manifest.apply_addons(&context()).unwrap();

        assert!(!has_addon(&manifest, "web"));
        assert!(manifest.addons_applied);
    }

    #[rstest]
    #[case::stemcell("stemcell: [{os: ubuntu-xenial}]", &[true, true, true])]
    #[case::other_stemcell("stemcell: [{os: opensuse}]", &[false, false, false])]
    #[case::jobs("jobs: [{name: nats, release: nats}]", &[false, true, false])]
    #[case::jobs_wrong_release("jobs: [{name: nats, release: capi}]", &[false, false, false])]
    #[case::legacy_jobs_key("release: [{name: smoke_tests, release: capi}]", &[false, false, true])]
    #[case::networks("networks: [private, other]", &[false, true, false])]
    #[case::deployments("deployments: [cf]", &[true, true, true])]
    #[case::other_deployments("deployments: [diego]", &[false, false, false])]
    #[case::teams("teams: [platform, security]", &[true, true, true])]
    #[case::other_teams("teams: [security]", &[false, false, false])]
    #[case::service_lifecycle("lifecycle: service", &[true, true, false])]
    #[case::errand_lifecycle("lifecycle: errand", &[false, false, true])]
    #[case::combined("{instance_groups: [web, nats], networks: [public]}", &[true, false, false])]
    #[case::empty("{}", &[true, true, true])]
    fn include_rule_dimensions(#[case] rules: &str, #[case] expected: &[bool]) {
        let mut manifest = manifest(&format!(
            "addons:\n- name: os-configuration\n  jobs:\n  - name: user_add\n    release: os-conf\n  include:\n    {rules}\n"
        ));
        manifest.apply_addons(&context()).unwrap();

        let actual: Vec<bool> = ["web", "nats", "smoke-tests"]
            .iter()
            .map(|ig| has_addon(&manifest, ig))
            .collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn unresolvable_stemcell_aborts_placement() {
        let mut manifest = manifest(indoc! {"
            addons:
            - name: os-configuration
              jobs:
              - name: user_add
                release: os-conf
              include:
                stemcell:
                - os: ubuntu-xenial
        "});
        manifest.instance_groups[1].stemcell = "unknown".to_owned();

        let err = manifest.apply_addons(&context()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to evaluate include rules of addon \"os-configuration\" for instance group \"nats\""
        );
        assert!(!manifest.addons_applied);
    }

    #[test]
    fn unresolvable_stemcell_in_exclude_rules_aborts_placement() {
        let mut manifest = manifest(indoc! {"
            addons:
            - name: os-configuration
              jobs:
              - name: user_add
                release: os-conf
              include:
                instance_groups: [web]
              exclude:
                stemcell:
                - os: ubuntu-trusty
        "});
        manifest.instance_groups[1].stemcell = "unknown".to_owned();

        let err = manifest.apply_addons(&context()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to evaluate exclude rules of addon \"os-configuration\" for instance group \"nats\""
        );
        assert!(!has_addon(&manifest, "web"));
    }

    #[test]
    fn failed_placement_leaves_instance_groups_untouched() {
        let mut manifest = manifest(indoc! {"
            addons:
            - name: first
              jobs:
              - name: injected
                release: os-conf
              include:
                instance_groups: [web]
            - name: second
              jobs:
              - name: other
                release: os-conf
              include:
                stemcell:
                - os: ubuntu-xenial
        "});
        manifest.instance_groups[1].stemcell = "unknown".to_owned();

        assert!(manifest.apply_addons(&context()).is_err());
        assert_eq!(job_names(&manifest, "web"), ["cloud_controller"]);
        assert!(!manifest.addons_applied);

        manifest.instance_groups[1].stemcell = "default".to_owned();
        manifest.apply_addons(&context()).unwrap();

        assert_eq!(
            job_names(&manifest, "web"),
            ["cloud_controller", "injected", "other"]
        );
        assert_eq!(job_names(&manifest, "nats"), ["nats", "other"]);
        assert!(manifest.addons_applied);
    }
}
