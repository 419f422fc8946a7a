//! Validation of the DNS addons.
//!
//! The operator replaces BOSH DNS with Kubernetes services. The aliases configured for the
//! `bosh-dns` and `bosh-dns-aliases` addons are turned into service names later on, so they
//! need to be valid domain names.

use std::sync::LazyLock;

use bosh_manifest::{
    Manifest,
    addon::{BOSH_DNS_ADDON_NAME, BOSH_DNS_ALIASES_ADDON_NAME},
};
use const_format::concatcp;
use regex::Regex;
use serde::Deserialize;
use snafu::{ResultExt, Snafu, ensure};

const RFC_1123_LABEL_FMT: &str = "[a-zA-Z0-9]([-a-zA-Z0-9]*[a-zA-Z0-9])?";
const RFC_1123_SUBDOMAIN_FMT: &str =
    concatcp!(RFC_1123_LABEL_FMT, "(\\.", RFC_1123_LABEL_FMT, ")*");

/// This is a subdomain's max length in DNS (RFC 1123)
const DOMAIN_MAX_LENGTH: usize = 253;
/// Same as [`RFC_1123_SUBDOMAIN_FMT`], but allows a trailing dot
const DOMAIN_FMT: &str = concatcp!(RFC_1123_SUBDOMAIN_FMT, "\\.?");

/// Wildcard aliases like `_.nats.service.cf.internal` resolve to all instances.
const WILDCARD_LABEL: &str = "_.";

static DOMAIN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{DOMAIN_FMT}$")).expect("failed to compile domain regex")
});

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read aliases of job {job:?} in addon {addon:?}"))]
    ParseAliases {
        source: serde_yaml::Error,
        addon: String,
        job: String,
    },

    #[snafu(display(
        "alias {domain:?} of job {job:?} in addon {addon:?} is not a valid domain name"
    ))]
    InvalidDomain {
        domain: String,
        addon: String,
        job: String,
    },
}

/// A DNS alias as configured in the `aliases` property of the DNS addon jobs.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct Alias {
    pub domain: String,

    #[serde(default)]
    pub targets: Vec<Target>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct Target {
    pub query: String,
    pub instance_group: String,
    pub deployment: String,
    pub network: String,
    pub domain: String,
}

/// Returns the aliases configured by the DNS addons of `manifest`.
pub fn aliases(manifest: &Manifest) -> Result<Vec<Alias>> {
    let mut aliases = Vec::new();
    let dns_addons = manifest
        .add_ons
        .iter()
        .filter(|addon| {
            [BOSH_DNS_ADDON_NAME, BOSH_DNS_ALIASES_ADDON_NAME].contains(&addon.name.as_str())
        });

    for addon in dns_addons {
        for job in &addon.jobs {
            let Some(value) = job.properties.properties.get("aliases") else {
                continue;
            };
            let job_aliases: Vec<Alias> =
                serde_yaml::from_value(value.clone()).with_context(|_| ParseAliasesSnafu {
                    addon: &addon.name,
                    job: &job.name,
                })?;

            for alias in &job_aliases {
                ensure!(
                    is_domain(&alias.domain),
                    InvalidDomainSnafu {
                        domain: &alias.domain,
                        addon: &addon.name,
                        job: &job.name,
                    }
                );
            }
            aliases.extend(job_aliases);
        }
    }

    Ok(aliases)
}

/// Validates the aliases of the DNS addons.
pub fn validate(manifest: &Manifest) -> Result<()> {
    aliases(manifest).map(|_| ())
}

fn is_domain(domain: &str) -> bool {
    let domain = domain.strip_prefix(WILDCARD_LABEL).unwrap_or(domain);
    domain.len() <= DOMAIN_MAX_LENGTH && DOMAIN_REGEX.is_match(domain)
}
