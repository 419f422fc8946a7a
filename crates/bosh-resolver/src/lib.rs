//! Resolution of `BOSHDeployment` resources into desired BOSH manifests.
//!
//! The [`Resolver`] fetches the manifest and ops files referenced by a deployment, applies the
//! ops files, interpolates implicit and explicit variables from secrets and applies addons.
//! The Kubernetes side is hidden behind the [`fetch::ResourceFetcher`] and
//! [`secret::SecretStore`] traits, ops files and variables are evaluated by a
//! [`evaluator::TemplateEvaluator`].

pub mod cli;
pub mod crd;
pub mod dns;
pub mod evaluator;
pub mod fetch;
pub mod logging;
pub mod resolver;
pub mod secret;

pub use resolver::{Resolver, ResolverConfig};
