//! Command line options configuring the [`Resolver`](crate::Resolver).
//!
//! Embed [`ResolverOptions`] into the options of an application using `#[command(flatten)]`:
//!
//! ```no_run
//! use bosh_resolver::{ResolverConfig, cli::ResolverOptions};
//! use clap::Parser;
//!
//! #[derive(Parser)]
//! struct Opts {
//!     #[command(flatten)]
//!     resolver: ResolverOptions,
//! }
//!
//! let opts = Opts::parse();
//! let config = ResolverConfig::from(opts.resolver);
//! ```

use crate::ResolverConfig;

#[derive(clap::Args, Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResolverOptions {
    /// Apply ops files one by one, so errors point to the failing ops file.
    #[arg(long, env)]
    pub detailed_ops_evaluation: bool,

    /// Fail when explicit variables can't be resolved, instead of keeping their placeholders.
    #[arg(long, env)]
    pub expect_all_explicit_keys: bool,
}

impl From<ResolverOptions> for ResolverConfig {
    fn from(options: ResolverOptions) -> Self {
        Self {
            detailed_ops_evaluation: options.detailed_ops_evaluation,
            expect_all_explicit_keys: options.expect_all_explicit_keys,
        }
    }
}
