//! Command line interface of the operator.
//!
//! Every argument of the `run` subcommand can also be set with the environment variable of the
//! same name, e.g. `WATCH_NAMESPACE` or `RESYNC_INTERVAL`.

use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::{
    logging::LoggingOptions, namespace::WatchNamespace, reconcile::ReconcileOptions,
    resolver::UnsetPackagePolicy,
};

#[derive(Debug, Parser)]
#[command(author, version, about = "Operator expanding PackageVariantSets into PackageVariants")]
pub struct Opts {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Print CRD objects.
    Crd,

    /// Run the operator.
    Run(RunArguments),
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct RunArguments {
    /// Provides a specific namespace to watch (instead of watching all namespaces)
    #[arg(long, env, default_value = "")]
    pub watch_namespace: WatchNamespace,

    /// What to do with targets that name no package
    #[arg(long, env, value_enum, default_value = "upstream")]
    pub unset_package_policy: UnsetPackagePolicy,

    /// Maximum number of PackageVariant writes a single reconciliation runs at the same time
    #[arg(long, env, default_value_t = 8, value_parser = clap::value_parser!(u16).range(1..))]
    pub max_concurrent_operations: u16,

    /// Delay before a PackageVariantSet whose reconciliation failed is reconciled again
    #[arg(long, env, value_name = "DURATION", default_value = "30s", value_parser = humantime::parse_duration)]
    pub requeue_after_error: Duration,

    /// Interval after which a reconciled PackageVariantSet is reconciled again, so that changed
    /// Repositories and selected objects are picked up
    #[arg(long, env, value_name = "DURATION", default_value = "5m", value_parser = humantime::parse_duration)]
    pub resync_interval: Duration,

    // Flattened structs go last to keep the help headings correct
    #[command(flatten, next_help_heading = "Logging Options")]
    pub logging: LoggingOptions,
}

impl RunArguments {
    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            unset_package_policy: self.unset_package_policy,
            max_concurrent_operations: usize::from(self.max_concurrent_operations),
        }
    }
}
