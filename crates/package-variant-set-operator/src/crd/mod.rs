//! Custom resource types read and written by the operator.
//!
//! Only [`PackageVariantSet`] is owned by this operator. [`PackageVariant`] and [`Repository`]
//! belong to Porch and are modelled with the fields the operator reads or writes.

use std::io::Write;

use snafu::{ResultExt, Snafu};

pub mod pipeline;
pub mod repository;
pub mod variant;
pub mod variant_set;

pub use repository::{Repository, RepositorySpec};
pub use variant::{PackageVariant, PackageVariantSpec};
pub use variant_set::{PackageVariantSet, PackageVariantSetSpec, PackageVariantSetStatus};

/// Label put on every PackageVariant created for a PackageVariantSet, set to the name of the set.
pub const VARIANT_SET_LABEL: &str = "config.porch.kpt.dev/packagevariantset";

/// Finalizer which keeps a PackageVariantSet around until its PackageVariants are retracted.
pub const FINALIZER_NAME: &str = "config.porch.kpt.dev/packagevariantset";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize CRD to YAML"))]
    SerializeYaml { source: serde_yaml::Error },

    #[snafu(display("failed to write CRD YAML schema to stdout"))]
    WriteToStdout { source: std::io::Error },
}

/// Provides YAML schema generation and output capabilities for Kubernetes custom resources.
pub trait CustomResourceExt: kube::CustomResourceExt {
    /// Generates the YAML schema of a `CustomResourceDefinition` and returns it as a [`String`].
    ///
    /// The returned string is an explicit document with leading dashes (`---`).
    fn yaml_schema() -> Result<String> {
        let schema = serde_yaml::to_string(&Self::crd()).context(SerializeYamlSnafu)?;
        Ok(format!("---\n{schema}"))
    }

    /// Generates the YAML schema of a `CustomResourceDefinition` and prints it to [stdout].
    ///
    /// [stdout]: std::io::stdout
    fn print_yaml_schema() -> Result<()> {
        let schema = Self::yaml_schema()?;
        std::io::stdout()
            .lock()
            .write_all(schema.as_bytes())
            .context(WriteToStdoutSnafu)
    }
}

impl<T> CustomResourceExt for T where T: kube::CustomResourceExt {}
