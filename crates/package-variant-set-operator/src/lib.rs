//! Expands PackageVariantSets into one PackageVariant per resolved target.
//!
//! A reconciliation pass resolves the targets of a set ([`resolver`]), renders the template of
//! each target into a PackageVariant spec ([`render`]) and converges the PackageVariants owned by
//! the set towards the rendered ones ([`reconcile`]). The [`controller`] runs passes whenever a
//! set or one of its PackageVariants changes.

pub mod cli;
pub mod client;
pub mod controller;
pub mod crd;
pub mod expression;
pub mod logging;
pub mod namespace;
pub mod naming;
pub mod owner;
pub mod reconcile;
pub mod render;
pub mod resolver;
pub mod selector;
pub mod status;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
