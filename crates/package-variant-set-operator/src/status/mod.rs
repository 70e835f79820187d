//! Status reporting for PackageVariantSets.

pub mod condition;
