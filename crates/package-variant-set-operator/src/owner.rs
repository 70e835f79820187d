// Modeled after the controller_ref.go file from the Kubernetes apimachinery package

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use snafu::{OptionExt, Snafu};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cannot build an owner reference for an object without name and uid"))]
    OwnerMissingIdentity,
}

/// Returns a reference to the controller of the passed in resource if it exists.
pub fn get_controller_of<T>(resource: &T) -> Option<&OwnerReference>
where
    T: Resource,
{
    resource
        .meta()
        .owner_references
        .as_ref()
        .and_then(|owners| {
            owners
                .iter()
                .find(|owner| matches!(owner.controller, Some(true)))
        })
}

/// This returns `false` for Resources that have no OwnerReference (with a Controller flag)
/// or where the Controller does not have the same `uid` as the passed in `owner_uid`.
/// If however the `uid` exists and matches we return `true`.
pub fn is_controlled_by<T>(resource: &T, owner_uid: &str) -> bool
where
    T: Resource,
{
    let controller = get_controller_of(resource);
    matches!(controller, Some(OwnerReference { uid, .. }) if uid == owner_uid)
}

/// Builds the controller reference which marks an object as owned by `owner`.
///
/// The reference blocks deletion of `owner` in foreground deletion until the object is gone.
pub fn controller_reference<T>(owner: &T) -> Result<OwnerReference>
where
    T: Resource<DynamicType = ()>,
{
    let reference = owner
        .controller_owner_ref(&())
        .context(OwnerMissingIdentitySnafu)?;
    Ok(OwnerReference {
        block_owner_deletion: Some(true),
        ..reference
    })
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;

    use super::*;
    use crate::crd::{PackageVariant, PackageVariantSet};

    fn variant_set(uid: Option<&str>) -> PackageVariantSet {
        let mut set = PackageVariantSet::new("edge", Default::default());
        set.metadata.namespace = Some("default".to_owned());
        set.metadata.uid = uid.map(ToOwned::to_owned);
        set
    }

    fn variant(owner_references: Vec<OwnerReference>) -> PackageVariant {
        PackageVariant {
            metadata: ObjectMeta {
                name: Some("edge-edge-1-ns-a".to_owned()),
                owner_references: Some(owner_references),
                ..ObjectMeta::default()
            },
            spec: Default::default(),
        }
    }

    #[test]
    fn controller_reference_of_variant_set() {
        let reference =
            controller_reference(&variant_set(Some("1234"))).expect("set has name and uid");

        assert_eq!(reference.api_version, "config.porch.kpt.dev/v1alpha1");
        assert_eq!(reference.kind, "PackageVariantSet");
        assert_eq!(reference.name, "edge");
        assert_eq!(reference.uid, "1234");
        assert_eq!(reference.controller, Some(true));
        assert_eq!(reference.block_owner_deletion, Some(true));
    }

    #[test]
    fn controller_reference_requires_uid() {
        assert!(controller_reference(&variant_set(None)).is_err());
    }

    #[test]
    fn ownership_is_decided_by_controller_uid() {
        let reference =
            controller_reference(&variant_set(Some("1234"))).expect("set has name and uid");
        let not_controller = OwnerReference {
            controller: None,
            ..reference.clone()
        };

        assert!(is_controlled_by(&variant(vec![reference.clone()]), "1234"));
        assert!(!is_controlled_by(&variant(vec![reference]), "5678"));
        assert!(!is_controlled_by(&variant(vec![not_controller]), "1234"));
        assert!(!is_controlled_by(&variant(Vec::new()), "1234"));
    }
}
