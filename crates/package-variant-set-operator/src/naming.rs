//! Deterministic names for the PackageVariants of a PackageVariantSet.

use sha2::{Digest, Sha256};

use crate::render::VariantIdentity;

/// PackageVariant names are kept short enough to be used as label values.
pub const MAX_NAME_LENGTH: usize = 63;

const HASH_LENGTH: usize = 10;

/// Returns the name of the PackageVariant for `identity` owned by the set named `set_name`.
///
/// The name is `{set}-{repo}-{package}`, lower-cased, with invalid characters replaced by `-`,
/// cut to fit and followed by a hash of the unmodified input. The joined parts alone are
/// ambiguous (`a-b` + `c` and `a` + `b-c`), the hash is what keeps the names of distinct
/// identities apart.
pub fn variant_name(set_name: &str, identity: &VariantIdentity) -> String {
    let sanitized = sanitize(&format!("{set_name}-{}-{}", identity.repo, identity.package));

    let digest = Sha256::digest(format!("{set_name}/{}/{}", identity.repo, identity.package));
    let hash = format!("{digest:x}");

    let prefix_length = MAX_NAME_LENGTH - HASH_LENGTH - 1;
    let prefix = sanitized[..sanitized.len().min(prefix_length)].trim_end_matches(['-', '.']);

    if prefix.is_empty() {
        hash[..HASH_LENGTH].to_owned()
    } else {
        format!("{prefix}-{}", &hash[..HASH_LENGTH])
    }
}

/// Lower-cases `name`, replaces everything but alphanumerics, `-` and `.` with `-` and strips
/// non-alphanumeric characters from both ends.
fn sanitize(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '-' | '.') => c,
            _ => '-',
        })
        .collect();

    replaced
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_owned()
}
