//! Template Packager / Validator
//!
//! A template is a directory with a `manifest.yaml` and optional
//! `migrations/`, `functions/` and `assets/` directories. Templates are
//! shipped as gzip tarballs with a SHA-256 sidecar file.

pub mod archive;
pub mod manifest;

pub use archive::{install, package, sha256_file, PackageInfo};
pub use manifest::{TemplateContents, TemplateManifest, MANIFEST_FILE};

use crate::error::AppResult;
use std::cmp::Ordering;
use std::path::Path;

/// Version of this build, compared against `minPlatformVersion`
pub const PLATFORM_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Load the manifest and check that every declared directory exists
pub fn validate_dir(dir: &Path) -> AppResult<TemplateManifest> {
    let manifest = TemplateManifest::load(dir)?;
    manifest.check_contents(dir)?;
    Ok(manifest)
}

fn segments(version: &str) -> Vec<u64> {
    version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

/// Dotted ordinal comparison; missing segments count as 0, so `1.2 == 1.2.0`
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (a, b) = (segments(a), segments(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("2", "10.0"), Ordering::Less);
        assert_eq!(compare_versions("v2.0.1", "2.0.0-rc1"), Ordering::Greater);
    }
}
