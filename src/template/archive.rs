//! Template archives (`.tar.gz` + `.sha256`)

use super::compare_versions;
use super::manifest::{TemplateManifest, MANIFEST_FILE};
use crate::error::{manifest_error, AppError, AppResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    pub path: PathBuf,
    pub checksum: String,
    pub size_bytes: u64,
}

pub fn sha256_file(path: &Path) -> AppResult<String> {
    let bytes = fs::read(path)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

fn checksum_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Validate `dir` and write `out` plus `<out>.sha256`
pub fn package(dir: &Path, out: &Path) -> AppResult<PackageInfo> {
    let manifest = super::validate_dir(dir)?;

    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let encoder = GzEncoder::new(File::create(out)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_path_with_name(dir.join(MANIFEST_FILE), MANIFEST_FILE)?;
    for (name, _) in manifest.contents.declared() {
        builder.append_dir_all(name, dir.join(name))?;
    }
    builder.into_inner()?.finish()?;

    let checksum = sha256_file(out)?;
    let file_name = out
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    fs::write(checksum_path(out), format!("{}  {}\n", checksum, file_name))?;

    let size_bytes = fs::metadata(out)?.len();
    info!("Packaged template {} -> {} ({} bytes)", manifest.name, out.display(), size_bytes);
    Ok(PackageInfo {
        path: out.to_path_buf(),
        checksum,
        size_bytes,
    })
}

fn open(archive: &Path) -> AppResult<tar::Archive<GzDecoder<File>>> {
    Ok(tar::Archive::new(GzDecoder::new(File::open(archive)?)))
}

/// Read `manifest.yaml` out of the archive without extracting anything
fn read_manifest(archive: &Path) -> AppResult<TemplateManifest> {
    let mut tar = open(archive)?;
    for entry in tar.entries()? {
        let mut entry = entry?;
        let is_manifest = {
            let path = entry.path()?;
            path.as_ref() == Path::new(MANIFEST_FILE) || path.as_ref() == Path::new("./manifest.yaml")
        };
        if is_manifest {
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            return TemplateManifest::parse(&text);
        }
    }
    Err(manifest_error(format!("Archive {} has no {}", archive.display(), MANIFEST_FILE)))
}

/// Verify, check compatibility, then extract into `dest`.
///
/// `expected_sha256` may be a bare hex digest or a `sha256sum` line.
pub fn install(archive: &Path, expected_sha256: &str, dest: &Path, platform_version: &str) -> AppResult<TemplateManifest> {
    let expected = expected_sha256
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase();
    let actual = sha256_file(archive)?;
    if expected != actual {
        return Err(AppError::ChecksumMismatch { expected, actual });
    }

    let manifest = read_manifest(archive)?;
    if let Some(required) = &manifest.min_platform_version {
        if compare_versions(required, platform_version) == Ordering::Greater {
            return Err(AppError::VersionIncompatible {
                required: required.clone(),
                current: platform_version.to_string(),
            });
        }
    }

    fs::create_dir_all(dest)?;
    let mut tar = open(archive)?;
    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_path_buf();
        if !entry.unpack_in(dest)? {
            return Err(manifest_error(format!(
                "Archive entry {} escapes the install directory",
                path.display()
            )));
        }
        debug!("Extracted {}", path.display());
    }

    let installed = super::validate_dir(dest)?;
    info!("Installed template {} into {}", installed.name, dest.display());
    Ok(installed)
}
