//! Structural BagIt validation run before anything is sent to the repository.
//!
//! [`BagItValidator`] checks the declaration, the payload directory and every
//! `manifest-<alg>.txt`: listed files must exist with matching digests, and
//! every payload file must be listed. Tag manifests, `fetch.txt` and the
//! payload oxum are not looked at.

use crate::{
    models::report::Report,
    services::{
        checksum::{DigestAlgorithm, file_digest},
        mapping_service::list_files,
    },
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::{
    collections::BTreeSet,
    path::{Component, Path, PathBuf},
};
use tracing::{debug, info};

const FUNCTION: &str = "BagValidator";

#[async_trait]
pub trait BagValidator: Send + Sync {
    /// Returns `Ok(false)` for an invalid bag; problems are written to `report`.
    async fn validate(&self, package: &Path, report: &mut Report) -> Result<bool>;
}

#[derive(Clone, Debug, Default)]
pub struct BagItValidator;

#[async_trait]
impl BagValidator for BagItValidator {
    async fn validate(&self, package: &Path, report: &mut Report) -> Result<bool> {
        info!("Validating bag {}", package.display());
        let mut valid = true;

        match tokio::fs::read_to_string(package.join("bagit.txt")).await {
            Ok(declaration) if declaration.lines().any(|l| l.starts_with("BagIt-Version:")) => {}
            Ok(_) => {
                report.add_critical(FUNCTION, "bagit.txt lacks a BagIt-Version declaration");
                valid = false;
            }
            Err(_) => {
                report.add_critical(FUNCTION, "Missing bag declaration bagit.txt");
                valid = false;
            }
        }

        let data_dir = package.join("data");
        if !data_dir.is_dir() {
            report.add_critical(FUNCTION, "Missing payload directory data/");
            return Ok(false);
        }

        let manifests = payload_manifests(package)?;
        if manifests.is_empty() {
            report.add_critical(FUNCTION, "No payload manifest found");
            return Ok(false);
        }

        let payload: BTreeSet<PathBuf> = list_files(&data_dir)?
            .into_iter()
            .filter_map(|p| p.strip_prefix(package).ok().map(Path::to_path_buf))
            .collect();

        for (algorithm, manifest) in manifests {
            let Some(algorithm) = algorithm else {
                report.add_warning(
                    FUNCTION,
                    format!("Skipping manifest with unsupported algorithm: {}", manifest.display()),
                );
                continue;
            };
            valid &= check_manifest(package, &manifest, algorithm, &payload, report).await?;
        }

        if valid {
            report.add_correct(FUNCTION, format!("Bag {} is valid", package.display()));
        }
        Ok(valid)
    }
}

/// `manifest-<alg>.txt` files of the bag with their parsed algorithm.
fn payload_manifests(package: &Path) -> Result<Vec<(Option<DigestAlgorithm>, PathBuf)>> {
    let mut manifests = Vec::new();
    let entries = std::fs::read_dir(package)
        .with_context(|| format!("listing bag directory {}", package.display()))?;
    for entry in entries {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(alg) = name
            .strip_prefix("manifest-")
            .and_then(|rest| rest.strip_suffix(".txt"))
        {
            manifests.push((alg.parse().ok(), path));
        }
    }
    manifests.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(manifests)
}

async fn check_manifest(
    package: &Path,
    manifest: &Path,
    algorithm: DigestAlgorithm,
    payload: &BTreeSet<PathBuf>,
    report: &mut Report,
) -> Result<bool> {
    let content = tokio::fs::read_to_string(manifest)
        .await
        .with_context(|| format!("reading manifest {}", manifest.display()))?;
    let name = manifest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut valid = true;
    let mut listed = BTreeSet::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let Some((digest, raw_path)) = line.trim_end().split_once(char::is_whitespace) else {
            report.add_critical(FUNCTION, format!("{}:{}: malformed line", name, lineno + 1));
            valid = false;
            continue;
        };
        let relative = PathBuf::from(decode_manifest_path(raw_path.trim_start()));
        if !is_payload_path(&relative) {
            report.add_critical(
                FUNCTION,
                format!("{}:{}: path outside payload: {}", name, lineno + 1, relative.display()),
            );
            valid = false;
            continue;
        }

        let local = package.join(&relative);
        match file_digest(&local, algorithm).await {
            Ok(actual) if actual.eq_ignore_ascii_case(digest) => {
                debug!("{} verified against {}", relative.display(), name);
            }
            Ok(_) => {
                report.add_critical(
                    FUNCTION,
                    format!("Checksum mismatch for {} in {}", relative.display(), name),
                );
                valid = false;
            }
            Err(_) => {
                report.add_critical(
                    FUNCTION,
                    format!("File listed in {} is missing: {}", name, relative.display()),
                );
                valid = false;
            }
        }
        listed.insert(relative);
    }

    for unlisted in payload.difference(&listed) {
        report.add_critical(
            FUNCTION,
            format!("Payload file not listed in {}: {}", name, unlisted.display()),
        );
        valid = false;
    }
    Ok(valid)
}

/// Undo the percent-encoding BagIt applies to CR, LF and `%` in manifest paths.
/// `data/...` made of plain components only.
fn is_payload_path(relative: &Path) -> bool {
    let mut components = relative.components();
    matches!(components.next(), Some(Component::Normal(first)) if first == "data")
        && components.all(|c| matches!(c, Component::Normal(_)))
}

fn decode_manifest_path(raw: &str) -> String {
    raw.replace("%0A", "\n")
        .replace("%0a", "\n")
        .replace("%0D", "\r")
        .replace("%0d", "\r")
        .replace("%25", "%")
}
