//! Re-verification of uploaded drafts against the local package.
//!
//! Every file the repository reports for a draft is hashed locally with the
//! algorithm of its checksum. Mismatches are collected rather than raised so
//! a single run reports the state of the whole tree.

use crate::{
    models::{metadata::HAS_PART, report::Report},
    services::{
        checksum::verify_file,
        file_keys,
        repository::{Repository, RepositoryResult, record_id_from_url},
    },
};
use std::{collections::HashSet, path::Path};
use tracing::{debug, warn};

const FUNCTION: &str = "Integrity";

pub struct IntegrityValidator<'a> {
    repo: &'a dyn Repository,
    package: &'a Path,
}

impl<'a> IntegrityValidator<'a> {
    pub fn new(repo: &'a dyn Repository, package: &'a Path) -> Self {
        Self { repo, package }
    }

    /// Verify the draft `id` and every `haspart` descendant, each once.
    ///
    /// Remote failures are errors; checksum problems make the result `false`.
    pub async fn verify(&self, id: &str, report: &mut Report) -> RepositoryResult<bool> {
        let mut all_ok = true;
        let mut visited = HashSet::new();
        let mut pending = vec![id.to_string()];

        while let Some(id) = pending.pop() {
            if !visited.insert(id.clone()) {
                debug!("record {} already verified", id);
                continue;
            }
            let manifest = self.repo.list_draft_files(&id).await?;
            let mut failed = Vec::new();
            for (key, checksum) in manifest.checksums() {
                if !self.file_matches(key, checksum).await {
                    failed.push(key.to_string());
                }
            }
            if failed.is_empty() {
                report.add_correct(FUNCTION, format!("Validated record {}", id));
            } else {
                warn!("record {} failed verification: {:?}", id, failed);
                report.add_critical(
                    FUNCTION,
                    format!("Checksum mismatch in record {}: {}", id, failed.join(", ")),
                );
                all_ok = false;
            }

            let draft = self.repo.get_draft(&id).await?;
            let mut children = Vec::new();
            for url in draft.metadata.related_of(HAS_PART) {
                match record_id_from_url(url) {
                    Some(child) => children.push(child.to_string()),
                    None => report.add_warning(
                        FUNCTION,
                        format!("Ignoring part relation of {} without record id: {}", id, url),
                    ),
                }
            }
            // reversed so that children are verified in relation order
            pending.extend(children.into_iter().rev());
        }
        Ok(all_ok)
    }

    async fn file_matches(&self, key: &str, checksum: Option<&str>) -> bool {
        let Some(checksum) = checksum else {
            debug!("{} has no checksum", key);
            return false;
        };
        let Ok(relative) = file_keys::to_relative_path(key) else {
            debug!("{} does not decode to a package path", key);
            return false;
        };
        match verify_file(&self.package.join(relative), checksum).await {
            Ok(matches) => matches,
            Err(err) => {
                debug!("{} could not be verified: {}", key, err);
                false
            }
        }
    }
}
