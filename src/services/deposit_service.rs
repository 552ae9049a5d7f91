//! Deposit orchestration.
//!
//! A deposit validates the package, takes the global gate, uploads the record
//! tree plus a preservation record, cross-links them, verifies every checksum
//! and then publishes all drafts. Any failure after the first draft exists
//! deletes every draft of the attempt again, newest first.

use crate::{
    errors::DepositError,
    models::{mapping::MapRecord, record::RecordQuery, report::Report},
    services::{
        bag_validator::{BagItValidator, BagValidator},
        doi::DoiRegistrar,
        gate::DepositGate,
        integrity::IntegrityValidator,
        journal::{AttemptStatus, Journal},
        link_fixer::link_preservation,
        mapping_service::{PackageLayout, load_mapping, validate_mapping},
        metadata_reader::{JsonMetadataReader, MetadataReader},
        repository::{LISTING_PAGE_SIZE, Repository},
        uploader::{DEFAULT_PRESERVATION_CREATOR, RecordUploader},
    },
};
use chrono::Utc;
use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const FUNCTION: &str = "Deposit";

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(600);

/// A `running` attempt whose heartbeat is older than this is considered dead.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(600);

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepositState {
    Idle,
    Validating,
    Locked,
    Uploading,
    Verifying,
    Publishing,
    Done,
    RolledBack,
    Failed,
}

impl fmt::Display for DepositState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn advance(state: &mut DepositState, next: DepositState) {
    info!(from = %state, to = %next, "deposit state changed");
    *state = next;
}

/// How a deposit ended. Only `Deposited` carries a record id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DepositOutcome {
    Deposited {
        root_id: String,
        preservation_id: String,
        /// False when publishing was disabled or failed for some draft.
        published: bool,
    },
    /// Bag or record map failed validation; nothing was sent.
    Rejected,
    /// The gate stayed taken; nothing was sent.
    LockUnavailable,
    /// A record with the title exists and updating was requested.
    UpdateNotImplemented { title: String },
    RolledBack {
        reason: String,
        /// False if some draft could not be deleted.
        complete: bool,
    },
}

impl DepositOutcome {
    pub fn root_id(&self) -> Option<&str> {
        match self {
            Self::Deposited { root_id, .. } => Some(root_id),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DepositOptions {
    /// Visibility of files in a synthesized record map.
    pub public_files: bool,
    pub separate_private_records: bool,
    pub update: bool,
    pub no_publish: bool,
}

/// Drafts created during one deposit run, in creation order.
///
/// While journaled, the attempt refreshes its heartbeat in the background so
/// a `cleanup` in another process can tell it is still in flight.
pub struct DepositAttempt {
    pub id: Uuid,
    drafts: Vec<String>,
    /// DOIs reserved for drafts of this attempt, still in the draft state.
    dois: Vec<String>,
    journal: Option<Journal>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Drop for DepositAttempt {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }
}

impl DepositAttempt {
    pub fn new(journal: Option<Journal>) -> Self {
        Self {
            id: Uuid::new_v4(),
            drafts: Vec::new(),
            dois: Vec::new(),
            journal,
            heartbeat: None,
        }
    }

    pub fn drafts(&self) -> &[String] {
        &self.drafts
    }

    async fn begin(&mut self, package: &Path) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(err) = journal.begin_attempt(self.id, package).await {
            warn!("journal: failed to record attempt {}: {}", self.id, err);
            return;
        }
        let journal = journal.clone();
        let id = self.id;
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = journal.heartbeat(id).await {
                    warn!("journal: failed to refresh attempt {}: {}", id, err);
                }
            }
        }));
    }

    pub async fn register(&mut self, record_id: &str) {
        self.drafts.push(record_id.to_string());
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.record_draft(self.id, record_id).await {
                warn!("journal: failed to record draft {}: {}", record_id, err);
            }
        }
    }

    async fn mark_deleted(&self, record_id: &str) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.mark_deleted(&self.id.to_string(), record_id).await {
                warn!("journal: failed to mark {} deleted: {}", record_id, err);
            }
        }
    }

    async fn mark_published(&self, record_id: &str) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.mark_published(&self.id.to_string(), record_id).await {
                warn!("journal: failed to mark {} published: {}", record_id, err);
            }
        }
    }

    async fn finish(&mut self, status: AttemptStatus) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.finish_attempt(&self.id.to_string(), status).await {
                warn!("journal: failed to close attempt {}: {}", self.id, err);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub attempts: usize,
    pub deleted: usize,
    pub failed: usize,
    /// Attempts left alone because their owner is still running.
    pub skipped: usize,
}

pub struct DepositService {
    repo: Arc<dyn Repository>,
    reader: Arc<dyn MetadataReader>,
    bag_validator: Arc<dyn BagValidator>,
    gate: DepositGate,
    journal: Option<Journal>,
    registrar: Option<Arc<dyn DoiRegistrar>>,
    layout: PackageLayout,
    lock_timeout: Duration,
    stale_after: Duration,
    preservation_creator: String,
}

impl DepositService {
    /// Service with the bundled collaborators and the process-wide gate.
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            reader: Arc::new(JsonMetadataReader),
            bag_validator: Arc::new(BagItValidator),
            gate: DepositGate::global(),
            journal: None,
            registrar: None,
            layout: PackageLayout::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            stale_after: DEFAULT_STALE_AFTER,
            preservation_creator: DEFAULT_PRESERVATION_CREATOR.to_string(),
        }
    }

    pub fn with_gate(mut self, gate: DepositGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Reserve DOIs for drafts whose metadata asks for one.
    pub fn with_doi_registrar(mut self, registrar: Arc<dyn DoiRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// How long a `running` attempt may go without a heartbeat before
    /// `cleanup` treats it as abandoned.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_metadata_reader(mut self, reader: Arc<dyn MetadataReader>) -> Self {
        self.reader = reader;
        self
    }

    pub fn with_bag_validator(mut self, validator: Arc<dyn BagValidator>) -> Self {
        self.bag_validator = validator;
        self
    }

    pub fn with_preservation_creator(mut self, creator: impl Into<String>) -> Self {
        self.preservation_creator = creator.into();
        self
    }

    /// Deposit the package at `package`.
    ///
    /// Never panics on remote failures: everything that went wrong is in
    /// `report`, and only a successful deposit yields a record id.
    pub async fn deposit(
        &self,
        package: &Path,
        options: &DepositOptions,
        report: &mut Report,
    ) -> DepositOutcome {
        let started = Instant::now();
        let mut state = DepositState::Idle;
        advance(&mut state, DepositState::Validating);

        let mapping = match load_mapping(
            package,
            &self.layout,
            options.public_files,
            options.separate_private_records,
        ) {
            Ok(mapping) => mapping,
            Err(err) => {
                report.add_error(FUNCTION, &err, "Failed to resolve record map");
                advance(&mut state, DepositState::Failed);
                return DepositOutcome::Rejected;
            }
        };
        debug!("record map has {} records", mapping.node_count());

        if !self.validate(package, &mapping, report).await {
            advance(&mut state, DepositState::Failed);
            return DepositOutcome::Rejected;
        }

        let Some(_permit) = self.gate.acquire(self.lock_timeout).await else {
            report.add_critical(FUNCTION, "Failed to get lock");
            advance(&mut state, DepositState::Failed);
            return DepositOutcome::LockUnavailable;
        };
        advance(&mut state, DepositState::Locked);

        let mut attempt = DepositAttempt::new(self.journal.clone());
        attempt.begin(package).await;

        advance(&mut state, DepositState::Uploading);
        let uploaded = self
            .upload_and_verify(package, &mapping, options, &mut attempt, report, &mut state)
            .await;

        let outcome = match uploaded {
            Ok(Some((root_id, preservation_id))) => {
                advance(&mut state, DepositState::Publishing);
                let published = self.publish(&mut attempt, options, report).await;
                advance(&mut state, DepositState::Done);
                info!("Deposited {} as record {}", package.display(), root_id);
                DepositOutcome::Deposited {
                    root_id,
                    preservation_id,
                    published,
                }
            }
            Ok(None) => {
                let complete = self.rollback(&mut attempt, report).await;
                advance(&mut state, DepositState::RolledBack);
                DepositOutcome::RolledBack {
                    reason: "integrity verification failed".to_string(),
                    complete,
                }
            }
            Err(err) => {
                error!("deposit of {} failed: {}", package.display(), err);
                report.add_error(FUNCTION, &err, "Deposit failed");
                let complete = self.rollback(&mut attempt, report).await;
                advance(&mut state, DepositState::RolledBack);
                match err {
                    DepositError::UpdateNotImplemented(title) => {
                        DepositOutcome::UpdateNotImplemented { title }
                    }
                    other => DepositOutcome::RolledBack {
                        reason: other.to_string(),
                        complete,
                    },
                }
            }
        };

        report.add_note(
            FUNCTION,
            format!("Deposit took {} seconds", started.elapsed().as_secs()),
        );
        outcome
    }

    /// Bag and record map checks, run side by side.
    async fn validate(&self, package: &Path, mapping: &MapRecord, report: &mut Report) -> bool {
        let bag = async {
            let mut bag_report = Report::new();
            let valid = match self.bag_validator.validate(package, &mut bag_report).await {
                Ok(valid) => valid,
                Err(err) => {
                    bag_report.add_critical(
                        "BagValidator",
                        format!("Bag validation failed: {:#}", err),
                    );
                    false
                }
            };
            (valid, bag_report)
        };

        let owned_package = package.to_path_buf();
        let layout = self.layout.clone();
        let owned_mapping = mapping.clone();
        let map = tokio::task::spawn_blocking(move || {
            let mut map_report = Report::new();
            let checked =
                validate_mapping(&owned_package, &layout, &owned_mapping, &mut map_report);
            let valid = match checked {
                Ok(valid) => valid,
                Err(err) => {
                    map_report.add_error("Mapping", &err, "Mapping validation failed");
                    false
                }
            };
            (valid, map_report)
        });

        let ((bag_valid, bag_report), map_result) = tokio::join!(bag, map);
        report.merge(bag_report);
        let map_valid = match map_result {
            Ok((valid, map_report)) => {
                report.merge(map_report);
                valid
            }
            Err(err) => {
                report.add_error(FUNCTION, &err, "Mapping validation did not finish");
                false
            }
        };
        bag_valid && map_valid
    }

    /// Upload, link, verify and assign DOIs. `Ok(None)` means verification failed.
    async fn upload_and_verify(
        &self,
        package: &Path,
        mapping: &MapRecord,
        options: &DepositOptions,
        attempt: &mut DepositAttempt,
        report: &mut Report,
        state: &mut DepositState,
    ) -> Result<Option<(String, String)>, DepositError> {
        let metadata_file = mapping.metadata_file().ok_or(DepositError::MissingMetadata)?;
        let metadata_path = package.join(metadata_file);
        let root_metadata = self
            .reader
            .read_metadata(&metadata_path)
            .await
            .map_err(|err| DepositError::Metadata {
                path: metadata_path.clone(),
                message: format!("{:#}", err),
            })?;

        let uploader = RecordUploader::new(
            self.repo.as_ref(),
            self.reader.as_ref(),
            package,
            &self.layout,
            options.update,
        );
        let root_id = uploader
            .upload(mapping, root_metadata.clone(), None, attempt)
            .await?;
        let preservation_id = uploader
            .upload_preservation(&root_metadata, &self.preservation_creator, attempt)
            .await?;
        link_preservation(self.repo.as_ref(), &root_id, &preservation_id).await?;
        report.add_note(
            FUNCTION,
            format!(
                "Created {} drafts, root record {}",
                attempt.drafts().len(),
                root_id
            ),
        );

        advance(state, DepositState::Verifying);
        let integrity = IntegrityValidator::new(self.repo.as_ref(), package);
        let root_valid = integrity.verify(&root_id, report).await?;
        let preservation_valid = integrity.verify(&preservation_id, report).await?;
        if !(root_valid && preservation_valid) {
            return Ok(None);
        }

        self.assign_dois(attempt, report).await?;
        Ok(Some((root_id, preservation_id)))
    }

    /// Fill the DOI placeholders of every draft of the attempt.
    ///
    /// Without a registrar the placeholders are dropped so no record is
    /// published with a bogus DOI.
    async fn assign_dois(
        &self,
        attempt: &mut DepositAttempt,
        report: &mut Report,
    ) -> Result<(), DepositError> {
        for id in attempt.drafts().to_vec() {
            let mut draft = self.repo.get_draft(&id).await?;
            if !draft.metadata.wants_doi() {
                continue;
            }
            match &self.registrar {
                Some(registrar) => {
                    let doi = registrar
                        .reserve(&draft.metadata, &self.repo.record_url(&id))
                        .await
                        .map_err(|source| DepositError::Doi {
                            record: id.clone(),
                            source,
                        })?;
                    info!("Reserved DOI {} for record {}", doi, id);
                    attempt.dois.push(doi.clone());
                    draft.metadata.fill_doi(&doi);
                    report.add_correct(FUNCTION, format!("Reserved DOI {} for record {}", doi, id));
                }
                None => {
                    draft.metadata.drop_doi_placeholders();
                    report.add_warning(
                        FUNCTION,
                        format!("No DOI registrar configured, dropped DOI placeholder of record {}", id),
                    );
                }
            }
            self.repo.update_draft(&id, &draft).await?;
        }
        Ok(())
    }

    /// Publish every draft of the attempt. Returns whether all were published.
    async fn publish(
        &self,
        attempt: &mut DepositAttempt,
        options: &DepositOptions,
        report: &mut Report,
    ) -> bool {
        if options.no_publish {
            report.add_note(
                FUNCTION,
                format!("Publishing disabled, drafts kept: {}", attempt.drafts().join(", ")),
            );
            attempt.finish(AttemptStatus::Drafted).await;
            return false;
        }

        let mut failures = Vec::new();
        for id in attempt.drafts() {
            match self.repo.publish_draft(id).await {
                Ok(_) => {
                    debug!("published {}", id);
                    attempt.mark_published(id).await;
                }
                Err(err) => {
                    warn!("failed to publish {}: {}", id, err);
                    failures.push(format!("{}: {}", id, err));
                }
            }
        }
        attempt
            .finish(if failures.is_empty() {
                AttemptStatus::Published
            } else {
                AttemptStatus::PublishIncomplete
            })
            .await;
        if failures.is_empty() {
            report.add_correct(
                FUNCTION,
                format!("Published {} records", attempt.drafts().len()),
            );
            true
        } else {
            report.add_critical(
                FUNCTION,
                format!("Failed to publish records: {}", failures.join("; ")),
            );
            false
        }
    }

    /// Delete every draft of the attempt, newest first.
    ///
    /// Returns `false` if any delete failed; each failure is reported.
    async fn rollback(&self, attempt: &mut DepositAttempt, report: &mut Report) -> bool {
        warn!(
            "rolling back attempt {} ({} drafts)",
            attempt.id,
            attempt.drafts().len()
        );
        let mut complete = true;
        for id in attempt.drafts().iter().rev() {
            match self.repo.delete_draft(id).await {
                Ok(()) => attempt.mark_deleted(id).await,
                Err(err) if err.is_not_found() => attempt.mark_deleted(id).await,
                Err(err) => {
                    complete = false;
                    report.add_error(FUNCTION, &err, &format!("Failed to delete draft {}", id));
                }
            }
        }
        if let Some(registrar) = &self.registrar {
            for doi in attempt.dois.iter().rev() {
                if let Err(err) = registrar.delete(doi).await {
                    report.add_error(FUNCTION, &err, &format!("Failed to delete draft DOI {}", doi));
                }
            }
        }
        attempt
            .finish(if complete {
                AttemptStatus::RolledBack
            } else {
                AttemptStatus::RollbackIncomplete
            })
            .await;
        complete
    }

    /// Delete drafts left behind by interrupted attempts.
    ///
    /// Attempts that are still `running` with a recent heartbeat belong to a
    /// deposit in another process and are skipped, drafts included. With
    /// `all`, every other unpublished draft of the user goes as well.
    pub async fn cleanup(
        &self,
        all: bool,
        report: &mut Report,
    ) -> Result<CleanupSummary, DepositError> {
        let _permit = self
            .gate
            .acquire(self.lock_timeout)
            .await
            .ok_or(DepositError::LockUnavailable)?;
        let mut summary = CleanupSummary::default();
        let mut in_flight = HashSet::new();

        match &self.journal {
            Some(journal) => {
                let now = Utc::now();
                for attempt in journal.unfinished_attempts().await? {
                    if attempt.is_live(now, self.stale_after) {
                        report.add_note(
                            FUNCTION,
                            format!(
                                "Skipping attempt {} for {}, still running in process {} (heartbeat {})",
                                attempt.id, attempt.package_path, attempt.owner_pid, attempt.heartbeat_at
                            ),
                        );
                        summary.skipped += 1;
                        in_flight.extend(journal.pending_drafts(&attempt.id).await?);
                        continue;
                    }
                    info!(
                        "Cleaning attempt {} for {} ({}, started {})",
                        attempt.id, attempt.package_path, attempt.status, attempt.started_at
                    );
                    summary.attempts += 1;
                    let mut complete = true;
                    for record_id in journal.pending_drafts(&attempt.id).await? {
                        if self.delete_counted(&record_id, &mut summary, report).await {
                            journal.mark_deleted(&attempt.id, &record_id).await?;
                        } else {
                            complete = false;
                        }
                    }
                    if complete {
                        journal.finish_attempt(&attempt.id, AttemptStatus::Cleaned).await?;
                    } else {
                        journal
                            .finish_attempt(&attempt.id, AttemptStatus::RollbackIncomplete)
                            .await?;
                    }
                }
            }
            None => report.add_note(FUNCTION, "No journal configured, skipping recorded attempts"),
        }

        if all {
            for record_id in self.unpublished_drafts().await? {
                if in_flight.contains(&record_id) {
                    debug!("keeping in-flight draft {}", record_id);
                    continue;
                }
                self.delete_counted(&record_id, &mut summary, report).await;
            }
        }

        report.add_note(
            FUNCTION,
            format!(
                "Cleanup deleted {} drafts from {} attempts, {} failures, {} attempts still running",
                summary.deleted, summary.attempts, summary.failed, summary.skipped
            ),
        );
        Ok(summary)
    }

    async fn delete_counted(
        &self,
        record_id: &str,
        summary: &mut CleanupSummary,
        report: &mut Report,
    ) -> bool {
        match self.repo.delete_draft(record_id).await {
            Ok(()) => {
                summary.deleted += 1;
                true
            }
            Err(err) if err.is_not_found() => {
                debug!("draft {} already gone", record_id);
                true
            }
            Err(err) => {
                summary.failed += 1;
                report.add_error(FUNCTION, &err, &format!("Failed to delete draft {}", record_id));
                false
            }
        }
    }

    async fn unpublished_drafts(&self) -> Result<Vec<String>, DepositError> {
        let mut ids = Vec::new();
        let mut page = 1;
        loop {
            let result = self
                .repo
                .list_user_records(&RecordQuery::all(page, LISTING_PAGE_SIZE))
                .await?;
            let seen = u64::from(page) * u64::from(LISTING_PAGE_SIZE);
            let exhausted = result.hits.is_empty() || seen >= result.total;
            ids.extend(
                result
                    .hits
                    .into_iter()
                    .filter(|r| !r.is_published)
                    .filter_map(|r| r.id),
            );
            if exhausted {
                return Ok(ids);
            }
            page += 1;
        }
    }
}

/// Absolute form of a package path for logs and the journal.
pub fn package_path(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{
            metadata::{DESCRIBES, HAS_PART, IS_DESCRIBED_BY, IS_PART_OF, Metadata},
            record::{Access, AccessType, DraftRecord, FilesOptions},
            report::Severity,
        },
        services::{
            memory_repository::MemoryRepository,
            mirror::download_tree,
            test_support::{MemoryRegistrar, PackageBuilder, write_file},
        },
    };

    const SESSION_MAP: &str = r#"{
        "metadata": "data/Metadata/metadata.json",
        "records": [{"title": "Session 1",
                     "files": [{"name": "data/s1/a.txt", "public": true},
                               {"name": "data/s1/b.txt", "public": true}]}]
    }"#;

    fn corpus_a() -> tempfile::TempDir {
        PackageBuilder::new("Corpus A")
            .file("data/s1/a.txt", "alpha")
            .file("data/s1/b.txt", "beta")
            .record_map(SESSION_MAP)
            .build()
    }

    fn service(repo: &MemoryRepository) -> DepositService {
        DepositService::new(Arc::new(repo.clone()))
            .with_gate(DepositGate::new())
            .with_lock_timeout(Duration::from_millis(200))
    }

    fn titles(repo: &MemoryRepository, ids: &[String]) -> Vec<String> {
        let mut titles: Vec<String> = ids
            .iter()
            .map(|id| repo.read_record(id).unwrap().metadata.title)
            .collect();
        titles.sort();
        titles
    }

    #[tokio::test]
    async fn deposits_corpus_with_session_and_preservation_record() {
        let pkg = corpus_a();
        let repo = MemoryRepository::new("http://sandbox");
        let mut report = Report::new();

        let outcome = service(&repo)
            .deposit(pkg.path(), &DepositOptions::default(), &mut report)
            .await;

        let DepositOutcome::Deposited {
            root_id,
            preservation_id,
            published,
        } = outcome.clone()
        else {
            panic!("unexpected outcome {:?}: {:#?}", outcome, report);
        };
        assert!(published);
        assert_eq!(report.critical_count(), 0, "{:#?}", report);
        assert_eq!(outcome.root_id(), Some(root_id.as_str()));

        let published_ids = repo.published_ids();
        assert_eq!(
            titles(&repo, &published_ids),
            vec![
                "Corpus A".to_string(),
                "Corpus A: Preservation information".to_string(),
                "Corpus A: Session 1".to_string(),
            ]
        );
        assert!(repo.draft_ids().is_empty());

        let root = repo.read_record(&root_id).unwrap();
        assert_eq!(root.metadata.title, "Corpus A");
        let described_by: Vec<_> = root.metadata.related_of(IS_DESCRIBED_BY).collect();
        assert_eq!(described_by, vec![repo.record_url(&preservation_id)]);

        let preservation = repo.read_record(&preservation_id).unwrap();
        let describes: Vec<_> = preservation.metadata.related_of(DESCRIBES).collect();
        assert_eq!(describes, vec![repo.record_url(&root_id)]);

        let child_url = root.metadata.related_of(HAS_PART).next().unwrap().to_string();
        let child_id = child_url.rsplit('/').next().unwrap();
        let child = repo.read_record(child_id).unwrap();
        assert_eq!(child.metadata.title, "Corpus A: Session 1");
        assert_eq!(
            child.metadata.related_of(IS_PART_OF).collect::<Vec<_>>(),
            vec![repo.record_url(&root_id)]
        );
    }

    #[tokio::test]
    async fn downloaded_tree_matches_package() {
        let pkg = corpus_a();
        let repo = MemoryRepository::new("http://sandbox");
        let mut report = Report::new();
        let outcome = service(&repo)
            .deposit(pkg.path(), &DepositOptions::default(), &mut report)
            .await;
        let root_id = outcome.root_id().unwrap().to_string();

        let dest = tempfile::tempdir().unwrap();
        let mut mirror_report = Report::new();
        let summary = download_tree(&repo, &root_id, dest.path(), &mut mirror_report)
            .await
            .unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.files, 3);
        assert_eq!(summary.checksum_failures, 0);

        for relative in ["data/Metadata/metadata.json", "data/s1/a.txt", "data/s1/b.txt"] {
            assert_eq!(
                std::fs::read(dest.path().join(relative)).unwrap(),
                std::fs::read(pkg.path().join(relative)).unwrap(),
                "{} differs",
                relative
            );
        }
    }

    #[tokio::test]
    async fn second_deposit_collides_and_leaves_first_intact() {
        let pkg = corpus_a();
        let repo = MemoryRepository::new("http://sandbox");
        let service = service(&repo);

        let mut first = Report::new();
        assert!(matches!(
            service.deposit(pkg.path(), &DepositOptions::default(), &mut first).await,
            DepositOutcome::Deposited { .. }
        ));
        let before = repo.published_ids();

        let mut second = Report::new();
        let outcome = service
            .deposit(pkg.path(), &DepositOptions::default(), &mut second)
            .await;
        assert!(matches!(outcome, DepositOutcome::RolledBack { complete: true, .. }));
        assert!(
            second
                .iter()
                .any(|i| i.severity == Severity::Critical && i.message.contains("already exists"))
        );
        assert_eq!(repo.published_ids(), before);
        assert!(repo.draft_ids().is_empty());
    }

    #[tokio::test]
    async fn update_mode_is_reported_as_not_implemented() {
        let pkg = corpus_a();
        let repo = MemoryRepository::new("http://sandbox");
        let service = service(&repo);
        let mut report = Report::new();
        service
            .deposit(pkg.path(), &DepositOptions::default(), &mut report)
            .await;

        let options = DepositOptions {
            update: true,
            ..Default::default()
        };
        let outcome = service.deposit(pkg.path(), &options, &mut report).await;
        assert_eq!(
            outcome,
            DepositOutcome::UpdateNotImplemented {
                title: "Corpus A".to_string()
            }
        );
        assert_eq!(outcome.root_id(), None);
        assert!(repo.draft_ids().is_empty());
    }

    #[tokio::test]
    async fn failed_child_upload_removes_every_draft() {
        let pkg = corpus_a();
        let repo = MemoryRepository::new("http://sandbox");
        repo.fail_upload("data-0-0-s1-0-0-b.txt");
        let mut report = Report::new();

        let outcome = service(&repo)
            .deposit(pkg.path(), &DepositOptions::default(), &mut report)
            .await;
        assert!(matches!(outcome, DepositOutcome::RolledBack { complete: true, .. }));
        assert!(repo.draft_ids().is_empty());
        assert!(repo.published_ids().is_empty());
    }

    #[tokio::test]
    async fn corrupted_upload_fails_verification_and_rolls_back() {
        let pkg = corpus_a();
        let repo = MemoryRepository::new("http://sandbox");
        repo.corrupt_upload("data-0-0-s1-0-0-a.txt");
        let mut report = Report::new();

        let outcome = service(&repo)
            .deposit(pkg.path(), &DepositOptions::default(), &mut report)
            .await;
        assert_eq!(
            outcome,
            DepositOutcome::RolledBack {
                reason: "integrity verification failed".to_string(),
                complete: true
            }
        );
        assert!(
            report
                .iter()
                .any(|i| i.severity == Severity::Critical && i.message.contains("data-0-0-s1-0-0-a.txt"))
        );
        assert!(repo.draft_ids().is_empty());
        assert!(repo.published_ids().is_empty());
    }

    #[tokio::test]
    async fn failed_deletes_are_reported_and_journaled() {
        let pkg = corpus_a();
        let repo = MemoryRepository::new("http://sandbox");
        repo.fail_upload("data-0-0-s1-0-0-b.txt");
        repo.fail_deletes(true);
        let journal = Journal::in_memory().await.unwrap();
        let service = service(&repo).with_journal(journal.clone());
        let mut report = Report::new();

        let outcome = service
            .deposit(pkg.path(), &DepositOptions::default(), &mut report)
            .await;
        assert!(matches!(outcome, DepositOutcome::RolledBack { complete: false, .. }));
        let leftover = repo.draft_ids();
        assert_eq!(leftover.len(), 2);
        assert_eq!(
            report
                .iter()
                .filter(|i| i.message.starts_with("Failed to delete draft"))
                .count(),
            2
        );

        let unfinished = journal.unfinished_attempts().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].status, "rollback_incomplete");

        repo.fail_deletes(false);
        let mut cleanup_report = Report::new();
        let summary = service.cleanup(false, &mut cleanup_report).await.unwrap();
        assert_eq!(
            summary,
            CleanupSummary {
                attempts: 1,
                deleted: 2,
                failed: 0,
                skipped: 0
            }
        );
        assert!(repo.draft_ids().is_empty());
        assert!(journal.unfinished_attempts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unpublished_drafts_stay_journaled_for_cleanup() {
        let pkg = corpus_a();
        let repo = MemoryRepository::new("http://sandbox");
        repo.fail_publish("Corpus A: Session 1");
        let journal = Journal::in_memory().await.unwrap();
        let service = service(&repo).with_journal(journal.clone());
        let mut report = Report::new();

        let outcome = service
            .deposit(pkg.path(), &DepositOptions::default(), &mut report)
            .await;
        assert!(matches!(outcome, DepositOutcome::Deposited { published: false, .. }));
        assert!(
            report
                .iter()
                .any(|i| i.severity == Severity::Critical
                    && i.message.starts_with("Failed to publish records"))
        );
        assert_eq!(repo.published_ids().len(), 2);
        let stuck = repo.draft_ids();
        assert_eq!(stuck.len(), 1);

        let unfinished = journal.unfinished_attempts().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].status, "publish_incomplete");
        let attempt_id = unfinished[0].id.clone();
        assert_eq!(journal.pending_drafts(&attempt_id).await.unwrap(), stuck);

        let mut cleanup_report = Report::new();
        let summary = service.cleanup(false, &mut cleanup_report).await.unwrap();
        assert_eq!(summary.attempts, 1);
        assert_eq!(summary.deleted, 1);
        assert!(repo.draft_ids().is_empty());
        assert_eq!(repo.published_ids().len(), 2);
        assert_eq!(
            journal.attempt_status(&attempt_id).await.unwrap().as_deref(),
            Some("cleaned")
        );
    }

    #[tokio::test]
    async fn cleanup_leaves_attempts_of_live_deposits_alone() {
        let repo = MemoryRepository::new("http://sandbox");
        let journal = Journal::in_memory().await.unwrap();

        // a deposit running elsewhere, one draft in
        let other = Uuid::new_v4();
        journal.begin_attempt(other, Path::new("/bags/busy")).await.unwrap();
        let draft = DraftRecord::new(
            Access {
                record: AccessType::Public,
                files: AccessType::Public,
            },
            FilesOptions::default(),
            Metadata::new("dataset", vec![], "Busy corpus", "2024"),
        );
        let in_flight = repo.insert_draft(&draft).id.unwrap();
        journal.record_draft(other, &in_flight).await.unwrap();
        let stray = repo
            .insert_draft(&DraftRecord {
                metadata: Metadata::new("dataset", vec![], "Stray", "2024"),
                ..draft.clone()
            })
            .id
            .unwrap();

        let service = service(&repo).with_journal(journal.clone());
        let mut report = Report::new();
        let summary = service.cleanup(true, &mut report).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.attempts, 0);
        assert_eq!(summary.deleted, 1);
        assert_eq!(repo.draft_ids(), vec![in_flight.clone()]);
        assert!(!repo.draft_ids().contains(&stray));

        // once the heartbeat is stale the attempt is abandoned
        let service = service.with_stale_after(Duration::ZERO);
        let summary = service.cleanup(false, &mut report).await.unwrap();
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.attempts, 1);
        assert_eq!(summary.deleted, 1);
        assert!(repo.draft_ids().is_empty());
        assert_eq!(
            journal
                .attempt_status(&other.to_string())
                .await
                .unwrap()
                .as_deref(),
            Some("cleaned")
        );
    }

    #[tokio::test]
    async fn cleanup_all_removes_foreign_drafts_only() {
        let pkg = corpus_a();
        let repo = MemoryRepository::new("http://sandbox");
        let service = service(&repo);
        let mut report = Report::new();
        service
            .deposit(pkg.path(), &DepositOptions::default(), &mut report)
            .await;

        let kept = PackageBuilder::new("Corpus B").file("data/x.txt", "x").build();
        let options = DepositOptions {
            no_publish: true,
            ..Default::default()
        };
        let outcome = service.deposit(kept.path(), &options, &mut report).await;
        assert!(matches!(outcome, DepositOutcome::Deposited { published: false, .. }));
        assert_eq!(repo.draft_ids().len(), 2);

        let summary = service.cleanup(true, &mut report).await.unwrap();
        assert_eq!(summary.deleted, 2);
        assert!(repo.draft_ids().is_empty());
        assert_eq!(repo.published_ids().len(), 3);
    }

    fn corpus_with_doi_placeholder(title: &str) -> tempfile::TempDir {
        let metadata = serde_json::json!({
            "resource_type": {"id": "dataset"},
            "creators": [{"person_or_org": {"type": "organizational", "name": "Corpus Lab"}}],
            "title": title,
            "publication_date": "2024-05-17",
            "identifiers": [{"identifier": "10.0/NOTYET", "scheme": "doi"}]
        })
        .to_string();
        PackageBuilder::new(title)
            .metadata(&metadata)
            .file("data/s1/a.txt", "alpha")
            .file("data/s1/b.txt", "beta")
            .record_map(SESSION_MAP)
            .build()
    }

    #[tokio::test]
    async fn placeholder_dois_are_reserved_before_publishing() {
        let repo = MemoryRepository::new("http://sandbox");
        let registrar = MemoryRegistrar::default();
        let pkg = corpus_with_doi_placeholder("Corpus D");

        let mut report = Report::new();
        let outcome = service(&repo)
            .with_doi_registrar(Arc::new(registrar.clone()))
            .deposit(pkg.path(), &DepositOptions::default(), &mut report)
            .await;
        let DepositOutcome::Deposited {
            root_id,
            preservation_id,
            published: true,
        } = outcome
        else {
            panic!("unexpected outcome {:?}: {:#?}", outcome, report);
        };

        // the session record inherits the root metadata, placeholder included
        let reserved = registrar.reserved();
        assert_eq!(reserved.len(), 2);
        assert_eq!(reserved[0].1, repo.record_url(&root_id));
        let root = repo.read_record(&root_id).unwrap();
        assert_eq!(root.metadata.identifiers[0].identifier, reserved[0].0);
        assert!(!root.metadata.wants_doi());
        let preservation = repo.read_record(&preservation_id).unwrap();
        assert!(preservation.metadata.identifiers.is_empty());
        assert!(registrar.deleted().is_empty());
    }

    #[tokio::test]
    async fn refused_doi_rolls_back_drafts_and_reserved_dois() {
        let repo = MemoryRepository::new("http://sandbox");
        let registrar = MemoryRegistrar::default();
        registrar.refuse_after(1);
        let pkg = corpus_with_doi_placeholder("Corpus D");

        let mut report = Report::new();
        let outcome = service(&repo)
            .with_doi_registrar(Arc::new(registrar.clone()))
            .deposit(pkg.path(), &DepositOptions::default(), &mut report)
            .await;
        match outcome {
            DepositOutcome::RolledBack { reason, complete } => {
                assert!(complete);
                assert!(reason.contains("DOI registration"), "{}", reason);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(repo.draft_ids().is_empty());
        assert!(repo.published_ids().is_empty());
        assert_eq!(registrar.deleted(), vec!["10.5072/test-1".to_string()]);
    }

    #[tokio::test]
    async fn placeholders_are_dropped_without_registrar() {
        let repo = MemoryRepository::new("http://sandbox");
        let pkg = corpus_with_doi_placeholder("Corpus D");

        let mut report = Report::new();
        let outcome = service(&repo)
            .deposit(pkg.path(), &DepositOptions::default(), &mut report)
            .await;
        let Some(root_id) = outcome.root_id().map(str::to_string) else {
            panic!("unexpected outcome {:?}: {:#?}", outcome, report);
        };
        let root = repo.read_record(&root_id).unwrap();
        assert!(root.metadata.identifiers.is_empty());
        assert_eq!(
            report
                .iter()
                .filter(|i| i.severity == Severity::Warning && i.message.contains("DOI placeholder"))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn held_gate_yields_lock_unavailable() {
        let pkg = corpus_a();
        let repo = MemoryRepository::new("http://sandbox");
        let gate = DepositGate::new();
        let _holder = gate.acquire(Duration::from_millis(10)).await.unwrap();

        let service = DepositService::new(Arc::new(repo.clone()))
            .with_gate(gate.clone())
            .with_lock_timeout(Duration::from_millis(50));
        let mut report = Report::new();
        let outcome = service
            .deposit(pkg.path(), &DepositOptions::default(), &mut report)
            .await;

        assert_eq!(outcome, DepositOutcome::LockUnavailable);
        assert!(report.iter().any(|i| i.message == "Failed to get lock"));
        assert!(repo.draft_ids().is_empty());
        assert!(repo.published_ids().is_empty());
    }

    #[tokio::test]
    async fn invalid_package_is_rejected_before_any_remote_call() {
        let pkg = corpus_a();
        write_file(pkg.path(), "data/s1/untracked.txt", "?");
        let repo = MemoryRepository::new("http://sandbox");
        let mut report = Report::new();

        let outcome = service(&repo)
            .deposit(pkg.path(), &DepositOptions::default(), &mut report)
            .await;
        assert_eq!(outcome, DepositOutcome::Rejected);
        // flagged both by the bag manifest and by the record map
        assert!(
            report
                .iter()
                .any(|i| i.message.starts_with("Unexpected files in path"))
        );
        assert!(report.iter().any(|i| i.function == "BagValidator"));
        assert!(repo.draft_ids().is_empty());
    }

    #[tokio::test]
    async fn private_files_split_into_own_record() {
        let pkg = PackageBuilder::new("Corpus P")
            .file("data/open.txt", "o")
            .file("data/closed.txt", "c")
            .record_map(
                r#"{"metadata": "data/Metadata/metadata.json",
                    "files": [{"name": "data/open.txt", "public": true},
                              {"name": "data/closed.txt", "public": false}]}"#,
            )
            .build();
        let repo = MemoryRepository::new("http://sandbox");
        let options = DepositOptions {
            separate_private_records: true,
            ..Default::default()
        };
        let mut report = Report::new();
        let outcome = service(&repo).deposit(pkg.path(), &options, &mut report).await;
        let root_id = outcome.root_id().unwrap().to_string();

        let root = repo.read_record(&root_id).unwrap();
        let child_url = root.metadata.related_of(HAS_PART).next().unwrap().to_string();
        let child = repo.read_record(child_url.rsplit('/').next().unwrap()).unwrap();
        assert_eq!(child.metadata.title, "Corpus P: Private files");
        assert_eq!(child.access.files, AccessType::Restricted);
        assert_eq!(root.access.files, AccessType::Public);
    }

    struct RefusingValidator;

    #[async_trait::async_trait]
    impl BagValidator for RefusingValidator {
        async fn validate(&self, _package: &Path, _report: &mut Report) -> anyhow::Result<bool> {
            anyhow::bail!("validator offline")
        }
    }

    struct FixedTitleReader;

    #[async_trait::async_trait]
    impl MetadataReader for FixedTitleReader {
        async fn read_metadata(
            &self,
            path: &Path,
        ) -> anyhow::Result<Metadata> {
            let mut metadata = JsonMetadataReader.read_metadata(path).await?;
            metadata.title = "Renamed".to_string();
            Ok(metadata)
        }
    }

    #[tokio::test]
    async fn collaborators_can_be_swapped() {
        let pkg = corpus_a();
        let repo = MemoryRepository::new("http://sandbox");
        let mut report = Report::new();
        let refusing = service(&repo).with_bag_validator(Arc::new(RefusingValidator));
        assert_eq!(
            refusing
                .deposit(pkg.path(), &DepositOptions::default(), &mut report)
                .await,
            DepositOutcome::Rejected
        );
        assert!(report.iter().any(|i| i.message.contains("validator offline")));

        let renaming = service(&repo)
            .with_metadata_reader(Arc::new(FixedTitleReader))
            .with_preservation_creator("Archive Team");
        let mut report = Report::new();
        let outcome = renaming
            .deposit(pkg.path(), &DepositOptions::default(), &mut report)
            .await;
        let root = repo.read_record(outcome.root_id().unwrap()).unwrap();
        assert_eq!(root.metadata.title, "Renamed");
        let preservation = repo
            .published_ids()
            .into_iter()
            .map(|id| repo.read_record(&id).unwrap())
            .find(|r| r.metadata.title == "Renamed: Preservation information")
            .unwrap();
        assert_eq!(
            preservation.metadata.creators[0].person_or_org.name.as_deref(),
            Some("Archive Team")
        );
    }
}
