//! Depth-first creation of one draft per record-map node.

use crate::{
    errors::DepositError,
    models::{
        mapping::MapRecord,
        metadata::{Creator, HAS_PART, IS_PART_OF, Metadata, RelatedIdentifier},
        record::{Access, AccessType, DraftRecord, FilesOptions},
    },
    services::{
        deposit_service::DepositAttempt,
        file_keys,
        mapping_service::PackageLayout,
        metadata_reader::MetadataReader,
        repository::{Repository, RepositoryError, find_record_by_title},
    },
};
use chrono::Utc;
use futures::{FutureExt, future::BoxFuture};
use std::path::Path;
use tracing::{debug, info};

pub const DEFAULT_PRESERVATION_CREATOR: &str = "Leibniz-Institut für Deutsche Sprache (IDS)";

/// Metadata of the synthetic record holding preservation information for `root`.
pub fn preservation_metadata(root: &Metadata, creator: &str, date: &str) -> Metadata {
    let mut metadata = Metadata::new(
        "other",
        vec![Creator::organization(creator)],
        format!("{}: Preservation information", root.title),
        date,
    );
    metadata.description = Some(format!(
        "Record for storing preservation information for {}",
        root.title
    ));
    metadata
}

pub struct RecordUploader<'a> {
    repo: &'a dyn Repository,
    reader: &'a dyn MetadataReader,
    package: &'a Path,
    layout: &'a PackageLayout,
    update: bool,
}

impl<'a> RecordUploader<'a> {
    pub fn new(
        repo: &'a dyn Repository,
        reader: &'a dyn MetadataReader,
        package: &'a Path,
        layout: &'a PackageLayout,
        update: bool,
    ) -> Self {
        Self {
            repo,
            reader,
            package,
            layout,
            update,
        }
    }

    /// Create the draft for `node` and, recursively, for its children.
    ///
    /// `inherited` is the parent's resolved metadata (the root's own metadata
    /// for the root). Every created id is registered with `attempt` right away
    /// so a later failure can delete it.
    pub fn upload<'b>(
        &'b self,
        node: &'b MapRecord,
        inherited: Metadata,
        parent: Option<&'b str>,
        attempt: &'b mut DepositAttempt,
    ) -> BoxFuture<'b, Result<String, DepositError>> {
        async move {
            let mut metadata = match node.metadata_file() {
                Some(file) => self.read_metadata(file).await?,
                None => inherited.clone(),
            };
            if let Some(suffix) = node.title_suffix() {
                metadata.title = format!("{}: {}", inherited.title, suffix);
            }
            self.check_title(&metadata.title).await?;

            let files = FilesOptions {
                enabled: node.has_files(),
                default_preview: None,
            };
            let mut draft = DraftRecord::new(node.access(), files, metadata);
            let id = self.create(&draft, attempt).await?;
            info!("Created draft {} for \"{}\"", id, draft.metadata.title);

            draft.files.default_preview = self.upload_files(&id, node).await?;

            let for_children = draft.metadata.clone();
            for child in &node.records {
                let child_id = self
                    .upload(child, for_children.clone(), Some(&id), attempt)
                    .await?;
                draft
                    .metadata
                    .add_related(RelatedIdentifier::url(self.repo.record_url(&child_id), HAS_PART));
            }
            if let Some(parent) = parent {
                draft
                    .metadata
                    .add_related(RelatedIdentifier::url(self.repo.record_url(parent), IS_PART_OF));
            }

            self.repo.update_draft(&id, &draft).await?;
            Ok(id)
        }
        .boxed()
    }

    /// Create the file-less preservation record for the root.
    pub async fn upload_preservation(
        &self,
        root: &Metadata,
        creator: &str,
        attempt: &mut DepositAttempt,
    ) -> Result<String, DepositError> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let metadata = preservation_metadata(root, creator, &today);
        self.check_title(&metadata.title).await?;

        let access = Access {
            record: AccessType::Public,
            files: AccessType::Public,
        };
        let draft = DraftRecord::new(access, FilesOptions::default(), metadata);
        let id = self.create(&draft, attempt).await?;
        info!("Created preservation draft {}", id);
        Ok(id)
    }

    async fn read_metadata(&self, file: &str) -> Result<Metadata, DepositError> {
        let path = self.package.join(file);
        self.reader
            .read_metadata(&path)
            .await
            .map_err(|err| DepositError::Metadata {
                path,
                message: format!("{:#}", err),
            })
    }

    async fn check_title(&self, title: &str) -> Result<(), DepositError> {
        match find_record_by_title(self.repo, title).await? {
            Some(existing) if self.update => {
                debug!("record {:?} matches title \"{}\"", existing.id, title);
                Err(DepositError::UpdateNotImplemented(title.to_string()))
            }
            Some(_) => Err(DepositError::TitleExists(title.to_string())),
            None => Ok(()),
        }
    }

    async fn create(
        &self,
        draft: &DraftRecord,
        attempt: &mut DepositAttempt,
    ) -> Result<String, DepositError> {
        let created = self.repo.create_draft(draft).await?;
        let id = created.id.ok_or_else(|| {
            RepositoryError::Rejected("repository returned a draft without id".into())
        })?;
        attempt.register(&id).await;
        Ok(id)
    }

    /// Upload the node's metadata file and its files, in that order.
    ///
    /// Returns the key of the first file carrying the metadata extension,
    /// which becomes the draft's default preview.
    async fn upload_files(
        &self,
        id: &str,
        node: &MapRecord,
    ) -> Result<Option<String>, DepositError> {
        let extension = self.layout.metadata_extension();
        let names = node
            .metadata_file()
            .into_iter()
            .chain(node.files.iter().map(|f| f.name.as_str()));

        let mut default_preview = None;
        for name in names {
            let key = file_keys::encode(name)?;
            if default_preview.is_none() && !extension.is_empty() && name.ends_with(&extension) {
                default_preview = Some(key.clone());
            }
            let path = self.package.join(name);
            debug!("Uploading {} as {} to {}", path.display(), key, id);
            self.repo
                .start_file_uploads(id, std::slice::from_ref(&key))
                .await?;
            self.repo.upload_file_content(id, &key, &path).await?;
            self.repo.commit_file_upload(id, &key).await?;
        }
        Ok(default_preview)
    }
}
