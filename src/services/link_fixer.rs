//! Cross-links the root record and its preservation record.
//!
//! Both drafts must exist before either can reference the other, so this runs
//! as a second pass after the upload.

use crate::{
    models::metadata::{DESCRIBES, IS_DESCRIBED_BY, RelatedIdentifier},
    services::repository::{Repository, RepositoryResult},
};
use tracing::info;

pub async fn link_preservation(
    repo: &dyn Repository,
    root_id: &str,
    preservation_id: &str,
) -> RepositoryResult<()> {
    let mut root = repo.get_draft(root_id).await?;
    let mut preservation = repo.get_draft(preservation_id).await?;

    preservation
        .metadata
        .add_related(RelatedIdentifier::url(repo.record_url(root_id), DESCRIBES));
    root.metadata.add_related(RelatedIdentifier::url(
        repo.record_url(preservation_id),
        IS_DESCRIBED_BY,
    ));

    repo.update_draft(preservation_id, &preservation).await?;
    repo.update_draft(root_id, &root).await?;
    info!("Linked {} and preservation record {}", root_id, preservation_id);
    Ok(())
}
