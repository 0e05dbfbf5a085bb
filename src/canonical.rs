//! Canonicalization for digest-based deduplication
//!
//! The canonical form is only ever used to compute a digest. It never
//! replaces the submitted content.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::debug;

use crate::artifact::ArtifactType;
use crate::budget::StageBudget;
use crate::content::{CanonicalContent, Content};
use crate::error::Result;
use crate::executor::Stage;
use crate::formats;

/// Canonical form of `content` for `artifact_type`
///
/// Content that cannot be parsed comes back unchanged; surfacing parse
/// errors is the validator's job. Runs without a deadline, and content
/// nested past the default limit is also returned unchanged.
pub fn canonicalize(artifact_type: ArtifactType, content: &Content) -> CanonicalContent {
    let budget = StageBudget::unbounded(Stage::Canonicalizing);
    canonicalize_within(artifact_type, content, &budget).unwrap_or_else(|e| {
        debug!(%artifact_type, error = %e, "Canonicalization stopped, using identity");
        CanonicalContent::new(content.clone())
    })
}

/// [`canonicalize`] bounded by `budget`
///
/// Fails with `ResourceExhausted` when the deadline passes or the content
/// nests deeper than the budget allows.
pub fn canonicalize_within(
    artifact_type: ArtifactType,
    content: &Content,
    budget: &StageBudget,
) -> Result<CanonicalContent> {
    let canonicalize = formats::rules_for(artifact_type).canonicalize;
    let normalized = match catch_unwind(AssertUnwindSafe(|| canonicalize(content, budget))) {
        Ok(normalized) => normalized?,
        Err(_) => {
            debug!(%artifact_type, "Canonicalizer panicked, using identity");
            None
        }
    };

    Ok(match normalized {
        Some(bytes) if bytes.as_slice() != content.bytes() => {
            let canonical = Content::from_bytes(bytes);
            CanonicalContent::new(match content.content_type() {
                Some(content_type) => canonical.with_content_type(content_type.clone()),
                None => canonical,
            })
        }
        _ => CanonicalContent::new(content.clone()),
    })
}
