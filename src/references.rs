//! Reference resolution
//!
//! Content may point at other registered content (Avro named types, Protobuf
//! imports, `$ref` documents, XSD imports). The resolver asks the
//! caller-supplied [`ReferenceLookup`] for each declared coordinate and
//! collects the answers in an immutable [`ReferenceMap`].
//!
//! Resolution is single-hop unless the artifact type needs the full closure
//! (see [`ArtifactType::needs_transitive_references`]) or the `REFS_EXIST`
//! integrity rule is enabled.

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::artifact::ArtifactType;
use crate::budget::StageBudget;
use crate::content::Content;
use crate::error::{panic_message, Result, RuleError};
use crate::formats;
use crate::violation::{RuleKind, RuleViolation, RuleViolations, Verdict, ViolationCause};

/// Name of a referenced document as written inside the referencing content
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceCoordinate(String);

impl ReferenceCoordinate {
    pub fn new(coordinate: impl Into<String>) -> Self {
        Self(coordinate.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ReferenceCoordinate {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReferenceCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReferenceCoordinate {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Resolved references for one request. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceMap {
    entries: BTreeMap<ReferenceCoordinate, Content>,
}

impl ReferenceMap {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a map from already-resolved content
    pub fn from_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Content)>,
        K: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (ReferenceCoordinate::new(k), v))
                .collect(),
        }
    }

    pub fn get(&self, coordinate: &str) -> Option<&Content> {
        self.entries.get(coordinate)
    }

    pub fn contains(&self, coordinate: &str) -> bool {
        self.entries.contains_key(coordinate)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReferenceCoordinate, &Content)> {
        self.entries.iter()
    }

    pub fn contents(&self) -> impl Iterator<Item = &Content> {
        self.entries.values()
    }
}

/// Why a lookup produced no content
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("not found")]
    NotFound,
    #[error("lookup unavailable: {0}")]
    Unavailable(String),
}

/// Caller-supplied capability mapping a coordinate to content
pub trait ReferenceLookup: Send + Sync {
    fn lookup(&self, coordinate: &ReferenceCoordinate) -> std::result::Result<Content, LookupError>;
}

impl<F> ReferenceLookup for F
where
    F: Fn(&ReferenceCoordinate) -> std::result::Result<Content, LookupError> + Send + Sync,
{
    fn lookup(&self, coordinate: &ReferenceCoordinate) -> std::result::Result<Content, LookupError> {
        self(coordinate)
    }
}

/// Map-backed lookup
#[derive(Debug, Clone, Default)]
pub struct InMemoryLookup {
    entries: BTreeMap<String, Content>,
}

impl InMemoryLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, coordinate: impl Into<String>, content: impl Into<Content>) -> Self {
        self.insert(coordinate, content);
        self
    }

    pub fn insert(&mut self, coordinate: impl Into<String>, content: impl Into<Content>) {
        self.entries.insert(coordinate.into(), content.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every file under `root`, keyed by its `/`-separated relative path
    pub fn from_directory(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let mut lookup = Self::new();
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            lookup.insert(key, Content::from_bytes(std::fs::read(entry.path())?));
        }
        debug!(root = %root.display(), entries = lookup.len(), "Loaded reference directory");
        Ok(lookup)
    }
}

impl ReferenceLookup for InMemoryLookup {
    fn lookup(&self, coordinate: &ReferenceCoordinate) -> std::result::Result<Content, LookupError> {
        self.entries
            .get(coordinate.as_str())
            .cloned()
            .ok_or(LookupError::NotFound)
    }
}

/// Wraps a lookup and counts calls
#[derive(Debug, Default)]
pub struct CountingLookup<L> {
    inner: L,
    calls: AtomicUsize,
}

impl<L> CountingLookup<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

impl<L: ReferenceLookup> ReferenceLookup for CountingLookup<L> {
    fn lookup(&self, coordinate: &ReferenceCoordinate) -> std::result::Result<Content, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.lookup(coordinate)
    }
}

/// How far resolution goes for one request
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Follow references declared by referenced content
    pub transitive: bool,
    /// Report coordinates declared more than once
    pub reject_duplicates: bool,
    pub max_depth: usize,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            transitive: false,
            reject_duplicates: false,
            max_depth: 16,
        }
    }
}

/// Coordinates `content` declares, in document order, duplicates included
pub fn declared_references(artifact_type: ArtifactType, content: &Content) -> Vec<ReferenceCoordinate> {
    let extract = formats::rules_for(artifact_type).extract_references;
    catch_unwind(AssertUnwindSafe(|| extract(content))).unwrap_or_default()
}

/// Resolve the references of `content` through `lookup`
///
/// An unresolvable coordinate rejects the request with a single INTEGRITY
/// violation. A lookup that fails for other reasons (or panics) is an error.
pub fn resolve_references(
    artifact_type: ArtifactType,
    content: &Content,
    lookup: &dyn ReferenceLookup,
    options: &ResolveOptions,
    budget: &StageBudget,
) -> Result<Verdict<ReferenceMap>> {
    let declared = declared_references(artifact_type, content);

    if options.reject_duplicates {
        let duplicates = duplicate_references(&declared);
        if !duplicates.is_empty() {
            return Ok(Verdict::from_findings(ReferenceMap::empty(), duplicates));
        }
    }

    let mut entries = BTreeMap::new();
    let mut seen: HashSet<ReferenceCoordinate> = HashSet::new();
    let mut queue: VecDeque<(ReferenceCoordinate, usize)> = VecDeque::new();
    for coordinate in declared {
        if seen.insert(coordinate.clone()) {
            queue.push_back((coordinate, 1));
        }
    }

    while let Some((coordinate, depth)) = queue.pop_front() {
        budget.check()?;
        if depth > options.max_depth {
            return Err(budget.exhausted(format!(
                "reference chain through '{}' is deeper than {}",
                coordinate, options.max_depth
            )));
        }

        let resolved = match call_lookup(lookup, &coordinate)? {
            Some(content) => content,
            None => {
                debug!(%coordinate, depth, "Reference not found");
                return Ok(Verdict::Rejected(RuleViolations::single(
                    RuleViolation::unresolved_reference(coordinate.as_str()),
                )));
            }
        };

        if options.transitive {
            for nested in declared_references(artifact_type, &resolved) {
                if seen.insert(nested.clone()) {
                    queue.push_back((nested, depth + 1));
                }
            }
        }
        entries.insert(coordinate, resolved);
    }

    debug!(%artifact_type, resolved = entries.len(), transitive = options.transitive, "References resolved");
    Ok(Verdict::Accepted(ReferenceMap { entries }))
}

fn duplicate_references(declared: &[ReferenceCoordinate]) -> Vec<RuleViolation> {
    let mut seen = BTreeSet::new();
    let mut reported = BTreeSet::new();
    let mut violations = Vec::new();
    for coordinate in declared {
        if !seen.insert(coordinate) && reported.insert(coordinate) {
            violations.push(
                RuleViolation::new(
                    RuleKind::Integrity,
                    ViolationCause::DuplicateReference,
                    format!("Reference '{}' is declared more than once", coordinate),
                )
                .at(coordinate.as_str()),
            );
        }
    }
    violations
}

fn call_lookup(lookup: &dyn ReferenceLookup, coordinate: &ReferenceCoordinate) -> Result<Option<Content>> {
    match catch_unwind(AssertUnwindSafe(|| lookup.lookup(coordinate))) {
        Ok(Ok(content)) => Ok(Some(content)),
        Ok(Err(LookupError::NotFound)) => Ok(None),
        Ok(Err(LookupError::Unavailable(reason))) => {
            warn!(%coordinate, %reason, "Reference lookup unavailable");
            Err(RuleError::LookupFailed {
                coordinate: coordinate.to_string(),
                reason,
            })
        }
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            warn!(%coordinate, %reason, "Reference lookup panicked");
            Err(RuleError::LookupFailed {
                coordinate: coordinate.to_string(),
                reason: format!("lookup panicked: {}", reason),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Stage;

    fn budget() -> StageBudget {
        StageBudget::unbounded(Stage::ResolvingReferences)
    }

    fn proto(imports: &[&str]) -> Content {
        let mut s = String::from("syntax = \"proto3\";\n");
        for i in imports {
            s.push_str(&format!("import \"{}\";\n", i));
        }
        s.push_str("message M {}\n");
        Content::from_string(s)
    }

    #[test]
    fn test_direct_references_only_by_default() {
        let lookup = CountingLookup::new(
            InMemoryLookup::new()
                .with("a.json", r#"{"$ref": "b.json"}"#)
                .with("b.json", "{}"),
        );
        let content = Content::from_string(r#"{"properties": {"x": {"$ref": "a.json#/defs/x"}}}"#);
        let verdict =
            resolve_references(ArtifactType::Json, &content, &lookup, &ResolveOptions::default(), &budget())
                .unwrap();
        let map = verdict.into_result().unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains("a.json"));
        assert_eq!(lookup.calls(), 1);
    }

    #[test]
    fn test_transitive_closure_is_cycle_safe() {
        let lookup = InMemoryLookup::new()
            .with("a.proto", proto(&["b.proto"]))
            .with("b.proto", proto(&["a.proto"]));
        let options = ResolveOptions { transitive: true, ..Default::default() };
        let map = resolve_references(ArtifactType::Protobuf, &proto(&["a.proto"]), &lookup, &options, &budget())
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_not_found_is_a_single_integrity_violation() {
        let content = proto(&["missing.proto", "also_missing.proto"]);
        let verdict = resolve_references(
            ArtifactType::Protobuf,
            &content,
            &InMemoryLookup::new(),
            &ResolveOptions::default(),
            &budget(),
        )
        .unwrap();
        let violations = verdict.violations().unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations.first().kind, RuleKind::Integrity);
        assert_eq!(violations.first().cause, ViolationCause::UnresolvedReference);
    }

    #[test]
    fn test_well_known_imports_are_not_looked_up() {
        let lookup = CountingLookup::new(InMemoryLookup::new());
        let content = proto(&["google/protobuf/timestamp.proto"]);
        let verdict =
            resolve_references(ArtifactType::Protobuf, &content, &lookup, &ResolveOptions::default(), &budget())
                .unwrap();
        assert!(verdict.is_accepted());
        assert_eq!(lookup.calls(), 0);
    }

    #[test]
    fn test_duplicates_rejected_when_enabled() {
        let content = proto(&["a.proto", "a.proto"]);
        let options = ResolveOptions { reject_duplicates: true, ..Default::default() };
        let verdict =
            resolve_references(ArtifactType::Protobuf, &content, &InMemoryLookup::new(), &options, &budget())
                .unwrap();
        let violations = verdict.violations().unwrap();
        assert_eq!(violations.first().cause, ViolationCause::DuplicateReference);
    }

    #[test]
    fn test_unavailable_lookup_is_an_error() {
        let lookup = |_: &ReferenceCoordinate| -> std::result::Result<Content, LookupError> {
            Err(LookupError::Unavailable("storage offline".into()))
        };
        let err = resolve_references(
            ArtifactType::Protobuf,
            &proto(&["a.proto"]),
            &lookup,
            &ResolveOptions::default(),
            &budget(),
        )
        .unwrap_err();
        assert!(matches!(err, RuleError::LookupFailed { .. }));
    }

    #[test]
    fn test_panicking_lookup_is_an_error_not_a_crash() {
        let lookup = |_: &ReferenceCoordinate| -> std::result::Result<Content, LookupError> {
            panic!("boom")
        };
        let err = resolve_references(
            ArtifactType::Protobuf,
            &proto(&["a.proto"]),
            &lookup,
            &ResolveOptions::default(),
            &budget(),
        )
        .unwrap_err();
        match err {
            RuleError::LookupFailed { reason, .. } => assert!(reason.contains("boom")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_depth_limit() {
        let lookup = InMemoryLookup::new()
            .with("a.proto", proto(&["b.proto"]))
            .with("b.proto", proto(&["c.proto"]))
            .with("c.proto", proto(&[]));
        let options = ResolveOptions { transitive: true, max_depth: 2, ..Default::default() };
        let err = resolve_references(ArtifactType::Protobuf, &proto(&["a.proto"]), &lookup, &options, &budget())
            .unwrap_err();
        assert!(err.is_resource_exhausted());
    }

    #[test]
    fn test_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("common")).unwrap();
        std::fs::write(dir.path().join("common/money.proto"), "syntax = \"proto3\";").unwrap();
        let lookup = InMemoryLookup::from_directory(dir.path()).unwrap();
        assert!(lookup.lookup(&"common/money.proto".into()).is_ok());
        assert_eq!(lookup.lookup(&"nope".into()), Err(LookupError::NotFound));
    }
}
