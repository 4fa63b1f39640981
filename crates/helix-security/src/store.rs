//! Policy document store.
//!
//! Holds the single [`PolicyDocument`] read by the engine and edited by
//! operators. Every mutation runs under the write lock for its whole
//! read-modify-write (and persist) cycle, so concurrent editors are serialized
//! and each change is visible to the next evaluation as soon as the call returns.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{PolicyError, Result};
use crate::models::{InvalidPattern, ListKind, PolicyDocument, PolicyLocation, PolicyPatch};
use crate::pattern::CommandMatcher;

/// Longest accepted approval timeout (one week).
const MAX_TIMEOUT_SECONDS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug)]
pub struct PolicyStore {
    document: RwLock<PolicyDocument>,
    path: Option<PathBuf>,
}

impl PolicyStore {
    /// Create a store that keeps the document in memory only.
    pub fn new(document: PolicyDocument) -> Self {
        Self {
            document: RwLock::new(document),
            path: None,
        }
    }

    /// In-memory store seeded with the default document.
    pub fn in_memory() -> Self {
        Self::new(PolicyDocument::default())
    }

    /// Open a file-backed store. A missing file yields the default document;
    /// the file is only written on the first mutation.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let document = if path.exists() {
            let content = fs::read_to_string(&path)?;
            let document: PolicyDocument = serde_json::from_str(&content)?;
            validate(&document)?;
            debug!(path = %path.display(), "Loaded policy document");
            document
        } else {
            debug!(path = %path.display(), "No policy document on disk, using defaults");
            PolicyDocument::default()
        };

        Ok(Self {
            document: RwLock::new(document),
            path: Some(path),
        })
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Snapshot of the current document.
    pub fn current_document(&self) -> PolicyDocument {
        self.document.read().clone()
    }

    /// Run `f` against the current document without cloning it.
    pub fn read<R>(&self, f: impl FnOnce(&PolicyDocument) -> R) -> R {
        f(&self.document.read())
    }

    /// Replace the whole document.
    pub fn replace(&self, document: PolicyDocument) -> Result<()> {
        validate(&document)?;
        let mut current = self.document.write();
        self.commit(&mut current, document)?;
        info!("Policy document replaced");
        Ok(())
    }

    /// Apply a partial update and return the resulting document.
    pub fn patch(&self, patch: PolicyPatch) -> Result<PolicyDocument> {
        let mut current = self.document.write();
        let mut next = current.clone();

        if let Some(deny) = patch.global_deny {
            next.global_deny = deny;
        }
        if let Some(allow) = patch.global_allow {
            next.global_allow = allow;
        }
        if let Some(agents) = patch.per_agent {
            for (id, entry) in agents {
                match entry {
                    Some(policy) => {
                        next.per_agent.insert(id, policy);
                    }
                    None => {
                        next.per_agent.remove(&id);
                    }
                }
            }
        }
        if let Some(nodes) = patch.per_node {
            for (id, entry) in nodes {
                match entry {
                    Some(policy) => {
                        next.per_node.insert(id, policy);
                    }
                    None => {
                        next.per_node.remove(&id);
                    }
                }
            }
        }
        if let Some(timeout) = patch.timeout_seconds {
            next.timeout_seconds = timeout;
        }
        if let Some(action) = patch.default_timeout_action {
            next.default_timeout_action = action;
        }
        if let Some(policy) = patch.default_policy {
            next.default_policy = policy;
        }

        validate(&next)?;
        self.commit(&mut current, next.clone())?;
        info!("Policy document patched");
        Ok(next)
    }

    /// Append `pattern` to the allow list at `location`.
    ///
    /// Idempotent: returns `false` without touching the document when an
    /// equivalent pattern (patterns match case-insensitively) is already present.
    pub fn add_always_allow(&self, location: &PolicyLocation, pattern: &str) -> Result<bool> {
        let pattern = pattern.trim();
        CommandMatcher::compile(pattern)?;

        let mut current = self.document.write();
        let mut next = current.clone();
        let list = next.list_mut(location, ListKind::Allow);
        if list.iter().any(|existing| existing.trim().eq_ignore_ascii_case(pattern)) {
            debug!(%location, pattern, "Always-allow pattern already present");
            return Ok(false);
        }
        list.push(pattern.to_string());

        self.commit(&mut current, next)?;
        info!(%location, pattern, "Added always-allow pattern");
        Ok(true)
    }

    /// Every pattern in the document that fails to compile.
    pub fn invalid_patterns(&self) -> Vec<InvalidPattern> {
        let document = self.document.read();
        let mut lists: Vec<(PolicyLocation, ListKind, &Vec<String>)> = vec![
            (PolicyLocation::Global, ListKind::Deny, &document.global_deny),
            (PolicyLocation::Global, ListKind::Allow, &document.global_allow),
        ];
        for (id, policy) in &document.per_agent {
            lists.push((PolicyLocation::Agent(id.clone()), ListKind::Deny, &policy.deny));
            lists.push((PolicyLocation::Agent(id.clone()), ListKind::Allow, &policy.allow));
        }
        for (id, policy) in &document.per_node {
            lists.push((PolicyLocation::Node(id.clone()), ListKind::Deny, &policy.deny));
            lists.push((PolicyLocation::Node(id.clone()), ListKind::Allow, &policy.allow));
        }

        lists
            .into_iter()
            .flat_map(|(location, list, patterns)| {
                patterns.iter().filter_map(move |pattern| {
                    match CommandMatcher::compile(pattern) {
                        Ok(_) => None,
                        Err(err) => Some(InvalidPattern {
                            location: location.clone(),
                            list,
                            pattern: pattern.clone(),
                            reason: err.to_string(),
                        }),
                    }
                })
            })
            .collect()
    }

    /// Persist first, then swap: a failed write leaves the old document in place.
    fn commit(&self, current: &mut PolicyDocument, next: PolicyDocument) -> Result<()> {
        if let Some(path) = &self.path {
            write_document(path, &next)?;
        }
        *current = next;
        Ok(())
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn validate(document: &PolicyDocument) -> Result<()> {
    if document.timeout_seconds > MAX_TIMEOUT_SECONDS {
        return Err(PolicyError::Validation(format!(
            "timeoutSeconds {} exceeds max {}",
            document.timeout_seconds, MAX_TIMEOUT_SECONDS
        )));
    }
    if document.per_agent.keys().any(|id| id.trim().is_empty()) {
        return Err(PolicyError::Validation("agent id must not be empty".to_string()));
    }
    if document.per_node.keys().any(|id| id.trim().is_empty()) {
        return Err(PolicyError::Validation("node id must not be empty".to_string()));
    }
    Ok(())
}

fn write_document(path: &Path, document: &PolicyDocument) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut file = tempfile::NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut file, document)?;
    file.write_all(b"\n")?;
    file.flush()?;
    file.persist(path).map_err(|err| PolicyError::Io(err.error))?;
    Ok(())
}
