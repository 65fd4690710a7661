//! Picks the chain of catalog patches that reaches the newest version.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, PatchError, Result};
use crate::version::Version;

/// One published patch. Exactly one of `version_from` (exact source version)
/// and `version_from_subsequent` (lower bound, used by full patches) is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEdge {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_from: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_from_subsequent: Option<Version>,
    pub version_to: Version,
    pub download_length: u64,
}

impl CatalogEdge {
    /// Whether this patch can be installed on top of `installed`. Downgrades
    /// and no-op edges are never usable.
    pub fn usable_from(&self, installed: &Version, accept_only_full: bool) -> bool {
        if self.version_to <= *installed {
            return false;
        }
        match (&self.version_from, &self.version_from_subsequent) {
            (Some(from), None) => !accept_only_full && from == installed,
            (None, Some(lower)) => lower <= installed,
            _ => false,
        }
    }
}

/// Read a JSON array of edges.
pub fn load_catalog(path: &Path) -> Result<Vec<CatalogEdge>> {
    let text = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let catalog: Vec<CatalogEdge> = serde_json::from_str(&text)
        .map_err(|e| PatchError::format(format!("catalog {}: {e}", path.display())))?;
    for edge in &catalog {
        if edge.version_from.is_some() == edge.version_from_subsequent.is_some() {
            return Err(PatchError::format(format!(
                "catalog edge {} must set exactly one of version_from and version_from_subsequent",
                edge.id
            )));
        }
    }
    Ok(catalog)
}

#[derive(Debug, Clone)]
struct Chain {
    reaches: Version,
    total: u64,
    edges: Vec<usize>,
}

impl Chain {
    fn empty(at: &Version) -> Self {
        Self {
            reaches: at.clone(),
            total: 0,
            edges: Vec::new(),
        }
    }

    /// Higher final version, then smaller download, then fewer patches.
    fn beats(&self, other: &Chain) -> bool {
        match self.reaches.cmp(&other.reaches) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => {
                (self.total, self.edges.len()) < (other.total, other.edges.len())
            }
        }
    }
}

struct Search<'a> {
    catalog: &'a [CatalogEdge],
    accept_only_full: bool,
    best: HashMap<Version, Chain>,
}

impl Search<'_> {
    fn best_from(&mut self, installed: &Version) -> Chain {
        if let Some(chain) = self.best.get(installed) {
            return chain.clone();
        }
        let mut best = Chain::empty(installed);
        for (index, edge) in self.catalog.iter().enumerate() {
            if !edge.usable_from(installed, self.accept_only_full) {
                continue;
            }
            // Edges only move upward, so this recursion terminates.
            let rest = self.best_from(&edge.version_to);
            let candidate = Chain {
                reaches: rest.reaches,
                total: edge.download_length.saturating_add(rest.total),
                edges: std::iter::once(index).chain(rest.edges).collect(),
            };
            if candidate.beats(&best) {
                best = candidate;
            }
        }
        self.best.insert(installed.clone(), best.clone());
        best
    }
}

/// The patches to install, in order, to get from `current` to the highest
/// reachable version at the lowest download cost. Empty when already newest.
pub fn resolve_chain(
    catalog: &[CatalogEdge],
    current: &Version,
    accept_only_full: bool,
) -> Vec<CatalogEdge> {
    let mut search = Search {
        catalog,
        accept_only_full,
        best: HashMap::new(),
    };
    let chain = search.best_from(current);
    tracing::debug!(
        from = %current,
        to = %chain.reaches,
        bytes = chain.total,
        patches = chain.edges.len(),
        "resolved patch chain"
    );
    chain.edges.into_iter().map(|i| catalog[i].clone()).collect()
}
