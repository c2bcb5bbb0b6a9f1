//! Per-key generation chains and their compaction.
//!
//! A generation without a `create_revision` is the deletion marker: the key
//! is currently deleted and the next put starts a lifecycle in that slot.
//! Only the last generation is ever mutated; earlier ones are history kept
//! until compaction drops them.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::Revision;

/// One create-to-delete lifecycle of a key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    /// `None` marks a deleted key.
    pub create_revision: Option<Revision>,
    pub version: i64,
    /// Every revision that touched the key in this lifecycle, oldest first.
    pub revisions: Vec<Revision>,
}

impl Generation {
    fn started_at(revision: Revision) -> Self {
        Self {
            create_revision: Some(revision),
            version: 1,
            revisions: vec![revision],
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.create_revision.is_none()
    }
}

/// The revision history of one key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvIndex {
    pub id: Vec<u8>,
    /// Revision of the most recent put or delete.
    pub mod_revision: Revision,
    pub generations: Vec<Generation>,
}

/// Position of a key inside its lifecycle right after a put or delete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lifecycle {
    pub create_revision: Revision,
    pub version: i64,
    /// Create revision and version of the lifecycle that was live before the
    /// mutation, when there was one.
    pub prev: Option<(Revision, i64)>,
}

impl KvIndex {
    pub fn new(key: &[u8]) -> Self {
        Self {
            id: key.to_vec(),
            ..Default::default()
        }
    }

    pub fn latest_generation(&self) -> Option<&Generation> {
        self.generations.last()
    }

    /// A key is live when its latest generation was created and not deleted.
    pub fn is_live(&self) -> bool {
        self.latest_generation()
            .map_or(false, |g| !g.is_tombstone() && !g.revisions.is_empty())
    }

    /// Records a put at `revision`.
    pub fn put(&mut self, revision: Revision) -> Lifecycle {
        let prev_mod = self.mod_revision;
        self.mod_revision = revision;

        let Some(latest) = self.generations.last_mut() else {
            self.generations.push(Generation::started_at(revision));
            return Lifecycle {
                create_revision: revision,
                version: 1,
                prev: None,
            };
        };

        match latest.create_revision {
            Some(create_revision) => {
                let prev = Some((create_revision, latest.version));
                latest.revisions.push(revision);
                latest.version += 1;
                debug!(key = ?String::from_utf8_lossy(&self.id), %revision, prev_mod = %prev_mod, "Index: put");
                Lifecycle {
                    create_revision,
                    version: latest.version,
                    prev,
                }
            }
            None => {
                // Deletion marker becomes the new lifecycle.
                *latest = Generation::started_at(revision);
                Lifecycle {
                    create_revision: revision,
                    version: 1,
                    prev: None,
                }
            }
        }
    }

    /// Records a delete at `revision`: closes the live generation and opens
    /// a deletion marker. Returns `None` when the key was not live.
    pub fn tombstone(&mut self, revision: Revision) -> Option<Lifecycle> {
        let latest = self.generations.last_mut()?;
        let create_revision = latest.create_revision?;

        let prev = Some((create_revision, latest.version));
        latest.revisions.push(revision);
        latest.version += 1;
        let version = latest.version;

        self.generations.push(Generation::default());
        self.mod_revision = revision;
        debug!(key = ?String::from_utf8_lossy(&self.id), %revision, "Index: tombstone");

        Some(Lifecycle {
            create_revision,
            version,
            prev,
        })
    }

    /// Newest revision with `main <= at` inside the lifecycle alive at `at`.
    ///
    /// The deletion revision itself counts as "not alive".
    pub fn revision_at(&self, at: i64) -> Option<Revision> {
        for (i, generation) in self.generations.iter().enumerate().rev() {
            let Some(created) = generation.create_revision else {
                continue;
            };
            if created.main > at {
                continue;
            }
            let closed = i + 1 < self.generations.len();
            let rev = generation.revisions.iter().rev().find(|r| r.main <= at).copied()?;
            if closed && generation.revisions.last() == Some(&rev) {
                // `rev` is the delete that closed this generation.
                return None;
            }
            return Some(rev);
        }
        None
    }

    pub fn count_revisions(&self) -> usize {
        self.generations.iter().map(|g| g.revisions.len()).sum()
    }
}

/// Rebuilds `kv_index` without the revisions `compact_revision` releases.
///
/// Returns the rebuilt index (`None` when nothing is left and the key should
/// be dropped) and the revisions whose records must be deleted.
///
/// History generations lose their revisions with `main < compact_revision.main`
/// and vanish when emptied; once one survives, every later generation is kept
/// intact. The latest generation always keeps its newest revision. A trailing
/// deletion marker survives only behind a surviving generation.
pub fn compact(kv_index: &KvIndex, compact_revision: Revision) -> (Option<KvIndex>, Vec<Revision>) {
    let mut generations: Vec<Generation> = Vec::new();
    let mut released = Vec::new();

    let Some((latest, history)) = kv_index.generations.split_last() else {
        return (Some(kv_index.clone()), released);
    };

    for generation in history {
        if !generations.is_empty() {
            generations.push(generation.clone());
            continue;
        }
        let Some(create_revision) = generation.create_revision else {
            continue;
        };
        let (old, kept): (Vec<Revision>, Vec<Revision>) = generation
            .revisions
            .iter()
            .copied()
            .partition(|r| r.main < compact_revision.main);
        released.extend(old);
        if !kept.is_empty() {
            generations.push(Generation {
                create_revision: Some(create_revision),
                version: generation.version,
                revisions: kept,
            });
        }
    }

    if latest.is_tombstone() || !generations.is_empty() {
        if !generations.is_empty() {
            generations.push(latest.clone());
        }
    } else if let Some((newest, older)) = latest.revisions.split_last() {
        let mut kept = Vec::with_capacity(older.len() + 1);
        for revision in older {
            if revision.main < compact_revision.main {
                released.push(*revision);
            } else {
                kept.push(*revision);
            }
        }
        kept.push(*newest);
        generations.push(Generation {
            create_revision: latest.create_revision,
            version: latest.version,
            revisions: kept,
        });
    }

    if generations.is_empty() {
        return (None, released);
    }
    let rebuilt = KvIndex {
        id: kv_index.id.clone(),
        mod_revision: kv_index.mod_revision,
        generations,
    };
    (Some(rebuilt), released)
}
