// Copyright (c) The Mirror Developers
// SPDX-License-Identifier: Apache-2.0

//! Lazy traversal of the content-addressed object graph of one origin.
//!
//! The walker starts from an origin's latest snapshot and visits everything
//! reachable from its branches, deduplicating by identifier so shared
//! subtrees and cyclic revision graphs are each visited exactly once. It is
//! driven by an explicit work stack rather than recursion, so deep
//! revision-parent chains cannot exhaust the call stack.

use std::collections::{BTreeSet, HashSet};

use sha1::{Digest, Sha1};
use tracing::{error, trace};

use crate::{
    error::{ApiResult, WalkError, WalkResult},
    model::{
        Content,
        DirectoryEntry,
        EntryKind,
        ObjectId,
        ObjectKind,
        OriginStats,
        Release,
        Revision,
        Snapshot,
        TargetKind,
        Visit,
    },
};

/// Lazy locator for graph nodes. The walker resolves targets through this
/// seam; the REST client implements it for a live stack.
pub trait ObjectSource {
    fn latest_visit(&self, origin: &str) -> ApiResult<Option<Visit>>;
    fn origin_visits(&self, origin: &str) -> ApiResult<Vec<Visit>>;
    fn snapshot(&self, url: &str) -> ApiResult<Snapshot>;
    fn revision(&self, url: &str) -> ApiResult<Revision>;
    fn release(&self, url: &str) -> ApiResult<Release>;
    fn directory(&self, url: &str) -> ApiResult<Vec<DirectoryEntry>>;
    fn content(&self, url: &str) -> ApiResult<Content>;
    fn content_bytes(&self, url: &str) -> ApiResult<Vec<u8>>;
}

/// A node waiting on the traversal frontier.
#[derive(Debug)]
struct Pending {
    kind: ObjectKind,
    id: String,
    url: String,
}

/// A single-use, depth-first iterator over the objects reachable from one
/// traversal root.
///
/// Content, revision and release objects are yielded; directories and
/// snapshots are traversed but not streamed (the reconciler cares about
/// counts, which are read from [`GraphWalker::visited`] after the walk).
/// Each identifier is yielded at most once per walk.
pub struct GraphWalker<'a, S> {
    source: &'a S,
    visited: HashSet<ObjectId>,
    stack: Vec<Pending>,
}

impl<'a, S: ObjectSource> GraphWalker<'a, S> {
    /// Starts a walk at the latest snapshot of `origin`. An origin without a
    /// visit, or whose latest visit carries no snapshot, yields nothing.
    pub fn from_origin(source: &'a S, origin: &str) -> WalkResult<Self> {
        let mut walker = Self::empty(source);
        if let Some(visit) = source.latest_visit(origin)? {
            if let (Some(snapshot), Some(url)) = (visit.snapshot, visit.snapshot_url) {
                walker.stack.push(Pending {
                    kind: ObjectKind::Snapshot,
                    id: snapshot,
                    url,
                });
            }
        }
        Ok(walker)
    }

    /// Starts a walk at an arbitrary target reference.
    pub fn from_target(source: &'a S, kind: ObjectKind, id: &str, url: &str) -> Self {
        let mut walker = Self::empty(source);
        walker.stack.push(Pending {
            kind,
            id: id.into(),
            url: url.into(),
        });
        walker
    }

    fn empty(source: &'a S) -> Self {
        Self {
            source,
            visited: HashSet::new(),
            stack: Vec::new(),
        }
    }

    /// The identifiers visited so far, including traversed-but-not-yielded
    /// directories and snapshots.
    pub fn visited(&self) -> &HashSet<ObjectId> {
        &self.visited
    }

    /// Queues a target unless it was already visited. `frontier` is filled in
    /// traversal order and pushed in reverse, preserving listing order under
    /// the LIFO stack.
    fn enqueue(&mut self, frontier: &mut Vec<Pending>, kind: ObjectKind, id: &str, url: &str) {
        if !self.visited.contains(&ObjectId::new(kind, id)) {
            frontier.push(Pending {
                kind,
                id: id.into(),
                url: url.into(),
            });
        }
    }

    fn flush(&mut self, mut frontier: Vec<Pending>) {
        frontier.reverse();
        self.stack.append(&mut frontier);
    }

    /// Expands a snapshot: branches in mapping order, following pagination,
    /// skipping dangling (null) targets and aliases.
    fn expand_snapshot(&mut self, url: &str) -> WalkResult<()> {
        let mut frontier = Vec::new();
        let mut page = Some(url.to_owned());
        while let Some(page_url) = page {
            let snapshot = self.source.snapshot(&page_url)?;
            for (name, target) in &snapshot.branches {
                let Some(target) = target else {
                    trace!(branch = %name, "skipping dangling branch");
                    continue;
                };
                match target.target_type.object_kind() {
                    Some(kind) => {
                        let Some(target_url) = &target.target_url else {
                            continue;
                        };
                        self.enqueue(&mut frontier, kind, &target.target, target_url);
                    }
                    // Aliases point at sibling branches of the same snapshot,
                    // which are all walked anyway; they carry no object.
                    None => trace!(branch = %name, alias = %target.target, "skipping alias branch"),
                }
            }
            page = snapshot.next_branch.clone();
        }
        self.flush(frontier);
        Ok(())
    }

    /// Expands a directory listing in order; files resolve to contents,
    /// subdirectories are traversed transitively. Nested revisions
    /// (submodules) carry no reachable payload and are skipped.
    fn expand_directory(&mut self, url: &str) -> WalkResult<()> {
        let entries = self.source.directory(url)?;
        let mut frontier = Vec::new();
        for entry in &entries {
            let kind = match entry.kind {
                EntryKind::File => ObjectKind::Content,
                EntryKind::Dir => ObjectKind::Directory,
                EntryKind::Rev => {
                    trace!(entry = %entry.name, "skipping nested revision entry");
                    continue;
                }
            };
            let Some(target_url) = &entry.target_url else {
                continue;
            };
            self.enqueue(&mut frontier, kind, &entry.target, target_url);
        }
        self.flush(frontier);
        Ok(())
    }

    /// Fetches the raw bytes of a content object and checks them against the
    /// declared length and sha1 checksum. A mismatch aborts the traversal:
    /// the walk exists to validate replication.
    fn verify_content(&self, id: &ObjectId, url: &str) -> WalkResult<()> {
        let meta = self.source.content(url)?;
        let data = match self.source.content_bytes(&meta.data_url) {
            Ok(data) => data,
            Err(err) => {
                error!(%id, url = %meta.data_url, %err, "failed to load content bytes");
                return Err(err.into());
            }
        };
        if data.len() as u64 != meta.length {
            return Err(WalkError::ContentLengthMismatch {
                id: id.clone(),
                expected: meta.length,
                actual: data.len() as u64,
            });
        }
        let expected = meta
            .checksums
            .get("sha1")
            .ok_or_else(|| WalkError::MissingChecksum {
                id: id.clone(),
                field: "sha1",
            })?;
        let actual = hex::encode(Sha1::digest(&data));
        if &actual != expected {
            return Err(WalkError::ContentChecksumMismatch {
                id: id.clone(),
                expected: expected.clone(),
                actual,
            });
        }
        Ok(())
    }

    fn step(&mut self, pending: Pending) -> WalkResult<Option<ObjectId>> {
        let id = ObjectId::new(pending.kind, pending.id.as_str());
        // Check-then-insert is atomic here: the walk is strictly sequential.
        if !self.visited.insert(id.clone()) {
            return Ok(None);
        }
        match pending.kind {
            ObjectKind::Snapshot => {
                self.expand_snapshot(&pending.url)?;
                Ok(None)
            }
            ObjectKind::Directory => {
                self.expand_directory(&pending.url)?;
                Ok(None)
            }
            ObjectKind::Content => {
                self.verify_content(&id, &pending.url)?;
                Ok(Some(id))
            }
            ObjectKind::Revision => {
                let revision = self.source.revision(&pending.url)?;
                let mut frontier = Vec::new();
                // The directory subtree is walked before the parent chain.
                self.enqueue(
                    &mut frontier,
                    ObjectKind::Directory,
                    &revision.directory,
                    &revision.directory_url,
                );
                for parent in &revision.parents {
                    self.enqueue(&mut frontier, ObjectKind::Revision, &parent.id, &parent.url);
                }
                self.flush(frontier);
                Ok(Some(id))
            }
            ObjectKind::Release => {
                let release = self.source.release(&pending.url)?;
                let mut frontier = Vec::new();
                match release.target_type.object_kind() {
                    Some(kind) => {
                        self.enqueue(&mut frontier, kind, &release.target, &release.target_url)
                    }
                    None => trace!(release = %id, "release with alias target, skipping"),
                }
                self.flush(frontier);
                Ok(Some(id))
            }
        }
    }
}

impl<S: ObjectSource> Iterator for GraphWalker<'_, S> {
    type Item = WalkResult<ObjectId>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(pending) = self.stack.pop() {
            match self.step(pending) {
                Ok(Some(id)) => return Some(Ok(id)),
                Ok(None) => continue,
                Err(err) => {
                    // Abort the traversal; no partial-result recovery.
                    self.stack.clear();
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

/// Computes the per-origin statistics record from a full walk plus an
/// enumeration of all visits and their snapshot branches, mirroring what the
/// statistics producer reports on the journal.
pub fn origin_stats<S: ObjectSource>(source: &S, origin: &str) -> WalkResult<OriginStats> {
    let mut stats = OriginStats {
        origin: origin.to_owned(),
        ..Default::default()
    };

    let mut walker = GraphWalker::from_origin(source, origin)?;
    for item in walker.by_ref() {
        item?;
    }
    for id in walker.visited() {
        match id.kind {
            ObjectKind::Content => stats.cnt += 1,
            ObjectKind::Directory => stats.dir += 1,
            ObjectKind::Revision => stats.rev += 1,
            ObjectKind::Release | ObjectKind::Snapshot => {}
        }
    }

    // Branch statistics cover every visit, not just the latest one.
    let visits = source.origin_visits(origin)?;
    stats.visit = visits.len() as u64;
    let mut branches: BTreeSet<(String, TargetKind, String)> = BTreeSet::new();
    for visit in &visits {
        let mut page = visit.snapshot_url.clone();
        while let Some(url) = page {
            let snapshot = source.snapshot(&url)?;
            for (name, target) in snapshot.branches {
                if let Some(target) = target {
                    branches.insert((name, target.target_type, target.target));
                }
            }
            page = snapshot.next_branch;
        }
    }
    for (_, kind, _) in &branches {
        match kind {
            TargetKind::Release => stats.release += 1,
            TargetKind::Alias => stats.alias += 1,
            TargetKind::Revision => stats.branch += 1,
            _ => {}
        }
    }

    Ok(stats)
}
