// Copyright (c) The Mirror Developers
// SPDX-License-Identifier: Apache-2.0

//! Data model of the archive's object graph and the harness's expected state.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// The kind of a content-addressed archive object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Content,
    Directory,
    Revision,
    Release,
    Snapshot,
}

impl ObjectKind {
    /// The short tag used inside identifiers.
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Content => "cnt",
            Self::Directory => "dir",
            Self::Revision => "rev",
            Self::Release => "rel",
            Self::Snapshot => "snp",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

impl FromStr for ObjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cnt" => Ok(Self::Content),
            "dir" => Ok(Self::Directory),
            "rev" => Ok(Self::Revision),
            "rel" => Ok(Self::Release),
            "snp" => Ok(Self::Snapshot),
            other => Err(format!("unknown object kind tag {other:?}")),
        }
    }
}

/// A SWHID-like identifier: an object kind plus its content-derived hash.
///
/// Identifiers are globally unique and immutable; they key the walker's
/// visited set and the reconciler's maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId {
    pub kind: ObjectKind,
    pub hash: String,
}

impl ObjectId {
    pub fn new(kind: ObjectKind, hash: impl Into<String>) -> Self {
        Self {
            kind,
            hash: hash.into(),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "swh:1:{}:{}", self.kind, self.hash)
    }
}

/// The kind of a branch or release target, as reported by the REST API.
///
/// This is a closed set: an unknown `target_type` string is a deserialization
/// error rather than a silently ignored fallthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Content,
    Directory,
    Revision,
    Release,
    Snapshot,
    /// A named pointer to another branch of the same snapshot. Aliases carry
    /// no object of their own and are not dereferenced by the walker.
    Alias,
}

impl TargetKind {
    /// The object kind a target of this kind resolves to, if it is an object.
    pub fn object_kind(&self) -> Option<ObjectKind> {
        match self {
            Self::Content => Some(ObjectKind::Content),
            Self::Directory => Some(ObjectKind::Directory),
            Self::Revision => Some(ObjectKind::Revision),
            Self::Release => Some(ObjectKind::Release),
            Self::Snapshot => Some(ObjectKind::Snapshot),
            Self::Alias => None,
        }
    }
}

/// One point-in-time observation of an origin, as returned by the visit endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct Visit {
    pub origin: Option<String>,
    pub visit: Option<u64>,
    pub snapshot: Option<String>,
    pub snapshot_url: Option<String>,
}

/// A snapshot: the named branches observed at one visit of an origin.
///
/// Branch values may be null for dangling or deleted branches. Large
/// snapshots are paginated through `next_branch`.
#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub branches: BTreeMap<String, Option<BranchTarget>>,
    #[serde(default)]
    pub next_branch: Option<String>,
}

/// The target of a snapshot branch or release.
#[derive(Debug, Clone, Deserialize)]
pub struct BranchTarget {
    pub target: String,
    pub target_type: TargetKind,
    #[serde(default)]
    pub target_url: Option<String>,
}

/// A revision: one directory plus zero or more parent revisions.
#[derive(Debug, Clone, Deserialize)]
pub struct Revision {
    pub id: String,
    pub directory: String,
    pub directory_url: String,
    #[serde(default)]
    pub parents: Vec<RevisionParent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RevisionParent {
    pub id: String,
    pub url: String,
}

/// A release: a named, annotated pointer to a single target of any kind.
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub id: String,
    pub target: String,
    pub target_type: TargetKind,
    pub target_url: String,
}

/// The kind tag of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Dir,
    /// A nested revision (submodule); carries no reachable payload here.
    Rev,
}

/// One named entry of a directory listing.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub target: String,
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub perms: Option<u32>,
    #[serde(default)]
    pub length: Option<u64>,
}

/// Content metadata: declared length, checksums and the raw-bytes locator.
#[derive(Debug, Clone, Deserialize)]
pub struct Content {
    pub length: u64,
    pub checksums: BTreeMap<String, String>,
    pub data_url: String,
}

/// An origin listed by the archive.
#[derive(Debug, Clone, Deserialize)]
pub struct Origin {
    pub url: String,
}

/// The status of a vault cooking request.
#[derive(Debug, Clone, Deserialize)]
pub struct CookStatus {
    pub status: String,
    #[serde(default)]
    pub fetch_url: Option<String>,
}

/// The per-origin expected-state record carried by the statistics topic.
///
/// One terminal record per origin is produced per run; the harness compares
/// it structurally against the counts the walker derives independently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginStats {
    pub origin: String,
    pub visit: u64,
    pub release: u64,
    pub alias: u64,
    pub branch: u64,
    pub cnt: u64,
    pub dir: u64,
    pub rev: u64,
}
