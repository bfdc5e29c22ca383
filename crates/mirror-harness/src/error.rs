// Copyright (c) The Mirror Developers
// SPDX-License-Identifier: Apache-2.0

//! Error types for the harness, one enum per concern.

use reqwest::StatusCode;

use crate::model::ObjectId;

pub type ControlResult<T> = Result<T, ControlError>;

/// Errors returned by the container-orchestrator control plane.
///
/// The CLI wrapper classifies failures here once, so callers can match on
/// variants instead of inspecting free-text error messages.
#[derive(thiserror::Error, Debug)]
pub enum ControlError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("unsupported service mode: {0}")]
    UnsupportedMode(String),

    #[error("`docker {command}` exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to parse `docker {command}` output: {message}")]
    UnexpectedOutput { command: String, message: String },

    #[error("log stream of service {service} ended before the expected entry was seen")]
    LogStreamClosed { service: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Errors raised while talking to the mirror's REST API.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),

    #[error("GET {url} returned {status}")]
    Status { url: String, status: StatusCode },

    #[error("GET {url} returned {actual}, expected {expected}")]
    UnexpectedStatus {
        url: String,
        expected: StatusCode,
        actual: StatusCode,
    },
}

impl ApiError {
    /// Returns the HTTP status code the server answered with, if any.
    pub fn http_status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Request(inner) => inner.status(),
            Self::Status { status, .. } => Some(*status),
            Self::UnexpectedStatus { actual, .. } => Some(*actual),
        }
    }
}

pub type WalkResult<T> = Result<T, WalkError>;

/// Errors raised during an object-graph traversal.
///
/// The content mismatch variants are data-integrity failures: the traversal
/// exists to validate replication, so they abort the walk instead of being
/// tolerated.
#[derive(thiserror::Error, Debug)]
pub enum WalkError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("content {id} has {actual} bytes, {expected} declared")]
    ContentLengthMismatch {
        id: ObjectId,
        expected: u64,
        actual: u64,
    },

    #[error("content {id} checksum is {actual}, {expected} declared")]
    ContentChecksumMismatch {
        id: ObjectId,
        expected: String,
        actual: String,
    },

    #[error("content {id} declares no {field} checksum")]
    MissingChecksum { id: ObjectId, field: &'static str },
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Errors raised while draining the expected-statistics topic.
#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("failed to decode a stats record: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("stats record key {key} does not match its embedded origin {origin}")]
    OriginKeyMismatch { key: String, origin: String },

    #[error("stats record at {topic}[{partition}]@{offset} has no {field}")]
    EmptyRecord {
        topic: String,
        partition: i32,
        offset: i64,
        field: &'static str,
    },
}

pub type StackResult<T> = Result<T, StackError>;

/// Errors raised by the stack lifecycle controller.
#[derive(thiserror::Error, Debug)]
pub enum StackError {
    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("image tag must be set to a build tag, not {0:?}")]
    InvalidImageTag(String),

    #[error("readiness probe {url} did not succeed within {timeout:?}")]
    StartupTimeout {
        url: String,
        timeout: std::time::Duration,
    },

    #[error("template source {0} does not exist")]
    MissingTemplate(std::path::PathBuf),
}
