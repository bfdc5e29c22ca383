// Copyright (c) The Mirror Developers
// SPDX-License-Identifier: Apache-2.0

//! Blocking client for the mirror's public REST API.

use std::{
    cell::RefCell,
    time::{Duration, Instant},
};

use reqwest::{blocking::Client, StatusCode};
use serde::de::DeserializeOwned;

use crate::{
    error::{ApiError, ApiResult},
    model::{Content, CookStatus, DirectoryEntry, Origin, Release, Revision, Snapshot, Visit},
    walker::ObjectSource,
};

/// Latencies of the requests issued through one [`ApiClient`].
///
/// Owned by the client rather than kept in ambient global state, so callers
/// decide when to read and reset it.
#[derive(Debug, Default)]
pub struct RequestTimings {
    samples: Vec<Duration>,
}

impl RequestTimings {
    pub fn record(&mut self, elapsed: Duration) {
        self.samples.push(elapsed);
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn total(&self) -> Duration {
        self.samples.iter().sum()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// A blocking HTTP client for the archive API and the auxiliary surfaces
/// (mail capture, vault) exposed by the stack under test.
pub struct ApiClient {
    http: Client,
    base_url: String,
    api_url: String,
    timings: RefCell<RequestTimings>,
}

impl ApiClient {
    /// Creates a client for the stack reachable at `base_url`, with the
    /// archive API rooted at `api_url` (typically `{base_url}/api/1`).
    pub fn new(base_url: impl Into<String>, api_url: impl Into<String>) -> ApiResult<Self> {
        let http = Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_url: api_url.into(),
            timings: RefCell::new(RequestTimings::default()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Runs `f` on the accumulated request timings.
    pub fn with_timings<T>(&self, f: impl FnOnce(&mut RequestTimings) -> T) -> T {
        f(&mut self.timings.borrow_mut())
    }

    /// GETs `url` and decodes the JSON response, failing on any non-2xx status.
    pub fn get_json<T: DeserializeOwned>(&self, url: &str) -> ApiResult<T> {
        let response = self.request_checked(url)?;
        Ok(response.json()?)
    }

    /// GETs `url` and returns the raw response body.
    pub fn get_bytes(&self, url: &str) -> ApiResult<Vec<u8>> {
        let response = self.request_checked(url)?;
        Ok(response.bytes()?.to_vec())
    }

    /// POSTs to `url` and decodes the JSON response; 200, 201 and 202 are
    /// all accepted.
    pub fn post_json<T: DeserializeOwned>(&self, url: &str) -> ApiResult<T> {
        let started = Instant::now();
        let response = self.http.post(url).send()?;
        self.timings.borrow_mut().record(started.elapsed());
        let status = response.status();
        if !matches!(
            status,
            StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED
        ) {
            return Err(ApiError::Status {
                url: url.into(),
                status,
            });
        }
        Ok(response.json()?)
    }

    /// GETs `url` and fails unless the response status is exactly `expected`.
    ///
    /// Used for the masking check, which requires a 403 rather than merely
    /// a non-success.
    pub fn expect_status(&self, url: &str, expected: StatusCode) -> ApiResult<()> {
        let started = Instant::now();
        let response = self.http.get(url).send()?;
        self.timings.borrow_mut().record(started.elapsed());
        let actual = response.status();
        if actual != expected {
            return Err(ApiError::UnexpectedStatus {
                url: url.into(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn request_checked(&self, url: &str) -> ApiResult<reqwest::blocking::Response> {
        let started = Instant::now();
        let response = self.http.get(url).send()?;
        self.timings.borrow_mut().record(started.elapsed());
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                url: url.into(),
                status,
            });
        }
        Ok(response)
    }

    /// All origins known to the mirror.
    pub fn origins(&self) -> ApiResult<Vec<Origin>> {
        self.get_json(&format!("{}/origins/", self.api_url))
    }

    /// The URL of the latest-visit endpoint for `origin`.
    pub fn latest_visit_url(&self, origin: &str) -> String {
        format!(
            "{}/origin/{origin}/visit/latest/?require_snapshot=true",
            self.api_url
        )
    }

    /// Enqueues a flat (directory) vault cooking for `swhid`.
    pub fn cook_request(&self, swhid: &str) -> ApiResult<CookStatus> {
        self.post_json(&format!("{}/vault/flat/{swhid}/", self.api_url))
    }

    /// Polls the status of a previously enqueued cooking.
    pub fn cook_status(&self, swhid: &str) -> ApiResult<CookStatus> {
        self.get_json(&format!("{}/vault/flat/{swhid}", self.api_url))
    }

    /// A directory listing by identifier (used when validating cooked bundles).
    pub fn directory_by_id(&self, id: &str) -> ApiResult<serde_json::Value> {
        self.get_json(&format!("{}/directory/{id}/", self.api_url))
    }

    /// The messages captured by the mail-capture service.
    pub fn mail_messages(&self) -> ApiResult<serde_json::Value> {
        self.get_json(&format!("{}/mail/api/v2/messages", self.base_url))
    }
}

impl ObjectSource for ApiClient {
    fn latest_visit(&self, origin: &str) -> ApiResult<Option<Visit>> {
        match self.get_json::<Visit>(&self.latest_visit_url(origin)) {
            Ok(visit) => Ok(Some(visit)),
            Err(error) if error.http_status_code() == Some(StatusCode::NOT_FOUND) => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn origin_visits(&self, origin: &str) -> ApiResult<Vec<Visit>> {
        self.get_json(&format!("{}/origin/{origin}/visits/", self.api_url))
    }

    fn snapshot(&self, url: &str) -> ApiResult<Snapshot> {
        self.get_json(url)
    }

    fn revision(&self, url: &str) -> ApiResult<Revision> {
        self.get_json(url)
    }

    fn release(&self, url: &str) -> ApiResult<Release> {
        self.get_json(url)
    }

    fn directory(&self, url: &str) -> ApiResult<Vec<DirectoryEntry>> {
        self.get_json(url)
    }

    fn content(&self, url: &str) -> ApiResult<Content> {
        self.get_json(url)
    }

    fn content_bytes(&self, url: &str) -> ApiResult<Vec<u8>> {
        self.get_bytes(url)
    }
}
