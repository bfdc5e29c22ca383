// Copyright (c) The Mirror Developers
// SPDX-License-Identifier: Apache-2.0

//! Shared plumbing for the end-to-end tests: environment wiring, stack
//! flavors, the initial service map of a freshly deployed stack, the
//! replication scenario itself, HEAD resolution and cooked-bundle
//! validation.

use std::{
    collections::BTreeMap,
    env,
    io::Read,
    path::PathBuf,
    thread,
    time::Duration,
};

use anyhow::{bail, Context};
use flate2::read::GzDecoder;
use mirror_harness::{
    api::ApiClient,
    control::{ControlPlane, DockerCli},
    model::{BranchTarget, CookStatus, Release, Revision, TargetKind},
    monitor::{wait_for_log_entry, wait_services_status},
    reconciler::StatsConsumer,
    stack::{MirrorStack, StackConfig},
    walker::{self, ObjectSource},
};
use reqwest::StatusCode;
use sha1::{Digest, Sha1};
use tracing::{debug, info};

/// The journal topic carrying the per-origin expected-state records.
pub const STATS_TOPIC: &str = "swh.test.objects.stats";

/// Replicas each replayer service is scaled to for the replay phase.
const SCALE: u64 = 2;

const MASKED_ORIGIN: &str = "https://github.com/SoftwareHeritage/swh-core";
const UNMASKED_ORIGIN: &str = "https://pypi.org/project/swh.core/";

/// One deployment variant of the mirror stack: which compose manifest to
/// deploy and which replayer services the replication round-trip drives.
#[derive(Debug, Clone, Copy)]
pub struct StackFlavor {
    pub compose_file: &'static str,
    /// Services the replication round-trip scales up and back down.
    pub replayer_services: &'static [&'static str],
}

impl StackFlavor {
    /// The default stack with a combined graph replayer.
    pub const BASIC: Self = Self {
        compose_file: "mirror.yml",
        replayer_services: &["content-replayer", "graph-replayer"],
    };

    /// The graph replay split across per-object-type replayer services.
    pub const ADVANCED: Self = Self {
        compose_file: "mirror-advanced.yml",
        replayer_services: &[
            "content-replayer",
            "graph-replayer",
            "graph-replayer-content",
            "graph-replayer-directory",
        ],
    };

    /// The basic scenario backed by a Cassandra storage.
    pub const CASSANDRA: Self = Self {
        compose_file: "mirror-cassandra.yml",
        replayer_services: Self::BASIC.replayer_services,
    };
}

/// Connection and deployment parameters, read from `MIRROR_TEST_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct TestEnv {
    pub broker: String,
    pub username: String,
    pub password: String,
    pub objstorage_url: String,
    pub base_url: String,
    pub api_url: String,
    pub image_tag: String,
    /// Overrides the flavor's compose manifest when set.
    pub compose_file: Option<String>,
    pub source_dir: PathBuf,
    pub cluster_name: Option<String>,
    pub keep_stack: bool,
    pub log_dir: PathBuf,
}

fn required(name: &str) -> anyhow::Result<String> {
    env::var(name).with_context(|| format!("{name} must be set"))
}

impl TestEnv {
    pub fn from_env() -> anyhow::Result<Self> {
        let base_url = env::var("MIRROR_TEST_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:5081".to_owned());
        let api_url =
            env::var("MIRROR_TEST_API_URL").unwrap_or_else(|_| format!("{base_url}/api/1"));
        Ok(Self {
            broker: required("MIRROR_TEST_KAFKA_BROKER")?,
            username: required("MIRROR_TEST_KAFKA_USERNAME")?,
            password: required("MIRROR_TEST_KAFKA_PASSWORD")?,
            objstorage_url: required("MIRROR_TEST_OBJSTORAGE_URL")?,
            image_tag: required("MIRROR_IMAGE_TAG")?,
            compose_file: env::var("MIRROR_TEST_COMPOSE_FILE").ok(),
            source_dir: env::var_os("MIRROR_TEST_SOURCE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            cluster_name: env::var("MIRROR_TEST_CLUSTER_NAME").ok(),
            keep_stack: env::var("MIRROR_TEST_KEEP_STACK").is_ok_and(|v| v == "1"),
            log_dir: env::var_os("MIRROR_TEST_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("service-logs")),
            base_url,
            api_url,
        })
    }

    pub fn stack_config(&self, flavor: &StackFlavor) -> StackConfig {
        StackConfig {
            source_dir: self.source_dir.clone(),
            compose_file: self
                .compose_file
                .clone()
                .unwrap_or_else(|| flavor.compose_file.to_owned()),
            broker: self.broker.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            objstorage_url: self.objstorage_url.clone(),
            cluster_name: self.cluster_name.clone(),
            image_tag: self.image_tag.clone(),
            keep_stack: self.keep_stack,
            log_dir: self.log_dir.clone(),
            probe_urls: vec![format!("{}/", self.base_url)],
        }
    }

    pub fn api_client(&self) -> anyhow::Result<ApiClient> {
        Ok(ApiClient::new(&self.base_url, &self.api_url)?)
    }
}

/// The replica state every service of a freshly deployed stack must reach
/// before any scenario starts. Replayers and the notification watcher stay
/// at zero until a test scales them.
pub fn initial_services_status(stack: &str, flavor: &StackFlavor) -> BTreeMap<String, String> {
    let mut status: BTreeMap<String, String> = [
        ("amqp", "1/1"),
        ("grafana", "1/1"),
        ("mailhog", "1/1"),
        ("memcache", "1/1"),
        ("nginx", "1/1"),
        ("notification-watcher", "0/0"),
        ("objstorage", "1/1"),
        ("prometheus", "1/1"),
        ("prometheus-statsd-exporter", "1/1"),
        ("redis", "1/1"),
        ("scheduler", "1/1"),
        ("scheduler-db", "1/1"),
        ("scheduler-listener", "1/1"),
        ("scheduler-runner", "1/1"),
        ("storage", "1/1"),
        ("storage-db", "1/1"),
        ("vault", "1/1"),
        ("vault-db", "1/1"),
        ("vault-worker", "1/1"),
        ("web", "1/1"),
        ("web-db", "1/1"),
    ]
    .into_iter()
    .map(|(name, status)| (format!("{stack}_{name}"), status.to_owned()))
    .collect();
    for service in flavor.replayer_services {
        status.insert(format!("{stack}_{service}"), "0/0".to_owned());
    }
    status
}

/// Runs the full replication round-trip against a live stack of the given
/// flavor: deploy, replay the journal, reconcile every origin against the
/// expected-state topic, cook and validate HEAD directories through the
/// vault, and exercise removal-notification handling.
pub fn run_mirror_scenario(flavor: &StackFlavor) -> anyhow::Result<()> {
    let env = TestEnv::from_env()?;
    let control = DockerCli::default();
    let mut stack = MirrorStack::deploy(control, env.stack_config(flavor))?;
    let control = stack.control().clone();
    let client = env.api_client()?;

    wait_services_status(
        &control,
        stack.name(),
        &initial_services_status(stack.name(), flavor),
    )?;

    // Scale the replayers up and wait until each replica announces itself.
    for short in flavor.replayer_services {
        let service = stack.service_name(short);
        info!(%service, "scaling to {SCALE}");
        control.scale_service(&service, SCALE, true)?;
        wait_for_log_entry(
            &control,
            &service,
            "Starting the SWH mirror (graph|content) replayer",
            SCALE as usize,
            false,
        )?;
    }

    // The replayers stop on partition EOF; wait them out and scale back down.
    for short in flavor.replayer_services {
        let service = stack.service_name(short);
        info!(%service, "waiting for replay to finish");
        wait_for_log_entry(&control, &service, "Done.", SCALE as usize, false)?;
        control.scale_service(&service, 0, false)?;
        wait_services_status(
            &control,
            stack.name(),
            &BTreeMap::from([(service.clone(), "0/0".to_owned())]),
        )?;
    }

    // Ground truth from the journal, replica state from the archive API.
    let origins = client.origins()?;
    let consumer = StatsConsumer::new(
        &stack.kafka_settings(),
        &format!("{}_stats", stack.group_id()),
        STATS_TOPIC,
    )?;
    let expected_stats = consumer.expected_stats()?;

    info!("checking the replicated archive");
    let mut origin_urls: Vec<_> = origins.iter().map(|o| o.url.clone()).collect();
    origin_urls.sort();
    let expected_origins: Vec<_> = expected_stats.keys().cloned().collect();
    assert_eq!(origin_urls, expected_origins);

    for (origin, expected) in &expected_stats {
        assert_eq!(origin, &expected.origin);
        let stats = walker::origin_stats(&client, origin)?;
        let (count, total) = client.with_timings(|t| (t.count(), t.total()));
        info!(%origin, requests = count, ?total, "walked");
        client.with_timings(|t| t.clear());
        assert_eq!(&stats, expected);
        info!(%origin, "origin is consistent");
    }

    // Cook the HEAD directory of every origin through the vault.
    let mut cooks: Vec<(String, String, CookStatus)> = Vec::new();
    for origin in &origins {
        let swhid = head_directory_swhid(&client, &origin.url)?;
        info!(origin = %origin.url, %swhid, "cooking HEAD directory");
        let cook = client.cook_request(&swhid)?;
        assert!(
            matches!(cook.status.as_str(), "new" | "pending"),
            "unexpected cooking status {}",
            cook.status,
        );
        cooks.push((origin.url.clone(), swhid, cook));
    }

    while !cooks.iter().all(|(_, _, cook)| cook.status == "done") {
        let (origin, swhid, cook) = cooks.remove(0);
        assert_ne!(cook.status, "failed", "cooking of {swhid} failed");
        let cook = client.cook_status(&swhid)?;
        cooks.push((origin, swhid, cook));
        thread::sleep(Duration::from_secs(1));
    }
    info!("all origins have been cooked");

    for (origin, swhid, cook) in &cooks {
        info!(%origin, %swhid, "validating cooked directory");
        let fetch_url = cook
            .fetch_url
            .as_ref()
            .context("done cooking has no fetch_url")?;
        let bundle = client.get_bytes(fetch_url)?;
        validate_cooked_bundle(&client, swhid, &bundle)?;
    }
    info!("all cooked origins have been validated");

    // Removal-notification handling: masked origins disappear from public
    // view, unrelated origins keep their statistics.
    let watcher = stack.service_name("notification-watcher");
    info!(service = %watcher, "scaling to 1");
    control.scale_service(&watcher, 1, false)?;

    let removal_id = "test_removal_swh_core";
    let subject = format!(
        "[Action needed] Removal from the main Software Heritage archive ({removal_id})"
    );
    // The watcher logs typographic quotes, not ASCII ones.
    for entry in [
        "Watching notifications for mirrors".to_owned(),
        format!("Received a removal notification \u{201c}{removal_id}\u{201d}"),
        format!("Sending email \u{201c}{subject}\u{201d}"),
    ] {
        info!(%entry, "waiting for log entry");
        wait_for_log_entry(&control, &watcher, &entry, 1, true)?;
    }

    info!("checking the notification email was sent");
    let mut messages = client.mail_messages()?;
    for _ in 0..10 {
        if messages["count"].as_u64().unwrap_or(0) >= 1 {
            break;
        }
        thread::sleep(Duration::from_secs(1));
        messages = client.mail_messages()?;
    }
    assert!(messages["count"].as_u64().unwrap_or(0) >= 1);
    let found = messages["items"]
        .as_array()
        .into_iter()
        .flatten()
        .any(|msg| msg["Content"]["Headers"]["Subject"][0].as_str() == Some(subject.as_str()));
    assert!(found, "expected email message missing");

    info!(origin = MASKED_ORIGIN, "checking the origin has been masked");
    client.expect_status(&client.latest_visit_url(MASKED_ORIGIN), StatusCode::FORBIDDEN)?;

    info!(origin = UNMASKED_ORIGIN, "checking the unrelated origin is untouched");
    let stats = walker::origin_stats(&client, UNMASKED_ORIGIN)?;
    assert_eq!(Some(&stats), expected_stats.get(UNMASKED_ORIGIN));

    stack.teardown()?;
    Ok(())
}

/// Resolves the HEAD branch of an origin's latest snapshot to a directory
/// SWHID, chasing aliases within the snapshot and dereferencing releases
/// and revisions.
pub fn head_directory_swhid(client: &ApiClient, origin: &str) -> anyhow::Result<String> {
    let visit = client
        .latest_visit(origin)?
        .with_context(|| format!("{origin} has no visit with a snapshot"))?;
    let snapshot_url = visit
        .snapshot_url
        .with_context(|| format!("latest visit of {origin} carries no snapshot"))?;

    let mut branches: BTreeMap<String, Option<BranchTarget>> = BTreeMap::new();
    let mut page = Some(snapshot_url);
    while let Some(url) = page {
        let snapshot = client.snapshot(&url)?;
        branches.extend(snapshot.branches);
        page = snapshot.next_branch;
    }

    let mut head = branches
        .get("HEAD")
        .cloned()
        .flatten()
        .with_context(|| format!("{origin} snapshot has no HEAD branch"))?;
    loop {
        match head.target_type {
            TargetKind::Alias => {
                head = branches
                    .get(&head.target)
                    .cloned()
                    .flatten()
                    .with_context(|| format!("dangling alias {}", head.target))?;
            }
            TargetKind::Release => {
                let url = head.target_url.context("release target without URL")?;
                let release: Release = client.release(&url)?;
                head = BranchTarget {
                    target: release.target,
                    target_type: release.target_type,
                    target_url: Some(release.target_url),
                };
            }
            TargetKind::Directory => return Ok(format!("swh:1:dir:{}", head.target)),
            TargetKind::Revision => {
                let url = head.target_url.context("revision target without URL")?;
                let revision: Revision = client.revision(&url)?;
                return Ok(format!("swh:1:dir:{}", revision.directory));
            }
            other => bail!("HEAD of {origin} resolves to unsupported target {other:?}"),
        }
    }
}

struct BundleEntry {
    path: String,
    is_dir: bool,
    is_symlink: bool,
    link_target: Option<String>,
    data: Vec<u8>,
}

/// Validates a cooked flat bundle member by member against the archive's
/// directory endpoint: names are rooted at the SWHID, directory entries are
/// directories, symlinks point where the archived content says, and regular
/// files match their declared length and sha1.
pub fn validate_cooked_bundle(
    client: &ApiClient,
    swhid: &str,
    bundle: &[u8],
) -> anyhow::Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(bundle));
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        let header = entry.header();
        let is_dir = header.entry_type().is_dir();
        let is_symlink = header.entry_type().is_symlink();
        let link_target = entry
            .link_name()?
            .map(|p| p.to_string_lossy().into_owned());
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        entries.push(BundleEntry {
            path,
            is_dir,
            is_symlink,
            link_target,
            data,
        });
    }
    anyhow::ensure!(!entries.is_empty(), "bundle for {swhid} is empty");
    for entry in &entries {
        anyhow::ensure!(
            entry.path.trim_end_matches('/').starts_with(swhid),
            "bundle member {} is not rooted at {swhid}",
            entry.path
        );
    }

    // The first member is the root directory itself and has no archive-side
    // counterpart to look up.
    for entry in &entries[1..] {
        let id_path = entry
            .path
            .trim_end_matches('/')
            .strip_prefix("swh:1:dir:")
            .context("member path lost its SWHID prefix")?;
        let expected: serde_json::Value = client.directory_by_id(id_path)?;
        debug!(path = %entry.path, ?expected, "validating bundle member");
        match expected["type"].as_str() {
            Some("dir") => {
                anyhow::ensure!(entry.is_dir, "{} should be a directory", entry.path)
            }
            Some("file") if expected["perms"].as_u64() == Some(0o120000) => {
                anyhow::ensure!(entry.is_symlink, "{} should be a symlink", entry.path);
                let target_url = expected["target_url"]
                    .as_str()
                    .context("symlink entry without target_url")?;
                let content = client.content(target_url)?;
                let link = client.content_bytes(&content.data_url)?;
                anyhow::ensure!(
                    entry.link_target.as_deref().map(str::as_bytes) == Some(link.as_slice()),
                    "{} points at {:?}, archive says {:?}",
                    entry.path,
                    entry.link_target,
                    String::from_utf8_lossy(&link),
                );
            }
            Some("file") => {
                anyhow::ensure!(!entry.is_dir && !entry.is_symlink);
                let length = expected["length"]
                    .as_u64()
                    .context("file entry without length")?;
                anyhow::ensure!(
                    entry.data.len() as u64 == length,
                    "{} has {} bytes, archive says {length}",
                    entry.path,
                    entry.data.len(),
                );
                let digest = hex::encode(Sha1::digest(&entry.data));
                let declared = expected["checksums"]["sha1"]
                    .as_str()
                    .context("file entry without sha1")?;
                anyhow::ensure!(
                    digest == declared,
                    "{} sha1 is {digest}, archive says {declared}",
                    entry.path,
                );
            }
            other => bail!("unexpected entry type {other:?} for {}", entry.path),
        }
    }
    info!(%swhid, members = entries.len(), "cooked bundle validated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_env() -> TestEnv {
        TestEnv {
            broker: "broker:9092".to_owned(),
            username: "mirror".to_owned(),
            password: "hunter2".to_owned(),
            objstorage_url: "http://objstorage:5003".to_owned(),
            base_url: "http://127.0.0.1:5081".to_owned(),
            api_url: "http://127.0.0.1:5081/api/1".to_owned(),
            image_tag: "20260827".to_owned(),
            compose_file: None,
            source_dir: PathBuf::from("."),
            cluster_name: None,
            keep_stack: false,
            log_dir: PathBuf::from("service-logs"),
        }
    }

    #[test]
    fn each_flavor_deploys_its_own_compose_manifest() {
        let env = test_env();
        assert_eq!(env.stack_config(&StackFlavor::BASIC).compose_file, "mirror.yml");
        assert_eq!(
            env.stack_config(&StackFlavor::ADVANCED).compose_file,
            "mirror-advanced.yml"
        );
        assert_eq!(
            env.stack_config(&StackFlavor::CASSANDRA).compose_file,
            "mirror-cassandra.yml"
        );
    }

    #[test]
    fn compose_file_override_beats_the_flavor() {
        let mut env = test_env();
        env.compose_file = Some("mirror-local.yml".to_owned());
        assert_eq!(
            env.stack_config(&StackFlavor::BASIC).compose_file,
            "mirror-local.yml"
        );
    }

    #[test]
    fn advanced_flavor_waits_on_the_split_graph_replayers() {
        let advanced = initial_services_status("mirrortest", &StackFlavor::ADVANCED);
        for service in [
            "mirrortest_graph-replayer-content",
            "mirrortest_graph-replayer-directory",
        ] {
            assert_eq!(advanced.get(service).map(String::as_str), Some("0/0"));
        }

        let basic = initial_services_status("mirrortest", &StackFlavor::BASIC);
        assert!(!basic.contains_key("mirrortest_graph-replayer-content"));
        assert_eq!(advanced.len(), basic.len() + 2);
        assert_eq!(
            basic.get("mirrortest_graph-replayer").map(String::as_str),
            Some("0/0")
        );
    }
}
