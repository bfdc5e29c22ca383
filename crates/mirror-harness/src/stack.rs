// Copyright (c) The Mirror Developers
// SPDX-License-Identifier: Apache-2.0

//! Stack lifecycle: deploy the mirror from its compose manifest, tear it
//! down and release its resources afterwards.
//!
//! Each run deploys under a fresh `mirrortest_<uuid>` namespace so that
//! concurrent or crashed runs never share secrets, configs, volumes or
//! consumer groups. Templated config files are rendered into a per-run
//! temporary directory; nothing under the source tree is modified.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use tempfile::TempDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    control::ControlPlane,
    error::{ControlError, StackError, StackResult},
    reconciler::{self, KafkaSettings},
    retry::RetryPolicy,
};

/// Services whose database password is provisioned as an orchestrator
/// secret before deployment.
const SECRET_SERVICES: [&str; 4] = ["storage", "web", "vault", "scheduler"];

/// Time each readiness endpoint has to come up after deployment.
const READINESS_DEADLINE: Duration = Duration::from_secs(60);

/// How long to wait for the labeled containers to drain after stack removal.
const CONTAINER_DRAIN: RetryPolicy = RetryPolicy {
    max_attempts: 60,
    backoff: Duration::from_secs(2),
    deadline: None,
};

/// Per-volume removal retries; volumes stay busy while their container's
/// mount is released.
const VOLUME_REMOVAL: RetryPolicy = RetryPolicy {
    max_attempts: 10,
    backoff: Duration::from_secs(3),
    deadline: None,
};

/// Everything needed to deploy one mirror stack.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Directory holding the compose manifest and the `conf/` and `env/`
    /// template trees.
    pub source_dir: PathBuf,
    /// Compose manifest file name within `source_dir`.
    pub compose_file: String,
    pub broker: String,
    pub username: String,
    pub password: String,
    pub objstorage_url: String,
    pub cluster_name: Option<String>,
    /// Image tag deployed by the manifest. Must be a build tag; `latest`
    /// hides version skew between services and is rejected.
    pub image_tag: String,
    /// Leave the stack running at teardown, for post-mortem inspection.
    pub keep_stack: bool,
    /// Where per-service logs are dumped before teardown.
    pub log_dir: PathBuf,
    /// HTTP endpoints that must respond before the stack counts as up.
    pub probe_urls: Vec<String>,
}

/// A deployed mirror stack.
///
/// [`deploy`](MirrorStack::deploy) builds one; dropping it (or calling
/// [`teardown`](MirrorStack::teardown)) releases the stack's resources
/// unless `keep_stack` was set.
pub struct MirrorStack<C: ControlPlane> {
    control: C,
    config: StackConfig,
    name: String,
    group_id: String,
    // Held for its Drop: the rendered templates live here.
    _workdir: TempDir,
    container_drain: RetryPolicy,
    volume_removal: RetryPolicy,
    purge_groups: bool,
    torn_down: bool,
}

impl<C: ControlPlane> MirrorStack<C> {
    /// Renders the templates, provisions secrets and deploys the stack,
    /// then blocks until all readiness endpoints respond.
    pub fn deploy(control: C, config: StackConfig) -> StackResult<Self> {
        if config.image_tag.is_empty() || config.image_tag == "latest" {
            return Err(StackError::InvalidImageTag(config.image_tag));
        }

        let name = format!("mirrortest_{}", Uuid::new_v4().simple());
        let group_id = format!("{}-{}", config.username, Uuid::new_v4());
        let workdir = TempDir::new()?;

        info!(stack = %name, "preparing stack working directory");
        for tree in ["conf", "env"] {
            let src = config.source_dir.join(tree);
            if !src.is_dir() {
                return Err(StackError::MissingTemplate(src));
            }
            copy_tree(&src, &workdir.path().join(tree))?;
        }
        let compose_src = config.source_dir.join(&config.compose_file);
        if !compose_src.is_file() {
            return Err(StackError::MissingTemplate(compose_src));
        }
        let compose = workdir.path().join(&config.compose_file);
        fs::copy(&compose_src, &compose)?;

        let secret_file = workdir.path().join("secret");
        fs::write(&secret_file, b"not-so-secret\n")?;

        render_templates(
            &workdir.path().join("conf"),
            &substitutions(&config, &group_id),
        )?;

        info!("creating missing secrets");
        for service in SECRET_SERVICES {
            let secret_name = format!("mirror-{service}-db-password");
            match control.secret_create(&secret_name, &secret_file) {
                Ok(()) => info!(secret = %secret_name, "created secret"),
                Err(ControlError::AlreadyExists(_)) => {
                    debug!(secret = %secret_name, "secret already present")
                }
                Err(err) => return Err(err.into()),
            }
        }

        info!("removing stale config objects");
        for config_id in control.list_configs(&name)? {
            control.remove_config(&config_id)?;
        }

        info!(stack = %name, image_tag = %config.image_tag, "deploying stack");
        control.deploy_stack(&name, &compose, &[("MIRROR_IMAGE_TAG", config.image_tag.as_str())])?;

        let stack = Self {
            control,
            config,
            name,
            group_id,
            _workdir: workdir,
            container_drain: CONTAINER_DRAIN,
            volume_removal: VOLUME_REMOVAL,
            purge_groups: true,
            torn_down: false,
        };
        stack.wait_ready()?;
        Ok(stack)
    }

    /// The stack's unique namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The consumer-group prefix all of this run's consumers share.
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    /// Fully-qualified name of a service of this stack.
    pub fn service_name(&self, short: &str) -> String {
        format!("{}_{short}", self.name)
    }

    /// Kafka settings for this run's broker credentials.
    pub fn kafka_settings(&self) -> KafkaSettings {
        KafkaSettings {
            broker: self.config.broker.clone(),
            username: self.config.username.clone(),
            password: self.config.password.clone(),
        }
    }

    fn wait_ready(&self) -> StackResult<()> {
        let policy = RetryPolicy::new(usize::MAX, Duration::from_secs(1))
            .with_deadline(READINESS_DEADLINE);
        let http = reqwest::blocking::Client::new();
        for url in &self.config.probe_urls {
            info!(%url, "waiting for readiness endpoint");
            let up = policy.wait_until(|| {
                http.get(url)
                    .send()
                    .map(|resp| resp.status().is_success())
                    .unwrap_or(false)
            });
            if !up {
                return Err(StackError::StartupTimeout {
                    url: url.clone(),
                    timeout: READINESS_DEADLINE,
                });
            }
        }
        Ok(())
    }

    /// Dumps service logs, removes the stack and releases its labeled
    /// resources. A no-op when `keep_stack` is set or when the stack was
    /// already torn down.
    pub fn teardown(&mut self) -> StackResult<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;

        if self.config.keep_stack {
            info!(stack = %self.name, "keeping stack as requested");
            return Ok(());
        }

        self.dump_logs();

        info!(stack = %self.name, "removing stack");
        match self.control.remove_stack(&self.name) {
            Ok(()) | Err(ControlError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        info!(stack = %self.name, "waiting for containers to drain");
        let drained = self.container_drain.wait_until(|| {
            match self.control.list_containers(&self.name) {
                Ok(containers) => containers.is_empty(),
                // Containers going away under us is the goal.
                Err(ControlError::NotFound(_)) => true,
                Err(err) => {
                    warn!(%err, "failed to list stack containers");
                    false
                }
            }
        });
        if !drained {
            warn!(stack = %self.name, "containers still present, proceeding anyway");
        }

        info!(stack = %self.name, "removing volumes");
        for volume in self.control.list_volumes(&self.name)? {
            if let Err(err) = self.volume_removal.retry(|| self.control.remove_volume(&volume)) {
                warn!(%volume, %err, "failed to remove volume, abandoning it");
            }
        }

        info!(stack = %self.name, "removing leftover networks");
        for network in self.control.list_networks(&self.name)? {
            match self.control.remove_network(&network, true) {
                Ok(()) | Err(ControlError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        if self.purge_groups {
            if let Err(err) =
                reconciler::purge_consumer_groups(&self.kafka_settings(), &self.group_id)
            {
                warn!(%err, "failed to purge consumer groups");
            }
        }

        Ok(())
    }

    /// Writes every service's merged output under the configured log
    /// directory. Failures are logged; log capture never blocks teardown.
    fn dump_logs(&self) {
        if let Err(err) = fs::create_dir_all(&self.config.log_dir) {
            warn!(%err, "cannot create log directory");
            return;
        }
        let services = match self.control.stack_services(&self.name) {
            Ok(services) => services,
            Err(err) => {
                warn!(%err, "cannot list services for log capture");
                return;
            }
        };
        for service in services {
            let path = self.config.log_dir.join(format!("{service}.log"));
            if let Err(err) = self.dump_service_log(&service, &path) {
                warn!(%service, %err, "failed to capture service logs");
            }
        }
    }

    fn dump_service_log(&self, service: &str, path: &Path) -> StackResult<()> {
        use std::io::Write;

        let mut out = fs::File::create(path)?;
        for line in self.control.service_logs(service, false, true)? {
            writeln!(out, "{}", line?)?;
        }
        Ok(())
    }
}

impl<C: ControlPlane> Drop for MirrorStack<C> {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            warn!(stack = %self.name, %err, "teardown failed");
        }
    }
}

fn substitutions(config: &StackConfig, group_id: &str) -> BTreeMap<&'static str, String> {
    let mut map = BTreeMap::from([
        ("username", config.username.clone()),
        ("password", config.password.clone()),
        ("group_id", group_id.to_owned()),
        ("broker", config.broker.clone()),
        ("objstorage_url", config.objstorage_url.clone()),
    ]);
    if let Some(cluster_name) = &config.cluster_name {
        map.insert("cluster_name", cluster_name.clone());
    }
    map
}

/// Renders every `*.yml.test` template in `dir` to its suffix-stripped
/// sibling, replacing `{name}` placeholders.
fn render_templates(dir: &Path, values: &BTreeMap<&'static str, String>) -> StackResult<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(target) = name.strip_suffix(".test") else {
            continue;
        };
        if !target.ends_with(".yml") {
            continue;
        }
        let mut text = fs::read_to_string(&path)?;
        for (key, value) in values {
            text = text.replace(&format!("{{{key}}}"), value);
        }
        fs::write(dir.join(target), text)?;
        debug!(template = %name, "rendered config template");
    }
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::test_support::FakeControl;

    use super::*;

    fn config(source_dir: &Path, log_dir: &Path) -> StackConfig {
        StackConfig {
            source_dir: source_dir.to_owned(),
            compose_file: "mirror.yml".to_owned(),
            broker: "broker.test:9093".to_owned(),
            username: "mirror-test".to_owned(),
            password: "hunter2".to_owned(),
            objstorage_url: "https://objstorage.test/".to_owned(),
            cluster_name: None,
            image_tag: "20260101-rc1".to_owned(),
            keep_stack: false,
            log_dir: log_dir.to_owned(),
            probe_urls: Vec::new(),
        }
    }

    fn write_source_tree(dir: &Path) {
        fs::create_dir_all(dir.join("conf")).unwrap();
        fs::create_dir_all(dir.join("env")).unwrap();
        fs::write(dir.join("mirror.yml"), "services: {}\n").unwrap();
        fs::write(
            dir.join("conf/storage.yml.test"),
            "journal:\n  brokers: [\"{broker}\"]\n  user: {username}\n  group: {group_id}\n",
        )
        .unwrap();
        fs::write(dir.join("conf/static.yml"), "untouched: true\n").unwrap();
    }

    #[test]
    fn latest_image_tag_is_rejected() {
        let source = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        write_source_tree(source.path());
        let mut config = config(source.path(), logs.path());
        config.image_tag = "latest".to_owned();

        let result = MirrorStack::deploy(FakeControl::default(), config);
        assert!(matches!(result, Err(StackError::InvalidImageTag(_))));
    }

    #[test]
    fn renders_templates_and_deploys_with_the_image_tag() {
        let source = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        write_source_tree(source.path());

        let mut stack =
            MirrorStack::deploy(FakeControl::default(), config(source.path(), logs.path()))
                .unwrap();

        let rendered = stack._workdir.path().join("conf/storage.yml");
        let text = fs::read_to_string(rendered).unwrap();
        assert!(text.contains("brokers: [\"broker.test:9093\"]"));
        assert!(text.contains("user: mirror-test"));
        assert!(text.contains(&format!("group: {}", stack.group_id())));
        // The template itself must survive for the next run.
        assert!(stack._workdir.path().join("conf/storage.yml.test").exists());

        {
            let deployed = stack.control.deployed.borrow();
            let (name, _, env) = &deployed[0];
            assert!(name.starts_with("mirrortest_"));
            assert_eq!(
                env,
                &vec![("MIRROR_IMAGE_TAG".to_owned(), "20260101-rc1".to_owned())]
            );
        }
        assert_eq!(
            *stack.control.created_secrets.borrow(),
            vec![
                "mirror-storage-db-password",
                "mirror-web-db-password",
                "mirror-vault-db-password",
                "mirror-scheduler-db-password",
            ]
        );
        stack.config.keep_stack = true;
    }

    #[test]
    fn existing_secrets_are_tolerated() {
        let source = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        write_source_tree(source.path());

        let control = FakeControl::default();
        control
            .existing_secrets
            .borrow_mut()
            .push("mirror-web-db-password".to_owned());

        let mut stack =
            MirrorStack::deploy(control, config(source.path(), logs.path())).unwrap();
        assert_eq!(stack.control.created_secrets.borrow().len(), 3);
        stack.config.keep_stack = true;
    }

    #[test]
    fn stale_configs_are_removed_before_deployment() {
        let source = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        write_source_tree(source.path());

        let control = FakeControl::default();
        control.configs.borrow_mut().push("old-config-id".to_owned());

        let mut stack =
            MirrorStack::deploy(control, config(source.path(), logs.path())).unwrap();
        assert_eq!(
            *stack.control.removed_configs.borrow(),
            vec!["old-config-id"]
        );
        stack.config.keep_stack = true;
    }

    #[test]
    fn missing_template_tree_is_an_error() {
        let source = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        // No conf/ or env/.
        fs::write(source.path().join("mirror.yml"), "services: {}\n").unwrap();

        let result =
            MirrorStack::deploy(FakeControl::default(), config(source.path(), logs.path()));
        assert!(matches!(result, Err(StackError::MissingTemplate(_))));
    }

    #[test]
    fn teardown_releases_resources_and_abandons_stuck_volumes() {
        let source = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        write_source_tree(source.path());

        let control = FakeControl::default();
        control
            .container_ticks
            .borrow_mut()
            .extend([vec!["c1".to_owned()], vec![]]);
        control
            .volumes
            .borrow_mut()
            .extend(["data".to_owned(), "stuck".to_owned()]);
        control
            .volume_failures
            .borrow_mut()
            .insert("stuck".to_owned(), usize::MAX);
        control.networks.borrow_mut().push("net0".to_owned());

        let mut stack =
            MirrorStack::deploy(control, config(source.path(), logs.path())).unwrap();
        // Shrink the teardown waits for the test, and keep it away from the
        // (nonexistent) broker.
        stack.container_drain = RetryPolicy::new(3, Duration::ZERO);
        stack.volume_removal = RetryPolicy::new(2, Duration::ZERO);
        stack.purge_groups = false;
        stack.teardown().unwrap();

        assert_eq!(*stack.control.removed_stacks.borrow(), vec![stack.name()]);
        assert_eq!(*stack.control.removed_volumes.borrow(), vec!["data"]);
        assert_eq!(*stack.control.removed_networks.borrow(), vec!["net0"]);
        // Second teardown (and the drop guard) must be a no-op.
        stack.teardown().unwrap();
        assert_eq!(stack.control.removed_stacks.borrow().len(), 1);
    }

    #[test]
    fn keep_stack_skips_teardown() {
        let source = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        write_source_tree(source.path());

        let mut config = config(source.path(), logs.path());
        config.keep_stack = true;
        let mut stack = MirrorStack::deploy(FakeControl::default(), config).unwrap();
        stack.teardown().unwrap();
        assert!(stack.control.removed_stacks.borrow().is_empty());
    }
}
