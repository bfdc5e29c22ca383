// Copyright (c) The Mirror Developers
// SPDX-License-Identifier: Apache-2.0

//! Typed control plane over the container orchestrator.
//!
//! The orchestrator (Docker Swarm) is an external collaborator; the harness
//! drives it through its CLI and classifies failures into [`ControlError`]
//! variants once, here, so the rest of the harness never has to match on
//! error message text.

use std::{
    io::{BufRead, BufReader, Lines},
    path::Path,
    process::{Child, ChildStdout, Command, Stdio},
};

use tracing::trace;

use crate::error::{ControlError, ControlResult};

/// The label the orchestrator stamps on all resources belonging to a stack.
pub const STACK_NAMESPACE_LABEL: &str = "com.docker.stack.namespace";

/// The declared scheduling mode of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    /// A fixed number of replicas.
    Replicated(u64),
    /// One task per node.
    Global,
}

impl ServiceMode {
    /// The number of replicas the mode targets.
    pub fn target_replicas(&self) -> u64 {
        match self {
            Self::Replicated(n) => *n,
            Self::Global => 1,
        }
    }
}

/// The last-known state of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Other(String),
}

/// Operations the harness needs from the orchestrator.
///
/// A trait seam so the convergence monitor and the lifecycle controller can
/// be exercised against a scripted fake.
pub trait ControlPlane {
    fn secret_create(&self, name: &str, file: &Path) -> ControlResult<()>;
    fn list_configs(&self, stack: &str) -> ControlResult<Vec<String>>;
    fn remove_config(&self, id: &str) -> ControlResult<()>;

    /// Deploys `compose` as stack `name`; `env` is visible to compose-file
    /// variable substitution.
    fn deploy_stack(&self, name: &str, compose: &Path, env: &[(&str, &str)])
        -> ControlResult<()>;
    fn remove_stack(&self, name: &str) -> ControlResult<()>;

    fn stack_services(&self, stack: &str) -> ControlResult<Vec<String>>;
    fn service_mode(&self, service: &str) -> ControlResult<ServiceMode>;
    fn service_tasks(&self, service: &str) -> ControlResult<Vec<String>>;
    fn task_state(&self, task: &str) -> ControlResult<TaskState>;
    fn scale_service(&self, service: &str, replicas: u64, detach: bool) -> ControlResult<()>;

    /// Streams the service's log lines. With `include_stderr`, the task's
    /// standard error is merged into the stream; otherwise only standard
    /// output is read.
    fn service_logs(
        &self,
        service: &str,
        follow: bool,
        include_stderr: bool,
    ) -> ControlResult<Box<dyn Iterator<Item = ControlResult<String>>>>;

    fn list_containers(&self, stack: &str) -> ControlResult<Vec<String>>;
    fn list_volumes(&self, stack: &str) -> ControlResult<Vec<String>>;
    fn remove_volume(&self, name: &str) -> ControlResult<()>;
    fn list_networks(&self, stack: &str) -> ControlResult<Vec<String>>;
    fn remove_network(&self, id: &str, force: bool) -> ControlResult<()>;
}

/// [`ControlPlane`] implementation shelling out to the `docker` CLI.
#[derive(Debug, Clone, Default)]
pub struct DockerCli;

impl DockerCli {
    fn run(&self, args: &[&str]) -> ControlResult<String> {
        self.run_inner(args, None, &[])
    }

    fn run_inner(
        &self,
        args: &[&str],
        cwd: Option<&Path>,
        env: &[(&str, &str)],
    ) -> ControlResult<String> {
        trace!(?args, "docker");
        let mut command = Command::new("docker");
        command.args(args);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        for (key, value) in env {
            command.env(key, value);
        }
        let output = command.output()?;
        if !output.status.success() {
            return Err(classify(args.join(" "), &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_lines(&self, args: &[&str]) -> ControlResult<Vec<String>> {
        Ok(self
            .run(args)?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }

    fn label_filter(stack: &str) -> String {
        format!("label={STACK_NAMESPACE_LABEL}={stack}")
    }
}

/// Maps a failed CLI invocation to a typed error by inspecting the
/// daemon's message once, at this boundary.
fn classify(command: String, output: &std::process::Output) -> ControlError {
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let lowered = stderr.to_lowercase();
    if lowered.contains("no such") || lowered.contains("not found") {
        ControlError::NotFound(stderr)
    } else if lowered.contains("alreadyexists") || lowered.contains("already exists") {
        ControlError::AlreadyExists(stderr)
    } else {
        ControlError::CommandFailed {
            command,
            code: output.status.code(),
            stderr,
        }
    }
}

impl ControlPlane for DockerCli {
    fn secret_create(&self, name: &str, file: &Path) -> ControlResult<()> {
        let file = file.to_string_lossy();
        self.run(&["secret", "create", name, &file])?;
        Ok(())
    }

    fn list_configs(&self, stack: &str) -> ControlResult<Vec<String>> {
        self.run_lines(&["config", "ls", "-q", "--filter", &Self::label_filter(stack)])
    }

    fn remove_config(&self, id: &str) -> ControlResult<()> {
        self.run(&["config", "rm", id])?;
        Ok(())
    }

    fn deploy_stack(
        &self,
        name: &str,
        compose: &Path,
        env: &[(&str, &str)],
    ) -> ControlResult<()> {
        let file = compose.to_string_lossy();
        self.run_inner(
            &["stack", "deploy", "--compose-file", &file, name],
            compose.parent(),
            env,
        )?;
        Ok(())
    }

    fn remove_stack(&self, name: &str) -> ControlResult<()> {
        self.run(&["stack", "rm", name])?;
        Ok(())
    }

    fn stack_services(&self, stack: &str) -> ControlResult<Vec<String>> {
        self.run_lines(&["stack", "services", "--format", "{{.Name}}", stack])
    }

    fn service_mode(&self, service: &str) -> ControlResult<ServiceMode> {
        let raw = self.run(&[
            "service",
            "inspect",
            "--format",
            "{{json .Spec.Mode}}",
            service,
        ])?;
        let mode: serde_json::Value =
            serde_json::from_str(raw.trim()).map_err(|err| ControlError::UnexpectedOutput {
                command: format!("service inspect {service}"),
                message: err.to_string(),
            })?;
        if let Some(replicated) = mode.get("Replicated") {
            let replicas = replicated
                .get("Replicas")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0);
            Ok(ServiceMode::Replicated(replicas))
        } else if mode.get("Global").is_some() {
            Ok(ServiceMode::Global)
        } else {
            Err(ControlError::UnsupportedMode(mode.to_string()))
        }
    }

    fn service_tasks(&self, service: &str) -> ControlResult<Vec<String>> {
        self.run_lines(&["service", "ps", "--format", "{{.ID}}", service])
    }

    fn task_state(&self, task: &str) -> ControlResult<TaskState> {
        let state = self.run(&["inspect", "--format", "{{.Status.State}}", task])?;
        let state = state.trim();
        if state == "running" {
            Ok(TaskState::Running)
        } else {
            Ok(TaskState::Other(state.to_owned()))
        }
    }

    fn scale_service(&self, service: &str, replicas: u64, detach: bool) -> ControlResult<()> {
        let spec = format!("{service}={replicas}");
        let mut args = vec!["service", "scale"];
        if detach {
            args.push("--detach");
        }
        args.push(&spec);
        self.run(&args)?;
        Ok(())
    }

    fn service_logs(
        &self,
        service: &str,
        follow: bool,
        include_stderr: bool,
    ) -> ControlResult<Box<dyn Iterator<Item = ControlResult<String>>>> {
        let follow_flag = if follow { " --follow" } else { "" };
        let mut child = if include_stderr {
            // The CLI writes task stdout/stderr to its own stdout/stderr;
            // merging them portably needs a shell redirect.
            let script = format!("exec docker service logs --raw{follow_flag} {service} 2>&1");
            Command::new("sh")
                .args(["-c", &script])
                .stdout(Stdio::piped())
                .stdin(Stdio::null())
                .spawn()?
        } else {
            let mut args = vec!["service", "logs", "--raw"];
            if follow {
                args.push("--follow");
            }
            args.push(service);
            Command::new("docker")
                .args(args)
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .stdin(Stdio::null())
                .spawn()?
        };
        let stdout = child.stdout.take().expect("stdout is piped");
        Ok(Box::new(LogLines {
            child,
            lines: BufReader::new(stdout).lines(),
        }))
    }

    fn list_containers(&self, stack: &str) -> ControlResult<Vec<String>> {
        self.run_lines(&["ps", "-q", "--filter", &Self::label_filter(stack)])
    }

    fn list_volumes(&self, stack: &str) -> ControlResult<Vec<String>> {
        self.run_lines(&["volume", "ls", "-q", "--filter", &Self::label_filter(stack)])
    }

    fn remove_volume(&self, name: &str) -> ControlResult<()> {
        self.run(&["volume", "rm", name])?;
        Ok(())
    }

    fn list_networks(&self, stack: &str) -> ControlResult<Vec<String>> {
        self.run_lines(&["network", "ls", "-q", "--filter", &Self::label_filter(stack)])
    }

    fn remove_network(&self, id: &str, force: bool) -> ControlResult<()> {
        let mut args = vec!["network", "rm"];
        if force {
            args.push("-f");
        }
        args.push(id);
        self.run(&args)?;
        Ok(())
    }
}

/// Line iterator over a spawned log-streaming process. The child is killed
/// when the iterator is dropped, so a satisfied log wait does not leave a
/// follower behind.
struct LogLines {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

impl Iterator for LogLines {
    type Item = ControlResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.lines
            .next()
            .map(|line| line.map_err(ControlError::from))
    }
}

impl Drop for LogLines {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
