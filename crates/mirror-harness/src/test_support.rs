// Copyright (c) The Mirror Developers
// SPDX-License-Identifier: Apache-2.0

//! Scripted [`ControlPlane`] fake shared by the monitor and stack tests.

use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    path::{Path, PathBuf},
};

use crate::{
    control::{ControlPlane, ServiceMode, TaskState},
    error::{ControlError, ControlResult},
};

#[derive(Clone)]
pub(crate) enum FakeTask {
    State(TaskState),
    /// Inspection reports the task gone.
    Vanished,
    /// Inspection fails outright.
    Broken,
}

#[derive(Clone)]
pub(crate) struct FakeService {
    pub mode: ServiceMode,
    pub tasks: Vec<FakeTask>,
}

/// An orchestrator whose observable state advances one scripted tick per
/// `stack_services` call and records every mutating call it receives.
#[derive(Default)]
pub(crate) struct FakeControl {
    ticks: RefCell<VecDeque<BTreeMap<String, FakeService>>>,
    current: RefCell<BTreeMap<String, FakeService>>,
    logs: RefCell<BTreeMap<String, Vec<String>>>,

    pub existing_secrets: RefCell<Vec<String>>,
    pub created_secrets: RefCell<Vec<String>>,
    pub configs: RefCell<Vec<String>>,
    pub removed_configs: RefCell<Vec<String>>,
    pub deployed: RefCell<Vec<(String, PathBuf, Vec<(String, String)>)>>,
    pub removed_stacks: RefCell<Vec<String>>,
    pub scaled: RefCell<Vec<(String, u64)>>,

    pub container_ticks: RefCell<VecDeque<Vec<String>>>,
    pub volumes: RefCell<Vec<String>>,
    /// Volume name to number of removal attempts that must fail first.
    pub volume_failures: RefCell<BTreeMap<String, usize>>,
    pub removed_volumes: RefCell<Vec<String>>,
    pub networks: RefCell<Vec<String>>,
    pub removed_networks: RefCell<Vec<String>>,
}

impl FakeControl {
    pub fn push_tick<const N: usize>(&self, services: [(&str, FakeService); N]) {
        self.ticks.borrow_mut().push_back(
            services
                .into_iter()
                .map(|(name, service)| (name.to_owned(), service))
                .collect(),
        );
    }

    pub fn set_logs(&self, service: &str, lines: &[&str]) {
        self.logs.borrow_mut().insert(
            service.to_owned(),
            lines.iter().map(|line| line.to_string()).collect(),
        );
    }
}

impl ControlPlane for FakeControl {
    fn secret_create(&self, name: &str, _file: &Path) -> ControlResult<()> {
        if self.existing_secrets.borrow().iter().any(|s| s == name) {
            return Err(ControlError::AlreadyExists(name.to_owned()));
        }
        self.created_secrets.borrow_mut().push(name.to_owned());
        Ok(())
    }

    fn list_configs(&self, _stack: &str) -> ControlResult<Vec<String>> {
        Ok(self.configs.borrow().clone())
    }

    fn remove_config(&self, id: &str) -> ControlResult<()> {
        self.removed_configs.borrow_mut().push(id.to_owned());
        Ok(())
    }

    fn deploy_stack(
        &self,
        name: &str,
        compose: &Path,
        env: &[(&str, &str)],
    ) -> ControlResult<()> {
        self.deployed.borrow_mut().push((
            name.to_owned(),
            compose.to_owned(),
            env.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ));
        Ok(())
    }

    fn remove_stack(&self, name: &str) -> ControlResult<()> {
        self.removed_stacks.borrow_mut().push(name.to_owned());
        Ok(())
    }

    fn stack_services(&self, _stack: &str) -> ControlResult<Vec<String>> {
        if let Some(tick) = self.ticks.borrow_mut().pop_front() {
            *self.current.borrow_mut() = tick;
        }
        Ok(self.current.borrow().keys().cloned().collect())
    }

    fn service_mode(&self, service: &str) -> ControlResult<ServiceMode> {
        self.current
            .borrow()
            .get(service)
            .map(|s| s.mode.clone())
            .ok_or_else(|| ControlError::NotFound(service.to_owned()))
    }

    fn service_tasks(&self, service: &str) -> ControlResult<Vec<String>> {
        let current = self.current.borrow();
        let service_state = current
            .get(service)
            .ok_or_else(|| ControlError::NotFound(service.to_owned()))?;
        Ok((0..service_state.tasks.len())
            .map(|i| format!("{service}#{i}"))
            .collect())
    }

    fn task_state(&self, task: &str) -> ControlResult<TaskState> {
        let (service, index) = task
            .split_once('#')
            .ok_or_else(|| ControlError::NotFound(task.to_owned()))?;
        let index: usize = index.parse().unwrap();
        match &self.current.borrow()[service].tasks[index] {
            FakeTask::State(state) => Ok(state.clone()),
            FakeTask::Vanished => Err(ControlError::NotFound(task.to_owned())),
            FakeTask::Broken => Err(ControlError::CommandFailed {
                command: format!("inspect {task}"),
                code: Some(1),
                stderr: "cannot connect to the daemon".to_owned(),
            }),
        }
    }

    fn scale_service(&self, service: &str, replicas: u64, _detach: bool) -> ControlResult<()> {
        self.scaled.borrow_mut().push((service.to_owned(), replicas));
        Ok(())
    }

    fn service_logs(
        &self,
        service: &str,
        _follow: bool,
        _include_stderr: bool,
    ) -> ControlResult<Box<dyn Iterator<Item = ControlResult<String>>>> {
        let lines = self
            .logs
            .borrow()
            .get(service)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(lines.into_iter().map(Ok)))
    }

    fn list_containers(&self, _stack: &str) -> ControlResult<Vec<String>> {
        let mut ticks = self.container_ticks.borrow_mut();
        match ticks.len() {
            0 => Ok(Vec::new()),
            1 => Ok(ticks[0].clone()),
            _ => Ok(ticks.pop_front().unwrap()),
        }
    }

    fn list_volumes(&self, _stack: &str) -> ControlResult<Vec<String>> {
        Ok(self.volumes.borrow().clone())
    }

    fn remove_volume(&self, name: &str) -> ControlResult<()> {
        let mut failures = self.volume_failures.borrow_mut();
        if let Some(remaining) = failures.get_mut(name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ControlError::CommandFailed {
                    command: format!("volume rm {name}"),
                    code: Some(1),
                    stderr: "volume is in use".to_owned(),
                });
            }
        }
        self.volumes.borrow_mut().retain(|v| v != name);
        self.removed_volumes.borrow_mut().push(name.to_owned());
        Ok(())
    }

    fn list_networks(&self, _stack: &str) -> ControlResult<Vec<String>> {
        Ok(self.networks.borrow().clone())
    }

    fn remove_network(&self, id: &str, _force: bool) -> ControlResult<()> {
        let mut networks = self.networks.borrow_mut();
        if !networks.iter().any(|n| n == id) {
            return Err(ControlError::NotFound(id.to_owned()));
        }
        networks.retain(|n| n != id);
        self.removed_networks.borrow_mut().push(id.to_owned());
        Ok(())
    }
}
