// Copyright (c) The Mirror Developers
// SPDX-License-Identifier: Apache-2.0

//! Service-convergence monitoring.
//!
//! [`wait_services_status`] polls the orchestrator until a set of services
//! reaches a caller-supplied replica state; [`wait_for_log_entry`] tails a
//! service's logs for an expected line. Neither carries its own timeout: a
//! stack that never converges blocks until the caller's harness-level
//! timeout fires, which is the desired behavior in a test rig.

use std::{collections::BTreeMap, time::Duration};

use regex::Regex;
use tracing::{debug, info, trace};

use crate::{
    control::{ControlPlane, TaskState},
    error::{ControlError, ControlResult},
};

/// Pause between convergence polls.
const POLL_TICK: Duration = Duration::from_secs(1);

/// Blocks until the services named by `target` report exactly the given
/// `"running/desired"` pairs.
///
/// Comparison is between maps: the order in which the orchestrator lists
/// services is irrelevant, and services not named in `target` are ignored.
pub fn wait_services_status<C: ControlPlane>(
    control: &C,
    stack: &str,
    target: &BTreeMap<String, String>,
) -> ControlResult<()> {
    wait_services_status_with_tick(control, stack, target, POLL_TICK)
}

pub fn wait_services_status_with_tick<C: ControlPlane>(
    control: &C,
    stack: &str,
    target: &BTreeMap<String, String>,
    tick: Duration,
) -> ControlResult<()> {
    info!(?target, "waiting for services");
    let mut last_reported: BTreeMap<String, String> = BTreeMap::new();
    loop {
        let status = observe_status(control, stack, target)?;
        if &status == target {
            info!("got them all");
            return Ok(());
        }
        if status != last_reported {
            let lagging: BTreeMap<&String, &String> = status
                .iter()
                .filter(|(name, state)| target.get(*name) != Some(*state))
                .collect();
            info!(?lagging, "not yet there");
            last_reported = status;
        }
        std::thread::sleep(tick);
    }
}

/// One poll tick: the `"running/desired"` pair of every service of `stack`
/// whose name is a key of `target`.
fn observe_status<C: ControlPlane>(
    control: &C,
    stack: &str,
    target: &BTreeMap<String, String>,
) -> ControlResult<BTreeMap<String, String>> {
    let mut status = BTreeMap::new();
    for service in control.stack_services(stack)? {
        if !target.contains_key(&service) {
            continue;
        }
        let desired = control.service_mode(&service)?.target_replicas();
        let mut running = 0;
        for task in control.service_tasks(&service)? {
            match control.task_state(&task) {
                Ok(TaskState::Running) => running += 1,
                Ok(TaskState::Other(state)) => trace!(%task, %state, "task not running"),
                // A task can be garbage-collected between listing and
                // inspection; it is then certainly not running.
                Err(ControlError::NotFound(_)) => debug!(%task, "task vanished"),
                Err(err) => return Err(err),
            }
        }
        status.insert(service, format!("{running}/{desired}"));
    }
    Ok(status)
}

/// Tails the logs of `service` until `entry` has been seen `occurrences`
/// times, then stops consuming the stream.
///
/// `entry` is tried as a regular expression first; if it produces no match
/// on a line, plain substring containment counts once. This dual mode
/// tolerates both literal and pattern-bearing expected strings.
pub fn wait_for_log_entry<C: ControlPlane>(
    control: &C,
    service: &str,
    entry: &str,
    occurrences: usize,
    with_stderr: bool,
) -> ControlResult<()> {
    let pattern = Regex::new(entry).ok();
    let mut count = 0;
    for line in control.service_logs(service, true, with_stderr)? {
        let line = line?;
        trace!(%service, %line, "service output");
        let mut matches = pattern
            .as_ref()
            .map(|re| re.find_iter(&line).count())
            .unwrap_or(0);
        if matches == 0 && line.contains(entry) {
            matches = 1;
        }
        count += matches;
        if count >= occurrences {
            debug!(%service, %entry, count, "expected log entry seen");
            return Ok(());
        }
    }
    Err(ControlError::LogStreamClosed {
        service: service.to_owned(),
    })
}
