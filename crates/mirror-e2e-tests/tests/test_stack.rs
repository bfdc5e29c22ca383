// Copyright (c) The Mirror Developers
// SPDX-License-Identifier: Apache-2.0

//! Stack lifecycle smoke test: deploy, converge, tear down.

use mirror_e2e_tests::{initial_services_status, StackFlavor, TestEnv};
use mirror_harness::{control::DockerCli, monitor::wait_services_status, stack::MirrorStack};
use mirror_test_utils::{init_tracing, Result as TestResult};

#[test]
#[ignore = "requires a Docker Swarm, a Kafka broker and mirror images"]
fn test_deploy_and_teardown() -> TestResult {
    init_tracing();
    let env = TestEnv::from_env()?;
    let mut stack = MirrorStack::deploy(DockerCli::default(), env.stack_config(&StackFlavor::BASIC))?;

    wait_services_status(
        stack.control(),
        stack.name(),
        &initial_services_status(stack.name(), &StackFlavor::BASIC),
    )?;

    stack.teardown()?;
    Ok(())
}
