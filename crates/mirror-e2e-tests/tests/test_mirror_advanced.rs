// Copyright (c) The Mirror Developers
// SPDX-License-Identifier: Apache-2.0

//! Replication round-trip with the graph replay split across dedicated
//! content and directory replayer services.

use mirror_e2e_tests::{run_mirror_scenario, StackFlavor};
use mirror_test_utils::{init_tracing, Result as TestResult};

#[test]
#[ignore = "requires a Docker Swarm, a Kafka broker and mirror images"]
fn test_mirror_advanced() -> TestResult {
    init_tracing();
    run_mirror_scenario(&StackFlavor::ADVANCED)?;
    Ok(())
}
