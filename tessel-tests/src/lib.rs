//! Tessel Tests - multi-node in-process cluster tests.
//!
//! Every test runs real [`tessel_server::TesselNode`]s over a
//! [`tessel_server::LocalNetwork`] on a manually advanced clock, so runs are
//! reproducible and time can jump by days.
//!
//! ## Test Organization
//!
//! **Scenario Tests** (`scenario_tests`): the documented cluster scenarios
//! - A: losing two non-master nodes of five keeps the master and readability
//! - B: replicas that cannot be placed leave the index yellow, never red
//! - C: a write succeeds while a replica is down; the replica resyncs
//! - D: lifecycle steps through warm before delete after a 31-day jump
//!
//! **Property Tests** (`property_tests`): safety and liveness under faults
//! - majority-only election, failover durability, random partitions
//!
//! **Support Modules**:
//! - `cluster`: the [`cluster::TestCluster`] harness
//! - `properties`: property definitions and the [`properties::PropertyChecker`]
//! - `scenarios`: shared cluster shapes, policies, documents and seeds
//!
//! ## Naming Conventions
//!
//! - Scenario tests: `test_scenario_<letter>_<what>`
//! - Property tests: `test_<property>_<condition>`
//! - Unit tests: Inline in each crate under `#[cfg(test)]`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod cluster;
pub mod properties;
pub mod scenarios;

#[cfg(test)]
mod scenario_tests;
