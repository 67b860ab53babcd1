//! Juju charms operating the Volcano batch scheduler on Kubernetes.
//!
//! Three charms share this library, one per Volcano workload: the scheduler, the controller
//! manager and the admission webhook. Each runs the workload binary in a sidecar container and
//! keeps the cluster objects the workload needs in place. See [`charm`] for the event handling.
pub mod certs;
pub mod charm;
pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod container;
pub mod logging;
pub mod manifests;
pub mod prometheus;
pub mod reconciler;
pub mod status;
pub mod templating;
pub mod unit;
pub mod workload;

#[cfg(test)]
mod testing;
