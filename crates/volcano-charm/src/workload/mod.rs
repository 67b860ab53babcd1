//! The three Volcano workloads, each run by its own charm.
//!
//! A [`Workload`] knows its binary, turns the charm configuration into the command line and the
//! files the binary needs, and describes the cluster objects the charm owns. Everything the
//! charm does with the container and the cluster is driven from these values.
use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};
use strum::{Display, EnumString};
use volcano_shared::yaml;

use crate::{
    certs::CertificatePaths,
    config::{CharmConfig, ConfigError},
    container::PushFile,
    manifests::{self, ManifestSource},
    unit::UnitIdentity,
};

mod admission;
mod controller;
mod scheduler;

pub use admission::Admission;
pub use controller::Controller;
pub use scheduler::Scheduler;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid charm configuration"))]
    InvalidConfig { source: ConfigError },

    #[snafu(display("failed to serialize {path:?}"))]
    SerializeConfigFile { source: yaml::Error, path: PathBuf },
}

#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, clap::ValueEnum)]
#[strum(serialize_all = "lowercase")]
pub enum WorkloadKind {
    Scheduler,
    Controller,
    Admission,
}

impl WorkloadKind {
    /// Capitalized name used in status messages.
    pub fn title(self) -> &'static str {
        match self {
            Self::Scheduler => "Scheduler",
            Self::Controller => "Controller",
            Self::Admission => "Admission",
        }
    }

    /// The workload with its default container paths.
    pub fn workload(self) -> Box<dyn Workload> {
        match self {
            Self::Scheduler => Box::new(Scheduler::default()),
            Self::Controller => Box::new(Controller::default()),
            Self::Admission => Box::new(Admission::default()),
        }
    }
}

/// The command line and files of one reconciliation pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prepared {
    pub command: String,
    pub files: Vec<PushFile>,
}

pub trait Workload: Send + Sync {
    fn kind(&self) -> WorkloadKind;

    /// Absolute path of the binary inside the workload container.
    fn binary(&self) -> &Path;

    /// Validates `config` and builds the command line and config files.
    fn prepare(&self, config: &CharmConfig, identity: &UnitIdentity) -> Result<Prepared, Error>;

    /// Where the cluster objects of the charm come from.
    fn manifests(
        &self,
        identity: &UnitIdentity,
        templates_dir: &Path,
    ) -> Result<ManifestSource, manifests::Error>;

    /// Paths the binary reads its server certificates from, if it serves TLS.
    fn certificate_paths(&self) -> Option<&CertificatePaths> {
        None
    }
}

/// Serializes a config file document the way the binaries expect it.
pub(crate) fn config_file<T: serde::Serialize>(
    path: &Path,
    document: &T,
    permissions: u32,
) -> Result<PushFile, Error> {
    let content = yaml::to_string(document, yaml::SerializeOptions::default())
        .context(SerializeConfigFileSnafu { path })?;

    Ok(PushFile::root_owned(path, content, permissions))
}
