use std::path::{Path, PathBuf};

use snafu::ResultExt;

use super::{InvalidConfigSnafu, Prepared, Workload, WorkloadKind};
use crate::{
    command::{self, Flag},
    config::{CharmConfig, ControllerArgs},
    manifests::{self, ManifestPatch, ManifestSource},
    templating::Release,
    unit::UnitIdentity,
};

/// `vc-controller-manager`, which drives the lifecycle of Volcano jobs and queues.
///
/// The controller has no config file, renders no templates and exposes no port. The only cluster
/// object it touches is its own StatefulSet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Controller {
    pub binary: PathBuf,
}

impl Default for Controller {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/vc-controller-manager"),
        }
    }
}

impl Workload for Controller {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::Controller
    }

    fn binary(&self) -> &Path {
        &self.binary
    }

    fn prepare(
        &self,
        config: &CharmConfig,
        _identity: &UnitIdentity,
    ) -> Result<Prepared, super::Error> {
        let args = ControllerArgs::load(config).context(InvalidConfigSnafu)?;

        let flags = [
            Flag::switch("logtostderr"),
            Flag::long("enable-healthz", args.enable_healthz),
            Flag::short("v", args.loglevel),
        ];

        Ok(Prepared {
            command: command::build(&self.binary, &flags, &args.extra_args),
            files: Vec::new(),
        })
    }

    fn manifests(
        &self,
        identity: &UnitIdentity,
        templates_dir: &Path,
    ) -> Result<ManifestSource, manifests::Error> {
        Ok(ManifestSource {
            templates: Vec::new(),
            basedir: templates_dir.to_owned(),
            values: serde_json::Value::Null,
            release: Release::for_charm(&identity.app, &identity.model),
            patches: vec![ManifestPatch::system_critical(
                &identity.app,
                &identity.model,
            )],
            service_port: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ENABLE_HEALTHZ, EXTRA_ARGS};

    fn identity() -> UnitIdentity {
        UnitIdentity::new("volcano-controllers", "volcano", "volcano-controllers/0")
    }

    #[test]
    fn default_command() {
        let prepared = Controller::default()
            .prepare(&CharmConfig::default(), &identity())
            .unwrap();

        assert_eq!(
            prepared.command,
            "/vc-controller-manager --logtostderr --enable-healthz=true -v=4 2>&1"
        );
        assert!(prepared.files.is_empty());
    }

    #[test]
    fn configured_command() {
        let config = CharmConfig::default()
            .with(ENABLE_HEALTHZ, false)
            .with(EXTRA_ARGS, "--worker-threads=8");
        let prepared = Controller::default().prepare(&config, &identity()).unwrap();

        assert_eq!(
            prepared.command,
            "/vc-controller-manager --logtostderr --enable-healthz=false -v=4 \
             --worker-threads='8' 2>&1"
        );
    }

    #[test]
    fn manifests_are_patch_only() {
        let set = Controller::default()
            .manifests(&identity(), Path::new("templates"))
            .unwrap()
            .render()
            .unwrap();

        assert!(set.resources.is_empty());
        assert_eq!(set.patches, [ManifestPatch::system_critical(
            "volcano-controllers",
            "volcano"
        )]);
    }
}
