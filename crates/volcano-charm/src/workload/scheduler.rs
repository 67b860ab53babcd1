use std::path::{Path, PathBuf};

use serde_json::json;
use snafu::ResultExt;

use super::{InvalidConfigSnafu, Prepared, Workload, WorkloadKind, config_file};
use crate::{
    command::{self, Flag},
    config::{CharmConfig, SchedulerArgs, SchedulerConfig},
    manifests::{self, ManifestPatch, ManifestSource, ServicePort, yaml_files},
    templating::Release,
    unit::UnitIdentity,
};

/// `vc-scheduler`, the batch scheduler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scheduler {
    pub binary: PathBuf,
    pub config_file: PathBuf,
    pub service_port: u16,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/vc-scheduler"),
            config_file: PathBuf::from("/volcano.scheduler/volcano-scheduler.yaml"),
            service_port: 8080,
        }
    }
}

impl Scheduler {
    fn values() -> serde_json::Value {
        json!({
            "basic": {
                "image_tag_version": "v1.7.0",
                "image_pull_secret": "",
                "admission_port": 8443,
                "scheduler_config_file": "config/volcano-scheduler.conf",
            },
            "custom": {
                "metrics_enable": false,
                "admission_enable": true,
                "controller_enable": true,
                "scheduler_enable": true,
                "enabled_admissions": super::admission::ENABLED_ADMISSIONS,
            },
            "juju": {
                "admission": true,
                "controller": true,
                "scheduler": true,
            },
        })
    }
}

impl Workload for Scheduler {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::Scheduler
    }

    fn binary(&self) -> &Path {
        &self.binary
    }

    fn prepare(
        &self,
        config: &CharmConfig,
        _identity: &UnitIdentity,
    ) -> Result<Prepared, super::Error> {
        let args = SchedulerArgs::load(config).context(InvalidConfigSnafu)?;
        let scheduler_config = SchedulerConfig::load(config).context(InvalidConfigSnafu)?;

        let flags = [
            Flag::switch("logtostderr"),
            Flag::long("scheduler-conf", self.config_file.display()),
            Flag::long("enable-healthz", args.enable_healthz),
            Flag::long("enable-metrics", args.enable_metrics),
            Flag::short("v", args.loglevel),
        ];

        Ok(Prepared {
            command: command::build(&self.binary, &flags, &args.extra_args),
            files: vec![config_file(&self.config_file, &scheduler_config, 0o600)?],
        })
    }

    fn manifests(
        &self,
        identity: &UnitIdentity,
        templates_dir: &Path,
    ) -> Result<ManifestSource, manifests::Error> {
        let mut templates = vec![templates_dir.join("scheduler.yaml")];
        templates.extend(yaml_files(&templates_dir.join("crd").join("v1"))?);

        Ok(ManifestSource {
            templates,
            basedir: templates_dir.to_owned(),
            values: Self::values(),
            release: Release::named("volcano", &identity.model),
            patches: vec![ManifestPatch::system_critical(
                &identity.app,
                &identity.model,
            )],
            service_port: Some(ServicePort::tcp(&identity.app, self.service_port)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ENABLE_HEALTHZ, ENABLE_METRICS, EXTRA_ARGS, LOG_LEVEL};

    fn identity() -> UnitIdentity {
        UnitIdentity::new("volcano-scheduler", "volcano", "volcano-scheduler/0")
    }

    #[test]
    fn default_command() {
        let prepared = Scheduler::default()
            .prepare(&CharmConfig::default(), &identity())
            .unwrap();

        assert_eq!(
            prepared.command,
            "/vc-scheduler --logtostderr --scheduler-conf=/volcano.scheduler/volcano-scheduler.yaml \
             --enable-healthz=true --enable-metrics=false -v=3 2>&1"
        );
    }

    #[test]
    fn command_with_every_option() {
        let config = CharmConfig::default()
            .with(ENABLE_HEALTHZ, false)
            .with(ENABLE_METRICS, true)
            .with(LOG_LEVEL, 1)
            .with(EXTRA_ARGS, "extra=args");
        let prepared = Scheduler::default().prepare(&config, &identity()).unwrap();

        assert_eq!(
            prepared.command,
            "/vc-scheduler --logtostderr --scheduler-conf=/volcano.scheduler/volcano-scheduler.yaml \
             --enable-healthz=false --enable-metrics=true -v=1 --extra='args' 2>&1"
        );
    }

    #[test]
    fn command_with_extra_args() {
        let config = CharmConfig::default()
            .with(LOG_LEVEL, 5)
            .with(EXTRA_ARGS, "zeta=1 alpha=2");
        let prepared = Scheduler::default().prepare(&config, &identity()).unwrap();

        assert!(
            prepared
                .command
                .ends_with("-v=5 --alpha='2' --zeta='1' 2>&1"),
            "{}",
            prepared.command
        );
    }

    #[test]
    fn config_file_is_private() {
        let prepared = Scheduler::default()
            .prepare(&CharmConfig::default(), &identity())
            .unwrap();

        assert_eq!(prepared.files.len(), 1);
        let file = &prepared.files[0];
        assert_eq!(
            file.path,
            Path::new("/volcano.scheduler/volcano-scheduler.yaml")
        );
        assert_eq!(file.permissions, 0o600);
        assert_eq!((file.user_id, file.group_id), (0, 0));
        assert!(file.content.starts_with("actions: enqueue, allocate, backfill\n"));
        assert!(file.content.trim_end().ends_with("- name: binpack"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = CharmConfig::default().with(LOG_LEVEL, "loud");
        let error = Scheduler::default()
            .prepare(&config, &identity())
            .unwrap_err();

        assert!(matches!(error, super::super::Error::InvalidConfig { .. }));
    }

    #[test]
    fn manifest_source() {
        let templates = tempfile::tempdir().unwrap();
        let crds = templates.path().join("crd").join("v1");
        std::fs::create_dir_all(&crds).unwrap();
        for name in ["b.yaml", "a.yaml", "README.md"] {
            std::fs::write(crds.join(name), "").unwrap();
        }

        let source = Scheduler::default()
            .manifests(&identity(), templates.path())
            .unwrap();

        assert_eq!(source.templates, [
            templates.path().join("scheduler.yaml"),
            crds.join("a.yaml"),
            crds.join("b.yaml"),
        ]);
        assert_eq!(source.release, Release::named("volcano", "volcano"));
        assert_eq!(source.values["juju"]["scheduler"], true);
        assert_eq!(
            source.service_port,
            Some(ServicePort::tcp("volcano-scheduler", 8080))
        );
        assert_eq!(source.patches, [ManifestPatch::system_critical(
            "volcano-scheduler",
            "volcano"
        )]);
    }
}
