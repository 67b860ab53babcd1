use std::path::{Path, PathBuf};

use serde_json::json;
use snafu::ResultExt;

use super::{InvalidConfigSnafu, Prepared, Workload, WorkloadKind, config_file};
use crate::{
    certs::CertificatePaths,
    command::{self, Flag},
    config::{AdmissionArgs, AdmissionConfig, CharmConfig},
    manifests::{self, ManifestPatch, ManifestSource, ServicePort},
    templating::Release,
    unit::UnitIdentity,
};

/// Admission paths the webhook configurations are rendered for.
///
/// This is independent of the `admissions` option, which only selects what the webhook manager
/// serves.
pub(crate) const ENABLED_ADMISSIONS: &str = concat!(
    "/jobs/mutate,/jobs/validate,/podgroups/mutate,/pods/validate,/pods/mutate,",
    "/queues/mutate,/queues/validate",
);

/// `vc-webhook-manager`, the admission webhook.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Admission {
    pub binary: PathBuf,
    pub config_file: PathBuf,
    pub certificates: CertificatePaths,
    pub service_port: u16,
}

impl Default for Admission {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("/vc-webhook-manager"),
            config_file: PathBuf::from("/admission.local.config/volcano-admission.yaml"),
            certificates: CertificatePaths::default(),
            service_port: 443,
        }
    }
}

impl Workload for Admission {
    fn kind(&self) -> WorkloadKind {
        WorkloadKind::Admission
    }

    fn binary(&self) -> &Path {
        &self.binary
    }

    fn prepare(
        &self,
        config: &CharmConfig,
        identity: &UnitIdentity,
    ) -> Result<Prepared, super::Error> {
        let args = AdmissionArgs::load(config).context(InvalidConfigSnafu)?;

        let flags = [
            Flag::long("enabled-admission", args.admissions.join(",")),
            Flag::long("tls-cert-file", self.certificates.cert.display()),
            Flag::long(
                "tls-private-key-file",
                self.certificates.private_key.display(),
            ),
            Flag::long("ca-cert-file", self.certificates.ca_cert.display()),
            Flag::long("admission-conf", self.config_file.display()),
            Flag::long("webhook-namespace", &identity.model),
            Flag::long("webhook-service-name", &identity.app),
            Flag::switch("logtostderr"),
            Flag::long("port", args.admission_port),
            Flag::short("v", args.loglevel),
        ];

        Ok(Prepared {
            command: command::build(&self.binary, &flags, &args.extra_args),
            files: vec![config_file(
                &self.config_file,
                &AdmissionConfig::default(),
                0o644,
            )?],
        })
    }

    fn manifests(
        &self,
        identity: &UnitIdentity,
        templates_dir: &Path,
    ) -> Result<ManifestSource, manifests::Error> {
        Ok(ManifestSource {
            templates: vec![templates_dir.join("webhooks.yaml")],
            basedir: templates_dir.to_owned(),
            values: json!({
                "custom": {
                    "admission_enable": true,
                    "enabled_admissions": ENABLED_ADMISSIONS,
                },
            }),
            release: Release::for_charm(&identity.app, &identity.model),
            patches: vec![ManifestPatch::system_critical(
                &identity.app,
                &identity.model,
            )],
            service_port: Some(ServicePort::tcp(&identity.app, self.service_port)),
        })
    }

    fn certificate_paths(&self) -> Option<&CertificatePaths> {
        Some(&self.certificates)
    }
}
