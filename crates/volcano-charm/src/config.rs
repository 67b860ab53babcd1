//! Typed charm configuration.
//!
//! [`CharmConfig`] is the raw, string keyed option map handed to the charm. Every workload reads
//! it through the typed documents in this module, which validate the raw values once per
//! reconciliation pass. A validation failure blocks the unit until the operator fixes the option.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Toleration;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

pub const LOG_LEVEL: &str = "log-level";
pub const EXTRA_ARGS: &str = "extra-args";
pub const ENABLE_HEALTHZ: &str = "enable-healthz";
pub const ENABLE_METRICS: &str = "enable-metrics";
pub const ADMISSIONS: &str = "admissions";
pub const ADMISSION_PORT: &str = "admission-port";
pub const SCHEDULER_CONFIG: &str = "scheduler-config";
pub const KUBE_STATE_METRICS_NAMESPACE: &str = "kube-state-metrics-namespace";

pub const DEFAULT_KUBE_STATE_METRICS_NAMESPACE: &str = "kube-system";

const MAX_LOG_LEVEL: i64 = 10;

type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to parse charm configuration"))]
    ParseConfig { source: serde_yaml::Error },

    #[snafu(display("config option {key:?} must be {expected}"))]
    WrongType { key: String, expected: &'static str },

    #[snafu(display("config option {key:?} must be between 0 and {MAX_LOG_LEVEL}, got {value}"))]
    LogLevelOutOfRange { key: String, value: i64 },

    #[snafu(display("config option {key:?} is not a valid port: {value}"))]
    InvalidPort { key: String, value: i64 },

    #[snafu(display("config option {EXTRA_ARGS:?} contains an entry without flag name: {entry:?}"))]
    InvalidExtraArg { entry: String },

    #[snafu(display("config option {ADMISSIONS:?} must name at least one admission"))]
    NoAdmissions,

    #[snafu(display("config option {SCHEDULER_CONFIG:?} is not a valid scheduler configuration"))]
    ParseSchedulerConfig { source: serde_yaml::Error },

    #[snafu(display("config option {SCHEDULER_CONFIG:?} is invalid: {reason}"))]
    InvalidSchedulerConfig { reason: String },
}

/// The configuration options of the charm application, as set by the operator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CharmConfig(BTreeMap<String, serde_json::Value>);

impl CharmConfig {
    /// Parses a flat YAML mapping of option names to scalar values.
    pub fn from_yaml(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(input)
            .map(Self)
            .context(ParseConfigSnafu)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Returns the raw value of `key`, treating an explicit `null` as unset.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key).filter(|value| !value.is_null())
    }

    pub fn get_str(&self, key: &str) -> Result<Option<&str>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value.as_str().map(Some).context(WrongTypeSnafu {
                key,
                expected: "a string",
            }),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value.as_bool().map(Some).context(WrongTypeSnafu {
                key,
                expected: "a boolean",
            }),
        }
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i64>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value.as_i64().map(Some).context(WrongTypeSnafu {
                key,
                expected: "an integer",
            }),
        }
    }

    /// Namespace the kube-state-metrics scrape job targets.
    pub fn kube_state_metrics_namespace(&self) -> Result<String> {
        Ok(self
            .get_str(KUBE_STATE_METRICS_NAMESPACE)?
            .filter(|namespace| !namespace.is_empty())
            .unwrap_or(DEFAULT_KUBE_STATE_METRICS_NAMESPACE)
            .to_owned())
    }

    fn log_level(&self, default: u8) -> Result<u8> {
        let Some(value) = self.get_int(LOG_LEVEL)? else {
            return Ok(default);
        };

        u8::try_from(value)
            .ok()
            .filter(|level| i64::from(*level) <= MAX_LOG_LEVEL)
            .context(LogLevelOutOfRangeSnafu {
                key: LOG_LEVEL,
                value,
            })
    }

    fn extra_args(&self) -> Result<BTreeMap<String, String>> {
        self.get_str(EXTRA_ARGS)?
            .map_or_else(|| Ok(BTreeMap::new()), parse_extra_args)
    }
}

/// Parses space separated `key=value` items into a flag map.
///
/// Leading dashes are stripped from the key. An item without `=` is a switch and maps to `true`.
/// A later item overrides an earlier one with the same key.
pub fn parse_extra_args(input: &str) -> Result<BTreeMap<String, String>> {
    let mut args = BTreeMap::new();

    for entry in input.split_whitespace() {
        let (key, value) = entry.split_once('=').unwrap_or((entry, "true"));
        let key = key.trim_start_matches('-');
        ensure!(!key.is_empty(), InvalidExtraArgSnafu { entry });

        args.insert(key.to_owned(), value.to_owned());
    }

    Ok(args)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerArgs {
    pub enable_healthz: bool,
    pub enable_metrics: bool,
    pub loglevel: u8,
    pub extra_args: BTreeMap<String, String>,
}

impl Default for SchedulerArgs {
    fn default() -> Self {
        Self {
            enable_healthz: true,
            enable_metrics: false,
            loglevel: 3,
            extra_args: BTreeMap::new(),
        }
    }
}

impl SchedulerArgs {
    pub fn load(config: &CharmConfig) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            enable_healthz: config
                .get_bool(ENABLE_HEALTHZ)?
                .unwrap_or(defaults.enable_healthz),
            enable_metrics: config
                .get_bool(ENABLE_METRICS)?
                .unwrap_or(defaults.enable_metrics),
            loglevel: config.log_level(defaults.loglevel)?,
            extra_args: config.extra_args()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerArgs {
    pub enable_healthz: bool,
    pub loglevel: u8,
    pub extra_args: BTreeMap<String, String>,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        Self {
            enable_healthz: true,
            loglevel: 4,
            extra_args: BTreeMap::new(),
        }
    }
}

impl ControllerArgs {
    pub fn load(config: &CharmConfig) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            enable_healthz: config
                .get_bool(ENABLE_HEALTHZ)?
                .unwrap_or(defaults.enable_healthz),
            loglevel: config.log_level(defaults.loglevel)?,
            extra_args: config.extra_args()?,
        })
    }
}

/// Admission endpoints the webhook manager serves unless configured otherwise.
pub const DEFAULT_ADMISSIONS: [&str; 6] = [
    "/jobs/mutate",
    "/jobs/validate",
    "/podgroups/mutate",
    "/pods/validate",
    "/queues/mutate",
    "/queues/validate",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdmissionArgs {
    pub admissions: Vec<String>,
    pub loglevel: u8,
    pub extra_args: BTreeMap<String, String>,
    pub admission_port: u16,
}

impl Default for AdmissionArgs {
    fn default() -> Self {
        Self {
            admissions: DEFAULT_ADMISSIONS.iter().map(ToString::to_string).collect(),
            loglevel: 4,
            extra_args: BTreeMap::new(),
            admission_port: 8443,
        }
    }
}

impl AdmissionArgs {
    pub fn load(config: &CharmConfig) -> Result<Self> {
        let defaults = Self::default();

        let admissions = match config.get_str(ADMISSIONS)? {
            Some(admissions) => {
                let admissions: Vec<String> = admissions
                    .split(',')
                    .map(str::trim)
                    .filter(|admission| !admission.is_empty())
                    .map(ToOwned::to_owned)
                    .collect();
                ensure!(!admissions.is_empty(), NoAdmissionsSnafu);
                admissions
            }
            None => defaults.admissions,
        };

        let admission_port = match config.get_int(ADMISSION_PORT)? {
            Some(value) => u16::try_from(value)
                .ok()
                .filter(|port| *port != 0)
                .context(InvalidPortSnafu {
                    key: ADMISSION_PORT,
                    value,
                })?,
            None => defaults.admission_port,
        };

        Ok(Self {
            admissions,
            loglevel: config.log_level(defaults.loglevel)?,
            extra_args: config.extra_args()?,
            admission_port,
        })
    }
}

/// The `volcano-scheduler.yaml` document read by `vc-scheduler`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    pub actions: String,
    pub tiers: Vec<SchedulerPlugins>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SchedulerPlugins {
    pub plugins: Vec<SchedulerPlugin>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerPlugin {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_preemptable: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<BTreeMap<String, serde_json::Value>>,
}

impl SchedulerPlugin {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            enable_preemptable: None,
            arguments: None,
        }
    }

    fn not_preemptable(name: &str) -> Self {
        Self {
            enable_preemptable: Some(false),
            ..Self::named(name)
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            actions: "enqueue, allocate, backfill".to_owned(),
            tiers: vec![
                SchedulerPlugins {
                    plugins: vec![
                        SchedulerPlugin::named("priority"),
                        SchedulerPlugin::not_preemptable("gang"),
                        SchedulerPlugin::named("conformance"),
                    ],
                },
                SchedulerPlugins {
                    plugins: vec![
                        SchedulerPlugin::named("overcommit"),
                        SchedulerPlugin::not_preemptable("drf"),
                        SchedulerPlugin::named("predicates"),
                        SchedulerPlugin::named("proportion"),
                        SchedulerPlugin::named("nodeorder"),
                        SchedulerPlugin::named("binpack"),
                    ],
                },
            ],
        }
    }
}

impl SchedulerConfig {
    /// Uses the `scheduler-config` option when set, the default tiers otherwise.
    pub fn load(config: &CharmConfig) -> Result<Self> {
        let Some(document) = config
            .get_str(SCHEDULER_CONFIG)?
            .filter(|document| !document.trim().is_empty())
        else {
            return Ok(Self::default());
        };

        let scheduler_config: Self =
            serde_yaml::from_str(document).context(ParseSchedulerConfigSnafu)?;
        scheduler_config.validate()?;

        Ok(scheduler_config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            !self.actions.trim().is_empty(),
            InvalidSchedulerConfigSnafu {
                reason: "no actions configured"
            }
        );
        ensure!(
            self.tiers
                .iter()
                .flat_map(|tier| &tier.plugins)
                .all(|plugin| !plugin.name.trim().is_empty()),
            InvalidSchedulerConfigSnafu {
                reason: "every plugin needs a name"
            }
        );

        Ok(())
    }
}

/// The `volcano-admission.yaml` document read by `vc-webhook-manager`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionConfig {
    pub resource_groups: Vec<ResourceGroup>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroup {
    pub resource_group: String,
    pub scheduler_name: String,
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ResourceObject>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ResourceObject {
    pub key: String,
    pub value: Vec<String>,
}
