//! Renders the charm templates.
//!
//! The templates are adapted from the upstream Volcano helm chart and use a small set of helm
//! helpers re-implemented on top of [`minijinja`]:
//!
//! - `.Values.a | regexMatch "/pods"` is written `Values.a | regexMatch("/pods")`
//! - `base .Values.file` is written `base(Values.file)`
//! - `(.Files.Glob .Values.file).AsConfig` is written `Files.glob(Values.file).AsConfig`
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use minijinja::{
    Environment, Error as TemplateError, ErrorKind, State, UndefinedBehavior, Value,
    value::{Object, from_args},
};
use regex::Regex;
use serde::Serialize;
use snafu::{ResultExt, Snafu};
use volcano_shared::yaml::{self, SerializeOptions};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read template {path:?}"))]
    ReadTemplate {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to render template {name:?}"))]
    RenderTemplate {
        source: TemplateError,
        name: String,
    },
}

/// The `Release` object of a helm chart.
///
/// Only the fields which are set are visible to templates. Accessing an unset field fails the
/// render.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Release {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub namespace: String,

    /// Name of the charm application deploying the release.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charm: Option<String>,
}

impl Release {
    pub fn named(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            namespace: namespace.into(),
            charm: None,
        }
    }

    pub fn for_charm(charm: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: None,
            namespace: namespace.into(),
            charm: Some(charm.into()),
        }
    }
}

/// Renders templates with strict undefined handling and the helm compatible helpers.
pub struct TemplateRenderer {
    env: Environment<'static>,
    basedir: PathBuf,
}

impl fmt::Debug for TemplateRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateRenderer")
            .field("basedir", &self.basedir)
            .finish_non_exhaustive()
    }
}

impl TemplateRenderer {
    /// Creates a renderer resolving `Files.glob` paths relative to `basedir`.
    pub fn new(basedir: impl Into<PathBuf>) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        // `indent` drops the final line break of `AsConfig`, the template's own one ends the
        // block scalar.
        env.set_keep_trailing_newline(true);
        env.add_filter("regexMatch", regex_match);
        env.add_function("base", base);

        Self {
            env,
            basedir: basedir.into(),
        }
    }

    /// Reads and renders the template at `path`.
    pub fn render_file(
        &self,
        path: &Path,
        values: &serde_json::Value,
        release: &Release,
    ) -> Result<String> {
        let source = std::fs::read_to_string(path).context(ReadTemplateSnafu { path })?;
        self.render_named(&path.display().to_string(), &source, values, release)
    }

    pub fn render_named(
        &self,
        name: &str,
        source: &str,
        values: &serde_json::Value,
        release: &Release,
    ) -> Result<String> {
        let context = minijinja::context! {
            Values => Value::from_serialize(values),
            Release => Value::from_serialize(release),
            Files => Value::from_object(Files {
                basedir: self.basedir.clone(),
            }),
        };

        self.env
            .render_named_str(name, source, context)
            .context(RenderTemplateSnafu { name })
    }
}

/// Helm `regexMatch`: every non-overlapping match of `pattern` in `value`.
///
/// The result is falsy when there is no match, which is how the templates use it in conditions.
fn regex_match(value: &str, pattern: &str) -> Result<Value, TemplateError> {
    let regex = Regex::new(pattern).map_err(|err| {
        TemplateError::new(
            ErrorKind::InvalidOperation,
            format!("invalid regular expression {pattern:?}"),
        )
        .with_source(err)
    })?;

    Ok(regex
        .find_iter(value)
        .map(|found| Value::from(found.as_str()))
        .collect())
}

/// Helm `base`: the final component of a path.
fn base(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Helm `.Files`, rooted at the renderer's base directory.
#[derive(Debug)]
struct Files {
    basedir: PathBuf,
}

impl Files {
    /// Reads `path` and returns an object exposing it as `AsConfig`, a YAML mapping of the file
    /// name to the file body.
    fn glob(&self, path: &str) -> Result<Value, TemplateError> {
        let path = self.basedir.join(path);
        let body = std::fs::read_to_string(&path).map_err(|err| {
            TemplateError::new(
                ErrorKind::InvalidOperation,
                format!("failed to read {}", path.display()),
            )
            .with_source(err)
        })?;

        let file_name = base(&path.to_string_lossy());
        let as_config = yaml::to_string(
            &std::collections::BTreeMap::from([(file_name, body)]),
            SerializeOptions::default(),
        )
        .map_err(|err| {
            TemplateError::new(
                ErrorKind::InvalidOperation,
                format!("failed to serialize {}", path.display()),
            )
            .with_source(err)
        })?;

        Ok(Value::from_iter([("AsConfig", as_config)]))
    }
}

impl Object for Files {
    fn call_method(
        self: &Arc<Self>,
        _state: &State<'_, '_>,
        method: &str,
        args: &[Value],
    ) -> Result<Value, TemplateError> {
        match method {
            "glob" => {
                let (path,): (&str,) = from_args(args)?;
                self.glob(path)
            }
            _ => Err(TemplateError::new(
                ErrorKind::UnknownMethod,
                format!("Files has no method named {method}"),
            )),
        }
    }
}
