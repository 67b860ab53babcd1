//! Builds the command line the Pebble service layer starts the workload binary with.
//!
//! The produced string is a pure function of its inputs: fixed flags keep the order the workload
//! declares them in, extra flags are rendered sorted by key. This keeps the service layer
//! byte-identical between reconciliations so Pebble does not see a spurious change.

use std::{collections::BTreeMap, fmt, path::Path};

/// Appended to every command so the workload logs end up in the Pebble log stream.
const OUTPUT_REDIRECT: &str = "2>&1";

/// A single flag passed to a workload binary.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Flag(String);

impl Flag {
    /// A flag without a value, e.g. `--logtostderr`.
    pub fn switch(name: &str) -> Self {
        Self(format!("--{name}"))
    }

    /// A long flag with a value, e.g. `--port=8443`.
    pub fn long(name: &str, value: impl fmt::Display) -> Self {
        Self(format!("--{name}={value}"))
    }

    /// A short flag with a value, e.g. `-v=3`.
    pub fn short(name: &str, value: impl fmt::Display) -> Self {
        Self(format!("-{name}={value}"))
    }

    /// An operator supplied flag. The value is single quoted so the shell keeps it as one word.
    pub fn extra(name: &str, value: &str) -> Self {
        Self(format!("--{name}='{value}'"))
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builds the full command line for `binary`.
///
/// `fixed_flags` are rendered in the given order, followed by `extra_args` in lexicographic key
/// order.
///
/// # Example
///
/// ```
/// use std::{collections::BTreeMap, path::Path};
///
/// use volcano_charm::command::{Flag, build};
///
/// let extra_args = BTreeMap::from([
///     ("b".to_owned(), "2".to_owned()),
///     ("a".to_owned(), "1".to_owned()),
/// ]);
/// let command = build(
///     Path::new("/vc-controller-manager"),
///     &[Flag::switch("logtostderr")],
///     &extra_args,
/// );
///
/// assert_eq!(command, "/vc-controller-manager --logtostderr --a='1' --b='2' 2>&1");
/// ```
pub fn build(binary: &Path, fixed_flags: &[Flag], extra_args: &BTreeMap<String, String>) -> String {
    let mut parts = Vec::with_capacity(fixed_flags.len() + extra_args.len() + 2);
    parts.push(binary.display().to_string());
    parts.extend(fixed_flags.iter().map(Flag::to_string));
    parts.extend(
        extra_args
            .iter()
            .map(|(key, value)| Flag::extra(key, value).to_string()),
    );
    parts.push(OUTPUT_REDIRECT.to_owned());

    parts.join(" ")
}
