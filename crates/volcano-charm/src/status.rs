use std::fmt;

/// The status a unit reports to the operator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitStatus {
    /// Waiting on something outside of the charm's control, e.g. the workload container.
    Waiting(String),

    /// Needs operator intervention, e.g. invalid configuration.
    Blocked(String),

    /// The charm is performing work the operator does not have to act on.
    Maintenance(String),

    Active,
}

impl UnitStatus {
    pub fn waiting(message: impl Into<String>) -> Self {
        Self::Waiting(message.into())
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self::Blocked(message.into())
    }

    pub fn maintenance(message: impl Into<String>) -> Self {
        Self::Maintenance(message.into())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Waiting(_) => "waiting",
            Self::Blocked(_) => "blocked",
            Self::Maintenance(_) => "maintenance",
            Self::Active => "active",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Waiting(message) | Self::Blocked(message) | Self::Maintenance(message) => {
                message
            }
            Self::Active => "",
        }
    }
}

impl Default for UnitStatus {
    fn default() -> Self {
        Self::Waiting(String::new())
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            "" => f.write_str(self.name()),
            message => write!(f, "{}: {message}", self.name()),
        }
    }
}
