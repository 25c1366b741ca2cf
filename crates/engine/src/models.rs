//! Core domain models for the orchestrator.
//!
//! The `*Spec` types are the authored workflow document (deserialised from
//! YAML or JSON).  The status enums describe the lifecycle of runs, jobs
//! and steps; they round-trip through the lowercase strings stored in the
//! `db` crate's rows.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// WorkflowSpec
// ---------------------------------------------------------------------------

/// A complete workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Trigger configuration.  Kept as metadata; triggering happens outside
    /// the orchestrator.
    #[serde(default, rename = "on", skip_serializing_if = "Option::is_none")]
    pub triggers: Option<serde_json::Value>,
    /// Upper bound for the whole run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Timeout>,
    /// Jobs keyed by name, in declaration order.
    #[serde(default, with = "ordered_jobs")]
    pub jobs: Vec<(String, JobSpec)>,
}

// ---------------------------------------------------------------------------
// JobSpec
// ---------------------------------------------------------------------------

/// A named unit of work: ordered steps run by one runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Display name; the job's key is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tags a runner must carry to take this job.
    #[serde(default, rename = "runs-on", deserialize_with = "one_or_many")]
    pub runs_on: Vec<String>,
    /// Keys of jobs that must succeed first.
    #[serde(default, deserialize_with = "one_or_many")]
    pub needs: Vec<String>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Timeout>,
}

// ---------------------------------------------------------------------------
// StepSpec
// ---------------------------------------------------------------------------

/// A single command within a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StepSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Shell command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    /// Marketplace action reference.  Parsed only to be rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Timeout>,
}

// ---------------------------------------------------------------------------
// StepAction
// ---------------------------------------------------------------------------

/// What a compiled step does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    /// Run `command` with `sh -c`.
    Shell { command: String },
}

impl StepAction {
    /// Human-readable form stored on the step row.
    pub fn describe(&self) -> &str {
        match self {
            Self::Shell { command } => command,
        }
    }
}

// ---------------------------------------------------------------------------
// Timeout
// ---------------------------------------------------------------------------

/// A duration written as seconds (`90`) or with a unit suffix (`"30s"`,
/// `"5m"`, `"1h"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout(pub Duration);

impl Timeout {
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl FromStr for Timeout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (digits, unit) = match s.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
            Some((i, _)) => s.split_at(i),
            None => (s, "s"),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid timeout '{s}'"))?;
        // Out-of-range values saturate; the compiler rejects them.
        let secs = match unit.trim() {
            "s" => value,
            "m" => value.saturating_mul(60),
            "h" => value.saturating_mul(3600),
            other => return Err(format!("invalid timeout unit '{other}' in '{s}'")),
        };
        Ok(Self(Duration::from_secs(secs)))
    }
}

impl Serialize for Timeout {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}s", self.0.as_secs()))
    }
}

impl<'de> Deserialize<'de> for Timeout {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Self(Duration::from_secs(secs))),
            Raw::Text(text) => text.parse().map_err(de::Error::custom),
        }
    }
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Ready,
    Dispatched,
    Running,
    Success,
    Failed,
    Skipped,
    /// Force-settled after a runner ignored a cancellation.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Still holds the run open.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// Lifecycle of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Severity of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $(Self::$variant => f.pad($text),)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($ty), ": {}"), other)),
                }
            }
        }
    };
}

string_enum!(RunStatus {
    Pending => "pending",
    Running => "running",
    Success => "success",
    Failed => "failed",
    Cancelled => "cancelled",
});

string_enum!(JobStatus {
    Pending => "pending",
    Ready => "ready",
    Dispatched => "dispatched",
    Running => "running",
    Success => "success",
    Failed => "failed",
    Skipped => "skipped",
    Cancelled => "cancelled",
});

string_enum!(StepStatus {
    Pending => "pending",
    Running => "running",
    Success => "success",
    Failed => "failed",
    Skipped => "skipped",
    Cancelled => "cancelled",
});

string_enum!(LogLevel {
    Debug => "debug",
    Info => "info",
    Warn => "warn",
    Error => "error",
});

// ---------------------------------------------------------------------------
// serde helpers
// ---------------------------------------------------------------------------

/// Accept either a single string or a list of strings.
fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(one)) => vec![one],
        Some(OneOrMany::Many(many)) => many,
    })
}

/// A mapping kept as an ordered list so declaration order survives
/// deserialisation.  Duplicate keys are kept; the compiler rejects them.
mod ordered_jobs {
    use super::*;

    pub fn serialize<S: Serializer>(
        jobs: &[(String, JobSpec)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(jobs.len()))?;
        for (key, job) in jobs {
            map.serialize_entry(key, job)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, JobSpec)>, D::Error> {
        struct JobsVisitor;

        impl<'de> Visitor<'de> for JobsVisitor {
            type Value = Vec<(String, JobSpec)>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of job name to job")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(Vec::new())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut jobs = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, job)) = access.next_entry::<String, JobSpec>()? {
                    jobs.push((key, job));
                }
                Ok(jobs)
            }
        }

        deserializer.deserialize_any(JobsVisitor)
    }
}
