//! Check variants and their predicate
//!
//! Every check kind carries only its own parameters. A reported result is decoded
//! against the kind it was produced for and evaluated in [`CheckKind::evaluate`],
//! the one place that knows how each kind passes or fails.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::Severity;

use super::error::EngineError;

/// Percentage threshold restricted to `1..=99`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Percent(u8);

impl Percent {
    pub const MIN: u32 = 1;
    pub const MAX: u32 = 99;

    pub fn new(value: u32) -> Result<Self, EngineError> {
        if !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(EngineError::InvalidInput(format!(
                "threshold must be between {} and {}, got {value}",
                Self::MIN,
                Self::MAX
            )));
        }
        Ok(Percent(value as u8))
    }

    pub fn get(self) -> u32 {
        u32::from(self.0)
    }
}

impl TryFrom<u32> for Percent {
    type Error = EngineError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Percent::new(value)
    }
}

impl From<Percent> for u32 {
    fn from(value: Percent) -> Self {
        value.get()
    }
}

/// Which side of a threshold counts as failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Usage style: failing when the value rises above the threshold
    Above,
    /// Free-space style: failing when the value drops below the threshold
    Below,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default)]
    pub warning: Option<Percent>,
    #[serde(default)]
    pub error: Option<Percent>,
}

impl Thresholds {
    fn validate(&self, direction: Direction) -> Result<(), EngineError> {
        match (self.warning, self.error) {
            (None, None) => Err(EngineError::InvalidInput(
                "warning threshold or error threshold must be set".to_string(),
            )),
            (Some(warning), Some(error)) => {
                let ordered = match direction {
                    Direction::Above => warning < error,
                    Direction::Below => warning > error,
                };
                if ordered {
                    Ok(())
                } else {
                    let relation = match direction {
                        Direction::Above => "less",
                        Direction::Below => "greater",
                    };
                    Err(EngineError::InvalidInput(format!(
                        "warning threshold must be {relation} than error threshold"
                    )))
                }
            }
            _ => Ok(()),
        }
    }

    /// Severity of the crossed threshold, `None` when the value is fine
    fn crossed(&self, value: f64, direction: Direction) -> Option<Severity> {
        let crosses = |threshold: Percent| {
            let threshold = f64::from(threshold.get());
            match direction {
                Direction::Above => value > threshold,
                Direction::Below => value < threshold,
            }
        };

        if self.error.is_some_and(crosses) {
            return Some(Severity::Error);
        }
        if self.warning.is_some_and(crosses) {
            return Some(Severity::Warning);
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum EventLogName {
    Application,
    System,
    Security,
}

impl fmt::Display for EventLogName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventLogName::Application => "Application",
            EventLogName::System => "System",
            EventLogName::Security => "Security",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Info,
    Warning,
    Error,
    AuditSuccess,
    AuditFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventIdMatch {
    /// Any event id in the log
    Wildcard,
    Exact(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailWhen {
    /// Fail when matching events were found
    Contains,
    /// Fail when no matching event was found
    NotContains,
}

fn default_min_events() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogCheck {
    pub log_name: EventLogName,
    pub event_id: EventIdMatch,
    #[serde(default)]
    pub event_type: Option<EventType>,
    /// Case-insensitive substring of the event source
    #[serde(default)]
    pub source: Option<String>,
    /// Regular expression applied to the event message
    #[serde(default)]
    pub message_pattern: Option<String>,
    pub fail_when: FailWhen,
    /// Matches needed before a `Contains` check fails
    #[serde(default = "default_min_events")]
    pub min_events: u32,
}

impl EventLogCheck {
    fn pattern(&self) -> Result<Option<Regex>, EngineError> {
        self.message_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| EngineError::InvalidInput(format!("invalid message pattern: {e}")))
    }

    fn matches(&self, event: &EventRecord, pattern: Option<&Regex>) -> bool {
        if event.log_name != self.log_name {
            return false;
        }

        // wildcard ids never look at the numeric id
        if let EventIdMatch::Exact(id) = self.event_id
            && event.event_id != id
        {
            return false;
        }

        if let Some(event_type) = self.event_type
            && event.event_type != event_type
        {
            return false;
        }

        if let Some(source) = &self.source
            && !event
                .source
                .to_lowercase()
                .contains(&source.to_lowercase())
        {
            return false;
        }

        pattern.is_none_or(|re| re.is_match(&event.message))
    }
}

fn default_ok_codes() -> Vec<i32> {
    vec![0]
}

fn default_script_timeout() -> u64 {
    90
}

/// The closed set of check kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckKind {
    DiskSpace {
        disk: String,
        thresholds: Thresholds,
    },
    CpuLoad {
        thresholds: Thresholds,
    },
    Memory {
        thresholds: Thresholds,
    },
    Ping {
        host: String,
    },
    WinService {
        service: String,
        #[serde(default)]
        pass_if_start_pending: bool,
    },
    Script {
        script_id: u64,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_script_timeout")]
        timeout_secs: u64,
        #[serde(default = "default_ok_codes")]
        ok_codes: Vec<i32>,
        #[serde(default)]
        warning_codes: Vec<i32>,
    },
    EventLog(EventLogCheck),
}

/// Outcome of evaluating one reported result
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub passed: bool,
    /// Severity of a failure; informational when passing
    pub severity: Severity,
    /// Numeric value appended to the check history
    pub value: f64,
    pub detail: String,
}

impl Evaluation {
    fn pass(value: f64, detail: String) -> Self {
        Self {
            passed: true,
            severity: Severity::Info,
            value,
            detail,
        }
    }

    fn fail(severity: Severity, value: f64, detail: String) -> Self {
        Self {
            passed: false,
            severity,
            value,
            detail,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UsageReport {
    percent: f64,
}

#[derive(Debug, Deserialize)]
struct DiskReport {
    percent_free: f64,
}

#[derive(Debug, Deserialize)]
struct PingReport {
    reachable: bool,
    #[serde(default)]
    output: String,
}

#[derive(Debug, Deserialize)]
struct ServiceReport {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ScriptReport {
    retcode: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

/// One event log entry as reported by an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub log_name: EventLogName,
    pub event_id: u32,
    pub event_type: EventType,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct EventLogReport {
    events: Vec<EventRecord>,
}

fn decode<T: serde::de::DeserializeOwned>(raw: &serde_json::Value) -> Result<T, EngineError> {
    serde_json::from_value(raw.clone()).map_err(|e| EngineError::Malformed(e.to_string()))
}

fn percentage(value: f64) -> Result<f64, EngineError> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(value)
    } else {
        Err(EngineError::Malformed(format!("{value} is not a percentage")))
    }
}

impl CheckKind {
    /// Validate the parameters of this kind
    pub fn validate(&self) -> Result<(), EngineError> {
        match self {
            CheckKind::DiskSpace { disk, thresholds } => {
                if disk.trim().is_empty() {
                    return Err(EngineError::InvalidInput("disk must be set".to_string()));
                }
                thresholds.validate(Direction::Below)
            }
            CheckKind::CpuLoad { thresholds } | CheckKind::Memory { thresholds } => {
                thresholds.validate(Direction::Above)
            }
            CheckKind::Ping { host } => {
                if host.trim().is_empty() {
                    return Err(EngineError::InvalidInput("host must be set".to_string()));
                }
                Ok(())
            }
            CheckKind::WinService { service, .. } => {
                if service.trim().is_empty() {
                    return Err(EngineError::InvalidInput("service must be set".to_string()));
                }
                Ok(())
            }
            CheckKind::Script {
                timeout_secs,
                ok_codes,
                ..
            } => {
                if *timeout_secs == 0 {
                    return Err(EngineError::InvalidInput(
                        "script timeout must be positive".to_string(),
                    ));
                }
                if ok_codes.is_empty() {
                    return Err(EngineError::InvalidInput(
                        "at least one passing return code is required".to_string(),
                    ));
                }
                Ok(())
            }
            CheckKind::EventLog(check) => check.pattern().map(|_| ()),
        }
    }

    /// Short human readable description
    pub fn describe(&self) -> String {
        match self {
            CheckKind::DiskSpace { disk, .. } => format!("Disk Space Drive {disk}"),
            CheckKind::CpuLoad { .. } => "CPU Load".to_string(),
            CheckKind::Memory { .. } => "Memory".to_string(),
            CheckKind::Ping { host } => format!("Ping {host}"),
            CheckKind::WinService { service, .. } => format!("Service Check - {service}"),
            CheckKind::Script { script_id, .. } => format!("Script Check #{script_id}"),
            CheckKind::EventLog(check) => format!("Event Log Check - {}", check.log_name),
        }
    }

    /// Decode a raw agent result for this kind and decide pass or fail
    ///
    /// `severity` is used for kinds without thresholds of their own.
    pub fn evaluate(
        &self,
        raw: &serde_json::Value,
        severity: Severity,
    ) -> Result<Evaluation, EngineError> {
        match self {
            CheckKind::DiskSpace { disk, thresholds } => {
                let report: DiskReport = decode(raw)?;
                let free = percentage(report.percent_free)?;
                let detail = format!("{disk}: {free:.1}% free");
                Ok(match thresholds.crossed(free, Direction::Below) {
                    Some(severity) => Evaluation::fail(severity, free, detail),
                    None => Evaluation::pass(free, detail),
                })
            }
            CheckKind::CpuLoad { thresholds } | CheckKind::Memory { thresholds } => {
                let report: UsageReport = decode(raw)?;
                let usage = percentage(report.percent)?;
                let detail = format!("average usage {usage:.1}%");
                Ok(match thresholds.crossed(usage, Direction::Above) {
                    Some(severity) => Evaluation::fail(severity, usage, detail),
                    None => Evaluation::pass(usage, detail),
                })
            }
            CheckKind::Ping { host } => {
                let report: PingReport = decode(raw)?;
                let detail = if report.output.is_empty() {
                    format!("{host} reachable: {}", report.reachable)
                } else {
                    report.output
                };
                Ok(if report.reachable {
                    Evaluation::pass(1.0, detail)
                } else {
                    Evaluation::fail(severity, 0.0, detail)
                })
            }
            CheckKind::WinService {
                service,
                pass_if_start_pending,
            } => {
                let report: ServiceReport = decode(raw)?;
                let status = report.status.to_lowercase();
                let running =
                    status == "running" || (*pass_if_start_pending && status == "start_pending");
                let detail = format!("{service} is {status}");
                Ok(if running {
                    Evaluation::pass(1.0, detail)
                } else {
                    Evaluation::fail(severity, 0.0, detail)
                })
            }
            CheckKind::Script {
                ok_codes,
                warning_codes,
                ..
            } => {
                let report: ScriptReport = decode(raw)?;
                let detail = format!(
                    "return code {}\n{}\n{}",
                    report.retcode,
                    report.stdout.trim(),
                    report.stderr.trim()
                )
                .trim()
                .to_string();
                let value = f64::from(report.retcode);
                Ok(if ok_codes.contains(&report.retcode) {
                    Evaluation::pass(value, detail)
                } else if warning_codes.contains(&report.retcode) {
                    Evaluation::fail(Severity::Warning, value, detail)
                } else {
                    Evaluation::fail(severity, value, detail)
                })
            }
            CheckKind::EventLog(check) => {
                let report: EventLogReport = decode(raw)?;
                let pattern = check.pattern()?;
                let matched = report
                    .events
                    .iter()
                    .filter(|event| check.matches(event, pattern.as_ref()))
                    .count();
                let detail = format!("{matched} matching events in {}", check.log_name);
                let failed = match check.fail_when {
                    FailWhen::Contains => matched as u64 >= u64::from(check.min_events.max(1)),
                    FailWhen::NotContains => matched == 0,
                };
                Ok(if failed {
                    Evaluation::fail(severity, matched as f64, detail)
                } else {
                    Evaluation::pass(matched as f64, detail)
                })
            }
        }
    }
}
