use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::GearError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunLevel {
    Project,
    Subject,
    Session,
    Acquisition,
    #[default]
    NoDestination,
}

impl RunLevel {
    pub const ANCESTORS: [RunLevel; 4] = [
        RunLevel::Project,
        RunLevel::Subject,
        RunLevel::Session,
        RunLevel::Acquisition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunLevel::Project => "project",
            RunLevel::Subject => "subject",
            RunLevel::Session => "session",
            RunLevel::Acquisition => "acquisition",
            RunLevel::NoDestination => "no_destination",
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, RunLevel::NoDestination)
    }
}

impl fmt::Display for RunLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunLevel {
    type Err = GearError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "project" => Ok(RunLevel::Project),
            "subject" => Ok(RunLevel::Subject),
            "session" => Ok(RunLevel::Session),
            "acquisition" => Ok(RunLevel::Acquisition),
            "no_destination" => Ok(RunLevel::NoDestination),
            _ => Err(GearError::InvalidRunLevel(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerType {
    Group,
    Project,
    Subject,
    Session,
    Acquisition,
    Analysis,
    #[serde(untagged)]
    Other(String),
}

impl ContainerType {
    pub fn as_str(&self) -> &str {
        match self {
            ContainerType::Group => "group",
            ContainerType::Project => "project",
            ContainerType::Subject => "subject",
            ContainerType::Session => "session",
            ContainerType::Acquisition => "acquisition",
            ContainerType::Analysis => "analysis",
            ContainerType::Other(value) => value,
        }
    }

    pub fn run_level(&self) -> Option<RunLevel> {
        match self {
            ContainerType::Project => Some(RunLevel::Project),
            ContainerType::Subject => Some(RunLevel::Subject),
            ContainerType::Session => Some(RunLevel::Session),
            ContainerType::Acquisition => Some(RunLevel::Acquisition),
            _ => None,
        }
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ContainerType {
    type Err = GearError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(GearError::InvalidContainerType(value.to_string()));
        }
        Ok(match normalized.as_str() {
            "group" => ContainerType::Group,
            "project" => ContainerType::Project,
            "subject" => ContainerType::Subject,
            "session" => ContainerType::Session,
            "acquisition" => ContainerType::Acquisition,
            "analysis" => ContainerType::Analysis,
            _ => ContainerType::Other(normalized),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationId(String);

impl DestinationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DestinationId {
    type Err = GearError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_string();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
        if !is_valid {
            return Err(GearError::InvalidDestinationId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hierarchy {
    pub run_level: RunLevel,
    pub run_label: String,
    pub group: Option<String>,
    pub project_label: Option<String>,
    pub subject_label: Option<String>,
    pub session_label: Option<String>,
    pub acquisition_label: Option<String>,
}

impl Default for Hierarchy {
    fn default() -> Self {
        Self {
            run_level: RunLevel::NoDestination,
            run_label: "unknown".to_string(),
            group: None,
            project_label: None,
            subject_label: None,
            session_label: None,
            acquisition_label: None,
        }
    }
}

impl Hierarchy {
    pub fn label(&self, level: RunLevel) -> Option<&str> {
        match level {
            RunLevel::Project => self.project_label.as_deref(),
            RunLevel::Subject => self.subject_label.as_deref(),
            RunLevel::Session => self.session_label.as_deref(),
            RunLevel::Acquisition => self.acquisition_label.as_deref(),
            RunLevel::NoDestination => None,
        }
    }

    pub fn set_label(&mut self, level: RunLevel, label: String) {
        match level {
            RunLevel::Project => self.project_label = Some(label),
            RunLevel::Subject => self.subject_label = Some(label),
            RunLevel::Session => self.session_label = Some(label),
            RunLevel::Acquisition => self.acquisition_label = Some(label),
            RunLevel::NoDestination => {}
        }
    }

    pub fn safe_run_label(&self) -> String {
        make_file_name_safe(&self.run_label, "")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl ConfigValue {
    /// Converts a raw JSON config value. `null` means "not set"; arrays
    /// become space separated lists and objects their JSON text.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(flag) => Some(ConfigValue::Bool(*flag)),
            serde_json::Value::Number(number) => Some(ConfigValue::Number(number.clone())),
            serde_json::Value::String(text) => Some(ConfigValue::Text(text.clone())),
            serde_json::Value::Array(items) => Some(ConfigValue::Text(
                items
                    .iter()
                    .filter_map(ConfigValue::from_json)
                    .map(|item| item.to_string())
                    .collect::<Vec<_>>()
                    .join(" "),
            )),
            serde_json::Value::Object(_) => Some(ConfigValue::Text(value.to_string())),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(flag) => Some(*flag),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Number(number) => number.as_f64(),
            ConfigValue::Text(text) => text.trim().parse().ok(),
            ConfigValue::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<u64> for ConfigValue {
    fn from(value: u64) -> Self {
        ConfigValue::Number(value.into())
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Text(value.to_string())
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(flag) => write!(f, "{flag}"),
            ConfigValue::Number(number) => write!(f, "{number}"),
            ConfigValue::Text(text) => write!(f, "{text}"),
        }
    }
}

fn unsafe_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^A-Za-z0-9_.]+").expect("valid regex"))
}

/// Replaces runs of characters outside `[A-Za-z0-9_.]` with `replace`.
/// An unsafe replacement is dropped and the characters are removed instead.
pub fn make_file_name_safe(input: &str, replace: &str) -> String {
    let replace = if unsafe_chars().is_match(replace) {
        tracing::warn!("{replace} is not a safe string, removing instead");
        ""
    } else {
        replace
    };
    unsafe_chars().replace_all(input, replace).into_owned()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_run_level() {
        assert_eq!("session".parse::<RunLevel>().unwrap(), RunLevel::Session);
        let err = "group".parse::<RunLevel>().unwrap_err();
        assert_matches!(err, GearError::InvalidRunLevel(_));
    }

    #[test]
    fn destination_id_rejects_path_characters() {
        let id: DestinationId = " 5d2761383289d60037e8b180 ".parse().unwrap();
        assert_eq!(id.as_str(), "5d2761383289d60037e8b180");
        let err = "../etc".parse::<DestinationId>().unwrap_err();
        assert_matches!(err, GearError::InvalidDestinationId(_));
    }

    #[test]
    fn container_type_keeps_unknown_kinds() {
        let kind: ContainerType = "Analysis".parse().unwrap();
        assert_eq!(kind, ContainerType::Analysis);
        let other: ContainerType = "file".parse().unwrap();
        assert_eq!(other, ContainerType::Other("file".to_string()));
        assert_eq!(other.run_level(), None);
    }

    #[test]
    fn safe_file_names() {
        assert_eq!(make_file_name_safe("TOME 3024/ses-1", ""), "TOME3024ses1");
        assert_eq!(make_file_name_safe("a b", "_"), "a_b");
        assert_eq!(make_file_name_safe("a b", "/"), "ab");
    }

    #[test]
    fn config_value_from_json() {
        let list = serde_json::json!(["T1w", "T2w"]);
        assert_eq!(
            ConfigValue::from_json(&list),
            Some(ConfigValue::Text("T1w T2w".to_string()))
        );
        assert_eq!(ConfigValue::from_json(&serde_json::Value::Null), None);
        let number = ConfigValue::from_json(&serde_json::json!(3.5)).unwrap();
        assert_eq!(number.to_string(), "3.5");
    }
}
