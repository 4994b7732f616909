use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::domain::{ConfigValue, DestinationId};
use crate::error::{Diagnostics, GearError};

pub const CONFIG_FILE: &str = "config.json";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const ENVIRONMENT_FILE: &str = "gear_environ.json";

pub const BIDS_APP_ARGS: &str = "bids_app_args";

pub type PipelineArgs = IndexMap<String, ConfigValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperNamespace {
    Gear,
    Slurm,
    Singularity,
}

impl WrapperNamespace {
    pub const ALL: [WrapperNamespace; 3] = [
        WrapperNamespace::Gear,
        WrapperNamespace::Slurm,
        WrapperNamespace::Singularity,
    ];

    pub fn prefix(&self) -> &'static str {
        match self {
            WrapperNamespace::Gear => "gear-",
            WrapperNamespace::Slurm => "slurm-",
            WrapperNamespace::Singularity => "singularity-",
        }
    }

    pub fn classify(key: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|namespace| key.starts_with(namespace.prefix()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GearOptions {
    pub log_level: String,
    pub dry_run: bool,
    pub run_bids_validation: bool,
    pub abort_on_bids_error: bool,
    pub save_intermediate_output: bool,
    pub intermediate_files: Vec<String>,
    pub intermediate_folders: Vec<String>,
    pub bids_folders: Vec<String>,
    pub download_source_data: bool,
    pub extra: IndexMap<String, ConfigValue>,
}

impl Default for GearOptions {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            dry_run: false,
            run_bids_validation: true,
            abort_on_bids_error: false,
            save_intermediate_output: false,
            intermediate_files: Vec::new(),
            intermediate_folders: Vec::new(),
            bids_folders: Vec::new(),
            download_source_data: false,
            extra: IndexMap::new(),
        }
    }
}

impl GearOptions {
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.as_str() {
            "DEBUG" => "debug",
            "WARNING" | "WARN" => "warn",
            "ERROR" | "CRITICAL" => "error",
            _ => "info",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inputs {
    pub api_key: Option<String>,
    pub bidsignore: Option<Utf8PathBuf>,
    pub previous_results: Option<Utf8PathBuf>,
    pub work_dir_archive: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone)]
pub struct GearConfig {
    pub destination_id: DestinationId,
    pub options: GearOptions,
    pub pipeline_args: PipelineArgs,
    pub inputs: Inputs,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Deserialize)]
pub struct RawGearConfig {
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    pub destination: RawDestination,
}

#[derive(Debug, Deserialize)]
pub struct RawDestination {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub custom: Value,
}

impl Manifest {
    pub fn bids_app_binary(&self) -> Option<String> {
        self.custom
            .get("bids-app-binary")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(root: &Utf8Path) -> Result<GearConfig, GearError> {
        let config_path = root.join(CONFIG_FILE);
        if !config_path.as_std_path().exists() {
            return Err(GearError::MissingConfig(root.as_std_path().to_path_buf()));
        }
        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| GearError::ConfigRead(config_path.as_std_path().to_path_buf()))?;
        let raw: RawGearConfig = serde_json::from_str(&content)
            .map_err(|err| GearError::ConfigParse(err.to_string()))?;
        Self::resolve_config(raw)
    }

    pub fn resolve_config(raw: RawGearConfig) -> Result<GearConfig, GearError> {
        let destination_id = raw.destination.id.parse()?;
        let mut diagnostics = Diagnostics::default();
        let (options, pipeline_args) = split_config(&raw.config, &mut diagnostics);
        let inputs = parse_inputs(&raw.inputs);
        Ok(GearConfig {
            destination_id,
            options,
            pipeline_args,
            inputs,
            diagnostics,
        })
    }

    pub fn manifest(root: &Utf8Path) -> Result<Manifest, GearError> {
        let path = root.join(MANIFEST_FILE);
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| GearError::ConfigRead(path.as_std_path().to_path_buf()))?;
        serde_json::from_str(&content).map_err(|err| GearError::ConfigParse(err.to_string()))
    }
}

/// Separates wrapper options from the arguments destined for the BIDS App.
/// A mistyped wrapper option keeps its default and is recorded as an error.
pub fn split_config(
    config: &Map<String, Value>,
    diagnostics: &mut Diagnostics,
) -> (GearOptions, PipelineArgs) {
    let mut options = GearOptions::default();
    let mut args = PipelineArgs::new();

    for (key, raw) in config {
        let Some(value) = ConfigValue::from_json(raw) else {
            continue;
        };
        match WrapperNamespace::classify(key) {
            None => {
                args.insert(key.clone(), value);
            }
            Some(WrapperNamespace::Gear) => {
                if let Err(err) = apply_gear_option(&mut options, key, value) {
                    diagnostics.error(err.to_string());
                }
            }
            Some(_) => {
                options.extra.insert(key.clone(), value);
            }
        }
    }

    (options, args)
}

fn apply_gear_option(
    options: &mut GearOptions,
    key: &str,
    value: ConfigValue,
) -> Result<(), GearError> {
    match key {
        "gear-log-level" => options.log_level = expect_text(key, &value)?.to_uppercase(),
        "gear-dry-run" => options.dry_run = expect_bool(key, &value)?,
        "gear-run-bids-validation" => options.run_bids_validation = expect_bool(key, &value)?,
        "gear-abort-on-bids-error" => options.abort_on_bids_error = expect_bool(key, &value)?,
        "gear-save-intermediate-output" => {
            options.save_intermediate_output = expect_bool(key, &value)?
        }
        "gear-intermediate-files" => options.intermediate_files = split_words(&value),
        "gear-intermediate-folders" => options.intermediate_folders = split_words(&value),
        "gear-bids-folders" => options.bids_folders = split_words(&value),
        "gear-download-source-data" => options.download_source_data = expect_bool(key, &value)?,
        _ => {
            options.extra.insert(key.to_string(), value);
        }
    }
    Ok(())
}

fn expect_bool(key: &str, value: &ConfigValue) -> Result<bool, GearError> {
    value.as_bool().ok_or_else(|| GearError::InvalidOption {
        key: key.to_string(),
        message: format!("expected a boolean, got {value}"),
    })
}

fn expect_text<'a>(key: &str, value: &'a ConfigValue) -> Result<&'a str, GearError> {
    value.as_str().ok_or_else(|| GearError::InvalidOption {
        key: key.to_string(),
        message: format!("expected a string, got {value}"),
    })
}

fn split_words(value: &ConfigValue) -> Vec<String> {
    value
        .to_string()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn parse_inputs(inputs: &Map<String, Value>) -> Inputs {
    let mut parsed = Inputs::default();
    for (name, input) in inputs {
        if input.get("base").and_then(Value::as_str) == Some("api-key") {
            parsed.api_key = input.get("key").and_then(Value::as_str).map(str::to_string);
            continue;
        }
        let Some(path) = input
            .get("location")
            .and_then(|location| location.get("path"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        let path = Utf8PathBuf::from(path);
        match name.as_str() {
            "bidsignore" => parsed.bidsignore = Some(path),
            "previous-results" => parsed.previous_results = Some(path),
            "work-dir" => parsed.work_dir_archive = Some(path),
            _ => {}
        }
    }
    parsed
}

pub fn load_environment(path: &Utf8Path) -> Result<BTreeMap<String, String>, GearError> {
    if !path.as_std_path().exists() {
        tracing::debug!("{path} not found, using the current environment");
        return Ok(std::env::vars().collect());
    }
    tracing::info!("Loading gear environment from {path}");
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|_| GearError::ConfigRead(path.as_std_path().to_path_buf()))?;
    serde_json::from_str(&content).map_err(|err| GearError::ConfigParse(err.to_string()))
}
