use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::domain::{Hierarchy, RunLevel};
use crate::error::GearError;
use crate::fs_util;
use crate::platform::{BidsDownloader, DownloadRequest};
use crate::workspace::Workspace;

pub const DATASET_DESCRIPTION_FILE: &str = "dataset_description.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BidsStatus {
    Ok,
    ValidatorExit(u8),
    ValidationErrors,
    ValidatorUnavailable,
    ValidatorOutputUnreadable,
    WrongRunLevel,
    ExportFailed,
    ValidatorFailed,
    UnknownAcquisition,
    NoDestination,
    ApiError,
    NothingDownloaded,
}

impl BidsStatus {
    pub fn code(&self) -> i32 {
        match self {
            BidsStatus::Ok => 0,
            BidsStatus::ValidatorExit(code) => i32::from(*code),
            BidsStatus::ValidationErrors => 10,
            BidsStatus::ValidatorUnavailable => 11,
            BidsStatus::ValidatorOutputUnreadable => 12,
            BidsStatus::WrongRunLevel => 20,
            BidsStatus::ExportFailed => 21,
            BidsStatus::ValidatorFailed => 22,
            BidsStatus::UnknownAcquisition => 23,
            BidsStatus::NoDestination => 24,
            BidsStatus::ApiError => 25,
            BidsStatus::NothingDownloaded => 26,
        }
    }

    pub fn is_validation_finding(&self) -> bool {
        (1..=10).contains(&self.code())
    }

    fn from_validator_error(err: &GearError) -> Self {
        match err {
            GearError::ValidatorRun(_) | GearError::MissingTool(_) => BidsStatus::ValidatorUnavailable,
            GearError::ValidatorOutput(_) => BidsStatus::ValidatorOutputUnreadable,
            _ => BidsStatus::ValidatorFailed,
        }
    }

    fn from_download_error(err: &GearError) -> Self {
        match err {
            GearError::ApiHttp(_) | GearError::ApiStatus { .. } => BidsStatus::ApiError,
            _ => BidsStatus::ExportFailed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub reason: String,
    pub files: Vec<String>,
}

impl Finding {
    fn describe(&self) -> String {
        let mut text = self.reason.clone();
        for file in &self.files {
            let _ = write!(text, "\n       {file}");
        }
        text
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatorReport {
    pub return_code: i32,
    pub summary: Value,
    pub errors: Vec<Finding>,
    pub warnings: Vec<Finding>,
}

impl ValidatorReport {
    pub fn parse(output: &str, return_code: i32) -> Result<Self, GearError> {
        let value: Value = serde_json::from_str(output)
            .map_err(|err| GearError::ValidatorOutput(err.to_string()))?;
        let issues = value
            .get("issues")
            .ok_or_else(|| GearError::ValidatorOutput("result missing 'issues'".to_string()))?;
        Ok(Self {
            return_code,
            summary: value.get("summary").cloned().unwrap_or(Value::Null),
            errors: findings(issues, "errors")?,
            warnings: findings(issues, "warnings")?,
        })
    }

    pub fn status(&self) -> BidsStatus {
        if !self.errors.is_empty() {
            return BidsStatus::ValidationErrors;
        }
        match u8::try_from(self.return_code) {
            Ok(code @ 1..=9) => BidsStatus::ValidatorExit(code),
            _ => BidsStatus::Ok,
        }
    }

    fn log(&self) {
        info!(
            "bids-validator results:\n\nValid BIDS files summary:\n{}\n",
            serde_json::to_string_pretty(&self.summary).unwrap_or_default()
        );
        for finding in &self.errors {
            error!("{}", finding.describe());
        }
        for finding in &self.warnings {
            warn!("{}", finding.describe());
        }
        if self.errors.is_empty() {
            info!("No BIDS errors detected.");
        } else {
            error!("{} BIDS validation error(s) were detected", self.errors.len());
        }
    }
}

fn findings(issues: &Value, kind: &str) -> Result<Vec<Finding>, GearError> {
    let list = issues
        .get(kind)
        .and_then(Value::as_array)
        .ok_or_else(|| GearError::ValidatorOutput(format!("result missing 'issues.{kind}'")))?;
    list.iter()
        .map(|issue| {
            let reason = issue
                .get("reason")
                .and_then(Value::as_str)
                .ok_or_else(|| GearError::ValidatorOutput(format!("{kind} entry without a reason")))?
                .to_string();
            let files = issue
                .get("files")
                .and_then(Value::as_array)
                .map(|files| {
                    files
                        .iter()
                        .filter_map(|entry| entry.pointer("/file/relativePath").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Ok(Finding { reason, files })
        })
        .collect()
}

pub trait BidsValidator: Send + Sync {
    fn validate(&self, bids_path: &Utf8Path) -> Result<ValidatorReport, GearError>;
}

pub struct CommandValidator {
    program: Option<PathBuf>,
    output_path: Utf8PathBuf,
    env: BTreeMap<String, String>,
}

impl CommandValidator {
    pub fn new(output_path: Utf8PathBuf, env: BTreeMap<String, String>) -> Self {
        Self {
            program: fs_util::find_in_path("bids-validator"),
            output_path,
            env,
        }
    }
}

impl BidsValidator for CommandValidator {
    fn validate(&self, bids_path: &Utf8Path) -> Result<ValidatorReport, GearError> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| GearError::MissingTool("bids-validator".to_string()))?;
        info!("Command: bids-validator --verbose --json {bids_path}");

        let stdout = fs::File::create(self.output_path.as_std_path())
            .map_err(|err| GearError::ValidatorRun(format!("{}: {err}", self.output_path)))?;
        let output = Command::new(program)
            .args(["--verbose", "--json", bids_path.as_str()])
            .env_clear()
            .envs(&self.env)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::piped())
            .output()
            .map_err(|err| GearError::ValidatorRun(err.to_string()))?;

        let return_code = output.status.code().unwrap_or(-1);
        info!("bids-validator return code: {return_code}");
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            error!("{}", stderr.trim_end());
        }

        let text = fs::read_to_string(self.output_path.as_std_path())
            .map_err(|err| GearError::ValidatorOutput(err.to_string()))?;
        ValidatorReport::parse(&text, return_code)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub folders: Vec<String>,
    pub source_data: bool,
    pub dry_run: bool,
    pub validate: bool,
    pub tree: bool,
    pub tree_title: Option<String>,
    pub bidsignore: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone)]
pub struct BidsOutcome {
    pub status: BidsStatus,
    pub bids_path: Utf8PathBuf,
    pub report: Option<ValidatorReport>,
}

pub fn download_bids_for_runlevel<D, V>(
    downloader: &D,
    validator: &V,
    workspace: &Workspace,
    hierarchy: &Hierarchy,
    options: &DownloadOptions,
) -> BidsOutcome
where
    D: BidsDownloader + ?Sized,
    V: BidsValidator + ?Sized,
{
    let mut notes = run_notes(hierarchy, options);
    let bids_dir = workspace.bids_dir();

    let downloaded = fetch(downloader, workspace, hierarchy, options, &mut notes);
    let mut report = None;
    let status = match downloaded {
        Err(status) => status,
        Ok(path) if !path.as_std_path().exists() => {
            let message = "No BIDS data was found to download";
            error!("{message}");
            notes.push_str(&format!("{message}\n"));
            BidsStatus::NothingDownloaded
        }
        Ok(path) => {
            info!("Found BIDS path {path}");
            match prepare_and_validate(&path, validator, options) {
                Ok(found) => {
                    let status = found.as_ref().map_or(BidsStatus::Ok, ValidatorReport::status);
                    report = found;
                    status
                }
                Err(err) => {
                    error!("{err}");
                    notes.push_str(&format!("EXCEPTION: {err}\n"));
                    BidsStatus::from_validator_error(&err)
                }
            }
        }
    };

    if status == BidsStatus::Ok {
        let message = "Downloading BIDS data was successful!";
        info!("{message}");
        notes.push_str(message);
    } else {
        let message = "Error in BIDS download or validation.  See log for details.";
        error!("{message}");
        notes.push_str(&format!("{message}\n"));
    }

    if options.tree {
        let title = options
            .tree_title
            .clone()
            .unwrap_or_else(|| format!("BIDS data for {}", hierarchy.run_label));
        if let Err(err) = write_tree_html(&bids_dir, &workspace.bids_tree_path(), &title, &notes) {
            warn!("Unable to write {}: {err}", workspace.bids_tree_path());
        } else {
            info!("Wrote tree(\"{bids_dir}\") output into html file \"{}\"", workspace.bids_tree_path());
        }
    }

    BidsOutcome {
        status,
        bids_path: bids_dir,
        report,
    }
}

fn fetch<D: BidsDownloader + ?Sized>(
    downloader: &D,
    workspace: &Workspace,
    hierarchy: &Hierarchy,
    options: &DownloadOptions,
    notes: &mut String,
) -> Result<Utf8PathBuf, BidsStatus> {
    let run_level = hierarchy.run_level;
    if run_level == RunLevel::NoDestination {
        let message = "Destination does not exist.";
        error!("{message}");
        notes.push_str(&format!("ERROR: {message}\n"));
        return Err(BidsStatus::NoDestination);
    }

    info!(
        "{}",
        if options.source_data {
            "Downloading source data."
        } else {
            "Not downloading source data."
        }
    );
    if options.dry_run {
        info!("Dry run is set.  No data will be downloaded.");
    } else {
        info!("Dry run is NOT set.  Data WILL be downloaded.");
    }
    if options.folders.is_empty() {
        info!("Downloading BIDS data in all folders.");
    } else {
        info!("Downloading BIDS only in folders: {:?}", options.folders);
    }

    let bids_dir = workspace.bids_dir();
    let mut request = DownloadRequest {
        bids_dir: bids_dir.clone(),
        run_level,
        destination_id: workspace.destination_id().to_string(),
        project_label: hierarchy.project_label.clone(),
        subjects: Vec::new(),
        sessions: Vec::new(),
        acquisition_label: None,
        folders: options.folders.clone(),
        source_data: options.source_data,
        dry_run: options.dry_run,
    };

    match run_level {
        RunLevel::Project | RunLevel::Subject | RunLevel::Session => {
            info!("Downloading BIDS for {run_level} \"{}\"", hierarchy.run_label);
            request.subjects = hierarchy.subject_label.iter().cloned().collect();
            request.sessions = hierarchy.session_label.iter().cloned().collect();
        }
        RunLevel::Acquisition => {
            let Some(label) = hierarchy.acquisition_label.clone() else {
                let message = "Cannot download BIDS for an unknown acquisition";
                error!("{message}");
                notes.push_str(&format!("ERROR: {message}\n"));
                return Err(BidsStatus::UnknownAcquisition);
            };
            info!("Downloading BIDS for acquisition \"{label}\"");
            request.subjects = hierarchy.subject_label.iter().cloned().collect();
            request.sessions = hierarchy.session_label.iter().cloned().collect();
            request.acquisition_label = Some(label);
        }
        RunLevel::NoDestination => {
            let message = format!(
                "This job is not being run at the project, subject, session or acquisition level. run_level = {run_level}"
            );
            error!("{message}");
            notes.push_str(&format!("ERROR: {message}\n"));
            return Err(BidsStatus::WrongRunLevel);
        }
    }

    if bids_dir.as_std_path().exists() {
        info!("Not actually downloading it because {bids_dir} exists");
        return Ok(bids_dir);
    }

    downloader.download(&request).map_err(|err| {
        error!("{err}");
        notes.push_str(&format!("{err}\n"));
        BidsStatus::from_download_error(&err)
    })
}

fn prepare_and_validate<V: BidsValidator + ?Sized>(
    bids_path: &Utf8Path,
    validator: &V,
    options: &DownloadOptions,
) -> Result<Option<ValidatorReport>, GearError> {
    fix_dataset_description(bids_path)?;
    if let Some(source) = &options.bidsignore {
        install_bidsignore(source, bids_path)?;
    }
    if !options.validate {
        info!("Not running BIDS validation");
        return Ok(None);
    }
    let report = validator.validate(bids_path)?;
    report.log();
    Ok(Some(report))
}

pub fn default_dataset_description() -> Value {
    json!({
        "Acknowledgements": "",
        "Authors": [],
        "BIDSVersion": "1.2.0",
        "DatasetDOI": "",
        "Funding": [],
        "HowToAcknowledge": "",
        "License": "",
        "Name": "tome",
        "ReferencesAndLinks": [],
        "template": "project"
    })
}

/// Makes sure `dataset_description.json` exists and that its `Funding` is a
/// list, which the validator insists on. Returns whether the file was
/// written.
pub fn fix_dataset_description(bids_path: &Utf8Path) -> Result<bool, GearError> {
    let path = bids_path.join(DATASET_DESCRIPTION_FILE);
    let description = if path.as_std_path().exists() {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| GearError::DatasetDescription(format!("read {path}: {err}")))?;
        let mut data: Value = serde_json::from_str(&content)
            .map_err(|err| GearError::DatasetDescription(format!("{path}: {err}")))?;
        let Some(object) = data.as_object_mut() else {
            return Err(GearError::DatasetDescription(format!("{path} is not a JSON object")));
        };
        let funding = object.get("Funding").cloned().unwrap_or(Value::Null);
        if funding.is_array() {
            return Ok(false);
        }
        warn!("dataset_description.json \"Funding\" is not a list");
        let fixed = match funding {
            Value::Null => Vec::new(),
            Value::String(text) if text.is_empty() => Vec::new(),
            other => vec![other],
        };
        object.insert("Funding".to_string(), Value::Array(fixed));
        data
    } else {
        info!("Creating default dataset_description.json file");
        default_dataset_description()
    };

    let text = serde_json::to_string_pretty(&description)
        .map_err(|err| GearError::Filesystem(err.to_string()))?;
    fs_util::write_file_atomic(path.as_std_path(), text.as_bytes())?;
    Ok(true)
}

fn install_bidsignore(source: &Utf8Path, bids_path: &Utf8Path) -> Result<(), GearError> {
    let dest = bids_path.join(".bidsignore");
    fs::copy(source.as_std_path(), dest.as_std_path())
        .map_err(|err| GearError::Filesystem(format!("copy {source} to {dest}: {err}")))?;
    info!("Installed .bidsignore in {bids_path}");
    Ok(())
}

fn run_notes(hierarchy: &Hierarchy, options: &DownloadOptions) -> String {
    let mut notes = format!("run_level is {}\n", hierarchy.run_level);
    let labels = [
        ("run_label", Some(hierarchy.run_label.as_str())),
        ("group", hierarchy.group.as_deref()),
        ("project_label", hierarchy.project_label.as_deref()),
        ("subject_label", hierarchy.subject_label.as_deref()),
        ("session_label", hierarchy.session_label.as_deref()),
        ("acquisition_label", hierarchy.acquisition_label.as_deref()),
    ];
    for (name, value) in labels {
        let _ = writeln!(notes, "  {name:<18}: {}", value.unwrap_or("None"));
    }
    let _ = writeln!(notes, "  {:<18}: {:?}", "folders", options.folders);
    let source = if options.source_data { "downloaded" } else { "not downloaded" };
    let _ = writeln!(notes, "  {:<18}: {source}", "source data?");
    let dry_run = if options.dry_run { "Yes" } else { "No" };
    let _ = writeln!(notes, "  {:<18}: {dry_run}\n", "dry run?");
    notes
}

pub fn write_tree_html(dir: &Utf8Path, dest: &Utf8Path, title: &str, notes: &str) -> Result<(), GearError> {
    let mut listing = String::new();
    let (mut dirs, mut files) = (0usize, 0usize);
    if dir.as_std_path().is_dir() {
        let _ = writeln!(listing, "{dir}");
        for entry in WalkDir::new(dir.as_std_path()).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|err| GearError::Filesystem(err.to_string()))?;
            let indent = "│   ".repeat(entry.depth() - 1);
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().is_dir() {
                dirs += 1;
                let _ = writeln!(listing, "{indent}├── {name}/");
            } else {
                files += 1;
                let _ = writeln!(listing, "{indent}├── {name}");
            }
        }
        let _ = writeln!(listing, "\n{dirs} directories, {files} files");
    } else {
        let _ = writeln!(listing, "{dir} [error opening dir]");
    }

    let mut html = String::from(
        "<!DOCTYPE HTML PUBLIC \"-//W3C//DTD HTML 4.01 Transitional//EN\">\n<html>\n  <head>\n",
    );
    html.push_str("    <meta http-equiv=\"content-type\" content=\"text/html; charset=UTF-8\">\n");
    let _ = writeln!(html, "    <title>{}</title>", escape_html(title));
    html.push_str("  </head>\n  <body>\n<pre>\n");
    html.push_str(&escape_html(&listing));
    html.push('\n');
    html.push_str(&escape_html(notes));
    let _ = writeln!(html, "\n\nCreated {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
    html.push_str("</pre>\n  </body>\n</html>\n");
    fs_util::write_file_atomic(dest.as_std_path(), html.as_bytes())
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
