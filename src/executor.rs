use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

use camino::Utf8PathBuf;
use indexmap::IndexMap;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::command::BidsAppCommand;
use crate::error::GearError;
use crate::fs_util;
use crate::workspace::Workspace;

const TIME_BINARY: &str = "/usr/bin/time";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionOutput {
    pub fn success(&self) -> bool {
        self.return_code == 0
    }
}

pub trait PipelineExecutor {
    fn run(
        &self,
        command: &BidsAppCommand,
        env: &BTreeMap<String, String>,
    ) -> Result<ExecutionOutput, GearError>;
}

impl<E: PipelineExecutor + ?Sized> PipelineExecutor for &E {
    fn run(
        &self,
        command: &BidsAppCommand,
        env: &BTreeMap<String, String>,
    ) -> Result<ExecutionOutput, GearError> {
        (**self).run(command, env)
    }
}

pub struct SystemExecutor {
    time_report: Option<Utf8PathBuf>,
}

impl SystemExecutor {
    pub fn new(time_report: Option<Utf8PathBuf>) -> Self {
        Self { time_report }
    }

    fn build(&self, command: &BidsAppCommand) -> Command {
        match &self.time_report {
            Some(report) if Path::new(TIME_BINARY).is_file() => {
                let mut process = Command::new(TIME_BINARY);
                process
                    .args(["-v", "-o", report.as_str()])
                    .arg(&command.program)
                    .args(&command.args);
                process
            }
            _ => {
                let mut process = Command::new(&command.program);
                process.args(&command.args);
                process
            }
        }
    }
}

impl PipelineExecutor for SystemExecutor {
    fn run(
        &self,
        command: &BidsAppCommand,
        env: &BTreeMap<String, String>,
    ) -> Result<ExecutionOutput, GearError> {
        let output = self
            .build(command)
            .env_clear()
            .envs(env)
            .output()
            .map_err(|err| GearError::Execution(format!("{}: {err}", command.program)))?;

        let result = ExecutionOutput {
            // A child killed by a signal has no exit code.
            return_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        for line in result.stdout.lines() {
            info!("{line}");
        }
        for line in result.stderr.lines() {
            warn!("{line}");
        }
        info!("{} return code: {}", command.program, result.return_code);
        Ok(result)
    }
}

pub struct DryRunExecutor {
    workspace: Workspace,
}

impl DryRunExecutor {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

impl PipelineExecutor for DryRunExecutor {
    fn run(
        &self,
        command: &BidsAppCommand,
        _env: &BTreeMap<String, String>,
    ) -> Result<ExecutionOutput, GearError> {
        info!("Dry run, not running: {command}");
        pretend_it_ran(&self.workspace)?;
        Ok(ExecutionOutput::default())
    }
}

const FAKE_REPORT: &str = r#"<html>
<head>
<meta http-equiv="content-type" content="text/html; charset=UTF-8">
<title>sub-TOME3024</title>
</head>
<body>
<h1>sub-TOME3024</h1>
<p>This is a test html file.</p>
</body>
</html>
"#;

pub fn pretend_it_ran(workspace: &Workspace) -> Result<(), GearError> {
    let work = workspace.work_dir();
    info!("Creating fake output in {work}");
    touch_all(&[
        work.join("somedir/d3.js"),
        work.join("reportlets/somecmd/sub-TOME3024/anat/sub-TOME3024_desc-about_T1w.html"),
    ])?;

    let results = workspace.analysis_output_dir();
    info!("Creating fake output in {results}");
    touch_all(&[
        results.join("logs/CITATION.md"),
        results.join(
            "sub-TOME3024/ses-Session2/anat/sub-TOME3024_ses-Session2_acq-MPR_from-orig_to-T1w_mode-image_xfm.txt",
        ),
        results.join("sub-TOME3024/figures/sub-TOME3024_desc-about_T1w.svg"),
    ])?;

    let report = results.join("sub-TOME3024.html");
    if !report.as_std_path().exists() {
        debug!("Creating: {report}");
        fs_util::write_file_atomic(report.as_std_path(), FAKE_REPORT.as_bytes())?;
    }
    Ok(())
}

fn touch_all(files: &[Utf8PathBuf]) -> Result<(), GearError> {
    for file in files {
        if file.as_std_path().exists() {
            debug!("Exists: {file}");
            continue;
        }
        debug!("Creating: {file}");
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| GearError::Filesystem(format!("create {parent}: {err}")))?;
        }
        fs::File::create(file.as_std_path())
            .map_err(|err| GearError::Filesystem(format!("create {file}: {err}")))?;
    }
    Ok(())
}

fn report_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\s*(.+?):\s+(.*?)\s*$").expect("valid regex"))
}

pub fn parse_time_report(text: &str) -> IndexMap<String, String> {
    text.lines()
        .filter_map(|line| report_line().captures(line))
        .map(|caps| (caps[1].to_string(), caps[2].trim_matches('"').to_string()))
        .collect()
}

pub fn write_resource_metadata(workspace: &Workspace) -> Result<bool, GearError> {
    let report_path = workspace.time_report_path();
    if !report_path.as_std_path().is_file() {
        debug!("No timing report at {report_path}");
        return Ok(false);
    }
    let text = fs::read_to_string(report_path.as_std_path())
        .map_err(|err| GearError::Filesystem(format!("read {report_path}: {err}")))?;
    let mut resources = parse_time_report(&text);
    resources.insert(
        "recorded".to_string(),
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    );
    for (key, value) in &resources {
        info!("{key}: {value}");
    }

    let metadata = json!({ "analysis": { "info": { "resources used": resources } } });
    let text = serde_json::to_string_pretty(&metadata)
        .map_err(|err| GearError::Filesystem(err.to_string()))?;
    fs_util::write_file_atomic(workspace.metadata_path().as_std_path(), text.as_bytes())?;
    Ok(true)
}
