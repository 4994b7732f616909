use std::collections::BTreeMap;
use std::fs;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::archive;
use crate::bids::{self, BidsOutcome, BidsStatus, BidsValidator, DownloadOptions};
use crate::command::{self, BidsAppCommand};
use crate::config::{GearConfig, GearOptions};
use crate::domain::Hierarchy;
use crate::error::{Diagnostics, GearError};
use crate::executor::{self, DryRunExecutor, PipelineExecutor};
use crate::fs_util;
use crate::performance::{HostResources, PerformanceResolver};
use crate::platform::{BidsDownloader, ContainerLookup};
use crate::run_level;
use crate::workspace::Workspace;

pub const DEFAULT_ANALYSIS_LEVEL: &str = "participant";

#[derive(Debug, Clone)]
pub struct GearJob {
    pub config: GearConfig,
    pub workspace: Workspace,
    pub bids_app: Option<String>,
    pub analysis_level: String,
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub return_code: i32,
    pub hierarchy: Hierarchy,
    pub bids_status: Option<BidsStatus>,
    pub bids_code: Option<i32>,
    pub command: Option<BidsAppCommand>,
    pub executed: bool,
    pub archives: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<L, D, V, E, H>
where
    L: ContainerLookup,
    D: BidsDownloader,
    V: BidsValidator,
    E: PipelineExecutor,
    H: HostResources,
{
    lookup: L,
    downloader: D,
    validator: V,
    executor: E,
    host: H,
}

impl<L, D, V, E, H> App<L, D, V, E, H>
where
    L: ContainerLookup,
    D: BidsDownloader,
    V: BidsValidator,
    E: PipelineExecutor,
    H: HostResources,
{
    pub fn new(lookup: L, downloader: D, validator: V, executor: E, host: H) -> Self {
        Self {
            lookup,
            downloader,
            validator,
            executor,
            host,
        }
    }

    /// Runs the whole gear. Problems end up in the report instead of being
    /// returned: the return code is 1 when any error was recorded. Archiving
    /// runs whether or not the BIDS App ran or succeeded.
    pub fn run(&self, job: &GearJob, sink: &dyn ProgressSink) -> RunReport {
        let mut diagnostics = job.config.diagnostics.clone();
        for message in &diagnostics.errors {
            error!("{message}");
        }
        let workspace = &job.workspace;
        let options = &job.config.options;

        let mut report = RunReport {
            return_code: 0,
            hierarchy: Hierarchy::default(),
            bids_status: None,
            bids_code: None,
            command: None,
            executed: false,
            archives: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        };

        if let Err(err) = workspace.ensure_dirs() {
            error!("{err}");
            diagnostics.error(err.to_string());
        }
        phase(sink, "phase=Restore; unpacking previous results", || {
            self.restore_inputs(job, &mut diagnostics)
        });

        report.hierarchy = phase(sink, "phase=Resolve; finding the run level", || {
            run_level::resolve(&self.lookup, workspace.destination_id().as_str())
        });
        let run_label = report.hierarchy.safe_run_label();

        let outcome = phase(sink, "phase=Bids; downloading and validating BIDS data", || {
            self.prepare_bids(job, &report.hierarchy, &mut diagnostics)
        });
        report.bids_status = Some(outcome.status);
        report.bids_code = Some(outcome.status.code());

        let command = match &job.bids_app {
            Some(program) => {
                let resolver = PerformanceResolver::new(&self.host);
                let args = resolver.apply(&job.config.pipeline_args);
                Some(command::compile(
                    &args,
                    program,
                    &outcome.bids_path,
                    &workspace.analysis_output_dir(),
                    &job.analysis_level,
                    &mut diagnostics,
                ))
            }
            None => {
                let message = "No BIDS App given on the command line or in manifest.json";
                error!("{message}");
                diagnostics.error(message);
                None
            }
        };

        match &command {
            Some(command) if !diagnostics.has_errors() => {
                report.executed = phase(sink, "phase=Execute; running the BIDS App", || {
                    self.execute(job, command, &mut diagnostics)
                });
            }
            _ => info!("Command was NOT run because of previous errors."),
        }
        report.command = command;

        report.archives = phase(sink, "phase=Archive; saving results", || {
            archive_results(workspace, options, &run_label, &mut diagnostics)
        });

        if options.dry_run {
            diagnostics.warn("gear-dry-run is set: the BIDS App was not run");
        }
        log_summary(&diagnostics);

        report.return_code = i32::from(diagnostics.has_errors());
        report.errors = diagnostics.errors;
        report.warnings = diagnostics.warnings;
        report
    }

    fn restore_inputs(&self, job: &GearJob, diagnostics: &mut Diagnostics) {
        let inputs = &job.config.inputs;
        let workspace = &job.workspace;
        if let Some(archive) = &inputs.previous_results {
            info!("Unzipping previous results {archive}");
            if let Err(err) = restore_previous_results(archive, workspace) {
                error!("{err}");
                diagnostics.error(format!("previous-results: {err}"));
            }
        }
        if let Some(archive) = &inputs.work_dir_archive {
            info!("Unzipping work directory {archive}");
            let restored = fs_util::validate_zip(archive.as_std_path())
                .and_then(|()| fs_util::extract_zip(archive.as_std_path(), workspace.root().as_std_path()));
            if let Err(err) = restored {
                error!("{err}");
                diagnostics.error(format!("work-dir: {err}"));
            }
        }
    }

    fn prepare_bids(
        &self,
        job: &GearJob,
        hierarchy: &Hierarchy,
        diagnostics: &mut Diagnostics,
    ) -> BidsOutcome {
        let options = &job.config.options;
        let download = DownloadOptions {
            folders: options.bids_folders.clone(),
            source_data: options.download_source_data,
            dry_run: options.dry_run,
            validate: options.run_bids_validation,
            tree: true,
            tree_title: Some(format!(
                "{} BIDS for {} {}",
                job.workspace.gear_name(),
                hierarchy.run_level,
                hierarchy.run_label
            )),
            bidsignore: job.config.inputs.bidsignore.clone(),
        };
        let outcome = bids::download_bids_for_runlevel(
            &self.downloader,
            &self.validator,
            &job.workspace,
            hierarchy,
            &download,
        );

        let status = outcome.status;
        if status == BidsStatus::Ok {
            return outcome;
        }
        let message = match (&outcome.report, status) {
            (Some(found), BidsStatus::ValidationErrors) => {
                format!("{} BIDS validation error(s) were detected", found.errors.len())
            }
            _ => format!(
                "Error in BIDS download or validation (code {})",
                status.code()
            ),
        };
        if status.is_validation_finding() && !options.abort_on_bids_error {
            diagnostics.warn(message);
        } else {
            diagnostics.error(message);
        }
        outcome
    }

    fn execute(&self, job: &GearJob, command: &BidsAppCommand, diagnostics: &mut Diagnostics) -> bool {
        let options = &job.config.options;
        let result = if options.dry_run {
            DryRunExecutor::new(job.workspace.clone()).run(command, &job.environment)
        } else {
            self.executor.run(command, &job.environment)
        };

        let started = match result {
            Ok(output) if output.success() => {
                info!("Command successfully executed!");
                true
            }
            Ok(output) => {
                error!("Unable to execute command.");
                diagnostics.error(format!(
                    "{} failed with return code {}",
                    command.program, output.return_code
                ));
                true
            }
            Err(err) => {
                error!("Unable to execute command.\n{err}");
                diagnostics.error(err.to_string());
                false
            }
        };

        if let Err(err) = executor::write_resource_metadata(&job.workspace) {
            warn!("Unable to save resource usage: {err}");
            diagnostics.warn(err.to_string());
        }
        started
    }
}

fn phase<T>(sink: &dyn ProgressSink, message: &str, step: impl FnOnce() -> T) -> T {
    sink.event(ProgressEvent {
        message: message.to_string(),
        elapsed: None,
    });
    let start = Instant::now();
    let value = step();
    sink.event(ProgressEvent {
        message: message.to_string(),
        elapsed: Some(start.elapsed()),
    });
    value
}

fn archive_results(
    workspace: &Workspace,
    options: &GearOptions,
    run_label: &str,
    diagnostics: &mut Diagnostics,
) -> Vec<String> {
    let mut written = Vec::new();
    let mut record = |result: Result<Vec<Utf8PathBuf>, GearError>, what: &str| match result {
        Ok(paths) => written.extend(paths.into_iter().map(|path| path.to_string())),
        Err(err) => {
            warn!("Unable to archive {what}: {err}");
            diagnostics.warn(format!("{what}: {err}"));
        }
    };

    record(archive::zip_htmls(workspace), "html reports");
    record(
        archive::zip_output(workspace, run_label).map(|path| vec![path]),
        "results",
    );
    if options.save_intermediate_output {
        record(
            archive::zip_all_intermediate(workspace, run_label).map(|path| vec![path]),
            "work directory",
        );
    }
    record(
        archive::zip_intermediate_selected(
            workspace,
            run_label,
            &options.intermediate_files,
            &options.intermediate_folders,
        )
        .map(|found| {
            found
                .map(|_| vec![workspace.work_selected_archive(run_label)])
                .unwrap_or_default()
        }),
        "selected intermediate files",
    );
    written
}

pub fn restore_previous_results(archive: &Utf8Path, workspace: &Workspace) -> Result<usize, GearError> {
    let output_dir = workspace.output_dir();
    let target = workspace.analysis_output_dir();
    fs::create_dir_all(target.as_std_path()).map_err(|err| GearError::Filesystem(err.to_string()))?;
    let temp = tempfile::Builder::new()
        .prefix(".previous-results")
        .tempdir_in(output_dir.as_std_path())
        .map_err(|err| GearError::Filesystem(err.to_string()))?;
    fs_util::validate_zip(archive.as_std_path())?;
    fs_util::extract_zip(archive.as_std_path(), temp.path())?;

    let top: Vec<_> = fs::read_dir(temp.path())
        .map_err(|err| GearError::Filesystem(err.to_string()))?
        .collect::<Result<_, _>>()
        .map_err(|err| GearError::Filesystem(err.to_string()))?;
    let source = match top.as_slice() {
        [single] if single.path().is_dir() => single.path(),
        _ => temp.path().to_path_buf(),
    };

    let mut moved = 0;
    for entry in fs::read_dir(&source).map_err(|err| GearError::Filesystem(err.to_string()))? {
        let entry = entry.map_err(|err| GearError::Filesystem(err.to_string()))?;
        let dest = target.as_std_path().join(entry.file_name());
        if dest.exists() {
            warn!("{} already exists, keeping it", dest.display());
            continue;
        }
        fs::rename(entry.path(), &dest).map_err(|err| GearError::Filesystem(err.to_string()))?;
        moved += 1;
    }
    Ok(moved)
}

fn log_summary(diagnostics: &Diagnostics) {
    if diagnostics.warnings.is_empty() && diagnostics.errors.is_empty() {
        info!("Gear finished without warnings or errors.");
        return;
    }
    if !diagnostics.warnings.is_empty() {
        warn!("Previous warnings:");
        for message in &diagnostics.warnings {
            warn!("Warning: {message}");
        }
    }
    if !diagnostics.errors.is_empty() {
        error!("Previous errors:");
        for message in &diagnostics.errors {
            error!("Error: {message}");
        }
    }
}
