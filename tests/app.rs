mod common;

use std::collections::BTreeMap;
use std::fs;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use serde_json::{Value, json};

use bids_gear::app::{
    App, DEFAULT_ANALYSIS_LEVEL, GearJob, ProgressEvent, ProgressSink, restore_previous_results,
};
use bids_gear::archive::zip_all;
use bids_gear::bids::BidsStatus;
use bids_gear::command::BidsAppCommand;
use bids_gear::config::{ConfigLoader, RawGearConfig};
use bids_gear::domain::{ContainerType, RunLevel};
use bids_gear::error::GearError;
use bids_gear::executor::{ExecutionOutput, PipelineExecutor};
use bids_gear::workspace::Workspace;

use common::{
    DownloadBehavior, FakeDownloader, FakeHost, FakePlatform, FakeValidator, capture_logs,
    temp_workspace, write_file,
};

struct MockExecutor {
    return_code: i32,
    calls: Mutex<Vec<(BidsAppCommand, BTreeMap<String, String>)>>,
    time_report: Option<Utf8PathBuf>,
}

impl MockExecutor {
    fn returning(return_code: i32) -> Self {
        Self {
            return_code,
            calls: Mutex::new(Vec::new()),
            time_report: None,
        }
    }

    fn calls(&self) -> Vec<(BidsAppCommand, BTreeMap<String, String>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl PipelineExecutor for MockExecutor {
    fn run(
        &self,
        command: &BidsAppCommand,
        env: &BTreeMap<String, String>,
    ) -> Result<ExecutionOutput, GearError> {
        self.calls.lock().unwrap().push((command.clone(), env.clone()));
        let results = Utf8PathBuf::from(command.args[1].clone());
        write_file(&results.join("sub-01/anat/sub-01_desc-preproc_T1w.nii.gz"), "t1");
        if let Some(report) = &self.time_report {
            write_file(
                report,
                "\tCommand being timed: \"fmriprep\"\n\tMaximum resident set size (kbytes): 2048\n",
            );
        }
        Ok(ExecutionOutput {
            return_code: self.return_code,
            ..ExecutionOutput::default()
        })
    }
}

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        if event.elapsed.is_some() {
            self.messages.lock().unwrap().push(event.message);
        }
    }
}

fn job(workspace: &Workspace, config: Value) -> GearJob {
    let raw: RawGearConfig = serde_json::from_value(json!({
        "config": config,
        "inputs": {},
        "destination": { "id": "01234", "type": "analysis" }
    }))
    .unwrap();
    GearJob {
        config: ConfigLoader::resolve_config(raw).unwrap(),
        workspace: workspace.clone(),
        bids_app: Some("fmriprep".to_string()),
        analysis_level: DEFAULT_ANALYSIS_LEVEL.to_string(),
        environment: BTreeMap::from([("PATH".to_string(), "/usr/bin".to_string())]),
    }
}

fn app(
    platform: FakePlatform,
    validator: FakeValidator,
    executor: MockExecutor,
) -> App<FakePlatform, FakeDownloader, FakeValidator, MockExecutor, FakeHost> {
    App::new(
        platform,
        FakeDownloader::new(DownloadBehavior::Dataset),
        validator,
        executor,
        FakeHost::new(8, 16),
    )
}

#[test]
fn dry_run_goes_through_every_phase() {
    let (_temp, workspace) = temp_workspace("01234");
    let job = job(
        &workspace,
        json!({
            "gear-dry-run": true,
            "gear-intermediate-folders": "reportlets",
            "n_cpus": 0,
            "verbose": "vv"
        }),
    );
    let executor = MockExecutor::returning(0);
    let app = App::new(
        FakePlatform::new("subject"),
        FakeDownloader::new(DownloadBehavior::Dataset),
        FakeValidator::clean(),
        &executor,
        FakeHost::new(8, 16),
    );
    let sink = RecordingSink::default();

    let (report, logs) = capture_logs(|| app.run(&job, &sink));

    assert_eq!(report.return_code, 0, "errors: {:?}", report.errors);
    assert!(report.executed);
    assert_eq!(report.hierarchy.run_level, RunLevel::Subject);
    assert_eq!(report.bids_code, Some(0));
    assert!(executor.calls().is_empty());

    let command = report.command.unwrap();
    assert_eq!(command.program, "fmriprep");
    assert_eq!(command.args[0], workspace.bids_dir().as_str());
    assert_eq!(command.args[1], workspace.analysis_output_dir().as_str());
    assert_eq!(command.args[2], "participant");
    assert!(command.args.contains(&"--n_cpus=8".to_string()));
    assert!(command.args.contains(&"-vv".to_string()));
    assert!(command.args.iter().any(|arg| arg.starts_with("--mem_mb=")));

    let output = workspace.output_dir();
    for name in [
        "sub-TOME3024_01234.html.zip",
        "bids-fmriprep_TheSubjectCode_01234.zip",
        "bids-fmriprep_work_selected_TheSubjectCode_01234.zip",
    ] {
        assert!(report.archives.iter().any(|path| path.ends_with(name)), "{name} missing");
        assert!(output.join(name).as_std_path().is_file());
    }
    assert!(!output.join("bids-fmriprep_work_TheSubjectCode_01234.zip").as_std_path().exists());

    assert_eq!(report.warnings, vec!["gear-dry-run is set: the BIDS App was not run"]);
    let warnings = logs.lines_at("WARN");
    assert!(warnings.iter().any(|line| line.contains("Warning: gear-dry-run is set")));

    let phases = sink.messages.lock().unwrap().clone();
    assert_eq!(phases.len(), 5);
    assert!(phases[0].starts_with("phase=Restore"));
    assert!(phases[4].starts_with("phase=Archive"));
}

#[test]
fn real_run_uses_the_executor_and_records_resources() {
    let (_temp, workspace) = temp_workspace("01234");
    let job = job(&workspace, json!({ "gear-save-intermediate-output": true }));
    let executor = MockExecutor {
        time_report: Some(workspace.time_report_path()),
        ..MockExecutor::returning(0)
    };
    let app = App::new(
        FakePlatform::new("session"),
        FakeDownloader::new(DownloadBehavior::Dataset),
        FakeValidator::clean(),
        &executor,
        FakeHost::new(4, 8),
    );

    let report = app.run(&job, &RecordingSink::default());

    assert_eq!(report.return_code, 0, "errors: {:?}", report.errors);
    assert!(report.warnings.is_empty());
    let calls = executor.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, job.environment);
    assert_eq!(report.hierarchy.run_label, "TheSessionLabel");

    let metadata: Value = serde_json::from_str(
        &fs::read_to_string(workspace.metadata_path().as_std_path()).unwrap(),
    )
    .unwrap();
    let resources = &metadata["analysis"]["info"]["resources used"];
    assert_eq!(resources["Maximum resident set size (kbytes)"], "2048");
    assert!(resources["recorded"].is_string());

    let output = workspace.output_dir();
    assert!(output.join("bids-fmriprep_TheSessionLabel_01234.zip").as_std_path().is_file());
    assert!(output.join("bids-fmriprep_work_TheSessionLabel_01234.zip").as_std_path().is_file());
}

#[test]
fn failed_bids_app_still_archives_results() {
    let (_temp, workspace) = temp_workspace("01234");
    let job = job(&workspace, json!({}));
    let app = app(FakePlatform::new("subject"), FakeValidator::clean(), MockExecutor::returning(2));

    let (report, logs) = capture_logs(|| app.run(&job, &RecordingSink::default()));

    assert_eq!(report.return_code, 1);
    assert!(report.executed);
    assert_eq!(report.errors, vec!["fmriprep failed with return code 2"]);
    assert!(logs.contents().contains("Unable to execute command."));
    assert!(logs.lines_at("ERROR").iter().any(|line| line.contains("Error: fmriprep failed")));
    assert!(
        workspace
            .output_archive("TheSubjectCode")
            .as_std_path()
            .is_file()
    );
}

#[test]
fn validation_errors_are_warnings_by_default() {
    let (_temp, workspace) = temp_workspace("01234");
    let job = job(&workspace, json!({}));
    let app = app(FakePlatform::new("subject"), FakeValidator::with_errors(1), MockExecutor::returning(0));

    let report = app.run(&job, &RecordingSink::default());

    assert_eq!(report.return_code, 0);
    assert_eq!(report.bids_status, Some(BidsStatus::ValidationErrors));
    assert_eq!(report.bids_code, Some(10));
    assert_eq!(report.warnings, vec!["1 BIDS validation error(s) were detected"]);
    assert!(report.executed);
}

#[test]
fn validation_errors_stop_the_run_when_asked() {
    let (_temp, workspace) = temp_workspace("01234");
    let job = job(&workspace, json!({ "gear-abort-on-bids-error": true }));
    let executor = MockExecutor::returning(0);
    let app = App::new(
        FakePlatform::new("subject"),
        FakeDownloader::new(DownloadBehavior::Dataset),
        FakeValidator::with_errors(3),
        &executor,
        FakeHost::new(8, 16),
    );

    let (report, logs) = capture_logs(|| app.run(&job, &RecordingSink::default()));

    assert_eq!(report.return_code, 1);
    assert!(!report.executed);
    assert!(executor.calls().is_empty());
    assert_eq!(report.errors, vec!["3 BIDS validation error(s) were detected"]);
    assert!(logs.contents().contains("Command was NOT run because of previous errors."));
}

#[test]
fn destination_that_is_not_an_analysis_stops_the_run() {
    let (_temp, workspace) = temp_workspace("01234");
    let job = job(&workspace, json!({}));
    let mut platform = FakePlatform::new("subject");
    platform.destination_mut().container_type = ContainerType::Session;
    let executor = MockExecutor::returning(0);
    let app = App::new(
        platform,
        FakeDownloader::new(DownloadBehavior::Dataset),
        FakeValidator::clean(),
        &executor,
        FakeHost::new(8, 16),
    );

    let (report, logs) = capture_logs(|| app.run(&job, &RecordingSink::default()));

    assert_eq!(report.hierarchy.run_level, RunLevel::NoDestination);
    assert_eq!(report.bids_code, Some(24));
    assert_eq!(report.return_code, 1);
    assert!(executor.calls().is_empty());
    assert!(logs.contents().contains("must reference an analysis container"));
    assert!(workspace.output_archive("unknown").as_std_path().is_file());
}

#[test]
fn previous_results_are_restored_under_the_destination() {
    let (_temp, workspace) = temp_workspace("01234");
    let old = workspace.root().join("old/56789");
    write_file(&old.join("sub-01/figures/brain.svg"), "<svg/>");
    write_file(&old.join("sub-01.html"), "<html/>");
    let archive = workspace.input_dir().join("previous-results/results.zip");
    zip_all(&old, &archive).unwrap();

    let moved = restore_previous_results(&archive, &workspace).unwrap();

    assert_eq!(moved, 2);
    let results = workspace.analysis_output_dir();
    assert!(results.join("sub-01/figures/brain.svg").as_std_path().is_file());
    assert!(results.join("sub-01.html").as_std_path().is_file());
}

#[test]
fn broken_previous_results_are_an_error() {
    let (_temp, workspace) = temp_workspace("01234");
    let archive = workspace.input_dir().join("previous-results/results.zip");
    write_file(&archive, "not a zip");
    let mut job = job(&workspace, json!({ "gear-dry-run": true }));
    job.config.inputs.previous_results = Some(archive);
    let app = app(FakePlatform::new("subject"), FakeValidator::clean(), MockExecutor::returning(0));

    let report = app.run(&job, &RecordingSink::default());

    assert_eq!(report.return_code, 1);
    assert!(report.errors[0].starts_with("previous-results:"));
    assert!(!report.executed);
}

#[test]
fn mistyped_gear_option_skips_the_app_but_still_archives() {
    let (_temp, workspace) = temp_workspace("01234");
    let job = job(&workspace, json!({ "gear-dry-run": "yes" }));
    let executor = MockExecutor::returning(0);
    let app = App::new(
        FakePlatform::new("subject"),
        FakeDownloader::new(DownloadBehavior::Dataset),
        FakeValidator::clean(),
        &executor,
        FakeHost::new(8, 16),
    );

    let (report, logs) = capture_logs(|| app.run(&job, &RecordingSink::default()));

    assert_eq!(report.return_code, 1);
    assert!(!report.executed);
    assert!(executor.calls().is_empty());
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("gear-dry-run"));
    assert!(workspace.output_archive("TheSubjectCode").as_std_path().is_file());
    assert!(
        logs.lines_at("ERROR")
            .iter()
            .any(|line| line.contains("Error: invalid gear option gear-dry-run"))
    );
}

#[test]
fn missing_bids_app_is_collected() {
    let (_temp, workspace) = temp_workspace("01234");
    let mut job = job(&workspace, json!({}));
    job.bids_app = None;
    let app = app(FakePlatform::new("subject"), FakeValidator::clean(), MockExecutor::returning(0));

    let report = app.run(&job, &RecordingSink::default());

    assert_eq!(report.return_code, 1);
    assert!(report.command.is_none());
    assert!(!report.executed);
    assert!(report.errors[0].starts_with("No BIDS App given"));
    assert!(workspace.output_archive("TheSubjectCode").as_std_path().is_file());
}

#[test]
fn missing_platform_client_still_archives() {
    let (_temp, workspace) = temp_workspace("01234");
    let mut job = job(&workspace, json!({}));
    job.config
        .diagnostics
        .error("The gear needs an api-key input to reach the platform");
    let executor = MockExecutor::returning(0);
    let app = App::new(
        None::<FakePlatform>,
        FakeDownloader::new(DownloadBehavior::Dataset),
        FakeValidator::clean(),
        &executor,
        FakeHost::new(8, 16),
    );

    let report = app.run(&job, &RecordingSink::default());

    assert_eq!(report.return_code, 1);
    assert_eq!(report.hierarchy.run_level, RunLevel::NoDestination);
    assert!(executor.calls().is_empty());
    assert_eq!(report.errors[0], "The gear needs an api-key input to reach the platform");
    assert!(workspace.output_archive("unknown").as_std_path().is_file());
}
