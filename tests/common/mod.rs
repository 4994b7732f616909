#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

use bids_gear::bids::{BidsValidator, ValidatorReport};
use bids_gear::domain::{ContainerType, DestinationId};
use bids_gear::error::GearError;
use bids_gear::performance::HostResources;
use bids_gear::platform::{
    BidsDownloader, Container, ContainerLookup, DownloadRequest, ParentRef, Parents,
};
use bids_gear::workspace::Workspace;

/// Collects everything logged while a closure runs.
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_max_level(Level::DEBUG)
            .with_ansi(false)
            .with_target(false)
            .finish();
        tracing::subscriber::with_default(subscriber, f)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }

    /// Lines logged at `level`, e.g. `"INFO"` or `"WARN"`.
    pub fn lines_at(&self, level: &str) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| line.split_whitespace().nth(1) == Some(level))
            .map(str::to_string)
            .collect()
    }
}

pub struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureWriter(self.buffer.clone())
    }
}

/// Runs `f` and returns its value together with the captured log.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, LogCapture) {
    let capture = LogCapture::default();
    let value = capture.run(f);
    (value, capture)
}

/// In-memory platform: an analysis `01234` below the containers
/// `proj_id`, `subj_id`, `sess_id` and `acq_id`.
pub struct FakePlatform {
    pub containers: HashMap<String, Container>,
}

impl FakePlatform {
    pub fn new(parent_level: &str) -> Self {
        let mut containers = HashMap::new();
        let parent_type: ContainerType = parent_level.parse().unwrap();
        containers.insert(
            "01234".to_string(),
            Container {
                id: "01234".to_string(),
                container_type: ContainerType::Analysis,
                label: Some("bids-fmriprep 01/02/2025".to_string()),
                parent: Some(ParentRef {
                    id: Some(format!("{}_id", short(parent_level))),
                    container_type: parent_type,
                }),
                parents: Parents {
                    group: Some("monkeyshine".to_string()),
                    project: Some("proj_id".to_string()),
                    subject: Some("subj_id".to_string()),
                    session: Some("sess_id".to_string()),
                    acquisition: Some("acq_id".to_string()),
                },
            },
        );
        for (id, container_type, label) in [
            ("proj_id", ContainerType::Project, "TheProjectLabel"),
            ("subj_id", ContainerType::Subject, "TheSubjectCode"),
            ("sess_id", ContainerType::Session, "TheSessionLabel"),
            ("acq_id", ContainerType::Acquisition, "TheAcquisitionLabel"),
        ] {
            containers.insert(
                id.to_string(),
                Container {
                    id: id.to_string(),
                    container_type,
                    label: Some(label.to_string()),
                    parent: None,
                    parents: Parents::default(),
                },
            );
        }
        Self { containers }
    }

    pub fn destination_mut(&mut self) -> &mut Container {
        self.containers.get_mut("01234").unwrap()
    }
}

fn short(level: &str) -> &str {
    match level {
        "project" => "proj",
        "subject" => "subj",
        "session" => "sess",
        "acquisition" => "acq",
        other => other,
    }
}

impl ContainerLookup for FakePlatform {
    fn get(&self, id: &str) -> Result<Container, GearError> {
        self.containers
            .get(id)
            .cloned()
            .ok_or_else(|| GearError::ApiStatus {
                status: 404,
                message: format!("container {id} not found"),
            })
    }
}

/// A platform that refuses every request.
pub struct BrokenPlatform;

impl ContainerLookup for BrokenPlatform {
    fn get(&self, _id: &str) -> Result<Container, GearError> {
        Err(GearError::ApiStatus {
            status: 401,
            message: "foo fum".to_string(),
        })
    }
}

pub struct FakeHost {
    pub cpus: u64,
    pub memory_bytes: Option<u64>,
}

impl FakeHost {
    pub fn new(cpus: u64, memory_gib: u64) -> Self {
        Self {
            cpus,
            memory_bytes: Some(memory_gib * 1024 * 1024 * 1024),
        }
    }
}

impl HostResources for FakeHost {
    fn cpu_count(&self) -> Result<u64, GearError> {
        Ok(self.cpus)
    }

    fn available_memory_bytes(&self) -> Result<u64, GearError> {
        self.memory_bytes
            .ok_or_else(|| GearError::HostIntrospection("no /proc/meminfo".to_string()))
    }
}

/// A workspace rooted in a fresh temporary directory.
pub fn temp_workspace(destination_id: &str) -> (tempfile::TempDir, Workspace) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let id: DestinationId = destination_id.parse().unwrap();
    let workspace = Workspace::new(root, "bids-fmriprep", id);
    workspace.ensure_dirs().unwrap();
    (temp, workspace)
}

pub fn write_file(path: &Utf8Path, contents: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent.as_std_path()).unwrap();
    }
    std::fs::write(path.as_std_path(), contents).unwrap();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadBehavior {
    /// Writes a small dataset with one subject.
    Dataset,
    /// Succeeds without writing anything.
    Nothing,
    /// Fails like an unreachable platform.
    ApiFailure,
}

/// Records each request and acts according to its behavior.
pub struct FakeDownloader {
    pub behavior: DownloadBehavior,
    pub requests: Mutex<Vec<DownloadRequest>>,
}

impl FakeDownloader {
    pub fn new(behavior: DownloadBehavior) -> Self {
        Self {
            behavior,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<DownloadRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl BidsDownloader for FakeDownloader {
    fn download(&self, request: &DownloadRequest) -> Result<Utf8PathBuf, GearError> {
        self.requests.lock().unwrap().push(request.clone());
        match self.behavior {
            DownloadBehavior::Dataset => {
                write_file(
                    &request.bids_dir.join("sub-TheSubjectCode/anat/sub-TheSubjectCode_T1w.nii.gz"),
                    "t1",
                );
                Ok(request.bids_dir.clone())
            }
            DownloadBehavior::Nothing => Ok(request.bids_dir.clone()),
            DownloadBehavior::ApiFailure => Err(GearError::ApiStatus {
                status: 500,
                message: "export failed".to_string(),
            }),
        }
    }
}

/// Answers with canned `bids-validator --json` output.
pub struct FakeValidator {
    pub output: String,
    pub return_code: i32,
    pub calls: Mutex<usize>,
}

impl FakeValidator {
    pub fn clean() -> Self {
        Self::with_output(r#"{"issues": {"errors": [], "warnings": []}, "summary": {"subjects": ["TheSubjectCode"]}}"#, 0)
    }

    pub fn with_errors(count: usize) -> Self {
        let errors: Vec<String> = (0..count)
            .map(|n| format!(r#"{{"reason": "problem {n}", "files": [{{"file": {{"relativePath": "/anat/{n}.json"}}}}]}}"#))
            .collect();
        Self::with_output(
            &format!(r#"{{"issues": {{"errors": [{}], "warnings": []}}, "summary": {{}}}}"#, errors.join(",")),
            1,
        )
    }

    pub fn with_output(output: &str, return_code: i32) -> Self {
        Self {
            output: output.to_string(),
            return_code,
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl BidsValidator for FakeValidator {
    fn validate(&self, _bids_path: &Utf8Path) -> Result<ValidatorReport, GearError> {
        *self.calls.lock().unwrap() += 1;
        ValidatorReport::parse(&self.output, self.return_code)
    }
}
