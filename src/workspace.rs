use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::DestinationId;
use crate::error::GearError;

#[derive(Debug, Clone)]
pub struct Workspace {
    root: Utf8PathBuf,
    gear_name: String,
    destination_id: DestinationId,
}

impl Workspace {
    pub fn new(root: Utf8PathBuf, gear_name: impl Into<String>, destination_id: DestinationId) -> Self {
        Self {
            root,
            gear_name: gear_name.into(),
            destination_id,
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn gear_name(&self) -> &str {
        &self.gear_name
    }

    pub fn destination_id(&self) -> &DestinationId {
        &self.destination_id
    }

    pub fn input_dir(&self) -> Utf8PathBuf {
        self.root.join("input")
    }

    pub fn work_dir(&self) -> Utf8PathBuf {
        self.root.join("work")
    }

    pub fn output_dir(&self) -> Utf8PathBuf {
        self.root.join("output")
    }

    pub fn bids_dir(&self) -> Utf8PathBuf {
        self.work_dir().join("bids")
    }

    pub fn analysis_output_dir(&self) -> Utf8PathBuf {
        self.output_dir().join(self.destination_id.as_str())
    }

    pub fn validator_output_path(&self) -> Utf8PathBuf {
        self.work_dir().join("validator.output.txt")
    }

    pub fn time_report_path(&self) -> Utf8PathBuf {
        self.work_dir().join("time_output.txt")
    }

    pub fn metadata_path(&self) -> Utf8PathBuf {
        self.output_dir().join(".metadata.json")
    }

    pub fn bids_tree_path(&self) -> Utf8PathBuf {
        self.output_dir().join("bids_tree.html")
    }

    pub fn output_archive(&self, run_label: &str) -> Utf8PathBuf {
        self.output_dir().join(format!(
            "{}_{run_label}_{}.zip",
            self.gear_name, self.destination_id
        ))
    }

    pub fn work_archive(&self, run_label: &str) -> Utf8PathBuf {
        self.output_dir().join(format!(
            "{}_work_{run_label}_{}.zip",
            self.gear_name, self.destination_id
        ))
    }

    pub fn work_selected_archive(&self, run_label: &str) -> Utf8PathBuf {
        self.output_dir().join(format!(
            "{}_work_selected_{run_label}_{}.zip",
            self.gear_name, self.destination_id
        ))
    }

    pub fn html_archive(&self, report_name: &str) -> Utf8PathBuf {
        let stem = report_name.strip_suffix(".html").unwrap_or(report_name);
        self.output_dir()
            .join(format!("{stem}_{}.html.zip", self.destination_id))
    }

    pub fn ensure_dirs(&self) -> Result<(), GearError> {
        for dir in [self.work_dir(), self.output_dir(), self.analysis_output_dir()] {
            fs::create_dir_all(dir.as_std_path())
                .map_err(|err| GearError::Filesystem(format!("create {dir}: {err}")))?;
        }
        Ok(())
    }
}
