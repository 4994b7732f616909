use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;

use crate::domain::{ContainerType, RunLevel};
use crate::error::GearError;
use crate::fs_util;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    pub id: Option<String>,
    pub container_type: ContainerType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Parents {
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub acquisition: Option<String>,
}

impl Parents {
    pub fn get(&self, level: RunLevel) -> Option<&str> {
        match level {
            RunLevel::Project => self.project.as_deref(),
            RunLevel::Subject => self.subject.as_deref(),
            RunLevel::Session => self.session.as_deref(),
            RunLevel::Acquisition => self.acquisition.as_deref(),
            RunLevel::NoDestination => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub container_type: ContainerType,
    pub label: Option<String>,
    pub parent: Option<ParentRef>,
    pub parents: Parents,
}

pub trait ContainerLookup: Send + Sync {
    fn get(&self, id: &str) -> Result<Container, GearError>;
}

/// A missing client answers every lookup with an error.
impl<L: ContainerLookup> ContainerLookup for Option<L> {
    fn get(&self, id: &str) -> Result<Container, GearError> {
        match self {
            Some(lookup) => lookup.get(id),
            None => Err(GearError::ApiHttp(format!(
                "no platform client to look up {id}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub bids_dir: Utf8PathBuf,
    pub run_level: RunLevel,
    pub destination_id: String,
    pub project_label: Option<String>,
    pub subjects: Vec<String>,
    pub sessions: Vec<String>,
    pub acquisition_label: Option<String>,
    pub folders: Vec<String>,
    pub source_data: bool,
    pub dry_run: bool,
}

pub trait BidsDownloader: Send + Sync {
    fn download(&self, request: &DownloadRequest) -> Result<Utf8PathBuf, GearError>;
}

#[derive(Clone)]
pub struct FlywheelClient {
    client: Client,
    base_url: String,
}

impl FlywheelClient {
    /// Builds a client from a platform API key of the form
    /// `host[:port]:secret`.
    pub fn new(api_key: &str) -> Result<Self, GearError> {
        let base_url = api_base_url(api_key)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("bids-gear/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| GearError::ApiHttp(err.to_string()))?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("scitran-user {}", api_key.trim()))
                .map_err(|err| GearError::ApiHttp(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| GearError::ApiHttp(err.to_string()))?;

        Ok(Self { client, base_url })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<reqwest::blocking::Response, GearError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(GearError::ApiHttp(err.to_string()));
                }
            }
        }
    }
}

impl ContainerLookup for FlywheelClient {
    fn get(&self, id: &str) -> Result<Container, GearError> {
        let url = format!("{}/containers/{id}", self.base_url);
        let response = self.send_with_retries(|| self.client.get(&url))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "container lookup failed".to_string());
            return Err(GearError::ApiStatus { status, message });
        }
        let record: ContainerRecord = response
            .json()
            .map_err(|err| GearError::ApiHttp(err.to_string()))?;
        record.into_container()
    }
}

#[derive(Debug, Deserialize)]
struct ContainerRecord {
    #[serde(rename = "_id", alias = "id")]
    id: String,
    #[serde(alias = "type")]
    container_type: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    parent: Option<ParentRecord>,
    #[serde(default)]
    parents: Parents,
}

#[derive(Debug, Deserialize)]
struct ParentRecord {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    container_type: String,
}

impl ContainerRecord {
    fn into_container(self) -> Result<Container, GearError> {
        let parent = self
            .parent
            .map(|parent| -> Result<ParentRef, GearError> {
                Ok(ParentRef {
                    id: parent.id,
                    container_type: parent.container_type.parse()?,
                })
            })
            .transpose()?;
        Ok(Container {
            id: self.id,
            container_type: self.container_type.parse()?,
            label: self.label,
            parent,
            parents: self.parents,
        })
    }
}

pub fn api_base_url(api_key: &str) -> Result<String, GearError> {
    let trimmed = api_key.trim();
    let (host, secret) = trimmed
        .rsplit_once(':')
        .ok_or_else(|| GearError::ApiHttp("malformed API key".to_string()))?;
    if host.is_empty() || secret.is_empty() {
        return Err(GearError::ApiHttp("malformed API key".to_string()));
    }
    Ok(format!("https://{host}/api"))
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Clone)]
pub struct FwCliDownloader {
    fw: Option<PathBuf>,
}

impl FwCliDownloader {
    pub fn new() -> Self {
        Self {
            fw: fs_util::find_in_path("fw"),
        }
    }

    pub fn export_args(request: &DownloadRequest) -> Result<Vec<String>, GearError> {
        let project = request.project_label.as_deref().ok_or_else(|| {
            GearError::BidsExport("cannot export BIDS without a project label".to_string())
        })?;
        let mut args = vec![
            "export".to_string(),
            "bids".to_string(),
            "--project".to_string(),
            project.to_string(),
        ];
        for subject in &request.subjects {
            args.push("--subject".to_string());
            args.push(subject.clone());
        }
        for session in &request.sessions {
            args.push("--session".to_string());
            args.push(session.clone());
        }
        if let Some(acquisition) = &request.acquisition_label {
            args.push("--acquisition".to_string());
            args.push(acquisition.clone());
        }
        for folder in &request.folders {
            args.push("--data-type".to_string());
            args.push(folder.clone());
        }
        if request.source_data {
            args.push("--source-data".to_string());
        }
        args.push(request.bids_dir.to_string());
        Ok(args)
    }
}

impl Default for FwCliDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl BidsDownloader for FwCliDownloader {
    fn download(&self, request: &DownloadRequest) -> Result<Utf8PathBuf, GearError> {
        let args = Self::export_args(request)?;
        if request.dry_run {
            tracing::info!("Dry run: would run fw {}", args.join(" "));
            fs::create_dir_all(request.bids_dir.as_std_path())
                .map_err(|err| GearError::Filesystem(err.to_string()))?;
            return Ok(request.bids_dir.clone());
        }
        let fw = self
            .fw
            .as_ref()
            .ok_or_else(|| GearError::MissingTool("fw".to_string()))?;
        tracing::info!("Running fw {}", args.join(" "));
        let output = Command::new(fw)
            .args(&args)
            .output()
            .map_err(|err| GearError::BidsExport(err.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("fw export bids exited with {}", output.status)
            } else {
                stderr
            };
            return Err(GearError::BidsExport(message));
        }
        Ok(request.bids_dir.clone())
    }
}
