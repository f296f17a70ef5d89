//! Fetching the paks a server references
//!
//! After each gamestate the paks listed in `sv_paks` that we don't have are
//! queued and requested one at a time. A file either streams in-band as
//! numbered blocks, each acknowledged with `nextdl`, or the server redirects
//! us to an HTTP mirror. Once the queue drains we send `donedl` and the
//! server answers with a fresh gamestate.

use crate::state::{ClientError, ClientState, ConnState};
use log::{debug, info, warn};
use shared::message::DownloadMessage;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Download Error: {0}")]
    Server(String),

    #[error("invalid pak name {0}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP downloads are not available")]
    HttpUnavailable,

    #[error("HTTP download failed: {0}")]
    Http(String),
}

fn safe_pak_name(name: &str) -> Result<&str, DownloadError> {
    if name.is_empty() || name.contains("..") || name.contains(|c: char| matches!(c, '/' | '\\' | ':')) {
        return Err(DownloadError::InvalidName(name.to_string()));
    }
    Ok(name)
}

/// Where paks live once downloaded
pub trait PakStore: Send {
    fn has(&self, name: &str) -> bool;
    fn save(&mut self, name: &str, data: &[u8]) -> Result<(), DownloadError>;
}

/// Paks kept as files in one directory
#[derive(Debug, Clone)]
pub struct DirectoryPakStore {
    root: PathBuf,
}

impl DirectoryPakStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PakStore for DirectoryPakStore {
    fn has(&self, name: &str) -> bool {
        safe_pak_name(name).map_or(false, |name| self.root.join(name).is_file())
    }

    fn save(&mut self, name: &str, data: &[u8]) -> Result<(), DownloadError> {
        let name = safe_pak_name(name)?;
        fs::create_dir_all(&self.root)?;

        // a partial file must never look like a finished pak
        let temp = self.root.join(format!("{}.tmp", name));
        let mut file = fs::File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp, self.root.join(name))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryPakStore {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryPakStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, data: Vec<u8>) {
        self.files.insert(name.to_string(), data);
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(Vec::as_slice)
    }
}

impl PakStore for MemoryPakStore {
    fn has(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    fn save(&mut self, name: &str, data: &[u8]) -> Result<(), DownloadError> {
        self.insert(safe_pak_name(name)?, data.to_vec());
        Ok(())
    }
}

/// Progress of an HTTP transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpProgress {
    InProgress,
    Done(Vec<u8>),
    Failed(String),
    ChecksumMismatch,
}

/// Fetches redirected downloads; polled once a frame
pub trait HttpDownloader: Send {
    fn begin(&mut self, url: &str, size: i32) -> Result<(), DownloadError>;
    fn poll(&mut self) -> HttpProgress;
}

/// Used when no HTTP client is linked; every redirect falls back to the server
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHttp;

impl HttpDownloader for NoHttp {
    fn begin(&mut self, _url: &str, _size: i32) -> Result<(), DownloadError> {
        Err(DownloadError::HttpUnavailable)
    }

    fn poll(&mut self) -> HttpProgress {
        HttpProgress::Failed("no transfer".to_string())
    }
}

#[derive(Debug, Default)]
pub struct DownloadState {
    queue: VecDeque<String>,
    /// File being transferred; empty when idle
    pub name: String,
    /// Next block we expect
    block: i32,
    size: i32,
    count: i32,
    data: Vec<u8>,
    /// The transfer was redirected to HTTP
    www: bool,
    pub url: String,
}

impl DownloadState {
    pub fn is_active(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn is_www(&self) -> bool {
        self.www
    }

    /// Bytes received of the current file and its announced size
    pub fn progress(&self) -> (i32, i32) {
        (self.count, self.size)
    }

    /// Share of the current file received, 0 until the size is known
    pub fn fraction(&self) -> f32 {
        if self.size <= 0 {
            return 0.0;
        }
        (self.count as f32 / self.size as f32).min(1.0)
    }

    fn start(&mut self, name: String) {
        self.name = name;
        self.block = 0;
        self.size = 0;
        self.count = 0;
        self.data.clear();
        self.www = false;
        self.url.clear();
    }

    fn finish(&mut self) {
        self.name.clear();
        self.www = false;
        self.url.clear();
        self.data.clear();
    }

    /// Drops the current file and everything queued after it
    fn abort(&mut self) {
        self.finish();
        self.queue.clear();
    }
}

impl ClientState {
    pub fn set_pak_store(&mut self, store: Box<dyn PakStore>) {
        self.paks = store;
    }

    pub fn set_http_downloader(&mut self, http: Box<dyn HttpDownloader>) {
        self.http = http;
    }

    /// Queues the paks the server lists that we lack and starts on the first
    pub(crate) fn init_downloads(&mut self) -> Result<(), ClientError> {
        self.download.abort();
        let missing: Vec<String> = self
            .server_paks
            .iter()
            .filter(|name| !self.paks.has(name))
            .cloned()
            .collect();

        if !missing.is_empty() {
            if !self.config.allow_download {
                return Err(ClientError::Drop(format!(
                    "You are missing some files referenced by the server:\n{}\nAutodownload is disabled",
                    missing.join(" ")
                )));
            }
            info!("Need paks: {}", missing.join(" "));
            self.download.queue.extend(missing);
            self.state = ConnState::Downloading;
        }

        self.next_download();
        Ok(())
    }

    fn next_download(&mut self) {
        match self.download.queue.pop_front() {
            Some(name) => {
                info!("Downloading {}", name);
                self.add_reliable_command(&format!("download {}", name));
                self.download.start(name);
            }
            None => self.downloads_complete(),
        }
    }

    fn save_download(&mut self, data: &[u8]) -> Result<(), ClientError> {
        let name = self.download.name.clone();
        self.paks.save(&name, data)?;
        info!("{} downloaded ({} bytes)", name, data.len());
        self.downloaded_any = true;
        Ok(())
    }

    pub(crate) fn parse_download(&mut self, message: DownloadMessage) -> Result<(), ClientError> {
        match message {
            DownloadMessage::Block {
                block,
                total_size,
                data,
            } => self.download_block(i32::from(block), total_size, data),
            DownloadMessage::Redirect { url, size, .. } => {
                self.download_redirect(url, size);
                Ok(())
            }
        }
    }

    fn download_block(&mut self, block: i32, total_size: Option<i32>, data: Vec<u8>) -> Result<(), ClientError> {
        if !self.download.is_active() {
            // leftovers from a download we gave up on
            self.add_reliable_command("stopdl");
            return Ok(());
        }

        if block == 0 {
            if let Some(size) = total_size {
                if size < 0 {
                    let message = String::from_utf8_lossy(&data).trim_end().to_string();
                    return Err(DownloadError::Server(message).into());
                }
                self.download.size = size;
            }
        }

        if block != self.download.block {
            debug!("parse_download: expected block {}, got {}", self.download.block, block);
            return Ok(());
        }

        self.download.count += data.len() as i32;
        self.download.data.extend_from_slice(&data);
        self.add_reliable_command(&format!("nextdl {}", block));
        self.download.block += 1;

        if data.is_empty() {
            let file = std::mem::take(&mut self.download.data);
            self.save_download(&file)?;
            self.download.finish();
            self.next_download();
        }
        Ok(())
    }

    fn download_redirect(&mut self, url: String, size: i32) {
        if !self.download.is_active() {
            debug!("ignoring redirect to {} with no download pending", url);
            return;
        }
        if self.download.www {
            // the server repeats the redirect until our ack reaches it
            return;
        }
        info!("Downloading {} from {}", self.download.name, url);
        self.download.www = true;
        self.download.size = size;
        self.download.url = url.clone();
        self.add_reliable_command("wwwdl ack");

        if let Err(e) = self.http.begin(&url, size) {
            warn!("HTTP download of {} failed to start: {}", self.download.name, e);
            self.add_reliable_command("wwwdl fail");
            // the server resends the gamestate and we try again in-band
            self.download.abort();
        }
    }

    /// Advances an HTTP transfer; called every frame
    pub(crate) fn poll_http_download(&mut self) -> Result<(), ClientError> {
        if !self.download.is_active() || !self.download.www {
            return Ok(());
        }
        match self.http.poll() {
            HttpProgress::InProgress => Ok(()),
            HttpProgress::Done(data) => {
                self.download.count = data.len() as i32;
                self.save_download(&data)?;
                self.add_reliable_command("wwwdl done");
                self.download.finish();
                self.next_download();
                Ok(())
            }
            HttpProgress::Failed(reason) => {
                warn!("HTTP download of {} failed: {}", self.download.name, reason);
                self.add_reliable_command("wwwdl fail");
                self.download.abort();
                Ok(())
            }
            HttpProgress::ChecksumMismatch => {
                warn!("HTTP download of {} had a bad checksum", self.download.name);
                self.add_reliable_command("wwwdl chkfail");
                self.download.abort();
                Ok(())
            }
        }
    }
}
