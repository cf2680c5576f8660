//! In-process stand-in for a remote target.
//!
//! A [`FakeRemote`] treats a local directory as the target's root filesystem
//! and answers the command shapes built in [`super::command`]. Anything else
//! fails the way an unknown shell command would.

use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{RemoteError, RemoteExec, RemoteStream, TargetProvider};
use crate::guard::{DiskUsage, VolumeStats};
use crate::model::{LogSpec, Target};
use crate::transfer::tar_codec;

static LS_GREP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ls '([^']*)' \| grep -(P|Fx) '([^']*)'(?:$| 2>/dev/null \|\| )").unwrap()
});
static LS_LD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ls -ld '([^']*)' \| grep '\^l'$").unwrap());
static DU: Lazy<Regex> = Lazy::new(|| Regex::new(r"^du -sk '([^']*)' \|").unwrap());
static TEST_D: Lazy<Regex> = Lazy::new(|| Regex::new(r"^test -d '([^']*)'$").unwrap());
static TAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^tar cf - -C '([^']*)' '([^']*)'$").unwrap());
static CAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^cat '([^']*)'$").unwrap());

pub struct FakeRemote {
    target: Target,
    root: PathBuf,
    has_tar: bool,
    tar_override: Option<Vec<u8>>,
    issued: Mutex<Vec<String>>,
}

impl FakeRemote {
    pub fn new(root: &Path) -> Self {
        Self {
            target: Target::Pod {
                namespace: "default".into(),
                pod: "fake-0".into(),
                container: None,
            },
            root: root.to_path_buf(),
            has_tar: true,
            tar_override: None,
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Answer every tar stream with `bytes` instead of packing the tree.
    pub fn with_tar_stream(mut self, bytes: Vec<u8>) -> Self {
        self.tar_override = Some(bytes);
        self
    }

    /// Every command run or streamed so far.
    pub fn issued(&self) -> Vec<String> {
        self.issued.lock().map(|log| log.clone()).unwrap_or_default()
    }

    fn record(&self, command: &str) {
        if let Ok(mut log) = self.issued.lock() {
            log.push(command.to_string());
        }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn without_tar(mut self) -> Self {
        self.has_tar = false;
        self
    }

    fn local(&self, remote: &str) -> PathBuf {
        self.root.join(remote.trim_start_matches('/'))
    }

    fn failed(&self, command: &str, output: impl Into<String>) -> RemoteError {
        RemoteError::CommandFailed {
            target: self.target.to_string(),
            command: command.to_string(),
            status: "exit status 1".to_string(),
            output: output.into(),
        }
    }

    fn list(&self, command: &str, dir: &str, mode: &str, pattern: &str) -> Result<String, RemoteError> {
        let mut names: Vec<String> = fs::read_dir(self.local(dir))
            .map_err(|e| self.failed(command, format!("ls: {e}")))?
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        let matched: Vec<String> = if mode == "Fx" {
            names.into_iter().filter(|n| n == pattern).collect()
        } else {
            let re = Regex::new(&format!("{pattern}$"))
                .map_err(|e| self.failed(command, format!("grep: {e}")))?;
            names.into_iter().filter(|n| re.is_match(n)).collect()
        };

        if matched.is_empty() {
            return Err(self.failed(command, ""));
        }
        Ok(matched.iter().map(|n| format!("{n}\n")).collect())
    }

    fn long_listing(&self, command: &str, path: &str) -> Result<String, RemoteError> {
        let local = self.local(path);
        let meta = local
            .symlink_metadata()
            .map_err(|e| self.failed(command, format!("ls: {e}")))?;
        if !meta.file_type().is_symlink() {
            return Err(self.failed(command, ""));
        }
        let link = fs::read_link(&local).map_err(|e| self.failed(command, e.to_string()))?;
        Ok(format!(
            "lrwxrwxrwx 1 root root {} Jan  1 00:00 {path} -> {}\n",
            link.as_os_str().len(),
            link.display()
        ))
    }

    fn disk_usage(&self, command: &str, path: &str) -> Result<String, RemoteError> {
        let local = self.local(path);
        let mut bytes = 0u64;
        for entry in walkdir::WalkDir::new(&local) {
            let entry = entry.map_err(|e| self.failed(command, format!("du: {e}")))?;
            if entry.file_type().is_file() {
                bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(format!("{}\n", bytes.div_ceil(1024)))
    }

    fn stream_bytes(&self, bytes: Vec<u8>) -> RemoteStream {
        let done = tokio::spawn(async { Ok(()) });
        RemoteStream::new(Box::new(Cursor::new(bytes)), done)
    }
}

#[async_trait]
impl RemoteExec for FakeRemote {
    fn target(&self) -> &Target {
        &self.target
    }

    async fn run_command(&self, command: &str) -> Result<String, RemoteError> {
        self.record(command);
        if let Some(c) = LS_GREP.captures(command) {
            return self.list(command, &c[1], &c[2], &c[3]);
        }
        if let Some(c) = LS_LD.captures(command) {
            return self.long_listing(command, &c[1]);
        }
        if let Some(c) = DU.captures(command) {
            return self.disk_usage(command, &c[1]);
        }
        if let Some(c) = TEST_D.captures(command) {
            return if self.local(&c[1]).is_dir() {
                Ok(String::new())
            } else {
                Err(self.failed(command, ""))
            };
        }
        if command == "command -v tar" {
            return if self.has_tar {
                Ok("/usr/bin/tar\n".to_string())
            } else {
                Err(self.failed(command, ""))
            };
        }
        Err(self.failed(command, "sh: command not found"))
    }

    async fn open_stream(&self, command: &str) -> Result<RemoteStream, RemoteError> {
        self.record(command);
        if let Some(c) = TAR.captures(command) {
            if !self.has_tar {
                return Err(self.failed(command, "sh: tar: not found"));
            }
            if let Some(bytes) = &self.tar_override {
                return Ok(self.stream_bytes(bytes.clone()));
            }
            let src = self.local(&c[1]).join(&c[2]);
            let bytes = tar_codec::pack(&src, &c[2], Vec::new())
                .map_err(|e| self.failed(command, e.to_string()))?;
            return Ok(self.stream_bytes(bytes));
        }
        if let Some(c) = CAT.captures(command) {
            let bytes = fs::read(self.local(&c[1]))
                .map_err(|e| self.failed(command, format!("cat: {e}")))?;
            return Ok(self.stream_bytes(bytes));
        }
        Err(self.failed(command, "sh: command not found"))
    }
}

/// Targets backed by local directories, keyed by target label.
#[derive(Default)]
pub struct FakeProvider {
    targets: Vec<(Target, PathBuf)>,
    without_tar: Vec<String>,
    tar_streams: HashMap<String, Vec<u8>>,
    logs: HashMap<String, String>,
}

impl FakeProvider {
    pub fn add(&mut self, target: Target, root: &Path) {
        self.targets.push((target, root.to_path_buf()));
    }

    pub fn disable_tar(&mut self, label: &str) {
        self.without_tar.push(label.to_string());
    }

    pub fn set_tar_stream(&mut self, label: &str, bytes: Vec<u8>) {
        self.tar_streams.insert(label.to_string(), bytes);
    }

    pub fn set_log(&mut self, label: &str, text: &str) {
        self.logs.insert(label.to_string(), text.to_string());
    }
}

#[async_trait]
impl TargetProvider for FakeProvider {
    async fn list_targets(&self, _spec: &LogSpec) -> Result<Vec<Target>, RemoteError> {
        Ok(self.targets.iter().map(|(t, _)| t.clone()).collect())
    }

    async fn connect(&self, target: &Target) -> Result<Box<dyn RemoteExec>, RemoteError> {
        let (_, root) = self
            .targets
            .iter()
            .find(|(t, _)| t == target)
            .ok_or_else(|| RemoteError::Connect {
                target: target.to_string(),
                reason: "unknown fake target".to_string(),
            })?;
        let mut remote = FakeRemote::new(root).with_target(target.clone());
        if self.without_tar.contains(&target.label()) {
            remote = remote.without_tar();
        }
        if let Some(bytes) = self.tar_streams.get(&target.label()) {
            remote = remote.with_tar_stream(bytes.clone());
        }
        Ok(Box::new(remote))
    }

    async fn tail(&self, target: &Target, lines: u32) -> Result<RemoteStream, RemoteError> {
        let text = self.logs.get(&target.label()).ok_or_else(|| RemoteError::Connect {
            target: target.to_string(),
            reason: "no log for fake target".to_string(),
        })?;
        let all: Vec<&str> = text.lines().collect();
        let keep = all.len().saturating_sub(lines as usize);
        let tail: String = all[keep..].iter().map(|l| format!("{l}\n")).collect();
        let done = tokio::spawn(async { Ok(()) });
        Ok(RemoteStream::new(Box::new(Cursor::new(tail.into_bytes())), done))
    }
}

/// Volume with fixed usage numbers.
pub struct FixedVolume(pub DiskUsage);

impl VolumeStats for FixedVolume {
    fn usage(&self, _path: &Path) -> std::io::Result<DiskUsage> {
        Ok(self.0)
    }
}

/// Volume whose statistics can never be read.
pub struct BrokenVolume;

impl VolumeStats for BrokenVolume {
    fn usage(&self, _path: &Path) -> std::io::Result<DiskUsage> {
        Err(std::io::Error::other("statvfs unavailable"))
    }
}
