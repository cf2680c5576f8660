//! Per-LogSpec collection runs.
//!
//! A run walks `Init → Resolving → Transferring → Archiving → Done`. Only
//! setup problems (the staging directory, target enumeration) and the final
//! archive step fail the run; everything that goes wrong for a single target
//! is captured in that target's [`TransferRecord`] and the run carries on.
//!
//! Every target writes into `<staging>/<target label>/` (or
//! `<staging>/<label>-pod.log` for tail specs), so targets processed in
//! parallel never touch each other's files.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use futures::StreamExt;
use thiserror::Error;

use crate::guard::{LocalVolume, SpaceGuard, UnverifiedPolicy, Verdict, VolumeStats};
use crate::model::{BackendKind, LogSpec, ResolvedPath, Target, TransferOutcome, TransferRecord};
use crate::remote::{RemoteError, RemoteExec, TargetProvider};
use crate::resolve::PathResolver;
use crate::transfer::{self, CopySettings, DEFAULT_SETTLE_DELAY, Strategy, TarError, tar_codec};

/// Default destination directory for archives.
pub const DEFAULT_DEST_DIR: &str = "/tmp/logs";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tar(#[from] TarError),

    #[error("archive task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
pub enum CollectError {
    #[error("cannot create staging directory {}: {source}", path.display())]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot enumerate targets for {spec}: {source}")]
    Targets {
        spec: String,
        #[source]
        source: RemoteError,
    },

    #[error("archiving {spec} failed: {source}")]
    Archive {
        spec: String,
        #[source]
        source: ArchiveError,
    },
}

impl CollectError {
    /// Whether the whole invocation must stop, not just this LogSpec.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Staging { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Resolving,
    Transferring,
    Archiving,
    Done,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Resolving => "resolving",
            Self::Transferring => "transferring",
            Self::Archiving => "archiving",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct CollectOptions {
    pub dest_dir: PathBuf,
    /// Transfer cap in MB/s, 0 for unbounded.
    pub limit_mb: u64,
    pub policy: UnverifiedPolicy,
    /// Targets of one LogSpec processed at once.
    pub parallelism: usize,
    pub settle_delay: Duration,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            dest_dir: PathBuf::from(DEFAULT_DEST_DIR),
            limit_mb: 0,
            policy: UnverifiedPolicy::Skip,
            parallelism: 1,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

impl CollectOptions {
    fn copy_settings(&self) -> CopySettings {
        CopySettings {
            limit_mb: self.limit_mb,
            settle: self.settle_delay,
        }
    }
}

/// Outcome of one successful run.
#[derive(Debug, Clone)]
pub struct CollectReport {
    pub archive: PathBuf,
    pub records: Vec<TransferRecord>,
}

impl CollectReport {
    pub fn ok_count(&self) -> usize {
        self.count(|o| matches!(o, TransferOutcome::Ok))
    }

    pub fn skipped_count(&self) -> usize {
        self.count(|o| matches!(o, TransferOutcome::SkippedSpace(_)))
    }

    pub fn failed_count(&self) -> usize {
        self.count(|o| matches!(o, TransferOutcome::Failed(_)))
    }

    fn count(&self, pred: impl Fn(&TransferOutcome) -> bool) -> usize {
        self.records.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn bytes(&self) -> u64 {
        self.records.iter().map(|r| r.bytes_transferred).sum()
    }

    /// One-line count summary.
    pub fn summary(&self) -> String {
        format!(
            "{} ok, {} skipped-space, {} failed ({} bytes)",
            self.ok_count(),
            self.skipped_count(),
            self.failed_count(),
            self.bytes()
        )
    }

    /// A line per record that did not end `ok`.
    pub fn problems(&self) -> Vec<String> {
        self.records
            .iter()
            .filter_map(|r| {
                let reason = match &r.outcome {
                    TransferOutcome::Ok => return None,
                    TransferOutcome::SkippedSpace(reason) | TransferOutcome::Failed(reason) => {
                        reason
                    }
                };
                let path = r.resolved_path.as_deref().unwrap_or("-");
                Some(format!("{} {path}: {}: {reason}", r.target, r.outcome))
            })
            .collect()
    }
}

/// Drives collection runs against one provider.
pub struct Collector<P> {
    provider: P,
    options: CollectOptions,
    volume: Arc<dyn VolumeStats>,
}

impl<P: TargetProvider> Collector<P> {
    pub fn new(provider: P, options: CollectOptions) -> Self {
        Self {
            provider,
            options,
            volume: Arc::new(LocalVolume),
        }
    }

    pub fn with_volume(mut self, volume: Arc<dyn VolumeStats>) -> Self {
        self.volume = volume;
        self
    }

    /// Run one LogSpec end to end and return its report.
    pub async fn collect(&self, spec: &LogSpec) -> Result<CollectReport, CollectError> {
        enter(spec, Phase::Init);
        let staging = self.options.dest_dir.join(&spec.name);
        if let Err(source) = prepare_staging(&staging).await {
            enter(spec, Phase::Failed);
            return Err(CollectError::Staging {
                path: staging,
                source,
            });
        }

        enter(spec, Phase::Resolving);
        let targets = match self.provider.list_targets(spec).await {
            Ok(targets) => targets,
            Err(source) => {
                tracing::error!(spec = %spec.name, error = %source, "target enumeration failed");
                let _ = tokio::fs::remove_dir_all(&staging).await;
                enter(spec, Phase::Failed);
                return Err(CollectError::Targets {
                    spec: spec.name.clone(),
                    source,
                });
            }
        };
        tracing::info!(spec = %spec.name, backend = %spec.backend, targets = targets.len(), "targets enumerated");

        enter(spec, Phase::Transferring);
        let guard = SpaceGuard::with_volume(self.options.policy, &staging, self.volume.clone());
        let records: Vec<TransferRecord> = futures::stream::iter(targets.iter())
            .map(|target| self.collect_target(spec, target, &staging, &guard))
            .buffered(self.options.parallelism.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect();

        enter(spec, Phase::Archiving);
        let archive = self.options.dest_dir.join(format!("{}.tar.gz", spec.name));
        if let Err(source) = archive_staging(&staging, &archive, &spec.name).await {
            tracing::error!(spec = %spec.name, error = %source, "archiving failed");
            enter(spec, Phase::Failed);
            return Err(CollectError::Archive {
                spec: spec.name.clone(),
                source,
            });
        }

        let report = CollectReport {
            archive,
            records,
        };
        tracing::info!(spec = %spec.name, archive = %report.archive.display(), summary = %report.summary(), "collection finished");
        enter(spec, Phase::Done);
        Ok(report)
    }

    async fn collect_target(
        &self,
        spec: &LogSpec,
        target: &Target,
        staging: &Path,
        guard: &SpaceGuard,
    ) -> Vec<TransferRecord> {
        match spec.backend {
            BackendKind::LogTail => vec![self.collect_tail(spec, target, staging).await],
            BackendKind::Cluster | BackendKind::Shell => {
                self.collect_files(spec, target, staging, guard).await
            }
        }
    }

    async fn collect_files(
        &self,
        spec: &LogSpec,
        target: &Target,
        staging: &Path,
        guard: &SpaceGuard,
    ) -> Vec<TransferRecord> {
        let remote = match self.provider.connect(target).await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!(remote = %target, error = %e, "cannot connect to target");
                return vec![TransferRecord::failed(target, e.to_string())];
            }
        };

        let resolver = PathResolver::new(remote.as_ref());
        let paths = match resolver.resolve(&spec.dir_pattern, &spec.file_pattern).await {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(
                    remote = %target,
                    dir = %spec.dir_pattern,
                    file = %spec.file_pattern,
                    error = %e,
                    "path resolution failed"
                );
                return vec![TransferRecord::failed(target, e.to_string())];
            }
        };

        let strategy = transfer::probe_strategy(remote.as_ref()).await;
        let dest_dir = staging.join(target.label());
        let landing = landing_dirs(&dest_dir, &paths);
        let mut records = Vec::with_capacity(paths.len());
        for (path, dir) in paths.iter().zip(&landing) {
            records.push(
                self.transfer_path(remote.as_ref(), path, dir, strategy, guard)
                    .await,
            );
        }
        records
    }

    async fn transfer_path(
        &self,
        remote: &dyn RemoteExec,
        path: &ResolvedPath,
        dest_dir: &Path,
        strategy: Strategy,
        guard: &SpaceGuard,
    ) -> TransferRecord {
        let target = remote.target();
        let mut record = TransferRecord {
            target: target.label(),
            resolved_path: Some(path.path.clone()),
            local_destination: None,
            bytes_transferred: 0,
            outcome: TransferOutcome::Ok,
        };

        match guard.check(remote, &path.path).await {
            Verdict::Approved { .. } => {}
            verdict @ Verdict::Rejected { .. } => {
                tracing::warn!(remote = %target, remote_path = %path, %verdict, "not enough local space, skipping");
                record.outcome = TransferOutcome::SkippedSpace(verdict.to_string());
                return record;
            }
            verdict @ Verdict::Unverified(_) => match guard.policy() {
                UnverifiedPolicy::Skip => {
                    tracing::warn!(remote = %target, remote_path = %path, %verdict, "space check failed, skipping");
                    record.outcome = TransferOutcome::SkippedSpace(verdict.to_string());
                    return record;
                }
                UnverifiedPolicy::Proceed => {
                    tracing::warn!(remote = %target, remote_path = %path, %verdict, "space check failed, transferring anyway");
                }
            },
        }

        let dest = dest_dir.join(path.file_name());
        tracing::info!(remote = %target, remote_path = %path, local = %dest.display(), ?strategy, "download started");

        let settings = self.options.copy_settings();
        let result = match strategy {
            Strategy::Tar => transfer::fetch_with_tar(remote, path, dest_dir, &settings).await,
            Strategy::Cat => transfer::fetch_with_cat(remote, path, dest_dir, &settings).await,
        };

        match result {
            Ok(bytes) => {
                tracing::info!(remote = %target, remote_path = %path, bytes, "download finished");
                record.bytes_transferred = bytes;
                record.local_destination = Some(dest);
            }
            Err(e) => {
                tracing::warn!(remote = %target, remote_path = %path, error = %e, "download failed");
                remove_partial(&dest).await;
                record.outcome = TransferOutcome::Failed(e.to_string());
            }
        }
        record
    }

    async fn collect_tail(&self, spec: &LogSpec, target: &Target, staging: &Path) -> TransferRecord {
        let lines = spec.tail_count.unwrap_or_default();
        let dest = staging.join(format!("{}-pod.log", target.label()));
        let mut record = TransferRecord {
            target: target.label(),
            resolved_path: None,
            local_destination: None,
            bytes_transferred: 0,
            outcome: TransferOutcome::Ok,
        };

        tracing::info!(remote = %target, lines, local = %dest.display(), "log tail started");
        let result = match self.provider.tail(target, lines).await {
            Ok(stream) => transfer::write_stream(stream, &dest, &self.options.copy_settings()).await,
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(bytes) => {
                record.bytes_transferred = bytes;
                record.local_destination = Some(dest);
            }
            Err(e) => {
                tracing::warn!(remote = %target, error = %e, "log tail failed");
                remove_partial(&dest).await;
                record.outcome = TransferOutcome::Failed(e.to_string());
            }
        }
        record
    }
}

/// Local directory each path is fetched into.
///
/// The first path with a given file name lands in `dest_dir`; later ones
/// (two symlinks whose targets share a name) go to `dest_dir/<name>.<n>/`,
/// with `n` chosen so it never clashes with another fetched name.
fn landing_dirs(dest_dir: &Path, paths: &[ResolvedPath]) -> Vec<PathBuf> {
    let mut taken: HashSet<String> = paths.iter().map(|p| p.file_name().to_string()).collect();
    let mut placed = HashSet::new();
    let mut dirs = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path.file_name();
        if placed.insert(name.to_string()) {
            dirs.push(dest_dir.to_path_buf());
            continue;
        }
        let mut n = 2;
        loop {
            let alt = format!("{name}.{n}");
            if taken.insert(alt.clone()) {
                dirs.push(dest_dir.join(alt));
                break;
            }
            n += 1;
        }
    }
    dirs
}

fn enter(spec: &LogSpec, phase: Phase) {
    tracing::debug!(spec = %spec.name, %phase, "phase");
}

/// Start every run from an empty staging directory.
async fn prepare_staging(staging: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(staging).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tokio::fs::create_dir_all(staging).await
}

async fn remove_partial(dest: &Path) {
    let removed = match tokio::fs::symlink_metadata(dest).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(dest).await,
        Ok(_) => tokio::fs::remove_file(dest).await,
        Err(_) => return,
    };
    if let Err(e) = removed {
        tracing::warn!(path = %dest.display(), error = %e, "cannot remove partial download");
    }
}

/// Fold the staging directory into `archive` (gzip'd tar, entries under
/// `base/`) and delete it. On failure the staging directory is left alone
/// and the partial archive is removed.
pub async fn archive_staging(staging: &Path, archive: &Path, base: &str) -> Result<(), ArchiveError> {
    let staging = staging.to_path_buf();
    let archive = archive.to_path_buf();
    let base = base.to_string();

    tokio::task::spawn_blocking(move || {
        if let Err(e) = write_archive(&staging, &archive, &base) {
            let _ = fs::remove_file(&archive);
            return Err(e);
        }
        fs::remove_dir_all(&staging)?;
        Ok(())
    })
    .await?
}

fn write_archive(staging: &Path, archive: &Path, base: &str) -> Result<(), ArchiveError> {
    let file = File::create(archive)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let encoder = tar_codec::pack(staging, base, encoder)?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostGroups;
    use crate::guard::DiskUsage;
    use crate::model::{HostCredential, Secret};
    use crate::remote::RemoteContext;
    use crate::remote::fake::{BrokenVolume, FakeProvider, FixedVolume};
    use flate2::read::GzDecoder;

    fn host(address: &str) -> Target {
        Target::Host(HostCredential {
            address: address.into(),
            port: 22,
            username: "root".into(),
            secret: Secret::Password("pw".into()),
        })
    }

    fn pod(name: &str) -> Target {
        Target::Pod {
            namespace: "api".into(),
            pod: name.into(),
            container: None,
        }
    }

    fn shell_spec(name: &str) -> LogSpec {
        LogSpec {
            name: name.into(),
            backend: BackendKind::Shell,
            namespace_pattern: None,
            target_name_pattern: None,
            dir_pattern: "/var/log/app".into(),
            file_pattern: "app.log".into(),
            container: None,
            host_group: Some("web".into()),
            tail_count: None,
        }
    }

    fn options(dest: &Path) -> CollectOptions {
        CollectOptions {
            dest_dir: dest.to_path_buf(),
            settle_delay: Duration::ZERO,
            ..CollectOptions::default()
        }
    }

    fn roomy() -> Arc<dyn VolumeStats> {
        Arc::new(FixedVolume(DiskUsage {
            total_kb: 10_000_000,
            used_kb: 1_000,
        }))
    }

    /// A remote root holding `/var/log/app/app.log` with `body`.
    fn remote_with_log(body: &str) -> tempfile::TempDir {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("var/log/app")).unwrap();
        fs::write(tmp.path().join("var/log/app/app.log"), body).unwrap();
        tmp
    }

    fn archive_entries(archive: &Path) -> Vec<(String, Vec<u8>)> {
        let file = File::open(archive).unwrap();
        let mut tar = tar::Archive::new(GzDecoder::new(file));
        let mut entries = Vec::new();
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().display().to_string();
            let mut body = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut body).unwrap();
            entries.push((name, body));
        }
        entries
    }

    async fn three_hosts(
        parallelism: usize,
    ) -> (Vec<tempfile::TempDir>, tempfile::TempDir, CollectReport) {
        let roots = vec![
            remote_with_log("one\n"),
            tempfile::TempDir::new().unwrap(),
            remote_with_log("three\n"),
        ];
        let mut provider = FakeProvider::default();
        for (i, root) in roots.iter().enumerate() {
            provider.add(host(&format!("10.0.0.{}", i + 1)), root.path());
        }

        let dest = tempfile::TempDir::new().unwrap();
        let collector = Collector::new(
            provider,
            CollectOptions {
                parallelism,
                ..options(dest.path())
            },
        )
        .with_volume(roomy());

        let report = collector.collect(&shell_spec("app")).await.unwrap();
        (roots, dest, report)
    }

    #[tokio::test]
    async fn failing_target_does_not_stop_the_others() {
        let (_roots, dest, report) = three_hosts(1).await;

        assert_eq!(report.archive, dest.path().join("app.tar.gz"));
        assert!(!dest.path().join("app").exists(), "staging must be removed");

        let entries = archive_entries(&report.archive);
        let files: Vec<(&str, &[u8])> = entries
            .iter()
            .filter(|(_, body)| !body.is_empty())
            .map(|(n, b)| (n.as_str(), b.as_slice()))
            .collect();
        assert_eq!(
            files,
            vec![
                ("app/10.0.0.1/app.log", b"one\n".as_slice()),
                ("app/10.0.0.3/app.log", b"three\n".as_slice()),
            ]
        );

        assert_eq!(report.records.len(), 3);
        assert_eq!(report.ok_count(), 2);
        assert_eq!(report.failed_count(), 1);
        let failed: Vec<&TransferRecord> = report
            .records
            .iter()
            .filter(|r| matches!(r.outcome, TransferOutcome::Failed(_)))
            .collect();
        assert_eq!(failed[0].target, "10.0.0.2");
        assert!(failed[0].resolved_path.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn parallel_run_keeps_target_isolation_and_order() {
        let (_roots, _dest, report) = three_hosts(3).await;
        let targets: Vec<&str> = report.records.iter().map(|r| r.target.as_str()).collect();
        assert_eq!(targets, ["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        assert_eq!(report.ok_count(), 2);
        assert_eq!(report.failed_count(), 1);
    }

    #[tokio::test]
    async fn cat_fallback_and_symlink_following() {
        let root = tempfile::TempDir::new().unwrap();
        let dir = root.path().join("var/log/app");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("app-2024.log"), b"rotated\n").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("app-2024.log", dir.join("app.log")).unwrap();
        #[cfg(not(unix))]
        fs::write(dir.join("app.log"), b"rotated\n").unwrap();

        let mut provider = FakeProvider::default();
        provider.add(host("10.0.0.9"), root.path());
        provider.disable_tar("10.0.0.9");

        let dest = tempfile::TempDir::new().unwrap();
        let collector = Collector::new(provider, options(dest.path())).with_volume(roomy());
        let report = collector.collect(&shell_spec("app")).await.unwrap();

        assert_eq!(report.ok_count(), 1);
        let record = &report.records[0];
        #[cfg(unix)]
        assert_eq!(record.resolved_path.as_deref(), Some("/var/log/app/app-2024.log"));
        assert_eq!(record.bytes_transferred, 8);

        let entries = archive_entries(&report.archive);
        assert!(
            entries
                .iter()
                .any(|(name, body)| name.starts_with("app/10.0.0.9/app") && body == b"rotated\n")
        );
    }

    #[tokio::test]
    async fn full_volume_skips_the_transfer() {
        let root = remote_with_log("big\n");
        let mut provider = FakeProvider::default();
        provider.add(host("10.0.0.1"), root.path());

        let dest = tempfile::TempDir::new().unwrap();
        let collector = Collector::new(provider, options(dest.path())).with_volume(Arc::new(
            FixedVolume(DiskUsage {
                total_kb: 100,
                used_kb: 90,
            }),
        ));
        let report = collector.collect(&shell_spec("app")).await.unwrap();

        assert_eq!(report.skipped_count(), 1);
        assert!(report.records[0].local_destination.is_none());
        assert!(report.archive.exists());
    }

    #[tokio::test]
    async fn unverified_space_follows_the_policy() {
        let root = remote_with_log("data\n");
        let dest = tempfile::TempDir::new().unwrap();

        let mut provider = FakeProvider::default();
        provider.add(host("10.0.0.1"), root.path());
        let skip = Collector::new(provider, options(dest.path())).with_volume(Arc::new(BrokenVolume));
        let report = skip.collect(&shell_spec("app")).await.unwrap();
        assert_eq!(report.skipped_count(), 1);
        assert!(report.problems()[0].contains("unverified"));

        let mut provider = FakeProvider::default();
        provider.add(host("10.0.0.1"), root.path());
        let proceed = Collector::new(
            provider,
            CollectOptions {
                policy: UnverifiedPolicy::Proceed,
                ..options(dest.path())
            },
        )
        .with_volume(Arc::new(BrokenVolume));
        let report = proceed.collect(&shell_spec("app")).await.unwrap();
        assert_eq!(report.ok_count(), 1);
    }

    #[tokio::test]
    async fn tail_spec_writes_pod_log_files() {
        let mut provider = FakeProvider::default();
        let empty = tempfile::TempDir::new().unwrap();
        provider.add(pod("api-0"), empty.path());
        provider.set_log("api-0", "l1\nl2\nl3\n");

        let spec = LogSpec {
            name: "api".into(),
            backend: BackendKind::LogTail,
            namespace_pattern: Some("api".into()),
            target_name_pattern: Some("api-".into()),
            dir_pattern: String::new(),
            file_pattern: String::new(),
            container: None,
            host_group: None,
            tail_count: Some(2),
        };

        let dest = tempfile::TempDir::new().unwrap();
        let collector = Collector::new(provider, options(dest.path())).with_volume(roomy());
        let report = collector.collect(&spec).await.unwrap();

        assert_eq!(report.ok_count(), 1);
        let entries = archive_entries(&report.archive);
        assert!(
            entries
                .iter()
                .any(|(name, body)| name == "api/api-0-pod.log" && body == b"l2\nl3\n")
        );
    }

    #[tokio::test]
    async fn unknown_host_group_fails_the_spec_without_archive() {
        let dest = tempfile::TempDir::new().unwrap();
        let collector = Collector::new(RemoteContext::new(HostGroups::default()), options(dest.path()));

        let err = collector.collect(&shell_spec("app")).await.unwrap_err();
        assert!(matches!(err, CollectError::Targets { .. }), "{err}");
        assert!(!err.is_fatal());
        assert!(!dest.path().join("app").exists());
        assert!(!dest.path().join("app.tar.gz").exists());
    }

    #[tokio::test]
    async fn staging_failure_is_fatal() {
        let tmp = tempfile::TempDir::new().unwrap();
        let blocker = tmp.path().join("dest");
        fs::write(&blocker, b"not a directory").unwrap();

        let collector = Collector::new(FakeProvider::default(), options(&blocker));
        let err = collector.collect(&shell_spec("app")).await.unwrap_err();
        assert!(err.is_fatal(), "{err}");
    }

    #[tokio::test]
    async fn stale_staging_contents_are_not_archived() {
        let dest = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(dest.path().join("app")).unwrap();
        fs::write(dest.path().join("app/leftover.log"), b"old").unwrap();

        let collector =
            Collector::new(FakeProvider::default(), options(dest.path())).with_volume(roomy());
        let report = collector.collect(&shell_spec("app")).await.unwrap();

        let entries = archive_entries(&report.archive);
        assert!(entries.iter().all(|(name, _)| !name.contains("leftover")));
    }

    #[tokio::test]
    async fn broken_tar_stream_leaves_no_partial_download() {
        let root = remote_with_log("ignored\n");
        let mut stream = tar::Builder::new(Vec::new());
        let members = [
            ("app.log/a.log", b"first\n".as_slice()),
            ("other/b.log", b"stray\n".as_slice()),
        ];
        for (name, body) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            stream.append_data(&mut header, name, body).unwrap();
        }
        let bytes = stream.into_inner().unwrap();

        let mut provider = FakeProvider::default();
        provider.add(host("10.0.0.1"), root.path());
        provider.set_tar_stream("10.0.0.1", bytes);

        let dest = tempfile::TempDir::new().unwrap();
        let collector = Collector::new(provider, options(dest.path())).with_volume(roomy());
        let report = collector.collect(&shell_spec("app")).await.unwrap();

        assert_eq!(report.failed_count(), 1);
        let record = &report.records[0];
        assert!(
            matches!(&record.outcome, TransferOutcome::Failed(reason) if reason.contains("corrupted")),
            "{:?}",
            record.outcome
        );
        assert!(record.local_destination.is_none());

        let entries = archive_entries(&report.archive);
        assert!(
            entries.iter().all(|(name, _)| !name.contains("app.log")),
            "partial download archived: {entries:?}"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn links_to_same_named_files_do_not_overwrite_each_other() {
        let root = tempfile::TempDir::new().unwrap();
        for (dir, body) in [("srv/one", "one\n"), ("srv/two", "two\n")] {
            fs::create_dir_all(root.path().join(dir)).unwrap();
            fs::write(root.path().join(dir).join("app.log"), body).unwrap();
        }
        let logs = root.path().join("var/log/app");
        fs::create_dir_all(&logs).unwrap();
        std::os::unix::fs::symlink("/srv/one/app.log", logs.join("a.log")).unwrap();
        std::os::unix::fs::symlink("/srv/two/app.log", logs.join("b.log")).unwrap();

        let mut provider = FakeProvider::default();
        provider.add(host("10.0.0.1"), root.path());
        let dest = tempfile::TempDir::new().unwrap();
        let collector = Collector::new(provider, options(dest.path())).with_volume(roomy());
        let spec = LogSpec {
            file_pattern: "[ab]\\.log".into(),
            ..shell_spec("app")
        };
        let report = collector.collect(&spec).await.unwrap();

        assert_eq!(report.ok_count(), 2);
        let entries = archive_entries(&report.archive);
        let body = |wanted: &str| {
            entries
                .iter()
                .find(|(name, _)| name == wanted)
                .map(|(_, body)| body.clone())
        };
        assert_eq!(body("app/10.0.0.1/app.log").as_deref(), Some(b"one\n".as_slice()));
        assert_eq!(
            body("app/10.0.0.1/app.log.2/app.log").as_deref(),
            Some(b"two\n".as_slice())
        );
    }

    #[test]
    fn landing_dirs_skip_names_already_in_use() {
        let paths = [
            ResolvedPath::new("/srv/one/app.log"),
            ResolvedPath::new("/var/log/app.log.2"),
            ResolvedPath::new("/srv/two/app.log"),
        ];
        let dirs = landing_dirs(Path::new("/stage/h"), &paths);
        assert_eq!(
            dirs,
            [
                PathBuf::from("/stage/h"),
                PathBuf::from("/stage/h"),
                PathBuf::from("/stage/h/app.log.3"),
            ]
        );
    }
}
