//! Per-container log shipping. A collector watches `<log_root>/<cid>/` and
//! uploads every rotated log file of that container, then registers it and
//! records it as done.

use crate::applet::artifacts::{ArtifactClient, LogArtifactDescriptor, UploadedLog};
use crate::applet::store::ApplicationRecord;
use crate::cluster::ClusterLayout;
use crate::objstore::{ObjectStore, PutOptions};
use crate::retry::{self, RetryPolicy, retry_async};
use crate::types::{ContainerRef, PodKey, PodMeta};
use crate::utils::{RotatedLogMatcher, artifact_key, epoch_millis};
use anyhow::Context;
use chrono::Utc;
use futures::StreamExt;
use inotify::{EventMask, EventStream, Inotify, WatchMask};
use std::collections::{BTreeMap, HashSet};
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Services shared by all collectors on the node.
pub struct CollectorContext {
    pub log_root: PathBuf,
    pub layout: ClusterLayout,
    pub objstore: Arc<dyn ObjectStore>,
    pub artifacts: ArtifactClient,
    pub store: Arc<ApplicationRecord>,
    pub upload_retry: RetryPolicy,
    /// Upload the unrotated tail when the collector stops.
    pub app_mode: bool,
    /// Wait before re-creating a watch that could not be set up.
    pub rewatch_delay: Duration,
}

/// Identity of a log file. A rotation rename keeps all of it; a new file that
/// reuses a freed inode differs in size or mtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FileStamp {
    ino: u64,
    size: u64,
    /// Nanoseconds since the epoch.
    mtime: i64,
}

impl FileStamp {
    fn of(meta: &Metadata) -> Self {
        Self {
            ino: meta.ino(),
            size: meta.size(),
            mtime: meta
                .mtime()
                .saturating_mul(1_000_000_000)
                .saturating_add(meta.mtime_nsec()),
        }
    }
}

struct RotatedFile {
    name: String,
    stamp: FileStamp,
}

pub struct ContainerLogCollector {
    ctx: Arc<CollectorContext>,
    pod: PodKey,
    meta: PodMeta,
    container: ContainerRef,
    watch_dir: PathBuf,
    matcher: RotatedLogMatcher,
    in_flight: Mutex<HashSet<String>>,
    /// Files shipped by this collector that are still on disk.
    shipped: Mutex<HashSet<FileStamp>>,
    /// Files whose upload gave up and that are still on disk.
    failed: Mutex<HashSet<FileStamp>>,
    /// Rotated files with an mtime at or below this were shipped before the
    /// collector started.
    restored_watermark: AtomicI64,
    watermark: AtomicI64,
}

/// A running collector. Dropping the handle does not stop the task.
pub struct CollectorHandle {
    collector: Arc<ContainerLogCollector>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CollectorHandle {
    pub fn container(&self) -> &ContainerRef {
        &self.collector.container
    }

    pub fn is_busy(&self) -> bool {
        self.collector.is_busy()
    }

    /// Signal the collector and wait until it has exited. An upload in
    /// progress is completed first.
    pub async fn stop(self) {
        if self.is_busy() {
            debug!(
                container_id = %self.collector.container.id,
                "Waiting for upload in progress before stopping"
            );
        }
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(
                container_id = %self.collector.container.id,
                "Log collector task failed: {}", e
            );
        }
    }
}

impl ContainerLogCollector {
    /// Start collecting. Fails when the container's log directory does not exist.
    pub fn spawn(
        ctx: Arc<CollectorContext>,
        pod: PodKey,
        meta: PodMeta,
        container: ContainerRef,
    ) -> anyhow::Result<CollectorHandle> {
        let watch_dir = ctx.log_root.join(&container.id);
        if !watch_dir.is_dir() {
            anyhow::bail!("Log directory {} does not exist", watch_dir.display());
        }
        let matcher = RotatedLogMatcher::new(&container.id)?;
        let collector = Arc::new(Self {
            ctx,
            pod,
            meta,
            container,
            watch_dir,
            matcher,
            in_flight: Mutex::new(HashSet::new()),
            shipped: Mutex::new(HashSet::new()),
            failed: Mutex::new(HashSet::new()),
            restored_watermark: AtomicI64::new(0),
            watermark: AtomicI64::new(0),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let collector = collector.clone();
            let cancel = cancel.clone();
            async move { collector.run(cancel).await }
        });
        Ok(CollectorHandle {
            collector,
            cancel,
            task,
        })
    }

    pub fn is_busy(&self) -> bool {
        !self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            container_id = %self.container.id,
            "Log collector for {} container {} started", self.pod, self.container.name
        );
        self.restore_watermark().await;
        loop {
            // Watch before listing so no rotation falls in between.
            let watch = self.watch();
            self.upload_existing().await;

            let mut events = match watch {
                Ok(events) => events,
                Err(e) => {
                    warn!(
                        container_id = %self.container.id,
                        "Cannot watch {}: {}", self.watch_dir.display(), e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.ctx.rewatch_delay) => continue,
                    }
                }
            };

            if self.watch_loop(&mut events, &cancel).await {
                break;
            }
            // The watch is gone or overflowed: re-register and re-enumerate.
        }
        self.finish().await;
    }

    async fn restore_watermark(&self) {
        match self
            .ctx
            .store
            .shipped_watermark(&self.pod, &self.container.id)
            .await
        {
            Ok(mark) => {
                self.restored_watermark.store(mark, Ordering::SeqCst);
                self.watermark.store(mark, Ordering::SeqCst);
            }
            Err(e) => warn!(
                container_id = %self.container.id,
                "Cannot read shipped watermark, shipping all rotated logs: {}", e
            ),
        }
    }

    fn watch(&self) -> std::io::Result<EventStream<[u8; 4096]>> {
        let inotify = Inotify::init()?;
        inotify.watches().add(
            &self.watch_dir,
            WatchMask::MOVED_TO | WatchMask::DELETE_SELF | WatchMask::MOVE_SELF,
        )?;
        inotify.into_event_stream([0u8; 4096])
    }

    /// Returns true once cancelled, false when the watch must be re-created.
    async fn watch_loop(
        &self,
        events: &mut EventStream<[u8; 4096]>,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return true,
                event = events.next() => {
                    let event = match event {
                        Some(Ok(event)) => event,
                        Some(Err(e)) => {
                            warn!(container_id = %self.container.id, "inotify error: {}", e);
                            return false;
                        }
                        None => return false,
                    };
                    if event.mask.contains(EventMask::Q_OVERFLOW) {
                        warn!(container_id = %self.container.id, "inotify queue overflow");
                        return false;
                    }
                    if event.mask.intersects(
                        EventMask::IGNORED | EventMask::DELETE_SELF | EventMask::MOVE_SELF,
                    ) {
                        warn!(
                            container_id = %self.container.id,
                            "Watch on {} removed", self.watch_dir.display()
                        );
                        return false;
                    }
                    if !event.mask.contains(EventMask::MOVED_TO) {
                        continue;
                    }
                    let Some(name) = event.name.as_ref().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    // Only the first rotation is new; higher indexes are renames.
                    if self.matcher.rotation_index(name) == Some(1) {
                        debug!(container_id = %self.container.id, "Rotated: {}", name);
                        self.upload_existing().await;
                    }
                }
            }
        }
    }

    /// Rotated files currently on disk, oldest rotation first.
    async fn rotated_files(&self) -> std::io::Result<Vec<RotatedFile>> {
        let mut dir = tokio::fs::read_dir(&self.watch_dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(idx) = self.matcher.rotation_index(&name) else {
                continue;
            };
            match entry.metadata().await {
                Ok(meta) if meta.is_file() => {
                    let stamp = FileStamp::of(&meta);
                    files.push((idx, RotatedFile { name, stamp }));
                }
                Ok(_) => warn!("Log {} is not a file, not uploading", name),
                // Rotated away while listing.
                Err(_) => continue,
            }
        }
        files.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(files.into_iter().map(|(_, f)| f).collect())
    }

    /// Ship every rotated file on disk that has not been shipped yet.
    async fn upload_existing(&self) {
        let files = match self.rotated_files().await {
            Ok(files) => files,
            Err(e) => {
                warn!(
                    container_id = %self.container.id,
                    "Cannot list {}: {}", self.watch_dir.display(), e
                );
                return;
            }
        };
        let present: HashSet<FileStamp> = files.iter().map(|f| f.stamp).collect();
        self.shipped
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|s| present.contains(s));
        self.failed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|s| present.contains(s));

        let restored = self.restored_watermark.load(Ordering::SeqCst);
        for file in files {
            if file.stamp.mtime <= restored
                || self
                    .shipped
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .contains(&file.stamp)
            {
                continue;
            }
            self.process(&file.name, file.stamp).await;
        }
    }

    async fn process(&self, file_name: &str, stamp: FileStamp) {
        if !self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(file_name.to_string())
        {
            warn!(
                container_id = %self.container.id,
                "Log {} rotated while previous log is not uploaded", file_name
            );
            return;
        }
        let path = self.watch_dir.join(file_name);
        if let Err(e) = self.persist(&path, stamp).await {
            error!(
                container_id = %self.container.id,
                "Failed to ship {}: {:#}", path.display(), e
            );
            self.failed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(stamp);
        }
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(file_name);
    }

    async fn finish(&self) {
        // Rotations that raced with the stop signal.
        self.upload_existing().await;
        if self.ctx.app_mode {
            let tail = format!("{}-json.log", self.container.id);
            match tokio::fs::metadata(self.watch_dir.join(&tail)).await {
                Ok(meta) if meta.is_file() => self.process(&tail, FileStamp::of(&meta)).await,
                _ => warn!(
                    container_id = %self.container.id,
                    "Log {} has been removed, nothing left to upload", tail
                ),
            }
        }
        info!(
            container_id = %self.container.id,
            "Log collector for {} container {} terminated", self.pod, self.container.name
        );
    }

    /// The watermark after shipping `stamp`. It only passes files older than
    /// any upload that gave up.
    fn advance_watermark(&self, stamp: FileStamp) -> i64 {
        let mut failed = self.failed.lock().unwrap_or_else(|e| e.into_inner());
        failed.remove(&stamp);
        if failed.iter().any(|f| f.mtime <= stamp.mtime) {
            return self.watermark.load(Ordering::SeqCst);
        }
        self.watermark.fetch_max(stamp.mtime, Ordering::SeqCst).max(stamp.mtime)
    }

    /// Upload one file, register it, and record it as done.
    async fn persist(&self, path: &Path, stamp: FileStamp) -> anyhow::Result<()> {
        let ts = epoch_millis();
        let compressed = path.extension().is_some_and(|e| e == "gz");
        let mut artifact_name = format!("{}.{}.log.{}", self.container.name, self.container.id, ts);
        if compressed {
            artifact_name.push_str(".gz");
        }
        let full_name = if self.meta.deployment_name.is_empty() {
            artifact_name.clone()
        } else {
            format!("{}.{}", self.meta.deployment_name, artifact_name)
        };

        let dest = self.ctx.layout.log_destination(&self.container.name);
        let key = artifact_key(
            &self.ctx.layout.artifact_prefix(),
            dest.dated.then(Utc::now),
            &self.meta.app_id,
            &self.meta.deployment_id,
            &artifact_name,
        );
        let artifact_id = uuid::Uuid::new_v4().to_string();
        let mut metadata = BTreeMap::new();
        metadata.insert("ax_artifact_id".to_string(), artifact_id.clone());
        metadata.insert("ax_container_log".to_string(), "True".to_string());
        metadata.insert("ax_timestamp".to_string(), ts.to_string());
        let opts = PutOptions {
            metadata: metadata.clone().into_iter().collect(),
            content_disposition: Some(format!("attachment; filename={}", full_name)),
        };

        info!("Uploading log file {} as {}", path.display(), full_name);
        let size = retry_async(
            self.ctx.upload_retry,
            "upload log",
            || self.ctx.objstore.put_file(&dest.bucket, &key, path, &opts),
            retry::always,
        )
        .await
        .with_context(|| format!("uploading to {}/{}", dest.bucket, key))?;
        self.shipped
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(stamp);

        let descriptor = LogArtifactDescriptor::for_upload(&UploadedLog {
            artifact_id: &artifact_id,
            deployment_id: &self.meta.deployment_id,
            app_id: &self.meta.app_id,
            full_name: &full_name,
            artifact_name: &artifact_name,
            bucket: &dest.bucket,
            key: &key,
            size,
            compressed,
            pod_name: &self.pod.pod_name,
            container_name: &self.container.name,
            metadata: &metadata,
            timestamp: ts,
            retention_tag: dest.retention_tag,
            artifact_type: dest.artifact_type,
        });
        if let Err(e) = self.ctx.artifacts.create_artifact(&descriptor).await {
            error!("Failed to register artifact {} for {}: {}", artifact_id, full_name, e);
        }

        let watermark = self.advance_watermark(stamp);
        if let Err(e) = self
            .ctx
            .store
            .record_done(&self.pod, &self.container.id, &path.to_string_lossy(), watermark)
            .await
        {
            error!(
                container_id = %self.container.id,
                "Failed to record {} as done: {}", path.display(), e
            );
        }
        info!("Uploaded {} to {}/{}", path.display(), dest.bucket, key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applet::store::AppRecord;
    use crate::testing::{MemoryStore, collector_context, wait_for};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn artifact_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/artifacts"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        server
    }

    fn pod() -> PodKey {
        PodKey::new("app1", "web-0")
    }

    fn meta() -> PodMeta {
        PodMeta {
            app_id: "app-id-1".into(),
            deployment_id: "dep-id-1".into(),
            deployment_name: "web".into(),
        }
    }

    #[tokio::test]
    async fn uploads_existing_rotations_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let server = artifact_server().await;
        let objects = Arc::new(MemoryStore::default());
        let (ctx, store) = collector_context(dir.path(), objects.clone(), &server.uri(), false).await;
        let cdir = dir.path().join("logs/c001");
        std::fs::create_dir_all(&cdir).unwrap();
        std::fs::write(cdir.join("c001-json.log.1"), "newest").unwrap();
        std::fs::write(cdir.join("c001-json.log.2.gz"), "older").unwrap();
        std::fs::write(cdir.join("c001-json.log.3.gz"), "oldest").unwrap();
        std::fs::write(cdir.join("c001-json.log"), "live").unwrap();
        let container = ContainerRef::new("main", "c001");
        store
            .add(&[AppRecord::new(&pod(), &meta(), &container)])
            .await
            .unwrap();

        let handle = ContainerLogCollector::spawn(ctx, pod(), meta(), container).unwrap();
        wait_for(|| objects.puts().len() == 3).await;
        handle.stop().await;

        let puts = objects.puts();
        let bodies: Vec<_> = puts.iter().map(|p| String::from_utf8_lossy(&p.body).to_string()).collect();
        assert_eq!(bodies, vec!["oldest", "older", "newest"]);
        let first = &puts[0];
        assert_eq!(first.bucket, "applatix-data-acme-0");
        assert!(first.key.starts_with(
            "prod/1b4e28ba-2fa1-11d2-883f-0016d3cca427/artifacts/app-id-1/dep-id-1/main.c001.log."
        ));
        assert!(first.key.ends_with(".gz"));
        assert_eq!(first.opts.metadata["ax_container_log"], "True");
        assert!(
            first
                .opts
                .content_disposition
                .as_deref()
                .unwrap()
                .starts_with("attachment; filename=web.main.c001.log.")
        );
        let last_done = store.last_done(&pod(), "c001").await.unwrap().unwrap();
        assert!(last_done.ends_with("c001-json.log.1"));
    }

    #[tokio::test]
    async fn ships_new_rotation_and_tail_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let server = artifact_server().await;
        let objects = Arc::new(MemoryStore::default());
        let (ctx, store) = collector_context(dir.path(), objects.clone(), &server.uri(), true).await;
        let cdir = dir.path().join("logs/c002");
        std::fs::create_dir_all(&cdir).unwrap();
        let container = ContainerRef::new("main", "c002");
        store
            .add(&[AppRecord::new(&pod(), &meta(), &container)])
            .await
            .unwrap();

        let handle = ContainerLogCollector::spawn(ctx, pod(), meta(), container).unwrap();
        // Let the watch come up before rotating.
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(cdir.join("c002-json.log"), "first chunk").unwrap();
        std::fs::rename(cdir.join("c002-json.log"), cdir.join("c002-json.log.1")).unwrap();
        wait_for(|| objects.puts().len() == 1).await;

        std::fs::write(cdir.join("c002-json.log"), "tail").unwrap();
        handle.stop().await;

        let bodies: Vec<_> = objects
            .puts()
            .iter()
            .map(|p| String::from_utf8_lossy(&p.body).to_string())
            .collect();
        assert_eq!(bodies, vec!["first chunk", "tail"]);
        assert!(!objects.puts()[0].key.ends_with(".gz"));
    }

    #[tokio::test]
    async fn failed_upload_keeps_last_done_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let server = artifact_server().await;
        let objects = Arc::new(MemoryStore::default());
        objects.fail_next_puts(3);
        let (ctx, store) = collector_context(dir.path(), objects.clone(), &server.uri(), false).await;
        let cdir = dir.path().join("logs/c003");
        std::fs::create_dir_all(&cdir).unwrap();
        std::fs::write(cdir.join("c003-json.log.1"), "x").unwrap();
        let container = ContainerRef::new("main", "c003");
        store
            .add(&[AppRecord::new(&pod(), &meta(), &container)])
            .await
            .unwrap();

        let handle = ContainerLogCollector::spawn(ctx, pod(), meta(), container).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_busy());
        assert!(objects.puts().is_empty());
        assert_eq!(store.last_done(&pod(), "c003").await.unwrap().as_deref(), Some(""));
        // Stopping re-enumerates; the retry budget is spent so this attempt succeeds.
        handle.stop().await;

        assert!(cdir.join("c003-json.log.1").exists());
        assert_eq!(objects.puts().len(), 1);
    }

    fn stamp(path: &Path) -> FileStamp {
        FileStamp::of(&std::fs::metadata(path).unwrap())
    }

    async fn wait_for_watermark(store: &ApplicationRecord, cid: &str, mark: i64) {
        for _ in 0..250 {
            if store.shipped_watermark(&pod(), cid).await.unwrap() == mark {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("watermark never reached {}", mark);
    }

    #[tokio::test]
    async fn every_rotation_ships_even_on_a_recycled_inode() {
        let dir = tempfile::tempdir().unwrap();
        let server = artifact_server().await;
        let objects = Arc::new(MemoryStore::default());
        let (ctx, store) = collector_context(dir.path(), objects.clone(), &server.uri(), false).await;
        let cdir = dir.path().join("logs/c004");
        std::fs::create_dir_all(&cdir).unwrap();
        let container = ContainerRef::new("main", "c004");
        store
            .add(&[AppRecord::new(&pod(), &meta(), &container)])
            .await
            .unwrap();
        let live = cdir.join("c004-json.log");
        let rotated = cdir.join("c004-json.log.1");

        let handle = ContainerLogCollector::spawn(ctx, pod(), meta(), container).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(&live, "first").unwrap();
        std::fs::rename(&live, &rotated).unwrap();
        let first = stamp(&rotated);
        wait_for(|| objects.puts().len() == 1).await;
        wait_for_watermark(&store, "c004", first.mtime).await;

        // The writer drops the old segment; the next log may get its inode.
        std::fs::remove_file(&rotated).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(&live, "second segment").unwrap();
        std::fs::rename(&live, &rotated).unwrap();
        let second = stamp(&rotated);
        wait_for(|| objects.puts().len() == 2).await;
        wait_for_watermark(&store, "c004", second.mtime).await;
        handle.stop().await;

        let bodies: Vec<_> = objects
            .puts()
            .iter()
            .map(|p| String::from_utf8_lossy(&p.body).to_string())
            .collect();
        assert_eq!(bodies, vec!["first", "second segment"]);
        assert!(second.mtime > first.mtime);
        let last_done = store.last_done(&pod(), "c004").await.unwrap().unwrap();
        assert!(last_done.ends_with("c004-json.log.1"));
    }

    #[tokio::test]
    async fn restarted_collector_skips_shipped_rotations() {
        let dir = tempfile::tempdir().unwrap();
        let server = artifact_server().await;
        let objects = Arc::new(MemoryStore::default());
        let (ctx, store) = collector_context(dir.path(), objects.clone(), &server.uri(), false).await;
        let cdir = dir.path().join("logs/c005");
        std::fs::create_dir_all(&cdir).unwrap();
        std::fs::write(cdir.join("c005-json.log.1"), "a").unwrap();
        let container = ContainerRef::new("main", "c005");
        store
            .add(&[AppRecord::new(&pod(), &meta(), &container)])
            .await
            .unwrap();

        let handle =
            ContainerLogCollector::spawn(ctx.clone(), pod(), meta(), container.clone()).unwrap();
        wait_for(|| objects.puts().len() == 1).await;
        handle.stop().await;

        std::fs::rename(cdir.join("c005-json.log.1"), cdir.join("c005-json.log.2")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(cdir.join("c005-json.log.1"), "bb").unwrap();

        let handle = ContainerLogCollector::spawn(ctx, pod(), meta(), container).unwrap();
        wait_for(|| objects.puts().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.stop().await;

        let bodies: Vec<_> = objects
            .puts()
            .iter()
            .map(|p| String::from_utf8_lossy(&p.body).to_string())
            .collect();
        assert_eq!(bodies, vec!["a", "bb"]);
    }

    #[tokio::test]
    async fn restarted_collector_retries_failed_upload() {
        let dir = tempfile::tempdir().unwrap();
        let server = artifact_server().await;
        let objects = Arc::new(MemoryStore::default());
        // Both listings of the first collector exhaust their retries.
        objects.fail_next_puts(6);
        let (ctx, store) = collector_context(dir.path(), objects.clone(), &server.uri(), false).await;
        let cdir = dir.path().join("logs/c006");
        std::fs::create_dir_all(&cdir).unwrap();
        std::fs::write(cdir.join("c006-json.log.1.gz"), "zipped").unwrap();
        let container = ContainerRef::new("main", "c006");
        store
            .add(&[AppRecord::new(&pod(), &meta(), &container)])
            .await
            .unwrap();

        let handle =
            ContainerLogCollector::spawn(ctx.clone(), pod(), meta(), container.clone()).unwrap();
        handle.stop().await;
        assert!(objects.puts().is_empty());
        assert!(cdir.join("c006-json.log.1.gz").exists());
        assert_eq!(store.last_done(&pod(), "c006").await.unwrap().as_deref(), Some(""));
        assert_eq!(store.shipped_watermark(&pod(), "c006").await.unwrap(), 0);

        let handle = ContainerLogCollector::spawn(ctx, pod(), meta(), container).unwrap();
        wait_for(|| objects.puts().len() == 1).await;
        handle.stop().await;

        assert!(objects.puts()[0].key.ends_with(".gz"));
        let last_done = store.last_done(&pod(), "c006").await.unwrap().unwrap();
        assert!(last_done.ends_with("c006-json.log.1.gz"));
    }

    #[tokio::test]
    async fn missing_log_dir_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(MemoryStore::default());
        let (ctx, _store) = collector_context(dir.path(), objects, "http://127.0.0.1:9", false).await;
        let res = ContainerLogCollector::spawn(ctx, pod(), meta(), ContainerRef::new("main", "nope"));
        assert!(res.is_err());
    }
}
