use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::KeepaliveConfig;
use super::KeepaliveError;
use super::ReaderProbe;
use super::WatcherHandle;
use super::WatcherSpawner;

/// One discovered log file and the reader kept open on it.
pub struct LogWatch<H> {
    pub path: PathBuf,
    handle: H,
    /// Readers seen on the last evaluation, `None` before the first one.
    pub last_reader_count: Option<usize>,
    /// Someone besides our reader held the file open on the last evaluation.
    pub alive: bool,
    idle_polls: u32,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub discovered: Vec<PathBuf>,
    pub released: Vec<PathBuf>,
    pub tracked: usize,
}

/// Per-pod monitor owning every active watch. Created at pod start, dropped
/// with the pod; there is no state shared between instances.
pub struct KeepaliveMonitor<P, S: WatcherSpawner> {
    config: KeepaliveConfig,
    probe: P,
    spawner: S,
    watches: BTreeMap<PathBuf, LogWatch<S::Handle>>,
    /// Abandoned files. A released file is never watched again.
    released: BTreeSet<PathBuf>,
    seen_any: bool,
    discovered_last_cycle: bool,
}

impl<P: ReaderProbe, S: WatcherSpawner> KeepaliveMonitor<P, S> {
    /// # Errors
    ///
    /// - [`KeepaliveError::Pattern`] if `log_pattern` is not a valid glob
    pub fn new(config: KeepaliveConfig, probe: P, spawner: S) -> Result<Self, Report<KeepaliveError>> {
        glob::Pattern::new(&config.log_pattern).map_err(|e| {
            Report::new(KeepaliveError::Pattern {
                pattern: config.log_pattern.clone(),
            })
            .attach_printable(e.to_string())
        })?;

        Ok(Self {
            config,
            probe,
            spawner,
            watches: BTreeMap::new(),
            released: BTreeSet::new(),
            seen_any: false,
            discovered_last_cycle: false,
        })
    }

    pub fn watches(&self) -> impl Iterator<Item = &LogWatch<S::Handle>> {
        self.watches.values()
    }

    pub fn tracked(&self) -> usize {
        self.watches.len()
    }

    /// Every file seen so far was abandoned and nothing new showed up.
    pub fn is_drained(&self) -> bool {
        self.seen_any && self.watches.is_empty() && !self.discovered_last_cycle
    }

    /// One polling cycle: evaluate the watches that existed before this
    /// cycle, then pick up new files. New files are first evaluated on the
    /// next cycle, giving the writer one interval to open them.
    pub async fn poll_once(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        let paths: Vec<PathBuf> = self.watches.keys().cloned().collect();
        for path in paths {
            if self.is_abandoned(&path).await {
                self.release(&path).await;
                report.released.push(path);
            }
        }

        for path in self.discover() {
            match self.spawner.spawn(&path).await {
                Ok(handle) => {
                    info!(path = %path.display(), "watching new log file");
                    self.watches.insert(
                        path.clone(),
                        LogWatch {
                            path: path.clone(),
                            handle,
                            last_reader_count: None,
                            alive: true,
                            idle_polls: 0,
                        },
                    );
                    report.discovered.push(path);
                }
                // picked up again on the next cycle
                Err(e) => warn!(path = %path.display(), error = ?e, "failed to start log reader"),
            }
        }

        self.discovered_last_cycle = !report.discovered.is_empty();
        self.seen_any |= self.discovered_last_cycle;
        report.tracked = self.watches.len();
        report
    }

    /// Poll forever. Once drained, park without consuming resources until the
    /// pod is deleted.
    pub async fn run(mut self) -> Infallible {
        info!(
            pattern = %self.config.log_pattern,
            interval = ?self.config.poll_interval,
            "keepalive monitor started"
        );
        loop {
            let report = self.poll_once().await;
            if !report.discovered.is_empty() || !report.released.is_empty() {
                debug!(?report, "keepalive cycle");
            }
            if self.is_drained() {
                info!("all task logs abandoned, idling until the pod is deleted");
                return futures::future::pending::<Infallible>().await;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn is_abandoned(&mut self, path: &Path) -> bool {
        let probe = &self.probe;
        let min_readers = self.config.min_readers;
        let grace_polls = self.config.grace_polls;
        let Some(watch) = self.watches.get_mut(path) else {
            return false;
        };

        if watch.handle.has_exited() {
            info!(path = %path.display(), "log reader exited");
            return true;
        }

        let readers = match probe.count_readers(path).await {
            Ok(readers) => readers,
            Err(e) => {
                // unknown is not abandoned
                warn!(path = %path.display(), error = ?e, "failed to count log readers");
                return false;
            }
        };

        watch.last_reader_count = Some(readers);
        watch.alive = readers >= min_readers;
        if watch.alive {
            watch.idle_polls = 0;
            return false;
        }
        watch.idle_polls += 1;
        debug!(path = %path.display(), readers, idle_polls = watch.idle_polls, "log file idle");
        watch.idle_polls >= grace_polls
    }

    async fn release(&mut self, path: &Path) {
        if let Some(mut watch) = self.watches.remove(path) {
            if let Err(e) = watch.handle.terminate().await {
                warn!(path = %path.display(), error = ?e, "failed to stop log reader");
            }
            info!(path = %path.display(), readers = ?watch.last_reader_count, "released abandoned log file");
        }
        self.released.insert(path.to_path_buf());
    }

    fn discover(&self) -> Vec<PathBuf> {
        let entries = match glob::glob(&self.config.log_pattern) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(pattern = %self.config.log_pattern, error = %e, "invalid log pattern");
                return Vec::new();
            }
        };
        let mut found: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|path| path.is_file())
            .filter(|path| !self.watches.contains_key(path) && !self.released.contains(path))
            .collect();
        found.sort();
        found
    }
}
