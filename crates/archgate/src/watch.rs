//! Debounced re-run of the pipeline on file-system change.
//!
//! A poller thread fingerprints the watched tree and sends change batches to
//! the coordinator. The coordinator re-arms a single debounce timer on every
//! batch and runs one synchronous pass when it fires, so bursts collapse into
//! one pass and passes never overlap.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Result;
use crossbeam_channel::{after, bounded, never, select, unbounded, Receiver, RecvTimeoutError, Sender};
use walkdir::WalkDir;

use crate::pipeline::{self, PassSummary, Workspace};
use crate::store::STATE_DIR_NAME;
use crate::util;

type Fingerprint = BTreeMap<String, (Option<SystemTime>, u64)>;

enum Step {
    Stop,
    Changed(usize),
    Fire,
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub dir: PathBuf,
    pub debounce: Duration,
    pub poll: Duration,
    pub max_passes: Option<u64>,
}

impl WatchOptions {
    pub fn from_workspace(ws: &Workspace, dir: Option<PathBuf>, max_passes: Option<u64>) -> Self {
        Self {
            dir: dir.unwrap_or_else(|| ws.root().to_path_buf()),
            debounce: Duration::from_millis(ws.cfg.watch_debounce_ms),
            poll: Duration::from_millis(ws.cfg.watch_poll_ms.max(10)),
            max_passes,
        }
    }
}

fn fingerprint(dir: &Path, excluded: &[String]) -> Fingerprint {
    let mut out = Fingerprint::new();
    let walker = WalkDir::new(dir).into_iter().filter_entry(|e| {
        if e.depth() == 0 || !e.file_type().is_dir() {
            return true;
        }
        let name = e.file_name().to_string_lossy();
        name != STATE_DIR_NAME && !excluded.iter().any(|x| *x == name)
    });
    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        out.insert(
            util::rel_posix(dir, entry.path()),
            (meta.modified().ok(), meta.len()),
        );
    }
    out
}

fn changed(old: &Fingerprint, new: &Fingerprint) -> Vec<String> {
    let mut out: Vec<String> = new
        .iter()
        .filter(|(k, v)| old.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    out.extend(old.keys().filter(|k| !new.contains_key(*k)).cloned());
    out
}

/// Polls until `stop` fires or disconnects, sending each non-empty change set.
pub fn spawn_poller(
    dir: PathBuf,
    excluded: Vec<String>,
    poll: Duration,
    events: Sender<Vec<String>>,
    stop: Receiver<()>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut last = fingerprint(&dir, &excluded);
        loop {
            match stop.recv_timeout(poll) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
            let now = fingerprint(&dir, &excluded);
            let batch = changed(&last, &now);
            last = now;
            if !batch.is_empty() && events.send(batch).is_err() {
                return;
            }
        }
    })
}

/// Runs the coordinator until `stop` fires, the poller dies, or
/// `max_passes` passes have completed. Returns the number of passes.
pub fn run(
    ws: &Workspace,
    opts: &WatchOptions,
    stop: Receiver<()>,
    mut on_pass: impl FnMut(&PassSummary),
) -> Result<u64> {
    let (events_tx, events) = unbounded::<Vec<String>>();
    let (poller_stop_tx, poller_stop) = bounded::<()>(1);
    let poller = spawn_poller(
        opts.dir.clone(),
        ws.cfg.exclude_dirs.clone(),
        opts.poll,
        events_tx,
        poller_stop,
    );
    tracing::info!(dir = %opts.dir.display(), "watching");

    let mut timer: Option<Receiver<Instant>> = None;
    let mut passes = 0u64;
    let result = loop {
        let fire = timer.clone().unwrap_or_else(never);
        let step = select! {
            recv(stop) -> _ => Step::Stop,
            recv(events) -> msg => match msg {
                Ok(batch) => Step::Changed(batch.len()),
                Err(_) => Step::Stop,
            },
            recv(fire) -> _ => Step::Fire,
        };
        match step {
            Step::Stop => break Ok(passes),
            Step::Changed(n) => {
                tracing::debug!(changed = n, "change batch");
                timer = Some(after(opts.debounce));
            }
            Step::Fire => {
                timer = None;
                match pipeline::watch_pass(ws) {
                    Ok(summary) => on_pass(&summary),
                    Err(err) => break Err(err),
                }
                passes += 1;
                if opts.max_passes.is_some_and(|max| passes >= max) {
                    break Ok(passes);
                }
            }
        }
    };

    drop(poller_stop_tx);
    if poller.join().is_err() {
        tracing::warn!("watch poller panicked");
    }
    result
}
