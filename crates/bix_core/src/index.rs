//! The index directory: current baseline, the single writer, and cleanup of
//! superseded generations.
//!
//! Writers in any process serialize on an exclusive `flock` of `<root>/LOCK`
//! held for a whole batch or gc run. Leftover cleanup on open only runs when
//! that lock is free, so opening an index never disturbs a writer.

use crate::auditor::{self, Problem};
use crate::baseline::Baseline;
use crate::config::IndexConfig;
use crate::consts::generation_dir_name;
use crate::dispatch::{Dispatcher, NoDispatch};
use crate::errors::Result;
use crate::manifest::Manifest;
use crate::predicate::{Evaluator, Predicate, Query};
use crate::utils::DirLock;
use crate::writer::{build_generation, Batch};
use arc_swap::ArcSwap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub struct Index {
    root: PathBuf,
    config: IndexConfig,
    /// Readers take a snapshot with `load_full` and keep it for the whole query.
    current: ArcSwap<Baseline>,
    /// Held for the duration of a batch; also serializes gc. Other processes
    /// are kept out by the directory lock.
    manifest: Mutex<Manifest>,
    /// Superseded baselines that may still be held by readers.
    retired: Mutex<Vec<(u64, Weak<Baseline>)>>,
    dispatcher: Arc<dyn Dispatcher>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Index {
    /// Open (or create) the index at `dir` with `config.json` or defaults.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let config = IndexConfig::load(dir)?;
        Self::open_with(dir, config)
    }

    pub fn open_with(dir: impl AsRef<Path>, config: IndexConfig) -> Result<Self> {
        let root = dir.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let manifest = match DirLock::try_exclusive(&root)? {
            Some(_lock) => {
                let manifest = Manifest::load(&root)?;
                remove_unpublished(&root, &manifest)?;
                manifest
            }
            None => {
                tracing::debug!(root = %root.display(), "writer active, leftover cleanup skipped");
                Manifest::load(&root)?
            }
        };

        let baseline = match manifest.current_rec() {
            Some(rec) => Baseline::open(&root, rec)?,
            None => Baseline::empty(),
        };
        tracing::info!(root = %root.display(), generation = baseline.generation(), "index opened");
        Ok(Self {
            root,
            config,
            current: ArcSwap::from_pointee(baseline),
            manifest: Mutex::new(manifest),
            retired: Mutex::new(Vec::new()),
            dispatcher: Arc::new(NoDispatch),
        })
    }

    /// Dispatcher used by custom predicates of later queries.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn root(&self) -> &Path { &self.root }

    pub fn config(&self) -> &IndexConfig { &self.config }

    pub fn current(&self) -> Arc<Baseline> {
        self.current.load_full()
    }

    /// Write `batch` as the next generation and publish it.
    ///
    /// On any error the partial generation is removed and the current
    /// baseline stays as it was.
    pub fn apply(&self, batch: &Batch) -> Result<Arc<Baseline>> {
        if batch.is_empty() {
            return Ok(self.current());
        }
        let mut manifest = lock(&self.manifest);
        let _dir_lock = DirLock::exclusive(&self.root)?;
        let prev = self.refresh(&mut manifest)?;
        let number = manifest.next_number().max(prev.generation() + 1);
        let sync = self.config.fsync;
        let built = build_generation(&self.root, &prev, number, batch, sync)?;

        let mut next = manifest.clone();
        let rec = next.publish(built.number, built.attributes, built.messages).clone();
        let opened = Baseline::open(&self.root, &rec).and_then(|b| next.save_atomic(&self.root, sync).map(|_| b));
        let baseline = match opened {
            Ok(b) => Arc::new(b),
            Err(e) => {
                let _ = fs::remove_dir_all(&built.dir);
                return Err(e);
            }
        };
        *manifest = next;

        self.current.store(baseline.clone());
        lock(&self.retired).push((prev.generation(), Arc::downgrade(&prev)));
        tracing::info!(
            generation = number,
            facts = batch.len(),
            records = built.records_written,
            messages = rec.messages,
            "generation published"
        );
        Ok(baseline)
    }

    /// Adopt what other processes committed since this handle last looked.
    /// Callers hold the manifest mutex and the directory lock.
    fn refresh(&self, manifest: &mut Manifest) -> Result<Arc<Baseline>> {
        let on_disk = Manifest::load(&self.root)?;
        let current = self.current.load_full();
        if on_disk.current.unwrap_or(0) == current.generation() {
            *manifest = on_disk;
            return Ok(current);
        }
        let baseline = Arc::new(match on_disk.current_rec() {
            Some(rec) => Baseline::open(&self.root, rec)?,
            None => Baseline::empty(),
        });
        *manifest = on_disk;
        self.current.store(baseline.clone());
        lock(&self.retired).push((current.generation(), Arc::downgrade(&current)));
        tracing::info!(generation = baseline.generation(), "picked up generation published elsewhere");
        Ok(baseline)
    }

    pub fn evaluator(&self) -> Evaluator {
        Evaluator::new(self.current(), self.dispatcher.clone(), (&self.config).into())
    }

    /// Bind `predicate` to the current baseline.
    pub fn query(&self, predicate: &Predicate) -> Result<Query> {
        Ok(Query::new(predicate.clone()).bind(self.evaluator()))
    }

    /// Parse and bind in one go.
    pub fn query_str(&self, text: &str) -> Result<Query> {
        Ok(Query::parse(text)?.bind(self.evaluator()))
    }

    pub fn audit(&self) -> Vec<Problem> {
        auditor::audit(&self.current())
    }

    /// Delete superseded generations beyond `keep_generations` that no
    /// reader holds any more. Returns the numbers removed.
    ///
    /// Readers in other processes are not tracked; `keep_generations` is
    /// what covers them.
    pub fn gc(&self) -> Result<Vec<u64>> {
        let mut manifest = lock(&self.manifest);
        let _dir_lock = DirLock::exclusive(&self.root)?;
        self.refresh(&mut manifest)?;
        let mut retired = lock(&self.retired);
        retired.retain(|(_, w)| w.strong_count() > 0);
        let held = |n: u64| retired.iter().any(|(g, _)| *g == n);

        let superseded: Vec<u64> = manifest.superseded().iter().map(|g| g.number).collect();
        let keep = self.config.keep_generations.min(superseded.len());
        let candidates = &superseded[..superseded.len() - keep];

        let mut removed = Vec::new();
        let mut next = manifest.clone();
        for &n in candidates {
            if held(n) {
                tracing::debug!(generation = n, "generation still in use, kept");
                continue;
            }
            next.forget(n);
            removed.push(n);
        }
        if removed.is_empty() {
            return Ok(removed);
        }
        // forget first: a crash between the two steps leaves only orphan
        // directories, which the next open removes
        next.save_atomic(&self.root, self.config.fsync)?;
        *manifest = next;
        for &n in &removed {
            let dir = self.root.join(generation_dir_name(n));
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
        }
        tracing::info!(removed = ?removed, "superseded generations removed");
        Ok(removed)
    }
}

/// Drop leftovers of interrupted writers: `.partial` directories and
/// generation directories the manifest does not know. Only safe while holding
/// the directory lock, with `manifest` read under it.
fn remove_unpublished(root: &Path, manifest: &Manifest) -> Result<()> {
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("gen-") {
            continue;
        }
        let known = manifest.generations.iter().any(|g| g.dir.as_os_str() == name.as_str());
        if name.ends_with(".partial") || !known {
            tracing::warn!(dir = %name, "removing unpublished generation");
            fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}
