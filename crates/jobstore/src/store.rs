//! The job store.
//!
//! An authoritative in-memory index of jobs, mirrored to disk for the
//! persisted subset. Mutations only mark the store dirty; `flush` writes the
//! whole persisted subset atomically when, and only when, something changed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::iter::FusedIterator;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::codec::{self, FileHeader};
use crate::error::JobStoreError;
use crate::job::{JobKey, JobRecord, JobSet};
use crate::layout::StoreFiles;
use crate::reader::{self, LoadReport};
use crate::writer::DiskWriter;
use jobstore_config::{FileLayout, StoreConfig};

/// What `JobStore::open` found on disk.
#[derive(Debug)]
pub enum LoadOutcome {
    /// No store-owned files existed.
    Fresh,
    /// Files were read into the store.
    Loaded(LoadReport),
    /// Files were unreadable; the store starts empty.
    Discarded(JobStoreError),
}

/// Result of a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing changed since the last write; the disk was not touched.
    Clean,
    /// The persisted subset was written.
    Written { records: usize, files: usize },
}

#[derive(Default)]
struct StoreState {
    jobs: HashMap<JobKey, Arc<JobRecord>>,
    /// user -> package -> keys
    by_user: HashMap<u32, HashMap<String, HashSet<JobKey>>>,
    dirty: bool,
    next_seq: u64,
    generation: u64,
}

impl StoreState {
    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.generation += 1;
    }

    /// Index a record, returning the one it replaced. Does not touch `dirty`.
    fn put(&mut self, mut record: JobRecord) -> Option<Arc<JobRecord>> {
        self.next_seq += 1;
        record.seq = self.next_seq;

        let key = record.key.clone();
        self.by_user
            .entry(key.user_id)
            .or_default()
            .entry(key.package.clone())
            .or_default()
            .insert(key.clone());
        self.jobs.insert(key, Arc::new(record))
    }

    fn insert(&mut self, record: JobRecord) -> Option<Arc<JobRecord>> {
        let persisted = record.persisted;
        let prior = self.put(record);
        if persisted || prior.as_ref().is_some_and(|p| p.persisted) {
            self.mark_dirty();
        }
        prior
    }

    fn remove(&mut self, key: &JobKey) -> Option<Arc<JobRecord>> {
        let removed = self.jobs.remove(key)?;

        if let Some(packages) = self.by_user.get_mut(&key.user_id) {
            if let Some(keys) = packages.get_mut(&key.package) {
                keys.remove(key);
                if keys.is_empty() {
                    packages.remove(&key.package);
                }
            }
            if packages.is_empty() {
                self.by_user.remove(&key.user_id);
            }
        }

        if removed.persisted {
            self.mark_dirty();
        }
        Some(removed)
    }

    fn remove_all(&mut self, keys: Vec<JobKey>) -> usize {
        keys.iter().filter(|key| self.remove(key).is_some()).count()
    }

    fn clear(&mut self) -> usize {
        let count = self.jobs.len();
        self.jobs.clear();
        self.by_user.clear();
        self.mark_dirty();
        count
    }

    fn lookup(&self, keys: impl IntoIterator<Item = JobKey>) -> Vec<Arc<JobRecord>> {
        keys.into_iter()
            .filter_map(|key| self.jobs.get(&key).cloned())
            .collect()
    }
}

/// Lazily filtered iterator over a snapshot of the store.
///
/// The snapshot is taken when the query is made; mutations after that are
/// not observed.
pub struct JobIter {
    snapshot: std::vec::IntoIter<Arc<JobRecord>>,
    predicate: Box<dyn FnMut(&JobRecord) -> bool + Send>,
}

impl Iterator for JobIter {
    type Item = Arc<JobRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let predicate = &mut self.predicate;
        self.snapshot.find(|record| predicate(record))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.snapshot.len()))
    }
}

impl FusedIterator for JobIter {}

impl std::fmt::Debug for JobIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobIter")
            .field("remaining", &self.snapshot.len())
            .finish()
    }
}

/// Persistent job store.
///
/// Shared by `Arc`; every method takes `&self`.
pub struct JobStore {
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    files: StoreFiles,
    writer: DiskWriter,
    state: RwLock<StoreState>,
    /// Held for the duration of a flush.
    flush_gate: Mutex<()>,
    flush_count: AtomicU64,
    changes: watch::Sender<u64>,
}

impl JobStore {
    /// Open the store in `config.storage_dir`, loading whatever is there.
    ///
    /// A file that cannot be parsed is not an error here: the store starts
    /// empty and the reason is returned as `LoadOutcome::Discarded`.
    pub fn open(config: StoreConfig, clock: Arc<dyn Clock>) -> Result<(Self, LoadOutcome), JobStoreError> {
        fs::create_dir_all(&config.storage_dir)?;

        let files = StoreFiles::new(&config.storage_dir, &config.file_name);
        let writer = DiskWriter::new(&config.storage_dir);
        let (changes, _) = watch::channel(0);

        let store = Self {
            config,
            clock,
            files,
            writer,
            state: RwLock::new(StoreState::default()),
            flush_gate: Mutex::new(()),
            flush_count: AtomicU64::new(0),
            changes,
        };

        let outcome = store.load()?;
        Ok((store, outcome))
    }

    fn load(&self) -> Result<LoadOutcome, JobStoreError> {
        let existing = self.files.list_existing()?;
        if existing.is_empty() {
            info!("No job files in {:?}, starting empty", self.files.dir());
            return Ok(LoadOutcome::Fresh);
        }

        let now = self.clock.reading();
        let (set, report) = match reader::read_job_set(&self.files, now.wall_trusted) {
            Ok(loaded) => loaded,
            Err(JobStoreError::Format(msg)) => {
                warn!("Discarding unreadable job store: {}", msg);
                return Ok(LoadOutcome::Discarded(JobStoreError::Format(msg)));
            }
            Err(e) => return Err(e),
        };

        let foreign_layout = existing.iter().any(|file| match self.config.layout {
            FileLayout::Single => file.user.is_some(),
            FileLayout::PerUser => file.user.is_none(),
        });

        let mut state = self.state.write();
        for record in set.into_sorted() {
            state.put(record);
        }
        if foreign_layout {
            debug!("Found job files of another layout, next flush consolidates them");
            state.mark_dirty();
            self.changes.send_replace(state.generation);
        }
        drop(state);

        info!(
            "Loaded {} jobs from {:?} (wall clock trusted: {})",
            report.loaded,
            self.files.dir(),
            now.wall_trusted
        );
        Ok(LoadOutcome::Loaded(report))
    }

    // Run a mutation under the write lock and publish the generation if it
    // made the persisted state dirty.
    fn mutate<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let mut state = self.state.write();
        let before = state.generation;
        let result = f(&mut state);
        if state.generation != before {
            self.changes.send_replace(state.generation);
        }
        result
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Add a job, replacing any job with the same key.
    ///
    /// Returns the replaced job. Replacing a job with one that differs in
    /// `persisted` is rejected.
    pub fn add(&self, record: JobRecord) -> Result<Option<Arc<JobRecord>>, JobStoreError> {
        record.validate()?;

        self.mutate(|state| {
            if let Some(existing) = state.jobs.get(&record.key) {
                if existing.persisted != record.persisted {
                    return Err(JobStoreError::Validation(format!(
                        "{} is already stored with persisted={}",
                        record.key, existing.persisted
                    )));
                }
            }
            debug!("Adding job {}", record.key);
            Ok(state.insert(record))
        })
    }

    /// Remove a job. Removing an absent key is a no-op.
    pub fn remove(&self, key: &JobKey) -> Option<Arc<JobRecord>> {
        let removed = self.mutate(|state| state.remove(key));
        if removed.is_some() {
            debug!("Removed job {}", key);
        }
        removed
    }

    /// Remove every job.
    pub fn clear(&self) -> usize {
        let count = self.mutate(StoreState::clear);
        info!("Cleared {} jobs", count);
        count
    }

    /// Drop the deadline of a job whose deadline has already fired.
    pub fn clear_deadline(&self, key: &JobKey) -> bool {
        self.mutate(|state| {
            let Some(existing) = state.jobs.get(key) else {
                return false;
            };
            if existing.deadline.is_none() {
                return false;
            }

            let mut updated = JobRecord::clone(existing);
            updated.deadline = None;
            let persisted = updated.persisted;
            state.jobs.insert(key.clone(), Arc::new(updated));
            if persisted {
                state.mark_dirty();
            }
            true
        })
    }

    /// Jobs matching `predicate`, evaluated lazily over a snapshot.
    pub fn query<P>(&self, predicate: P) -> JobIter
    where
        P: FnMut(&JobRecord) -> bool + Send + 'static,
    {
        let snapshot: Vec<_> = self.state.read().jobs.values().cloned().collect();
        JobIter {
            snapshot: snapshot.into_iter(),
            predicate: Box::new(predicate),
        }
    }

    pub fn get(&self, key: &JobKey) -> Option<Arc<JobRecord>> {
        self.state.read().jobs.get(key).cloned()
    }

    pub fn contains(&self, key: &JobKey) -> bool {
        self.state.read().jobs.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().jobs.is_empty()
    }

    /// Jobs of one package for one user.
    pub fn get_by_package(&self, package: &str, user_id: u32) -> Vec<Arc<JobRecord>> {
        let state = self.state.read();
        let keys = state
            .by_user
            .get(&user_id)
            .and_then(|packages| packages.get(package))
            .map(|keys| keys.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        state.lookup(keys)
    }

    /// Jobs of every package for one user.
    pub fn get_by_user(&self, user_id: u32) -> Vec<Arc<JobRecord>> {
        let state = self.state.read();
        let keys = state
            .by_user
            .get(&user_id)
            .map(|packages| packages.values().flatten().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        state.lookup(keys)
    }

    pub fn count_for_package(&self, package: &str, user_id: u32) -> usize {
        self.state
            .read()
            .by_user
            .get(&user_id)
            .and_then(|packages| packages.get(package))
            .map_or(0, HashSet::len)
    }

    /// Remove every job of a package for a user, e.g. on uninstall.
    pub fn remove_by_package(&self, package: &str, user_id: u32) -> usize {
        let removed = self.mutate(|state| {
            let keys = state
                .by_user
                .get(&user_id)
                .and_then(|packages| packages.get(package))
                .map(|keys| keys.iter().cloned().collect::<Vec<_>>())
                .unwrap_or_default();
            state.remove_all(keys)
        });
        if removed > 0 {
            info!("Removed {} jobs of {} for user {}", removed, package, user_id);
        }
        removed
    }

    /// Remove every job of a user, e.g. when the user is deleted.
    pub fn remove_by_user(&self, user_id: u32) -> usize {
        let removed = self.mutate(|state| {
            let keys = state
                .by_user
                .get(&user_id)
                .map(|packages| packages.values().flatten().cloned().collect::<Vec<_>>())
                .unwrap_or_default();
            state.remove_all(keys)
        });
        if removed > 0 {
            info!("Removed {} jobs of user {}", removed, user_id);
        }
        removed
    }

    /// Remove jobs of every user not in `users`.
    pub fn retain_users(&self, users: &[u32]) -> usize {
        let removed = self.mutate(|state| {
            let keys = state
                .by_user
                .iter()
                .filter(|(user, _)| !users.contains(user))
                .flat_map(|(_, packages)| packages.values().flatten().cloned())
                .collect();
            state.remove_all(keys)
        });
        if removed > 0 {
            info!("Removed {} jobs of users no longer present", removed);
        }
        removed
    }

    /// Copy of the persisted subset.
    pub fn persisted_set(&self) -> JobSet {
        self.state
            .read()
            .jobs
            .values()
            .filter(|record| record.persisted)
            .map(|record| JobRecord::clone(record))
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    /// Number of flushes that actually wrote to disk.
    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(Ordering::SeqCst)
    }

    /// Receive the change generation each time persisted state becomes dirty.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Write the persisted subset if anything changed since the last write.
    ///
    /// Blocks until the data is durable. Records that exceed the format's
    /// field limits (only reachable through [`Maintenance`]) are left out with
    /// a warning. On failure the store stays dirty. With a single file the
    /// disk is unchanged; with [`FileLayout::PerUser`] each file is replaced
    /// atomically but not the set, so users written before the failing one
    /// already hold the new snapshot.
    pub fn flush(&self) -> Result<FlushOutcome, JobStoreError> {
        self.flush_inner(false)
    }

    /// Same as [`JobStore::flush`].
    pub fn flush_now(&self) -> Result<FlushOutcome, JobStoreError> {
        self.flush()
    }

    fn flush_inner(&self, force: bool) -> Result<FlushOutcome, JobStoreError> {
        let _gate = self.flush_gate.lock();

        let mut snapshot: Vec<Arc<JobRecord>> = Vec::new();
        let mut unencodable = Vec::new();
        {
            let mut state = self.state.write();
            if !state.dirty && !force {
                return Ok(FlushOutcome::Clean);
            }
            state.dirty = false;
            for record in state.jobs.values().filter(|record| record.persisted) {
                match codec::check_encodable(record) {
                    Ok(()) => snapshot.push(record.clone()),
                    Err(e) => unencodable.push(e),
                }
            }
        }
        for e in unencodable {
            warn!("Leaving job out of the snapshot: {}", e);
        }

        match self.write_snapshot(&snapshot) {
            Ok(files) => {
                self.flush_count.fetch_add(1, Ordering::SeqCst);
                info!("Flushed {} jobs to {} file(s)", snapshot.len(), files);
                Ok(FlushOutcome::Written {
                    records: snapshot.len(),
                    files,
                })
            }
            Err(e) => {
                self.state.write().dirty = true;
                warn!("Failed to flush job store: {}", e);
                Err(e)
            }
        }
    }

    fn write_snapshot(&self, snapshot: &[Arc<JobRecord>]) -> Result<usize, JobStoreError> {
        let header = FileHeader::from_reading(&self.clock.reading());
        let mut written = HashSet::new();

        match self.config.layout {
            FileLayout::Single => {
                let data = codec::encode(snapshot.iter().map(Arc::as_ref), &header)?;
                let name = self.files.canonical_name().to_string();
                self.writer.write(&name, &data)?;
                written.insert(name);
            }
            FileLayout::PerUser => {
                let mut by_user: BTreeMap<u32, Vec<&JobRecord>> = BTreeMap::new();
                for record in snapshot {
                    by_user.entry(record.key.user_id).or_default().push(record);
                }
                for (user_id, records) in by_user {
                    let data = codec::encode(records.iter().copied(), &header)?;
                    let name = self.files.user_file_name(user_id);
                    self.writer.write(&name, &data)?;
                    written.insert(name);
                }
            }
        }

        for file in self.files.list_existing()? {
            let name = file.file_name();
            if !written.contains(&name) {
                self.writer.remove(&name)?;
            }
        }
        Ok(written.len())
    }

    /// Read the files currently on disk without touching the store.
    pub fn read_from_disk(&self, rtc_is_good: bool) -> Result<(JobSet, LoadReport), JobStoreError> {
        reader::read_job_set(&self.files, rtc_is_good)
    }

    /// Bulk and unchecked entry points for tooling and tests.
    pub fn maintenance(&self) -> Maintenance<'_> {
        Maintenance { store: self }
    }

    #[cfg(test)]
    pub(crate) fn writer(&self) -> &DiskWriter {
        &self.writer
    }
}

/// Entry points that bypass validation or dirty tracking.
pub struct Maintenance<'a> {
    store: &'a JobStore,
}

impl Maintenance<'_> {
    /// Insert many records under one lock acquisition.
    pub fn bulk_load(&self, records: impl IntoIterator<Item = JobRecord>) -> usize {
        self.store.mutate(|state| {
            let mut count = 0;
            for record in records {
                state.insert(record);
                count += 1;
            }
            count
        })
    }

    /// Insert without validation.
    pub fn insert_unchecked(&self, record: JobRecord) -> Option<Arc<JobRecord>> {
        self.store.mutate(|state| state.insert(record))
    }

    pub fn remove(&self, key: &JobKey) -> Option<Arc<JobRecord>> {
        self.store.mutate(|state| state.remove(key))
    }

    pub fn clear(&self) -> usize {
        self.store.mutate(StoreState::clear)
    }

    /// Write even when the store is clean.
    pub fn write_now(&self) -> Result<FlushOutcome, JobStoreError> {
        self.store.flush_inner(true)
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
