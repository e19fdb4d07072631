//! Loading persisted jobs and reconciling their clock domains.
//!
//! A file records whether the wall clock was trusted when it was written,
//! plus the wall/elapsed pair read at that instant. On load this is compared
//! with whether the wall clock is trusted now:
//!
//! | written \ now | trusted                         | untrusted                         |
//! |---------------|---------------------------------|-----------------------------------|
//! | trusted       | wall kept, elapsed → wall       | wall → elapsed, elapsed kept      |
//! | untrusted     | wall unknown (run now), elapsed kept | wall dropped, elapsed kept   |
//!
//! Conversions go through the write-time mapping, so the result depends only
//! on the stored values and the two flags. A conversion that would overflow
//! skips the record like any other malformed one.

use std::fs;
use std::io;
use std::path::Path;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::clock::ScheduleTime;
use crate::codec::{self, FileHeader};
use crate::error::{JobStoreError, ReconciliationWarning};
use crate::job::{JobRecord, JobSet};
use crate::layout::{OwnedFile, StoreFiles};

/// Outcome of reconciling one stored time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// Use this time.
    Keep(ScheduleTime),
    /// The stored time cannot be trusted; treat it as already passed.
    Unknown,
    /// Ignore the stored time for this load.
    Dropped,
    /// Converting between clock domains would overflow.
    OutOfRange,
}

/// Reconcile a stored time given the written-time and current trust flags.
pub fn reconcile_time(time: ScheduleTime, header: &FileHeader, now_trusted: bool) -> Reconciled {
    use ScheduleTime::{ElapsedBoot, WallClock};

    let wall = header.written_wall_ms;
    let elapsed = header.written_elapsed_ms;

    match (header.wall_clock_trusted, now_trusted, time) {
        (true, true, WallClock(t)) => Reconciled::Keep(WallClock(t)),
        (true, true, ElapsedBoot(e)) => convert(e, elapsed, wall)
            .map_or(Reconciled::OutOfRange, |t| Reconciled::Keep(WallClock(t))),
        (true, false, WallClock(t)) => convert(t, wall, elapsed)
            .map_or(Reconciled::OutOfRange, |e| Reconciled::Keep(ElapsedBoot(e))),
        (true, false, ElapsedBoot(e)) => Reconciled::Keep(ElapsedBoot(e)),
        (false, true, WallClock(_)) => Reconciled::Unknown,
        (false, true, ElapsedBoot(e)) => Reconciled::Keep(ElapsedBoot(e)),
        (false, false, WallClock(_)) => Reconciled::Dropped,
        (false, false, ElapsedBoot(e)) => Reconciled::Keep(ElapsedBoot(e)),
    }
}

/// Move `value` from the domain anchored at `from` to the one anchored at `to`.
fn convert(value: i64, from: i64, to: i64) -> Option<i64> {
    value.checked_sub(from)?.checked_add(to)
}

fn resolve(
    time: Option<ScheduleTime>,
    header: &FileHeader,
    now_trusted: bool,
) -> Result<(Option<ScheduleTime>, bool), JobStoreError> {
    match time.map(|t| (t, reconcile_time(t, header, now_trusted))) {
        None | Some((_, Reconciled::Dropped)) => Ok((None, false)),
        Some((_, Reconciled::Keep(t))) => Ok((Some(t), false)),
        Some((_, Reconciled::Unknown)) => Ok((Some(ScheduleTime::IMMEDIATE), true)),
        Some((t, Reconciled::OutOfRange)) => Err(JobStoreError::Format(format!(
            "time {:?} cannot be converted to the current clock domain",
            t
        ))),
    }
}

/// Reconcile both times of a record. Returns whether the record was
/// rescheduled to run immediately, or an error if a time is out of range.
///
/// An unknown deadline also pulls the earliest-run time to "now", so a job
/// never has an earliest-run time after its deadline.
pub fn reconcile_record(
    mut record: JobRecord,
    header: &FileHeader,
    now_trusted: bool,
) -> Result<(JobRecord, bool), JobStoreError> {
    let (earliest_run, earliest_unknown) = resolve(record.earliest_run, header, now_trusted)?;
    let (deadline, deadline_unknown) = resolve(record.deadline, header, now_trusted)?;

    record.earliest_run = if deadline_unknown {
        Some(ScheduleTime::IMMEDIATE)
    } else {
        earliest_run
    };
    record.deadline = deadline;

    Ok((record, earliest_unknown || deadline_unknown))
}

/// Summary of a load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Files read.
    pub files: usize,
    /// Records in the resulting set.
    pub loaded: usize,
    /// Records skipped as malformed.
    pub skipped: usize,
    /// Records whose timing was unknown and now run immediately.
    pub rescheduled: usize,
    /// One entry per skipped record.
    pub warnings: Vec<ReconciliationWarning>,
}

/// Read and reconcile one file.
///
/// Header or framing damage fails the whole file; a damaged record body only
/// skips that record.
pub fn read_file(file: &OwnedFile, now_trusted: bool) -> Result<(Vec<JobRecord>, LoadReport), JobStoreError> {
    let data = fs::read(&file.path)?;
    let (header, frames) = codec::decode_frames(Bytes::from(data)).map_err(|e| match e {
        JobStoreError::Format(msg) => JobStoreError::Format(format!("{:?}: {}", file.path, msg)),
        other => other,
    })?;

    let mut report = LoadReport {
        files: 1,
        ..Default::default()
    };
    let mut records = Vec::with_capacity(frames.len());

    for (index, body) in frames.into_iter().enumerate() {
        let decoded = codec::decode_record(body)
            .and_then(|record| match file.user {
                Some(user) if record.key.user_id != user => Err(JobStoreError::Format(format!(
                    "{} belongs to user {}, not {}",
                    record.key, record.key.user_id, user
                ))),
                _ => Ok(record),
            })
            .and_then(|record| reconcile_record(record, &header, now_trusted));

        match decoded {
            Ok((record, rescheduled)) => {
                if rescheduled {
                    debug!("Job {} has unknown timing, scheduling immediately", record.key);
                    report.rescheduled += 1;
                }
                records.push(record);
            }
            Err(e) => {
                let warning = ReconciliationWarning {
                    file: file.path.clone(),
                    index,
                    reason: e.to_string(),
                };
                warn!("{}", warning);
                report.skipped += 1;
                report.warnings.push(warning);
            }
        }
    }

    report.loaded = records.len();
    Ok((records, report))
}

/// Read every store-owned file into a fresh job set.
pub fn read_job_set(files: &StoreFiles, now_trusted: bool) -> Result<(JobSet, LoadReport), JobStoreError> {
    let mut set = JobSet::new();
    let mut report = LoadReport::default();

    for file in files.list_existing()? {
        let (records, file_report) = match read_file(&file, now_trusted) {
            Ok(loaded) => loaded,
            Err(JobStoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };

        for record in records {
            if set.insert(record).is_some() {
                debug!("Duplicate job in {:?}, keeping the later copy", file.path);
            }
        }
        report.files += file_report.files;
        report.skipped += file_report.skipped;
        report.rescheduled += file_report.rescheduled;
        report.warnings.extend(file_report.warnings);
    }

    report.loaded = set.len();
    if report.files > 0 {
        info!(
            "Read {} jobs from {} file(s) in {:?} ({} skipped, {} rescheduled)",
            report.loaded,
            report.files,
            files.dir(),
            report.skipped,
            report.rescheduled
        );
    }
    Ok((set, report))
}

/// Read a single file path, used when the caller already knows the file.
pub fn read_path(path: &Path, now_trusted: bool) -> Result<(Vec<JobRecord>, LoadReport), JobStoreError> {
    read_file(
        &OwnedFile {
            path: path.to_path_buf(),
            user: None,
        },
        now_trusted,
    )
}
