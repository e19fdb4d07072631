//! Versioned binary encoding of a job set.
//!
//! ```text
//! header:  "JSTR" | version u16 | flags u8 | written_wall_ms i64
//!          | written_elapsed_ms i64 | record_count u32
//! record:  frame_len u32 | body
//! body:    package str16 | user_id u32 | job_id i32 | namespace opt-str16
//!          | tag opt-str16 | persisted u8 | constraints u32 + bytes
//!          | earliest_run time | deadline time
//! time:    tag u8 (0 none, 1 wall clock, 2 elapsed boot) [+ i64]
//! ```
//!
//! All integers are big-endian. Records are sorted by key, so the same set
//! and header always encode to the same bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::clock::{ClockReading, ScheduleTime};
use crate::error::JobStoreError;
use crate::job::{JobKey, JobRecord};

pub const MAGIC: &[u8; 4] = b"JSTR";
pub const FORMAT_VERSION: u16 = 1;

const FLAG_WALL_TRUSTED: u8 = 0b0000_0001;
const HEADER_LEN: usize = 4 + 2 + 1 + 8 + 8 + 4;

const TIME_NONE: u8 = 0;
const TIME_WALL: u8 = 1;
const TIME_ELAPSED: u8 = 2;

/// File-level metadata captured once per write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Whether the wall clock was trusted when the file was written.
    pub wall_clock_trusted: bool,
    /// Wall clock at write time; pairs with `written_elapsed_ms`.
    pub written_wall_ms: i64,
    /// Elapsed boot time at write time.
    pub written_elapsed_ms: i64,
}

impl FileHeader {
    pub fn from_reading(reading: &ClockReading) -> Self {
        Self {
            wall_clock_trusted: reading.wall_trusted,
            written_wall_ms: reading.wall_ms,
            written_elapsed_ms: reading.elapsed_ms,
        }
    }
}

/// Encode the persisted records of `records`, sorted by key.
pub fn encode<'a, I>(records: I, header: &FileHeader) -> Result<Bytes, JobStoreError>
where
    I: IntoIterator<Item = &'a JobRecord>,
{
    let mut persisted: Vec<&JobRecord> = records.into_iter().filter(|r| r.persisted).collect();
    persisted.sort_by(|a, b| a.key.cmp(&b.key));

    let count = u32::try_from(persisted.len())
        .map_err(|_| JobStoreError::Validation("too many records for one file".to_string()))?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + persisted.len() * 64);
    put_header(&mut buf, header, count);
    for record in persisted {
        put_record(&mut buf, record)?;
    }
    Ok(buf.freeze())
}

pub(crate) fn put_header(buf: &mut BytesMut, header: &FileHeader, count: u32) {
    buf.put_slice(MAGIC);
    buf.put_u16(FORMAT_VERSION);
    buf.put_u8(if header.wall_clock_trusted { FLAG_WALL_TRUSTED } else { 0 });
    buf.put_i64(header.written_wall_ms);
    buf.put_i64(header.written_elapsed_ms);
    buf.put_u32(count);
}

/// Check that `record` fits within the field limits of the format.
pub fn check_encodable(record: &JobRecord) -> Result<(), JobStoreError> {
    let key = &record.key;
    let str_len = |value: &str| {
        if value.len() > u16::MAX as usize {
            Err(JobStoreError::Validation(format!(
                "string field on {} exceeds {} bytes",
                key,
                u16::MAX
            )))
        } else {
            Ok(2 + value.len())
        }
    };
    let opt_str_len = |value: Option<&str>| value.map_or(Ok(1), |v| str_len(v).map(|len| 1 + len));
    let time_len = |time: Option<ScheduleTime>| if time.is_some() { 9 } else { 1 };

    if u32::try_from(record.constraints.len()).is_err() {
        return Err(JobStoreError::Validation(format!(
            "constraint blob on {} is too large",
            key
        )));
    }
    let body_len = str_len(&key.package)?
        + 4
        + 4
        + opt_str_len(key.namespace.as_deref())?
        + opt_str_len(record.tag.as_deref())?
        + 1
        + 4
        + record.constraints.len()
        + time_len(record.earliest_run)
        + time_len(record.deadline);
    if u32::try_from(body_len).is_err() {
        return Err(JobStoreError::Validation(format!("record {} is too large", key)));
    }
    Ok(())
}

fn put_record(buf: &mut BytesMut, record: &JobRecord) -> Result<(), JobStoreError> {
    let start = buf.len();
    buf.put_u32(0);

    put_str(buf, &record.key.package, &record.key)?;
    buf.put_u32(record.key.user_id);
    buf.put_i32(record.key.job_id);
    put_opt_str(buf, record.key.namespace.as_deref(), &record.key)?;
    put_opt_str(buf, record.tag.as_deref(), &record.key)?;
    buf.put_u8(1);
    let blob_len = u32::try_from(record.constraints.len()).map_err(|_| {
        JobStoreError::Validation(format!("constraint blob on {} is too large", record.key))
    })?;
    buf.put_u32(blob_len);
    buf.put_slice(&record.constraints);
    put_time(buf, record.earliest_run);
    put_time(buf, record.deadline);

    let body_len = u32::try_from(buf.len() - start - 4)
        .map_err(|_| JobStoreError::Validation(format!("record {} is too large", record.key)))?;
    buf[start..start + 4].copy_from_slice(&body_len.to_be_bytes());
    Ok(())
}

fn put_str(buf: &mut BytesMut, value: &str, key: &JobKey) -> Result<(), JobStoreError> {
    let len = u16::try_from(value.len()).map_err(|_| {
        JobStoreError::Validation(format!("string field on {} exceeds {} bytes", key, u16::MAX))
    })?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_opt_str(buf: &mut BytesMut, value: Option<&str>, key: &JobKey) -> Result<(), JobStoreError> {
    match value {
        Some(value) => {
            buf.put_u8(1);
            put_str(buf, value, key)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

fn put_time(buf: &mut BytesMut, time: Option<ScheduleTime>) {
    match time {
        None => buf.put_u8(TIME_NONE),
        Some(ScheduleTime::WallClock(ms)) => {
            buf.put_u8(TIME_WALL);
            buf.put_i64(ms);
        }
        Some(ScheduleTime::ElapsedBoot(ms)) => {
            buf.put_u8(TIME_ELAPSED);
            buf.put_i64(ms);
        }
    }
}

/// Decode a whole file. Any malformed record fails the entire decode.
pub fn decode(data: Bytes) -> Result<(FileHeader, Vec<JobRecord>), JobStoreError> {
    let (header, frames) = decode_frames(data)?;
    let records = frames
        .into_iter()
        .map(decode_record)
        .collect::<Result<Vec<_>, _>>()?;
    Ok((header, records))
}

/// Validate the header and record framing, returning the raw record bodies.
pub fn decode_frames(mut data: Bytes) -> Result<(FileHeader, Vec<Bytes>), JobStoreError> {
    if data.len() < HEADER_LEN {
        return Err(JobStoreError::Format(format!(
            "file is {} bytes, shorter than the {} byte header",
            data.len(),
            HEADER_LEN
        )));
    }

    if &data[..MAGIC.len()] != MAGIC {
        return Err(JobStoreError::Format("bad magic, not a job store file".to_string()));
    }
    data.advance(MAGIC.len());

    let version = data.get_u16();
    if version != FORMAT_VERSION {
        return Err(JobStoreError::Format(format!(
            "unrecognized format version {} (expected {})",
            version, FORMAT_VERSION
        )));
    }

    let flags = data.get_u8();
    if flags & !FLAG_WALL_TRUSTED != 0 {
        return Err(JobStoreError::Format(format!("unknown header flags {:#04x}", flags)));
    }
    let header = FileHeader {
        wall_clock_trusted: flags & FLAG_WALL_TRUSTED != 0,
        written_wall_ms: data.get_i64(),
        written_elapsed_ms: data.get_i64(),
    };

    let count = data.get_u32() as usize;
    let mut frames = Vec::with_capacity(count.min(data.remaining() / 4));
    for index in 0..count {
        if data.remaining() < 4 {
            return Err(JobStoreError::Format(format!(
                "file truncated at record {} of {}",
                index, count
            )));
        }
        let len = data.get_u32() as usize;
        if data.remaining() < len {
            return Err(JobStoreError::Format(format!(
                "record {} claims {} bytes but only {} remain",
                index,
                len,
                data.remaining()
            )));
        }
        frames.push(data.copy_to_bytes(len));
    }

    if data.has_remaining() {
        return Err(JobStoreError::Format(format!(
            "{} trailing bytes after {} records",
            data.remaining(),
            count
        )));
    }

    Ok((header, frames))
}

/// Decode one record body.
pub fn decode_record(body: Bytes) -> Result<JobRecord, JobStoreError> {
    let mut body = BodyReader(body);

    let package = body.string("package")?;
    let user_id = body.u32("user_id")?;
    let job_id = body.i32("job_id")?;
    let namespace = body.opt_string("namespace")?;
    let tag = body.opt_string("tag")?;

    match body.u8("persisted")? {
        1 => {}
        0 => return Err(malformed("record is not marked persisted")),
        other => return Err(malformed(format!("invalid persisted flag {}", other))),
    }

    let blob_len = body.u32("constraints length")? as usize;
    let constraints = body.bytes(blob_len, "constraints")?;
    let earliest_run = body.time("earliest_run")?;
    let deadline = body.time("deadline")?;

    if body.0.has_remaining() {
        return Err(malformed(format!("{} unread bytes in record", body.0.remaining())));
    }

    let record = JobRecord {
        key: JobKey {
            package,
            user_id,
            job_id,
            namespace,
        },
        constraints,
        earliest_run,
        deadline,
        persisted: true,
        tag,
        seq: 0,
    };
    if record.key.package.is_empty() {
        return Err(malformed("empty package name"));
    }
    Ok(record)
}

fn malformed(reason: impl Into<String>) -> JobStoreError {
    JobStoreError::Format(format!("malformed record: {}", reason.into()))
}

/// Bounds-checked reads over a record body.
struct BodyReader(Bytes);

impl BodyReader {
    fn need(&self, n: usize, field: &str) -> Result<(), JobStoreError> {
        if self.0.remaining() < n {
            return Err(malformed(format!("truncated at {}", field)));
        }
        Ok(())
    }

    fn u8(&mut self, field: &str) -> Result<u8, JobStoreError> {
        self.need(1, field)?;
        Ok(self.0.get_u8())
    }

    fn u16(&mut self, field: &str) -> Result<u16, JobStoreError> {
        self.need(2, field)?;
        Ok(self.0.get_u16())
    }

    fn u32(&mut self, field: &str) -> Result<u32, JobStoreError> {
        self.need(4, field)?;
        Ok(self.0.get_u32())
    }

    fn i32(&mut self, field: &str) -> Result<i32, JobStoreError> {
        self.need(4, field)?;
        Ok(self.0.get_i32())
    }

    fn i64(&mut self, field: &str) -> Result<i64, JobStoreError> {
        self.need(8, field)?;
        Ok(self.0.get_i64())
    }

    fn bytes(&mut self, len: usize, field: &str) -> Result<Bytes, JobStoreError> {
        self.need(len, field)?;
        Ok(self.0.copy_to_bytes(len))
    }

    fn string(&mut self, field: &str) -> Result<String, JobStoreError> {
        let len = self.u16(field)? as usize;
        let raw = self.bytes(len, field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| malformed(format!("{} is not UTF-8", field)))
    }

    fn opt_string(&mut self, field: &str) -> Result<Option<String>, JobStoreError> {
        match self.u8(field)? {
            0 => Ok(None),
            1 => self.string(field).map(Some),
            other => Err(malformed(format!("invalid presence byte {} for {}", other, field))),
        }
    }

    fn time(&mut self, field: &str) -> Result<Option<ScheduleTime>, JobStoreError> {
        match self.u8(field)? {
            TIME_NONE => Ok(None),
            TIME_WALL => Ok(Some(ScheduleTime::WallClock(self.i64(field)?))),
            TIME_ELAPSED => Ok(Some(ScheduleTime::ElapsedBoot(self.i64(field)?))),
            other => Err(malformed(format!("unknown clock tag {} for {}", other, field))),
        }
    }
}
