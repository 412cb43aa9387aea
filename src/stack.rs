//! On-disk stack of reftables: a `tables.list` manifest naming an ordered
//! sequence of table files in one directory, mutated by lock-protected
//! rename, queried as one merged reference database, and periodically
//! compacted back down to a short stack.
//!
//! Table files are named `<min_update_index>-<max_update_index>` in lowercase
//! hex, twelve digits each, exactly as `format_name` in the source writes
//! them, so directory listings sort the same way the manifest does.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::block_source::FileBlockSource;
use crate::error::{Error, Result};
use crate::merged::MergedTables;
use crate::options::WriteOptions;
use crate::reader::Reader;
use crate::record::{LogRecord, RefRecord};
use crate::writer::Writer;

const LIST_FILE: &str = "tables.list";
const RELOAD_DEADLINE: Duration = Duration::from_secs(3);

pub fn format_name(min_update_index: u64, max_update_index: u64) -> String {
    format!("{min_update_index:012x}-{max_update_index:012x}")
}

pub struct Stack {
    dir: PathBuf,
    opts: WriteOptions,
    names: Vec<String>,
    readers: Vec<Reader>,
    rand_state: u64,
}

impl Stack {
    pub fn open(dir: impl AsRef<Path>, opts: WriteOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut s = Self {
            dir,
            opts,
            names: Vec::new(),
            readers: Vec::new(),
            rand_state: 0x9e3779b97f4a7c15,
        };
        s.reload()?;
        Ok(s)
    }

    fn list_path(&self) -> PathBuf {
        self.dir.join(LIST_FILE)
    }

    fn read_lines(path: &Path) -> Result<Vec<String>> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Re-reads `tables.list` and opens whatever changed. Tolerates a
    /// manifest mid-rewrite by another process: a transient read failure (or
    /// a name that fails to open because a compaction already replaced it)
    /// is retried with jittered backoff up to a three-second deadline. The
    /// first three attempts skip the deadline check entirely — under normal
    /// load a writer's lock/rename pair completes in microseconds, so three
    /// immediate retries clear nearly every transient race before the clock
    /// even starts mattering.
    pub fn reload(&mut self) -> Result<()> {
        let deadline = Instant::now() + RELOAD_DEADLINE;
        let mut attempt = 0u32;
        loop {
            match self.reload_once() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt > 3 && Instant::now() >= deadline {
                        log::warn!("stack reload at {} gave up after {} attempts: {}", self.dir.display(), attempt, e);
                        return Err(e);
                    }
                    log::trace!("stack reload at {} retrying (attempt {}): {}", self.dir.display(), attempt, e);
                    self.sleep_with_jitter(attempt);
                }
            }
        }
    }

    fn sleep_with_jitter(&mut self, attempt: u32) {
        self.rand_state ^= self.rand_state << 13;
        self.rand_state ^= self.rand_state >> 7;
        self.rand_state ^= self.rand_state << 17;
        let frac = (self.rand_state % 1000) as f64 / 1000.0;
        let base_micros = 1000u64 * attempt as u64;
        let micros = base_micros + (base_micros as f64 * frac) as u64 + 100;
        std::thread::sleep(Duration::from_micros(micros));
    }

    fn reload_once(&mut self) -> Result<()> {
        let names = Self::read_lines(&self.list_path())?;
        if names == self.names {
            return Ok(());
        }

        let mut readers = Vec::with_capacity(names.len());
        for name in &names {
            let path = self.dir.join(name);
            let src = FileBlockSource::open(&path)?;
            readers.push(Reader::open(Box::new(src))?);
        }
        for w in readers.windows(2) {
            if w[0].max_update_index() >= w[1].min_update_index() {
                return Err(Error::format("tables.list is not in non-overlapping update_index order"));
            }
        }

        self.names = names;
        self.readers = readers;
        Ok(())
    }

    pub fn next_update_index(&self) -> u64 {
        self.readers.last().map(|r| r.max_update_index() + 1).unwrap_or(1)
    }

    pub fn merged(&self) -> Result<MergedTables<'_>> {
        MergedTables::new(&self.readers)
    }

    pub fn seek_ref(&self, name: &str) -> Result<Option<RefRecord>> {
        self.merged()?.seek_ref(name)?.next_ref()
    }

    pub fn seek_log(&self, name: &str) -> Result<Option<LogRecord>> {
        self.merged()?.seek_log(name)?.next_log()
    }

    /// Appends a new table to the stack atomically. `build` receives a
    /// fresh `Writer` already limited to the single `update_index` assigned
    /// to this addition, and a view of the stack as it stood right before
    /// the lock was taken (for conflict checks against concurrent writers
    /// this process hasn't reloaded yet).
    ///
    /// Mirrors `stack_try_add`: take `tables.list.lock` via create-new,
    /// write the table to a temp file in the same directory, reject with
    /// `Error::Api` if another writer raced ahead of `next_update_index`,
    /// rename temp -> final name, append to the locked list, rename
    /// lock -> `tables.list`, then reload. Every failure path unlinks
    /// whatever of the temp file / lock file it created.
    pub fn add(&mut self, build: impl FnOnce(&mut Writer<File>) -> Result<()>) -> Result<()> {
        let lock_path = self.list_path_with_suffix(".lock");
        let mut lock_file = match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::Lock(format!("{} is held by another writer", lock_path.display())));
            }
            Err(e) => return Err(e.into()),
        };

        let result = self.add_locked(&mut lock_file, build);
        if result.is_err() {
            let _ = fs::remove_file(&lock_path);
        }
        result
    }

    fn add_locked(&mut self, lock_file: &mut File, build: impl FnOnce(&mut Writer<File>) -> Result<()>) -> Result<()> {
        self.reload()?;
        let next_update_index = self.next_update_index();

        let tmp_path = self.dir.join(format!(".tmp-{:012x}-{:x}", next_update_index, std::process::id()));
        let tmp_file = File::create(&tmp_path)?;
        let mut writer = Writer::new(tmp_file, self.opts.clone());
        writer.set_limits(next_update_index, next_update_index);

        if let Err(e) = build(&mut writer) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        let stats = match writer.close() {
            Ok(s) => s,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        };
        if stats.ref_blocks == 0 && stats.log_blocks == 0 {
            // Nothing was written; an empty table would only waste a stack
            // slot, so treat it as a no-op add.
            let _ = fs::remove_file(&tmp_path);
            return Ok(());
        }

        let final_name = format_name(next_update_index, next_update_index);
        let final_path = self.dir.join(&final_name);
        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        let mut contents = String::new();
        for name in &self.names {
            contents.push_str(name);
            contents.push('\n');
        }
        contents.push_str(&final_name);
        contents.push('\n');

        if let Err(e) = lock_file.write_all(contents.as_bytes()).and_then(|_| lock_file.sync_all()) {
            let _ = fs::remove_file(&final_path);
            return Err(e.into());
        }

        fs::rename(self.list_path_with_suffix(".lock"), self.list_path())?;
        self.reload()
    }

    fn list_path_with_suffix(&self, suffix: &str) -> PathBuf {
        let mut s = LIST_FILE.to_string();
        s.push_str(suffix);
        self.dir.join(s)
    }

    /// Full compaction: merges every table in the stack into a single new
    /// table spanning the whole update_index range, replacing the entire
    /// manifest. Unlike `add`, this is meant to be called off the write
    /// path (git's own gc-style maintenance) since it rewrites everything
    /// rather than appending. Mirrors `stack_compact_all`, which is simply
    /// `stack_compact_range(0, stack_len - 1)`.
    pub fn compact_all(&mut self) -> Result<()> {
        self.reload()?;
        if self.readers.len() <= 1 {
            return Ok(());
        }
        self.compact_range(0, self.readers.len() - 1)
    }

    /// Compacts tables `[first, last]` (inclusive, 0-indexed into the
    /// current in-memory stack) into one new table spanning their combined
    /// `update_index` range, leaving tables outside the range untouched.
    ///
    /// Mirrors `stack_compact_range`: take the main lock just long enough to
    /// verify up-to-date-ness and claim one `<name>.lock` per table in the
    /// range, then release the main lock so concurrent `add`s may proceed
    /// while this compaction writes its (possibly large) merged table.
    /// Deletions are elided from the output only when `first == 0` — a
    /// deletion can only be safely dropped once the table that held the
    /// value it shadows is itself being removed; dropping one that shadows
    /// a still-live older table would resurrect the old value.
    pub fn compact_range(&mut self, first: usize, last: usize) -> Result<()> {
        if first >= last {
            return Ok(());
        }
        self.reload()?;
        if last >= self.readers.len() {
            return Err(Error::api("compact_range: last index out of bounds"));
        }
        log::debug!("compacting tables {}..={} of {} in {}", first, last, self.names.len(), self.dir.display());

        let lock_path = self.list_path_with_suffix(".lock");
        let _main_lock = match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::Lock(format!("{} is held by another writer", lock_path.display())));
            }
            Err(e) => return Err(e.into()),
        };

        let mut sub_locks: Vec<PathBuf> = Vec::new();
        let result = self.compact_range_inner(first, last, &lock_path, &mut sub_locks);

        for lock in &sub_locks {
            let _ = fs::remove_file(lock);
        }
        if result.is_err() {
            let _ = fs::remove_file(&lock_path);
        }
        result
    }

    fn compact_range_inner(&mut self, first: usize, last: usize, lock_path: &Path, sub_locks: &mut Vec<PathBuf>) -> Result<()> {
        for name in &self.names[first..=last] {
            let sub_lock = self.dir.join(format!("{name}.lock"));
            match OpenOptions::new().write(true).create_new(true).open(&sub_lock) {
                Ok(_) => sub_locks.push(sub_lock),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    return Err(Error::Lock(format!("{} is held by another compactor", sub_lock.display())));
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Release the main lock: sub-table locks alone keep this range safe
        // from a concurrent compactor, and adds may now proceed while the
        // (possibly slow) merged write below runs.
        fs::remove_file(lock_path)?;

        let min = self.readers[first].min_update_index();
        let max = self.readers[last].max_update_index();
        let tmp_path = self.dir.join(format!(".tmp-compact-{min:012x}-{:x}", std::process::id()));
        let tmp_file = File::create(&tmp_path)?;
        let mut writer = Writer::new(tmp_file, self.opts.clone());
        writer.set_limits(min, max);

        let write_result = (|| -> Result<()> {
            let merged = MergedTables::new(&self.readers[first..=last])?;
            let mut it = merged.seek_ref_with_deletions("")?;
            while let Some(rec) = it.next_ref()? {
                if first == 0 && rec.is_deletion() {
                    continue;
                }
                writer.add_ref(&rec)?;
            }
            writer.close()?;
            Ok(())
        })();
        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        let final_name = format_name(min, max);
        let final_path = self.dir.join(&final_name);
        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        let mut lock_file = match OpenOptions::new().write(true).create_new(true).open(lock_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&final_path);
                return Err(Error::Lock(format!("{} is held by another writer", lock_path.display())));
            }
            Err(e) => {
                let _ = fs::remove_file(&final_path);
                return Err(e.into());
            }
        };

        let mut contents = String::new();
        for name in &self.names[..first] {
            contents.push_str(name);
            contents.push('\n');
        }
        contents.push_str(&final_name);
        contents.push('\n');
        for name in &self.names[last + 1..] {
            contents.push_str(name);
            contents.push('\n');
        }

        if let Err(e) = lock_file.write_all(contents.as_bytes()).and_then(|_| lock_file.sync_all()) {
            let _ = fs::remove_file(&final_path);
            return Err(e.into());
        }

        let replaced: Vec<PathBuf> = self.names[first..=last].iter().map(|n| self.dir.join(n)).collect();
        fs::rename(lock_path, self.list_path())?;

        for path in replaced {
            let _ = fs::remove_file(path);
        }
        self.reload()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RefValue;

    #[test]
    fn format_name_is_lowercase_hex_ranges() {
        assert_eq!(format_name(0, 0), "000000000000-000000000000");
        assert_eq!(format_name(1, 255), "000000000001-0000000000ff");
    }

    #[test]
    fn add_then_seek_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let mut stack = Stack::open(tmp.path(), WriteOptions::default()).unwrap();

        stack
            .add(|w| {
                w.add_ref(&RefRecord {
                    ref_name: "refs/heads/main".into(),
                    update_index: w.min_update_index(),
                    value: RefValue::Direct { value: vec![9; 20] },
                })
            })
            .unwrap();

        let rec = stack.seek_ref("refs/heads/main").unwrap().unwrap();
        assert_eq!(rec.value, RefValue::Direct { value: vec![9; 20] });
        assert_eq!(stack.next_update_index(), 2);
    }

    #[test]
    fn second_add_shadows_first() {
        let tmp = tempfile::tempdir().unwrap();
        let mut stack = Stack::open(tmp.path(), WriteOptions::default()).unwrap();

        for b in [1u8, 2u8] {
            stack
                .add(|w| {
                    w.add_ref(&RefRecord {
                        ref_name: "refs/heads/main".into(),
                        update_index: w.min_update_index(),
                        value: RefValue::Direct { value: vec![b; 20] },
                    })
                })
                .unwrap();
        }

        let rec = stack.seek_ref("refs/heads/main").unwrap().unwrap();
        assert_eq!(rec.value, RefValue::Direct { value: vec![2; 20] });
    }

    #[test]
    fn compaction_preserves_latest_values() {
        let tmp = tempfile::tempdir().unwrap();
        let mut stack = Stack::open(tmp.path(), WriteOptions::default()).unwrap();
        for b in [1u8, 2u8, 3u8] {
            stack
                .add(|w| {
                    w.add_ref(&RefRecord {
                        ref_name: "refs/heads/main".into(),
                        update_index: w.min_update_index(),
                        value: RefValue::Direct { value: vec![b; 20] },
                    })
                })
                .unwrap();
        }
        stack.compact_all().unwrap();
        assert_eq!(stack.names.len(), 1);
        let rec = stack.seek_ref("refs/heads/main").unwrap().unwrap();
        assert_eq!(rec.value, RefValue::Direct { value: vec![3; 20] });
    }

    #[test]
    fn compact_range_leaves_tables_outside_range_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let mut stack = Stack::open(tmp.path(), WriteOptions::default()).unwrap();
        for (name, b) in [("refs/heads/a", 1u8), ("refs/heads/b", 2u8), ("refs/heads/c", 3u8)] {
            stack
                .add(|w| {
                    w.add_ref(&RefRecord {
                        ref_name: name.into(),
                        update_index: w.min_update_index(),
                        value: RefValue::Direct { value: vec![b; 20] },
                    })
                })
                .unwrap();
        }
        assert_eq!(stack.names.len(), 3);

        stack.compact_range(0, 1).unwrap();
        // Tables 0 and 1 fold into one; table 2 (refs/heads/c) is untouched.
        assert_eq!(stack.names.len(), 2);
        assert_eq!(
            stack.seek_ref("refs/heads/a").unwrap().unwrap().value,
            RefValue::Direct { value: vec![1; 20] }
        );
        assert_eq!(
            stack.seek_ref("refs/heads/b").unwrap().unwrap().value,
            RefValue::Direct { value: vec![2; 20] }
        );
        assert_eq!(
            stack.seek_ref("refs/heads/c").unwrap().unwrap().value,
            RefValue::Direct { value: vec![3; 20] }
        );
    }

    #[test]
    fn compact_range_elides_deletions_only_at_base() {
        let tmp = tempfile::tempdir().unwrap();
        let mut stack = Stack::open(tmp.path(), WriteOptions::default()).unwrap();
        stack
            .add(|w| {
                w.add_ref(&RefRecord {
                    ref_name: "refs/heads/main".into(),
                    update_index: w.min_update_index(),
                    value: RefValue::Direct { value: vec![1; 20] },
                })
            })
            .unwrap();
        stack
            .add(|w| {
                w.add_ref(&RefRecord {
                    ref_name: "refs/heads/main".into(),
                    update_index: w.min_update_index(),
                    value: RefValue::Deletion,
                })
            })
            .unwrap();

        // Compacting the whole stack (first == 0) drops the deletion along
        // with the value it shadows: the ref is simply gone.
        stack.compact_range(0, 1).unwrap();
        assert_eq!(stack.names.len(), 1);
        assert!(stack.seek_ref("refs/heads/main").unwrap().is_none());
    }
}
