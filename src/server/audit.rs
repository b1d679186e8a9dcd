//! Audit log sink.
//!
//! The core only needs the sink interface; the daily-file sink writes one
//! file per calendar day named `YYYYMMDD` in the configured directory, one
//! line per operation: `HH:MM:SS.mmm|user|operation|key=value;…`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use time::OffsetDateTime;

pub trait AuditSink: Send + Sync {
    fn record(&self, user: &str, operation: &str, data: &str);
}

/// Sink for deployments with auditing disabled.
pub struct NullAudit;

impl AuditSink for NullAudit {
    fn record(&self, _user: &str, _operation: &str, _data: &str) {}
}

pub struct DailyFileAudit {
    directory: PathBuf,
    state: Mutex<FileState>,
}

struct FileState {
    date: (i32, u8, u8),
    file: Option<File>,
}

impl DailyFileAudit {
    pub fn new(directory: impl Into<PathBuf>) -> std::io::Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        Ok(DailyFileAudit {
            directory,
            state: Mutex::new(FileState {
                date: (0, 0, 0),
                file: None,
            }),
        })
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
    }
}

impl AuditSink for DailyFileAudit {
    fn record(&self, user: &str, operation: &str, data: &str) {
        let now = Self::now();
        let date = (now.year(), now.month() as u8, now.day());

        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        if state.date != date || state.file.is_none() {
            let filename = format!("{:04}{:02}{:02}", date.0, date.1, date.2);
            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.directory.join(filename))
            {
                Ok(file) => {
                    state.date = date;
                    state.file = Some(file);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cannot open audit file");
                    state.file = None;
                    return;
                }
            }
        }

        if let Some(file) = state.file.as_mut() {
            let line = format!(
                "{:02}:{:02}:{:02}.{:03}|{}|{}|{}\n",
                now.hour(),
                now.minute(),
                now.second(),
                now.millisecond(),
                user,
                operation,
                data
            );
            if let Err(e) = file.write_all(line.as_bytes()) {
                tracing::warn!(error = %e, "cannot write audit entry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_pipe_separated_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let audit = DailyFileAudit::new(dir.path()).expect("audit dir");
        audit.record("mark", "AddResource", "toolId=git;rgURL=repoA;URL=/a.c");
        audit.record("mark", "CreateTag", "from=main;to=t1");

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(name.len(), 8);
        assert!(name.chars().all(|c| c.is_ascii_digit()));

        let contents = std::fs::read_to_string(&entries[0]).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("|mark|AddResource|toolId=git;rgURL=repoA;URL=/a.c"));
        assert!(lines[1].ends_with("|mark|CreateTag|from=main;to=t1"));
    }
}
