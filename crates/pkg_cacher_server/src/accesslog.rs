//! The access log (§6 "Access log format"): `time|pid|client|status|size|basename`,
//! one line per served request, under a write lock on the log handle (§4.6,
//! §5 "Access log & error log ... line-atomic").

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::Path;

/// An append-only, line-atomic writer for the access log.
pub struct AccessLog {
    file: Mutex<File>,
    pid: u32,
}

impl AccessLog {
    /// Opens (creating if needed) `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> io::Result<AccessLog> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(AccessLog {
            file: Mutex::new(file),
            pid: std::process::id(),
        })
    }

    /// Writes one line: `time|pid|client|status|size|basename`.
    pub fn record(&self, client: IpAddr, status: &str, size: u64, basename: &str) -> io::Result<()> {
        let line = format!(
            "{}|{}|{client}|{status}|{size}|{basename}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%z"),
            self.pid,
        );
        let mut file = self.file.lock();
        file.write_all(line.as_bytes())
    }
}
