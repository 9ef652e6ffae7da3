//! Helpers that talk to the modem over its diagnostic and AT channels.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::hw::poll;

/// Diag command asking the CP to reset itself.
pub const RESET_COMMAND: [u8; 2] = [0x7a, 0x0a];

const IMEI_QUERY: &[u8] = b"AT+CGSN\0";
const LOOPBACK_PROBE: &[u8] = b"AT\r";
const DRAIN_CHUNK: usize = 2048;

fn open_nonblocking(path: &Path) -> io::Result<File> {
    loop {
        match OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => continue,
            other => return other,
        }
    }
}

/// Read whatever is buffered without blocking. Returns the byte count.
fn read_available(file: &mut File) -> io::Result<usize> {
    let mut buf = [0u8; DRAIN_CHUNK];
    let mut total = 0;
    loop {
        match file.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => total += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(total),
            Err(e) => return Err(e),
        }
    }
}

/// Query the IMEI over the AT channel. Only the digits of the reply are
/// kept; `None` when nothing arrives within `timeout`.
pub fn read_imei(tty: &Path, timeout: Duration) -> io::Result<Option<String>> {
    let mut file = open_nonblocking(tty)?;
    file.write_all(IMEI_QUERY)?;
    if !poll::readable(file.as_raw_fd(), Some(timeout))? {
        tracing::warn!(tty = %tty.display(), "no imei reply");
        return Ok(None);
    }
    let mut buf = [0u8; 128];
    let n = loop {
        match file.read(&mut buf) {
            Ok(n) => break n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    };
    let imei: String = buf[..n]
        .iter()
        .filter(|b| b.is_ascii_digit())
        .map(|&b| char::from(b))
        .collect();
    Ok(if imei.is_empty() { None } else { Some(imei) })
}

/// Write `AT\r` to the loopback pipe and read it back after `settle`.
/// Returns whether the echo matched.
pub fn loopback_test(dev: &Path, settle: Duration) -> io::Result<bool> {
    let mut file = open_nonblocking(dev)?;
    file.write_all(LOOPBACK_PROBE)?;
    thread::sleep(settle);
    let mut buf = [0u8; 128];
    let n = loop {
        match file.read(&mut buf) {
            Ok(n) => break n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    };
    if n == 0 {
        return Err(io::Error::new(ErrorKind::UnexpectedEof, "loopback returned nothing"));
    }
    Ok(&buf[..n] == LOOPBACK_PROBE)
}

/// Empty the log channel: keep reading until it stays quiet for `idle`.
pub fn drain_log(path: &Path, idle: Duration) -> io::Result<usize> {
    let mut file = open_nonblocking(path)?;
    let mut total = 0;
    while poll::readable(file.as_raw_fd(), Some(idle))? {
        let n = read_available(&mut file)?;
        if n == 0 {
            break;
        }
        total += n;
    }
    tracing::debug!(path = %path.display(), bytes = total, "log channel drained");
    Ok(total)
}

/// Flush the diag channel and send [`RESET_COMMAND`].
pub fn send_reset_command(diag: &Path) -> io::Result<()> {
    let mut file = open_nonblocking(diag)?;
    read_available(&mut file)?;
    let written = file.write(&RESET_COMMAND)?;
    if written != RESET_COMMAND.len() {
        return Err(io::Error::new(
            ErrorKind::WriteZero,
            format!("diag reset: wrote {written} of {} bytes", RESET_COMMAND.len()),
        ));
    }
    tracing::info!(diag = %diag.display(), "diag reset command sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_command_written_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let diag = dir.path().join("diag");
        std::fs::write(&diag, b"stale log bytes").unwrap();
        send_reset_command(&diag).unwrap();
        let contents = std::fs::read(&diag).unwrap();
        assert!(contents.ends_with(&RESET_COMMAND));
    }

    #[test]
    fn missing_diag_is_an_error() {
        assert!(send_reset_command(Path::new("/nonexistent/diag")).is_err());
    }

    #[test]
    fn drain_reads_everything_then_stops() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log");
        std::fs::write(&log, vec![7u8; 5000]).unwrap();
        assert_eq!(drain_log(&log, Duration::from_millis(5)).unwrap(), 5000);
    }

    #[test]
    fn imei_keeps_only_digits() {
        // On a regular file the query overwrites the first eight bytes and
        // the read picks up what follows.
        let dir = tempfile::tempdir().unwrap();
        let tty = dir.path().join("tty");
        std::fs::write(&tty, b"--------\r\n8675309 12\r\nOK\r\n").unwrap();
        let imei = read_imei(&tty, Duration::from_millis(50)).unwrap();
        assert_eq!(imei.as_deref(), Some("867530912"));
    }
}
