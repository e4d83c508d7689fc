//! Subprocess bootstrap: how the control pipes get from envelope to weavelet.
//!
//! The envelope creates two anonymous pipes before spawning the weavelet. The
//! child's ends are inherited across exec and their descriptor numbers are
//! published in environment variables; everything else is close-on-exec.

use crate::control::io::ConnError;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Descriptor the weavelet reads envelope frames from
pub const ENVELOPE_TO_WEAVELET_FD: &str = "WEAVELET_ENVELOPE_TO_WEAVELET_FD";
/// Descriptor the weavelet writes its frames to
pub const WEAVELET_TO_ENVELOPE_FD: &str = "WEAVELET_WEAVELET_TO_ENVELOPE_FD";

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Anonymous pipe with both ends close-on-exec. Returns (read, write).
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn pipe_cloexec() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds has room for the two descriptors pipe2() writes.
    cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    // SAFETY: pipe2() succeeded, so both descriptors are open and owned by us.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Anonymous pipe with both ends close-on-exec. Returns (read, write).
///
/// Not atomic: a fork on another thread between pipe() and fcntl() can leak
/// the descriptors into an unrelated child.
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn pipe_cloexec() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds has room for the two descriptors pipe() writes.
    cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    // SAFETY: pipe() succeeded, so both descriptors are open and owned by us.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in [&read, &write] {
        // SAFETY: fd is a valid open descriptor.
        cvt(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) })?;
    }
    Ok((read, write))
}

/// Both control pipes, as seen by the envelope before spawn.
#[derive(Debug)]
pub struct ControlPipes {
    /// Envelope reads weavelet frames here
    pub parent_reader: OwnedFd,
    /// Envelope writes frames for the weavelet here
    pub parent_writer: OwnedFd,
    /// Inherited by the child: its read end
    pub child_reader: OwnedFd,
    /// Inherited by the child: its write end
    pub child_writer: OwnedFd,
}

impl ControlPipes {
    pub fn new() -> io::Result<Self> {
        let (child_reader, parent_writer) = pipe_cloexec()?;
        let (parent_reader, child_writer) = pipe_cloexec()?;
        Ok(Self {
            parent_reader,
            parent_writer,
            child_reader,
            child_writer,
        })
    }

    /// Arrange for the child's ends to survive exec and be discoverable.
    ///
    /// The child ends must be kept open until `spawn` has returned, then
    /// dropped so the envelope sees EOF when the weavelet exits.
    pub fn configure(&self, cmd: &mut tokio::process::Command) {
        let child_reader = self.child_reader.as_raw_fd();
        let child_writer = self.child_writer.as_raw_fd();
        cmd.env(ENVELOPE_TO_WEAVELET_FD, child_reader.to_string());
        cmd.env(WEAVELET_TO_ENVELOPE_FD, child_writer.to_string());
        // SAFETY: the closure only calls fcntl, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || {
                for fd in [child_reader, child_writer] {
                    cvt(libc::fcntl(fd, libc::F_SETFD, 0))?;
                }
                Ok(())
            });
        }
    }
}

/// Descriptor numbers a weavelet found in its environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bootstrap {
    pub envelope_to_weavelet: RawFd,
    pub weavelet_to_envelope: RawFd,
}

impl Bootstrap {
    /// Read the descriptor numbers from the process environment.
    pub fn from_env() -> Result<Self, ConnError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the descriptor numbers through an arbitrary lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConnError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| -> Result<RawFd, ConnError> {
            let raw = lookup(key)
                .ok_or_else(|| ConnError::Bootstrap(format!("{} not set", key)))?;
            match raw.trim().parse::<RawFd>() {
                Ok(fd) if fd >= 0 => Ok(fd),
                _ => Err(ConnError::Bootstrap(format!(
                    "{}={:?} is not a file descriptor",
                    key, raw
                ))),
            }
        };
        let envelope_to_weavelet = parse(ENVELOPE_TO_WEAVELET_FD)?;
        let weavelet_to_envelope = parse(WEAVELET_TO_ENVELOPE_FD)?;
        if envelope_to_weavelet == weavelet_to_envelope {
            return Err(ConnError::Bootstrap(format!(
                "both control descriptors are {}",
                envelope_to_weavelet
            )));
        }
        Ok(Self {
            envelope_to_weavelet,
            weavelet_to_envelope,
        })
    }

    /// Take ownership of the inherited descriptors as (reader, writer).
    ///
    /// Must be called at most once per process.
    pub fn into_files(self) -> Result<(File, File), ConnError> {
        for fd in [self.envelope_to_weavelet, self.weavelet_to_envelope] {
            // SAFETY: F_GETFD only inspects the descriptor table.
            if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
                return Err(ConnError::Bootstrap(format!(
                    "descriptor {} is not open: {}",
                    fd,
                    io::Error::last_os_error()
                )));
            }
        }
        // SAFETY: both descriptors are open, distinct, and were handed to this
        // process exclusively by the envelope.
        let files = unsafe {
            (
                File::from_raw_fd(self.envelope_to_weavelet),
                File::from_raw_fd(self.weavelet_to_envelope),
            )
        };
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{Read, Write};

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn parses_descriptor_numbers() {
        let boot = Bootstrap::from_lookup(lookup(&[
            (ENVELOPE_TO_WEAVELET_FD, "7"),
            (WEAVELET_TO_ENVELOPE_FD, " 9 "),
        ]))
        .unwrap();
        assert_eq!(boot.envelope_to_weavelet, 7);
        assert_eq!(boot.weavelet_to_envelope, 9);
    }

    #[test]
    fn missing_variable_is_bootstrap_error() {
        let err = Bootstrap::from_lookup(lookup(&[(ENVELOPE_TO_WEAVELET_FD, "7")])).unwrap_err();
        assert!(matches!(err, ConnError::Bootstrap(ref m) if m.contains(WEAVELET_TO_ENVELOPE_FD)));
    }

    #[test]
    fn rejects_garbage_and_duplicates() {
        assert!(Bootstrap::from_lookup(lookup(&[
            (ENVELOPE_TO_WEAVELET_FD, "three"),
            (WEAVELET_TO_ENVELOPE_FD, "4"),
        ]))
        .is_err());
        assert!(Bootstrap::from_lookup(lookup(&[
            (ENVELOPE_TO_WEAVELET_FD, "-1"),
            (WEAVELET_TO_ENVELOPE_FD, "4"),
        ]))
        .is_err());
        assert!(Bootstrap::from_lookup(lookup(&[
            (ENVELOPE_TO_WEAVELET_FD, "5"),
            (WEAVELET_TO_ENVELOPE_FD, "5"),
        ]))
        .is_err());
    }

    #[test]
    fn pipes_connect_parent_and_child_ends() {
        let pipes = ControlPipes::new().unwrap();
        let mut parent_writer = File::from(pipes.parent_writer);
        let mut child_reader = File::from(pipes.child_reader);
        parent_writer.write_all(b"setup").unwrap();
        drop(parent_writer);
        let mut got = String::new();
        child_reader.read_to_string(&mut got).unwrap();
        assert_eq!(got, "setup");

        let mut child_writer = File::from(pipes.child_writer);
        let mut parent_reader = File::from(pipes.parent_reader);
        child_writer.write_all(b"ready").unwrap();
        drop(child_writer);
        let mut got = String::new();
        parent_reader.read_to_string(&mut got).unwrap();
        assert_eq!(got, "ready");
    }

    #[test]
    fn pipe_ends_are_close_on_exec() {
        let pipes = ControlPipes::new().unwrap();
        let flags = unsafe { libc::fcntl(pipes.child_reader.as_raw_fd(), libc::F_GETFD) };
        assert!(flags & libc::FD_CLOEXEC != 0);
    }
}
