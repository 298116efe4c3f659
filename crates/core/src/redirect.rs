//! Descriptor-level stdout/stderr capture for worker processes.
//!
//! A registered function may write with `print!`, `eprint!` or through a C
//! library straight to fd 1 and fd 2. In a worker process fd 1 is the output
//! artifact, so that text would land in front of the result bundle.
//! [`StdioCapture`] points both descriptors at anonymous temp files while the
//! function runs and puts the originals back afterwards, also on unwind.
//!
//! Descriptors belong to the whole process. Only capture where one task runs
//! per process; the in-process backend relies on [`Capture`](crate::Capture)
//! alone.

use std::io::{self, Write};

fn flush_std() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

#[cfg(unix)]
mod imp {
    use std::fs::File;
    use std::io::{self, Read, Seek, SeekFrom};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    /// One descriptor pointed at a temp file, with its original saved.
    pub(super) struct Redirected {
        target: RawFd,
        saved: OwnedFd,
        sink: File,
    }

    impl Redirected {
        pub(super) fn start(target: RawFd) -> io::Result<Self> {
            let sink = tempfile::tempfile()?;
            // SAFETY: dup on a descriptor number has no memory effects; the
            // result is checked before ownership is taken.
            let saved = unsafe { libc::dup(target) };
            if saved < 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: `saved` is a fresh descriptor nothing else owns.
            let saved = unsafe { OwnedFd::from_raw_fd(saved) };
            // SAFETY: both descriptors are open for the duration of the call.
            if unsafe { libc::dup2(sink.as_raw_fd(), target) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                target,
                saved,
                sink,
            })
        }

        pub(super) fn restore(&self) -> io::Result<()> {
            // SAFETY: as above; `saved` stays open until `self` drops.
            if unsafe { libc::dup2(self.saved.as_raw_fd(), self.target) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub(super) fn read_back(&mut self) -> io::Result<String> {
            self.sink.seek(SeekFrom::Start(0))?;
            let mut bytes = Vec::new();
            self.sink.read_to_end(&mut bytes)?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }

    pub(super) const STDOUT: RawFd = libc::STDOUT_FILENO;
    pub(super) const STDERR: RawFd = libc::STDERR_FILENO;
}

/// Active redirection of fd 1 and fd 2. Dropping it restores both.
#[cfg(unix)]
pub struct StdioCapture {
    stdout: imp::Redirected,
    stderr: imp::Redirected,
    restored: bool,
}

#[cfg(unix)]
impl StdioCapture {
    pub fn start() -> io::Result<Self> {
        flush_std();
        let stdout = imp::Redirected::start(imp::STDOUT)?;
        let stderr = match imp::Redirected::start(imp::STDERR) {
            Ok(stderr) => stderr,
            Err(e) => {
                let _ = stdout.restore();
                return Err(e);
            }
        };
        Ok(Self {
            stdout,
            stderr,
            restored: false,
        })
    }

    fn restore(&mut self) -> io::Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        flush_std();
        let stdout = self.stdout.restore();
        let stderr = self.stderr.restore();
        stdout.and(stderr)
    }

    /// Restore the original descriptors and return what was written to
    /// them as `(stdout, stderr)`.
    pub fn finish(mut self) -> io::Result<(String, String)> {
        self.restore()?;
        Ok((self.stdout.read_back()?, self.stderr.read_back()?))
    }
}

#[cfg(unix)]
impl Drop for StdioCapture {
    fn drop(&mut self) {
        let _ = self.restore();
    }
}

/// No descriptor capture on this platform; only `Capture` text is kept.
#[cfg(not(unix))]
pub struct StdioCapture;

#[cfg(not(unix))]
impl StdioCapture {
    pub fn start() -> io::Result<Self> {
        flush_std();
        Ok(Self)
    }

    pub fn finish(self) -> io::Result<(String, String)> {
        flush_std();
        Ok((String::new(), String::new()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn raw_write(fd: i32, text: &str) {
        // SAFETY: writes from a live buffer to an open descriptor.
        let written = unsafe { libc::write(fd, text.as_ptr().cast(), text.len()) };
        assert_eq!(written, text.len() as isize);
    }

    #[test]
    fn captures_and_restores_both_descriptors() {
        let capture = StdioCapture::start().unwrap();
        raw_write(libc::STDOUT_FILENO, "to stdout");
        raw_write(libc::STDERR_FILENO, "to stderr");
        let (stdout, stderr) = capture.finish().unwrap();

        assert_eq!(stdout, "to stdout");
        assert_eq!(stderr, "to stderr");

        // A second capture starts from a clean sink.
        let again = StdioCapture::start().unwrap();
        assert_eq!(again.finish().unwrap(), (String::new(), String::new()));
    }
}
