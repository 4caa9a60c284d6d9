use anyhow::anyhow;
use std::fs::File;
use syscalls::{syscall2, Sysno};

pub(crate) trait FileLock: Sized {
    /// Takes a non-blocking exclusive `flock`, failing if another handle
    /// already owns the file.
    fn lock_exclusive(self) -> anyhow::Result<Self>;
}

#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
impl FileLock for File {
    fn lock_exclusive(self) -> anyhow::Result<Self> {
        let fd = self.as_raw_fd();
        const LOCK_EX: usize = 0x2;
        const LOCK_NB: usize = 0x4;
        let result = unsafe { syscall2(Sysno::flock, fd as usize, LOCK_EX | LOCK_NB) };
        if let Err(err) = result {
            Err(anyhow!("cannot lock file {fd} errno={err}"))
        } else {
            Ok(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    #[test]
    fn test_second_handle_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked");
        let open = || {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .unwrap()
        };
        let first = open().lock_exclusive().unwrap();
        assert!(open().lock_exclusive().is_err());
        drop(first);
        open().lock_exclusive().unwrap();
    }
}
