//! Pass the file descriptor of a shared region on to child processes.
//!
//! This follows the systemd socket activation convention. Descriptors are numbered from `3`
//! upwards, their count is in `LISTEN_FDS` and their colon separated names are in
//! `LISTEN_FDNAMES`. A process started this way finds its region by name.
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

mod listenfd;

pub use listenfd::{Error, ListenFd, ListenInit};

/// A raw file descriptor, opened for us by the environment.
///
/// The code does assume to own it and closes it on drop.
pub struct SharedFd {
    fd: RawFd,
}

impl SharedFd {
    /// Import the descriptor passed under `name`, based on the environment variables.
    ///
    /// # Safety
    /// Caller asserts that the environment variables describe file descriptors that are not
    /// owned by any other resource.
    pub unsafe fn from_env(name: &str) -> Result<Self, Error> {
        let listen = ListenFd::new().ok_or_else(|| Error::Missing(name.to_owned()))??;
        Self::from_listen(&listen, name)
    }

    /// Import the descriptor passed under `name`, based on already parsed variables.
    ///
    /// # Safety
    /// See [`SharedFd::from_env`].
    pub unsafe fn from_listen(var: &ListenFd, name: &str) -> Result<Self, Error> {
        let fd = var
            .position(name)
            .ok_or_else(|| Error::Missing(name.to_owned()))?;

        let mut statbuf = unsafe { core::mem::zeroed::<libc::stat>() };
        if -1 == unsafe { libc::fstat(fd, &mut statbuf) } {
            return Err(Error::BadFd);
        }

        Ok(SharedFd { fd })
    }

    /// Convert into a file, handing over ownership of the descriptor.
    pub fn into_file(self) -> File {
        // Safety: we own the descriptor, and `into_raw_fd` relinquishes that ownership.
        unsafe { File::from_raw_fd(self.into_raw_fd()) }
    }

    pub fn into_raw_fd(self) -> RawFd {
        let _this = core::mem::ManuallyDrop::new(self);
        _this.fd
    }
}

impl AsRawFd for SharedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for SharedFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
