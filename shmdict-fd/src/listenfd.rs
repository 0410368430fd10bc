//! Parse the LISTENFD environment variables.
//!
//! Also prepares the variables and descriptors of a child process we hand regions to.
use std::ffi::OsStr;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Command;

pub struct ListenFd {
    pub fd_base: RawFd,
    pub fd_len: RawFd,
    pub names: Vec<String>,
}

/// The descriptors we pass to a child, on top of a `ListenFd` describing them.
pub struct ListenInit {
    pub listen: ListenFd,
    /// Pairs of our descriptor and the number it gets in the child.
    passed: Vec<(RawFd, RawFd)>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("LISTEN_PID does not name this process")]
    BadPid,
    #[error("LISTEN_FDS is not a valid descriptor count, or a descriptor is not open")]
    BadFd,
    #[error("LISTEN_FDNAMES does not name the passed descriptors")]
    BadNames,
    #[error("no descriptor named `{0}` was passed to this process")]
    Missing(String),
}

// https://github.com/systemd/systemd/blob/414ae39821f0c103b076fc5f7432f827e0e79765/src/libsystemd/sd-daemon/sd-daemon.c#L92-L129
impl ListenFd {
    pub const FD_BASE: RawFd = 3;

    pub fn new() -> Option<Result<Self, Error>> {
        let count = std::env::var_os("LISTEN_FDS")?;
        let pid = std::env::var_os("LISTEN_PID");
        let names = std::env::var_os("LISTEN_FDNAMES");

        Some(Self::parse(
            &count,
            pid.as_deref(),
            names.as_deref(),
            std::process::id(),
        ))
    }

    pub(crate) fn parse(
        count: &OsStr,
        pid: Option<&OsStr>,
        names: Option<&OsStr>,
        own_pid: u32,
    ) -> Result<Self, Error> {
        if let Some(pid) = pid {
            let Some(pid) = pid.to_str() else {
                return Err(Error::BadPid);
            };

            let Ok(pid): Result<u32, _> = pid.parse() else {
                return Err(Error::BadPid);
            };

            if pid != own_pid {
                return Err(Error::BadPid);
            }
        }

        let Some(count) = count
            .to_str()
            .and_then(|st| st.parse::<RawFd>().ok())
            .filter(|&count| count >= 0)
        else {
            return Err(Error::BadFd);
        };

        let names: Vec<String> = match names {
            None => Vec::new(),
            Some(names) => {
                // Must be a subset of ASCII.
                let Some(names) = names.to_str() else {
                    return Err(Error::BadNames);
                };

                if names.is_empty() {
                    Vec::new()
                } else {
                    names.split(':').map(String::from).collect()
                }
            }
        };

        if names.len() > count as usize {
            return Err(Error::BadNames);
        }

        Ok(ListenFd {
            fd_base: Self::FD_BASE,
            fd_len: count,
            names,
        })
    }

    /// The descriptor number passed under `name`, if any.
    pub fn position(&self, name: &str) -> Option<RawFd> {
        let num = self.names.iter().position(|v| v == name)?;
        let num = RawFd::try_from(num).ok().filter(|&num| num < self.fd_len)?;
        Some(self.fd_base + num)
    }
}

impl ListenInit {
    pub fn new() -> Self {
        ListenInit {
            listen: ListenFd {
                fd_base: ListenFd::FD_BASE,
                fd_len: 0,
                names: Vec::new(),
            },
            passed: Vec::new(),
        }
    }

    /// Pass `fd` to the child under `name`, returning the number it will have there.
    ///
    /// Passing a name twice replaces the earlier descriptor.
    pub fn pass(&mut self, fd: &impl AsRawFd, name: &str) -> RawFd {
        let rawfd = fd.as_raw_fd();

        if let Some(target) = self.listen.position(name) {
            for entry in self.passed.iter_mut().filter(|(_, t)| *t == target) {
                entry.0 = rawfd;
            }

            return target;
        }

        let target = self.listen.fd_base + self.listen.fd_len;
        self.listen.names.push(name.to_owned());
        self.listen.fd_len += 1;
        self.passed.push((rawfd, target));
        target
    }

    /// Configure the environment and descriptors of `proc`.
    ///
    /// Our descriptors are duplicated onto their targets in the forked child, before `exec`. A
    /// descriptor whose number equals a target of an earlier descriptor gets clobbered, callers
    /// passing several descriptors must avoid that numbering.
    ///
    /// # Safety
    /// All passed descriptors must stay open until the command has been spawned.
    pub unsafe fn wrap_proc(&self, proc: &mut Command) {
        proc.env("LISTEN_FDS", self.listen.fd_len.to_string());
        proc.env("LISTEN_FDNAMES", self.listen.names.join(":"));
        // The pid of the child is not known before the fork.
        proc.env_remove("LISTEN_PID");

        let passed = self.passed.clone();
        unsafe {
            proc.pre_exec(move || {
                for &(rawfd, target) in &passed {
                    if rawfd == target {
                        // We adjust the flags to not close-on-exec.
                        if -1 == libc::fcntl(rawfd, libc::F_SETFD, 0) {
                            return Err(std::io::Error::last_os_error());
                        }
                    } else if -1 == libc::dup2(rawfd, target) {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                Ok(())
            });
        }
    }
}

impl Default for ListenInit {
    fn default() -> Self {
        ListenInit::new()
    }
}
