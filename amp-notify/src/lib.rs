//! Blocking wait on a backend-owned event fd (an irq/doorbell fd under
//! bare-metal, a UIO fd under a partitioning hypervisor), with an
//! out-of-band way to unblock the waiter from another thread. The
//! unblock path is a self-pipe: `cancel()` writes a byte, `wait()` polls
//! both fds and returns as soon as either is readable.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

#[derive(Debug)]
pub enum Error {
    Pipe,
    Poll,
    Write,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// the backend's event fd became readable
    Event,
    /// `cancel()` was called while we were waiting
    Cancelled,
}

pub struct Notifier {
    event_fd: OwnedFd,
    cancel_r: OwnedFd,
    cancel_w: OwnedFd,
}

impl Notifier {
    pub fn new(event_fd: OwnedFd) -> Result<Self, Error> {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if ret < 0 {
            return Err(Error::Pipe);
        }
        Ok(Self {
            event_fd,
            cancel_r: unsafe { OwnedFd::from_raw_fd(fds[0]) },
            cancel_w: unsafe { OwnedFd::from_raw_fd(fds[1]) },
        })
    }

    /// Blocks until the event fd is readable or `cancel` unblocks us.
    /// Re-arming a level-triggered backend fd (e.g. a UIO irq count read)
    /// is the backend's responsibility, not this type's.
    pub fn wait(&self) -> Result<Wake, Error> {
        let mut fds = [
            libc::pollfd {
                fd: self.event_fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.cancel_r.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        loop {
            let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Poll);
            }
            if fds[1].revents & libc::POLLIN != 0 {
                let mut buf = [0u8; 64];
                unsafe {
                    libc::read(
                        self.cancel_r.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    );
                }
                return Ok(Wake::Cancelled);
            }
            if fds[0].revents & libc::POLLIN != 0 {
                return Ok(Wake::Event);
            }
        }
    }

    pub fn cancel(&self) -> Result<(), Error> {
        let byte = [1u8];
        let ret = unsafe {
            libc::write(
                self.cancel_w.as_raw_fd(),
                byte.as_ptr() as *const libc::c_void,
                1,
            )
        };
        if ret < 0 {
            return Err(Error::Write);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0i32; 2];
        assert_eq!(
            unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) },
            0
        );
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn cancel_unblocks_wait() {
        let (event_r, _event_w) = pipe_pair();
        let notifier = Arc::new(Notifier::new(event_r).unwrap());
        let n2 = notifier.clone();
        let handle = thread::spawn(move || n2.wait().unwrap());
        thread::sleep(Duration::from_millis(50));
        notifier.cancel().unwrap();
        assert_eq!(handle.join().unwrap(), Wake::Cancelled);
    }

    #[test]
    fn event_fd_wakes_wait() {
        let (event_r, event_w) = pipe_pair();
        let notifier = Notifier::new(event_r).unwrap();
        let ret = unsafe { libc::write(event_w.as_raw_fd(), b"x".as_ptr() as *const _, 1) };
        assert_eq!(ret, 1);
        assert_eq!(notifier.wait().unwrap(), Wake::Event);
    }
}
