//! A sequenced, reliable, message-preserving bidirectional link between the
//! two endpoints. Each channel message carries exactly one frame; the shim
//! creates the socketpair before spawning the helper, which inherits its end
//! as a numeric fd on the command line.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::frame::{Frame, FRAME_CAPACITY};
use super::{BridgeError, BridgeResult};

/// One end of a bridge channel. The underlying socket is closed on drop;
/// sends and receives are serialised by the owning context's mutex, not here.
#[derive(Debug)]
pub struct BridgeChannel {
    fd: RawFd,
}

impl BridgeChannel {
    /// Create a connected channel pair. The second half is meant to be
    /// inherited by the helper process.
    pub fn pair() -> io::Result<(BridgeChannel, BridgeChannel)> {
        let mut fds = [0 as RawFd; 2];
        // SOCK_SEQPACKET keeps message boundaries, so one write is one frame
        // and partial reads cannot occur.
        if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0, fds.as_mut_ptr()) }
            != 0
        {
            return Err(io::Error::last_os_error());
        }

        let a = BridgeChannel { fd: fds[0] };
        let b = BridgeChannel { fd: fds[1] };
        a.grow_buffers()?;
        b.grow_buffers()?;

        Ok((a, b))
    }

    /// Adopt a channel end inherited across `exec`, as the host agent does
    /// with the fds from its command line.
    ///
    /// # Safety
    ///
    /// `fd` must be an open `SOCK_SEQPACKET` socket that nothing else owns.
    pub unsafe fn from_raw_fd(fd: RawFd) -> io::Result<Self> {
        let channel = BridgeChannel { fd };
        channel.grow_buffers()?;
        Ok(channel)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Allow this end to survive `exec` so the helper can inherit it.
    pub fn clear_cloexec(&self) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(self.fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    // The default socket buffers on some systems are smaller than a full
    // audio frame; a message that does not fit would fail with EMSGSIZE.
    fn grow_buffers(&self) -> io::Result<()> {
        let size = FRAME_CAPACITY as libc::c_int;
        for opt in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
            if unsafe {
                libc::setsockopt(
                    self.fd,
                    libc::SOL_SOCKET,
                    opt,
                    &size as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            } != 0
            {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Write one frame as one channel message.
    pub fn send(&self, frame: &Frame) -> BridgeResult<()> {
        let bytes = frame.bytes();
        loop {
            let written =
                unsafe { libc::write(self.fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
            if written == bytes.len() as isize {
                return Ok(());
            }
            if written < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(BridgeError::Io(err));
            }
            // A seqpacket write is all-or-nothing; anything else means the
            // frame exceeded the socket limits.
            return Err(BridgeError::BadFrame("short channel write"));
        }
    }

    /// Block until one message arrives and read it into `frame`. A read of
    /// zero bytes means the peer closed its end.
    pub fn recv(&self, frame: &mut Frame) -> BridgeResult<()> {
        let buf = frame.recv_buf();
        loop {
            let read =
                unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if read > 0 {
                return frame.commit_read(read as usize);
            }
            if read == 0 {
                return Err(BridgeError::Closed);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(BridgeError::Io(err));
            }
        }
    }

    /// Wait up to `timeout` for a message to become readable. Returns false
    /// on timeout; this is how the endpoint idle loops interleave their
    /// cooperative stop checks.
    pub fn poll_readable(&self, timeout: Duration) -> BridgeResult<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

        loop {
            let ready = unsafe { libc::poll(&mut pfd, 1, millis) };
            if ready > 0 {
                // POLLHUP still needs the read to observe the zero-byte EOF
                return Ok(pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0);
            }
            if ready == 0 {
                return Ok(false);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(BridgeError::Io(err));
            }
        }
    }
}

impl Drop for BridgeChannel {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::frame::Cmd;

    #[test]
    fn messages_preserve_boundaries_and_content() {
        let (a, b) = BridgeChannel::pair().unwrap();

        let mut first = Frame::request(Cmd::EffectDispatch);
        first.set_tag(2);
        first.set_call_data(b"one");
        let mut second = Frame::request(Cmd::GetParameter);
        second.set_tag(4);

        a.send(&first).unwrap();
        a.send(&second).unwrap();

        let mut received = Frame::new();
        b.recv(&mut received).unwrap();
        assert_eq!(received.tag(), 2);
        assert_eq!(received.cmd().unwrap(), Cmd::EffectDispatch);
        assert_eq!(received.call_data(), b"one");

        b.recv(&mut received).unwrap();
        assert_eq!(received.tag(), 4);
        assert_eq!(received.cmd().unwrap(), Cmd::GetParameter);
    }

    #[test]
    fn peer_close_is_detected() {
        let (a, b) = BridgeChannel::pair().unwrap();
        drop(a);

        let mut frame = Frame::new();
        assert!(matches!(b.recv(&mut frame), Err(BridgeError::Closed)));
    }

    #[test]
    fn poll_times_out_without_traffic() {
        let (_a, b) = BridgeChannel::pair().unwrap();
        assert!(!b.poll_readable(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn poll_reports_pending_message() {
        let (a, b) = BridgeChannel::pair().unwrap();
        a.send(&Frame::request(Cmd::ShowWindow)).unwrap();
        assert!(b.poll_readable(Duration::from_millis(1000)).unwrap());
    }

    #[test]
    fn largest_frame_fits_the_socket() {
        let (a, b) = BridgeChannel::pair().unwrap();

        let mut big = Frame::request(Cmd::ProcessDouble);
        big.set_tag(2);
        big.set_nframes(2048);
        let samples = big.samples_f64_mut(2048 * 8);
        samples[0] = 1.5;
        samples[2048 * 8 - 1] = -2.5;

        a.send(&big).unwrap();

        let mut received = Frame::new();
        b.recv(&mut received).unwrap();
        assert_eq!(received.len(), big.len());
        let samples = received.samples_f64(2048 * 8);
        assert_eq!(samples[0], 1.5);
        assert_eq!(samples[2048 * 8 - 1], -2.5);
    }
}
