//! Fd-passing handoff protocol — socket-pair creation, ancillary
//! file-descriptor transfer, and completion handshake.
//!
//! Grounded on `handoff.c`/`handoff.h`: `SCM_RIGHTS` ancillary data
//! over a one-byte payload, a fixed 16-byte completion token
//! `HANDOFF_COMPLETE\n`, up to 32 fds per message, and a Unix
//! `SOCK_STREAM` socketpair as the channel.

use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags,
};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;
use thiserror::Error;

pub const MAX_FDS_PER_MSG: usize = 32;
pub const HANDOFF_FD: RawFd = 4;
pub const HANDOFF_FD_ENV: &str = "HANDOFF_FD";
pub const HANDOFF_COMPLETE_MSG: &[u8] = b"HANDOFF_COMPLETE\n";

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("too many file descriptors to transfer in one message (max {MAX_FDS_PER_MSG})")]
    TooManyFds,
    #[error("handoff completion token not received within timeout")]
    Timeout,
    #[error("handoff completion token mismatch")]
    BadToken,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Errno(#[from] nix::Error),
}

/// One endpoint of a handoff channel.
pub struct HandoffChannel {
    socket: OwnedFd,
}

impl HandoffChannel {
    /// Creates a connected pair of channel endpoints.
    pub fn create_pair() -> Result<(HandoffChannel, HandoffChannel), HandoffError> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )?;
        Ok((HandoffChannel { socket: a }, HandoffChannel { socket: b }))
    }

    pub fn from_raw(fd: OwnedFd) -> Self {
        Self { socket: fd }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }

    /// Sends up to `MAX_FDS_PER_MSG` file descriptors as `SCM_RIGHTS`
    /// ancillary data on a one-byte payload.
    pub fn send_fds(&self, fds: &[RawFd]) -> Result<(), HandoffError> {
        if fds.len() > MAX_FDS_PER_MSG {
            return Err(HandoffError::TooManyFds);
        }
        let payload = [b'X'; 1];
        let iov = [std::io::IoSlice::new(&payload)];
        let cmsg = [ControlMessage::ScmRights(fds)];
        sendmsg::<()>(self.fd().as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)?;
        Ok(())
    }

    /// Receives file descriptors, truncating to `max_count` if more
    /// arrive than the caller can hold (and logging the truncation).
    pub fn recv_fds(&self, max_count: usize) -> Result<Vec<RawFd>, HandoffError> {
        let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS_PER_MSG]);
        let mut payload = [0u8; 1];
        let mut iov = [std::io::IoSliceMut::new(&mut payload)];

        let msg = recvmsg::<()>(
            self.fd().as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )?;

        let mut received = Vec::new();
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                received.extend(fds);
            }
        }

        if received.len() > max_count {
            tracing::warn!(
                received = received.len(),
                max = max_count,
                "truncating received file descriptors"
            );
            received.truncate(max_count);
        }

        Ok(received)
    }

    /// Writes the fixed completion token.
    pub fn send_complete(&self) -> Result<(), HandoffError> {
        use std::io::Write;
        let mut stream: UnixStream = unsafe {
            use std::os::fd::FromRawFd;
            UnixStream::from_raw_fd(nix::unistd::dup(self.fd().as_raw_fd())?)
        };
        stream.write_all(HANDOFF_COMPLETE_MSG)?;
        Ok(())
    }

    /// Waits up to `timeout` for the completion token, validating its
    /// exact bytes. Any other byte sequence, or a timeout, is an
    /// error.
    pub async fn wait_complete(&self, timeout: Duration) -> Result<(), HandoffError> {
        let raw = nix::unistd::dup(self.fd().as_raw_fd())?;
        let std_stream = unsafe {
            use std::os::fd::FromRawFd;
            std::os::unix::net::UnixStream::from_raw_fd(raw)
        };
        std_stream.set_nonblocking(true)?;
        let stream = tokio::net::UnixStream::from_std(std_stream)?;

        let mut buf = [0u8; HANDOFF_COMPLETE_MSG.len()];
        let read = tokio::time::timeout(timeout, async {
            use tokio::io::AsyncReadExt;
            let mut s = stream;
            s.read_exact(&mut buf).await
        })
        .await
        .map_err(|_| HandoffError::Timeout)?;

        read?;
        if buf == HANDOFF_COMPLETE_MSG {
            Ok(())
        } else {
            Err(HandoffError::BadToken)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_transfer_round_trips() {
        let (a, b) = HandoffChannel::create_pair().unwrap();
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();

        a.send_fds(&[fd]).unwrap();
        let received = b.recv_fds(MAX_FDS_PER_MSG).unwrap();
        assert_eq!(received.len(), 1);
    }

    #[test]
    fn too_many_fds_rejected() {
        let (a, _b) = HandoffChannel::create_pair().unwrap();
        let fds = vec![0 as RawFd; MAX_FDS_PER_MSG + 1];
        assert!(matches!(a.send_fds(&fds), Err(HandoffError::TooManyFds)));
    }

    #[tokio::test]
    async fn completion_token_round_trips() {
        let (a, b) = HandoffChannel::create_pair().unwrap();
        a.send_complete().unwrap();
        b.wait_complete(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn completion_token_times_out_with_no_sender() {
        let (_a, b) = HandoffChannel::create_pair().unwrap();
        let result = b.wait_complete(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(HandoffError::Timeout)));
    }
}
