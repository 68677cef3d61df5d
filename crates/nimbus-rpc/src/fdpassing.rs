//! File-descriptor passing over UNIX-domain sockets.
//!
//! Each handoff is one sendmsg carrying a small tag string in the
//! data bytes and the descriptors as SCM_RIGHTS ancillary data. The
//! receiver dispatches on the tag. Ownership of the descriptors
//! transfers with the message.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tokio::io::Interest;
use tokio::net::UnixStream;

/// Handoff tags.
pub const TAG_EAT_FROM_FD: &str = "eatFromFD";
pub const TAG_FEED_TO_FD: &str = "feedToFD";
pub const TAG_REDIRECT_STDOUT: &str = "redirectStdout";
pub const TAG_REDIRECT_STDERR: &str = "redirectStderr";

/// Most descriptors one message may carry.
pub const MAX_FDS: usize = 8;

const MAX_TAG: usize = 255;

/// Send `fds` tagged with `tag`. The descriptors stay owned by the
/// caller; the kernel duplicates them into the receiver.
pub async fn send_fds(stream: &UnixStream, tag: &str, fds: &[RawFd]) -> io::Result<()> {
    if tag.len() > MAX_TAG {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "tag too long"));
    }
    if fds.is_empty() || fds.len() > MAX_FDS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "must pass between 1 and MAX_FDS descriptors",
        ));
    }
    loop {
        stream.writable().await?;
        match stream.try_io(Interest::WRITABLE, || {
            sendmsg_fds(stream.as_raw_fd(), tag.as_bytes(), fds)
        }) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Receive one tagged handoff; the returned descriptors are owned.
pub async fn recv_fds(stream: &UnixStream) -> io::Result<(String, Vec<OwnedFd>)> {
    loop {
        stream.readable().await?;
        match stream.try_io(Interest::READABLE, || recvmsg_fds(stream.as_raw_fd())) {
            Ok(result) => return Ok(result),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

fn sendmsg_fds(socket: RawFd, tag: &[u8], fds: &[RawFd]) -> io::Result<()> {
    let mut payload = Vec::with_capacity(1 + tag.len());
    payload.push(tag.len() as u8);
    payload.extend_from_slice(tag);

    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };
    let fd_bytes = mem::size_of_val(fds);
    let mut cmsg_buf = vec![0u8; unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_buf.len();

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as _;
        std::ptr::copy_nonoverlapping(
            fds.as_ptr().cast::<u8>(),
            libc::CMSG_DATA(cmsg),
            fd_bytes,
        );
        if libc::sendmsg(socket, &msg, 0) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn recvmsg_fds(socket: RawFd) -> io::Result<(String, Vec<OwnedFd>)> {
    let mut payload = [0u8; 1 + MAX_TAG];
    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast(),
        iov_len: payload.len(),
    };
    let cmsg_space =
        unsafe { libc::CMSG_SPACE((MAX_FDS * mem::size_of::<RawFd>()) as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_buf.len();

    let n = unsafe { libc::recvmsg(socket, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed during fd handoff",
        ));
    }

    let tag_len = payload[0] as usize;
    if n as usize != 1 + tag_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "fd handoff message was split",
        ));
    }
    let tag = String::from_utf8_lossy(&payload[1..1 + tag_len]).into_owned();

    let mut fds = Vec::new();
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let count = data_len / mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..count {
                    fds.push(OwnedFd::from_raw_fd(std::ptr::read_unaligned(data.add(i))));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    Ok((tag, fds))
}
