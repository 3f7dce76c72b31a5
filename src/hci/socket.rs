//! Non-blocking framed transport over the raw HCI management-channel socket.

use std::{
    io::{Error, ErrorKind, Result},
    mem::size_of,
    os::unix::io::AsRawFd,
};
use tokio::io::{unix::AsyncFd, ReadBuf};

use crate::sock::{self, OwnedFd, SysSockAddr};
use crate::sys::{sockaddr_hci, BTPROTO_HCI, HCI_CHANNEL_CONTROL, HCI_DEV_NONE};

struct HciSockAddr {
    dev: u16,
    channel: u16,
}

impl SysSockAddr for HciSockAddr {
    type SysSockAddr = sockaddr_hci;

    fn into_sys_sock_addr(self) -> Self::SysSockAddr {
        sockaddr_hci { hci_family: libc::AF_BLUETOOTH as _, hci_dev: self.dev, hci_channel: self.channel }
    }

    fn try_from_sys_sock_addr(addr: Self::SysSockAddr) -> Result<Self> {
        Ok(Self { dev: addr.hci_dev, channel: addr.hci_channel })
    }
}

/// A single mgmt frame: `{opcode, controller-index, length, payload}`, all little-endian.
#[derive(Clone, Debug)]
pub(crate) struct Frame {
    pub code: u16,
    pub index: u16,
    pub payload: Vec<u8>,
}

const HEADER_LEN: usize = size_of::<u16>() * 3;

impl Frame {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.code.to_le_bytes());
        buf.extend_from_slice(&self.index.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::new(ErrorKind::InvalidData, "mgmt frame shorter than header"));
        }
        let code = u16::from_le_bytes([buf[0], buf[1]]);
        let index = u16::from_le_bytes([buf[2], buf[3]]);
        let length = u16::from_le_bytes([buf[4], buf[5]]) as usize;
        let payload = buf.get(HEADER_LEN..HEADER_LEN + length)
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "mgmt frame shorter than declared length"))?
            .to_vec();
        Ok(Self { code, index, payload })
    }
}

/// A bound, non-blocking `AF_BLUETOOTH`/`BTPROTO_HCI` socket on `HCI_CHANNEL_CONTROL`.
pub(crate) struct ManagementSocket {
    fd: AsyncFd<OwnedFd>,
}

impl ManagementSocket {
    pub(crate) fn open() -> Result<Self> {
        let raw = sock::socket(libc::AF_BLUETOOTH, libc::SOCK_RAW, BTPROTO_HCI)?;
        sock::bind(&raw, HciSockAddr { dev: HCI_DEV_NONE, channel: HCI_CHANNEL_CONTROL })?;
        Ok(Self { fd: AsyncFd::new(raw)? })
    }

    pub(crate) async fn send(&self, frame: &Frame) -> Result<()> {
        let buf = frame.encode();
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| sock::send(inner.get_ref(), &buf, 0)) {
                Ok(result) => return result.map(|_| ()),
                Err(_would_block) => continue,
            }
        }
    }

    pub(crate) async fn recv(&self) -> Result<Frame> {
        let mut storage = [0u8; 1024];
        loop {
            let mut guard = self.fd.readable().await?;
            let mut buf = ReadBuf::new(&mut storage);
            match guard.try_io(|inner| sock::recv(inner.get_ref(), &mut buf, 0)) {
                Ok(Ok(_)) => return Frame::decode(buf.filled()),
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
    }

    #[allow(dead_code)]
    pub(crate) fn as_raw_fd(&self) -> i32 {
        self.fd.get_ref().as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_wire_encoding() {
        let frame = Frame { code: 0x0005, index: 0, payload: vec![0x01] };
        let encoded = frame.encode();
        assert_eq!(encoded, vec![0x05, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01]);
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.code, frame.code);
        assert_eq!(decoded.index, frame.index);
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn frame_decode_rejects_truncated_header() {
        assert!(Frame::decode(&[0x00, 0x01]).is_err());
    }
}
