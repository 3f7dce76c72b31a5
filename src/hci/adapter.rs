//! Management-protocol client: issues mgmt commands and routes mgmt events.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::{Address, Error, ErrorKind, Result};

use super::{
    socket::{Frame, ManagementSocket},
    ControllerInfo, EventCode, Opcode, Settings, Status,
};

/// Observable controller events forwarded to the application for logging purposes.
#[derive(Clone, Debug)]
pub enum ControllerEvent {
    /// The controller's current settings bitfield changed.
    NewSettings(Settings),
    /// A remote device connected.
    DeviceConnected(Address),
    /// A remote device disconnected.
    DeviceDisconnected(Address),
}

struct PendingCommand {
    opcode: u16,
    reply: oneshot::Sender<Result<Vec<u8>>>,
}

/// Client for the Linux kernel Bluetooth management (`mgmt`) protocol.
///
/// Owns the raw `HCI_CHANNEL_CONTROL` socket and a reader task that demultiplexes incoming
/// frames to pending command waiters or to the controller event channel.
pub struct HciAdapter {
    socket: Arc<ManagementSocket>,
    index: u16,
    pending: Arc<Mutex<HashMap<u16, PendingCommand>>>,
    reader: tokio::task::JoinHandle<()>,
}

impl HciAdapter {
    /// Opens the mgmt control socket and starts the background reader task.
    pub async fn open(index: u16, events_tx: mpsc::Sender<ControllerEvent>) -> Result<Self> {
        let socket = Arc::new(ManagementSocket::open().map_err(|err| {
            Error { kind: ErrorKind::ControllerError("failed to open mgmt socket".into()), message: err.to_string() }
        })?);
        let pending: Arc<Mutex<HashMap<u16, PendingCommand>>> = Arc::new(Mutex::new(HashMap::new()));

        let reader = {
            let socket = socket.clone();
            let pending = pending.clone();
            let events_tx = events_tx.clone();
            tokio::spawn(async move {
                loop {
                    match socket.recv().await {
                        Ok(frame) => Self::dispatch(frame, &pending, &events_tx).await,
                        Err(err) => {
                            log::warn!("mgmt socket closed: {}", err);
                            break;
                        }
                    }
                }
            })
        };

        Ok(Self { socket, index, pending, reader })
    }

    async fn dispatch(frame: Frame, pending: &Mutex<HashMap<u16, PendingCommand>>, events_tx: &mpsc::Sender<ControllerEvent>) {
        let Some(code) = EventCode::from_u16(frame.code) else {
            log::debug!("unhandled mgmt opcode 0x{:04x}", frame.code);
            return;
        };
        match code {
            EventCode::CommandComplete => {
                if frame.payload.len() < 3 {
                    return;
                }
                let opcode = u16::from_le_bytes([frame.payload[0], frame.payload[1]]);
                let status = Status(frame.payload[2]);
                let data = frame.payload[3..].to_vec();
                Self::complete(pending, opcode, status, data).await;
            }
            EventCode::CommandStatus => {
                if frame.payload.len() < 3 {
                    return;
                }
                let opcode = u16::from_le_bytes([frame.payload[0], frame.payload[1]]);
                let status = Status(frame.payload[2]);
                Self::complete(pending, opcode, status, Vec::new()).await;
            }
            EventCode::ControllerError => {
                log::warn!("mgmt controller error reported on index {}", frame.index);
            }
            EventCode::NewSettings => {
                if frame.payload.len() < 4 {
                    return;
                }
                let bits = u32::from_le_bytes([
                    frame.payload[0],
                    frame.payload[1],
                    frame.payload[2],
                    frame.payload[3],
                ]);
                let _ = events_tx.send(ControllerEvent::NewSettings(Settings::from_bits(bits))).await;
            }
            EventCode::DeviceConnected => {
                if let Some(addr) = parse_address(&frame.payload) {
                    let _ = events_tx.send(ControllerEvent::DeviceConnected(addr)).await;
                }
            }
            EventCode::DeviceDisconnected => {
                if let Some(addr) = parse_address(&frame.payload) {
                    let _ = events_tx.send(ControllerEvent::DeviceDisconnected(addr)).await;
                }
            }
        }
    }

    async fn complete(pending: &Mutex<HashMap<u16, PendingCommand>>, opcode: u16, status: Status, data: Vec<u8>) {
        let waiter = { pending.lock().await.remove(&opcode) };
        if let Some(PendingCommand { reply, .. }) = waiter {
            let result = if status.is_success() {
                Ok(data)
            } else {
                Err(Error {
                    kind: ErrorKind::ControllerError(format!("command 0x{opcode:04x} failed")),
                    message: status.to_string(),
                })
            };
            let _ = reply.send(result);
        }
    }

    async fn command(&self, opcode: Opcode, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        let opcode = opcode as u16;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(opcode, PendingCommand { opcode, reply: tx });

        let frame = Frame { code: opcode, index: self.index, payload };
        if let Err(err) = self.socket.send(&frame).await {
            self.pending.lock().await.remove(&opcode);
            return Err(Error {
                kind: ErrorKind::ControllerError("failed to send mgmt command".into()),
                message: err.to_string(),
            });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_canceled)) => {
                Err(Error::new(ErrorKind::ControllerError("mgmt reader task stopped".into())))
            }
            Err(_elapsed) => {
                self.pending.lock().await.remove(&opcode);
                Err(Error::new(ErrorKind::Timeout))
            }
        }
    }

    /// Issues `ReadControllerInfo` and parses the reply.
    pub async fn read_controller_info(&self, timeout: Duration) -> Result<ControllerInfo> {
        let data = self.command(Opcode::ReadControllerInfo, Vec::new(), timeout).await?;
        parse_controller_info(&data)
    }

    /// Issues `SetPowered`.
    pub async fn set_powered(&self, on: bool, timeout: Duration) -> Result<()> {
        self.command(Opcode::SetPowered, vec![on as u8], timeout).await.map(drop)
    }

    /// Issues `SetBrEdr`.
    pub async fn set_bredr(&self, on: bool, timeout: Duration) -> Result<()> {
        self.command(Opcode::SetBrEdr, vec![on as u8], timeout).await.map(drop)
    }

    /// Issues `SetLe`.
    pub async fn set_le(&self, on: bool, timeout: Duration) -> Result<()> {
        self.command(Opcode::SetLe, vec![on as u8], timeout).await.map(drop)
    }

    /// Issues `SetConnectable`.
    pub async fn set_connectable(&self, on: bool, timeout: Duration) -> Result<()> {
        self.command(Opcode::SetConnectable, vec![on as u8], timeout).await.map(drop)
    }

    /// Issues `SetBondable`.
    pub async fn set_bondable(&self, on: bool, timeout: Duration) -> Result<()> {
        self.command(Opcode::SetBondable, vec![on as u8], timeout).await.map(drop)
    }

    /// Issues `SetDiscoverable(mode, timeout_secs)`.
    pub async fn set_discoverable(&self, mode: u8, timeout_secs: u16, timeout: Duration) -> Result<()> {
        let mut payload = vec![mode];
        payload.extend_from_slice(&timeout_secs.to_le_bytes());
        self.command(Opcode::SetDiscoverable, payload, timeout).await.map(drop)
    }

    /// Issues `SetLocalName(short, long)`.
    pub async fn set_local_name(&self, short_name: &str, long_name: &str, timeout: Duration) -> Result<()> {
        let mut payload = vec![0u8; 260];
        write_fixed_cstr(&mut payload[0..249], long_name);
        write_fixed_cstr(&mut payload[249..260], short_name);
        self.command(Opcode::SetLocalName, payload, timeout).await.map(drop)
    }

    /// Issues `SetAdvertising(mode)`.
    pub async fn set_advertising(&self, mode: u8, timeout: Duration) -> Result<()> {
        self.command(Opcode::SetAdvertising, vec![mode], timeout).await.map(drop)
    }

    /// Reverses what this process set on the controller (advertising) and shuts the reader task
    /// down. Best-effort: does not itself power off the controller, since other processes may
    /// still depend on it being powered.
    pub async fn close(self) {
        if let Err(err) = self.set_advertising(0x00, DEFAULT_COMMAND_TIMEOUT).await {
            log::warn!("failed to disable advertising during shutdown: {err}");
        }
        self.reader.abort();
    }
}

fn write_fixed_cstr(dest: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(dest.len().saturating_sub(1));
    dest[..n].copy_from_slice(&bytes[..n]);
}

fn parse_address(payload: &[u8]) -> Option<Address> {
    if payload.len() < 6 {
        return None;
    }
    let mut addr = [0u8; 6];
    addr.copy_from_slice(&payload[0..6]);
    addr.reverse();
    Some(Address::new(addr))
}

fn parse_controller_info(data: &[u8]) -> Result<ControllerInfo> {
    if data.len() < 6 + 1 + 2 + 4 + 4 + 3 + 249 + 11 {
        return Err(Error::new(ErrorKind::ControllerError("truncated ReadControllerInfo reply".into())));
    }
    let mut addr = [0u8; 6];
    addr.copy_from_slice(&data[0..6]);
    addr.reverse();

    let version = data[6];
    let manufacturer = u16::from_le_bytes([data[7], data[8]]);
    let supported_settings = Settings::from_bits(u32::from_le_bytes([data[9], data[10], data[11], data[12]]));
    let current_settings = Settings::from_bits(u32::from_le_bytes([data[13], data[14], data[15], data[16]]));
    let class_of_device = [data[17], data[18], data[19]];
    let long_name = read_cstr(&data[20..20 + 249]);
    let short_name = read_cstr(&data[20 + 249..20 + 249 + 11]);

    Ok(ControllerInfo {
        address: Address::new(addr),
        version,
        manufacturer,
        supported_settings,
        current_settings,
        class_of_device,
        short_name,
        long_name,
    })
}

fn read_cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Default timeout for a single mgmt command awaiting its reply.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_cstr_stops_at_nul() {
        let mut buf = [0u8; 8];
        buf[..5].copy_from_slice(b"hello");
        assert_eq!(read_cstr(&buf), "hello");
    }

    #[test]
    fn write_fixed_cstr_truncates_to_dest_len() {
        let mut dest = [0u8; 4];
        write_fixed_cstr(&mut dest, "abcdef");
        assert_eq!(&dest, b"abc\0");
    }

    #[test]
    fn parse_controller_info_rejects_truncated_payload() {
        assert!(parse_controller_info(&[0u8; 4]).is_err());
    }
}
