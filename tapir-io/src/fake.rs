//! Simulated hardware for tests.
//!
//! [`FakeDevice`] answers register-bus frames from an in-memory register map.
//! [`FakeControl`] answers vendor control requests from canned replies.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use crate::{ControlChannel, ControlRequest, Error, Result, Transport, frame::Request};

/// An owned copy of a [`Request`], kept for inspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Access {
    Read(u16),
    Write(u16, u32),
    StreamRead(u16, usize),
    StreamWrite(u16, Vec<u8>),
    Flush,
}

#[derive(Default)]
pub struct FakeDevice {
    registers: HashMap<u16, u32>,
    scripted: HashMap<u16, VecDeque<u32>>,
    fifos: HashMap<u16, VecDeque<u8>>,
    written: HashMap<u16, Vec<u8>>,
    pending: Vec<u8>,
    silent: bool,
    truncate_next: Option<usize>,

    /// Every request, in the order it arrived.
    pub log: Vec<Access>,
    /// Length of every `send`.
    pub sends: Vec<usize>,
    /// Buffer length of every `recv`.
    pub recvs: Vec<usize>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: u16) -> u32 {
        self.registers.get(&address).copied().unwrap_or(0)
    }

    pub fn set_register(&mut self, address: u16, value: u32) {
        self.registers.insert(address, value);
    }

    /// Queue values returned by upcoming reads of `address`, before falling
    /// back to the register map.
    pub fn script_reads(&mut self, address: u16, values: impl IntoIterator<Item = u32>) {
        self.scripted.entry(address).or_default().extend(values);
    }

    /// Queue bytes served by stream reads of `address`.
    pub fn fill_fifo(&mut self, address: u16, data: &[u8]) {
        self.fifos.entry(address).or_default().extend(data);
    }

    /// Everything stream-written to `address` so far.
    pub fn stream_written(&self, address: u16) -> &[u8] {
        self.written.get(&address).map_or(&[], Vec::as_slice)
    }

    /// Stop answering; every following `recv` times out.
    pub fn go_silent(&mut self) {
        self.silent = true;
    }

    /// Cut the next reply down to `len` bytes.
    pub fn truncate_next_reply(&mut self, len: usize) {
        self.truncate_next = Some(len);
    }

    fn handle(&mut self, req: Request<'_>) {
        let echo = [req.seq(), req.opcode() as u8];
        match req {
            Request::Read { address, .. } => {
                self.log.push(Access::Read(address));
                let value = self
                    .scripted
                    .get_mut(&address)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or_else(|| self.register(address));
                self.pending.extend_from_slice(&echo);
                self.pending.extend_from_slice(&value.to_le_bytes());
            }
            Request::Write { address, value, .. } => {
                self.log.push(Access::Write(address, value));
                self.registers.insert(address, value);
                self.pending.extend_from_slice(&echo);
            }
            Request::StreamRead { address, len, .. } => {
                let len = usize::from(len);
                self.log.push(Access::StreamRead(address, len));
                self.pending.extend_from_slice(&echo);
                let fifo = self.fifos.entry(address).or_default();
                for _ in 0..len {
                    self.pending.push(fifo.pop_front().unwrap_or(0));
                }
            }
            Request::StreamWrite { address, data, .. } => {
                self.log.push(Access::StreamWrite(address, data.to_vec()));
                self.written.entry(address).or_default().extend_from_slice(data);
                self.pending.extend_from_slice(&echo);
            }
            Request::Flush { .. } => self.log.push(Access::Flush),
        }
    }
}

impl Transport for FakeDevice {
    async fn send(&mut self, data: &[u8], _timeout: Duration) -> Result<()> {
        self.sends.push(data.len());
        let mut rest = data;
        while !rest.is_empty() {
            let (req, r) = Request::parse(rest)?;
            self.handle(req);
            rest = r;
        }
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.recvs.push(buf.len());
        if self.silent || self.pending.is_empty() {
            return Err(Error::Timeout(timeout));
        }
        let mut len = buf.len().min(self.pending.len());
        if let Some(limit) = self.truncate_next.take() {
            len = len.min(limit);
        }
        buf[..len].copy_from_slice(&self.pending[..len]);
        self.pending.clear();
        Ok(len)
    }
}

/// Replies for one vendor request code.
#[derive(Clone, Debug)]
pub enum ControlReply {
    Data(Vec<u8>),
    Fail,
}

#[derive(Default)]
pub struct FakeControl {
    replies: HashMap<u8, ControlReply>,
    short_ack: Option<usize>,

    /// Every control write, with its payload.
    pub writes: Vec<(ControlRequest, Vec<u8>)>,
    /// Every control read request.
    pub reads: Vec<ControlRequest>,
}

impl FakeControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer control reads of `request` with `data`.
    pub fn reply(&mut self, request: u8, data: &[u8]) -> &mut Self {
        self.replies.insert(request, ControlReply::Data(data.to_vec()));
        self
    }

    /// Fail every transfer of `request`.
    pub fn fail(&mut self, request: u8) -> &mut Self {
        self.replies.insert(request, ControlReply::Fail);
        self
    }

    /// Acknowledge one byte less for the control write with this index.
    pub fn short_ack_at(&mut self, index: usize) -> &mut Self {
        self.short_ack = Some(index);
        self
    }

    /// Concatenated payloads of all writes of `request`.
    pub fn payload(&self, request: u8) -> Vec<u8> {
        self.writes
            .iter()
            .filter(|(req, _)| req.request == request)
            .flat_map(|(_, data)| data.iter().copied())
            .collect()
    }
}

impl ControlChannel for FakeControl {
    async fn control_write(
        &mut self,
        req: ControlRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        if let Some(ControlReply::Fail) = self.replies.get(&req.request) {
            return Err(Error::Timeout(timeout));
        }
        let index = self.writes.len();
        self.writes.push((req, data.to_vec()));
        match self.short_ack {
            Some(i) if i == index => Ok(data.len().saturating_sub(1)),
            _ => Ok(data.len()),
        }
    }

    async fn control_read(
        &mut self,
        req: ControlRequest,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.reads.push(req);
        match self.replies.get(&req.request) {
            Some(ControlReply::Data(data)) => {
                let len = buf.len().min(data.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok(len)
            }
            Some(ControlReply::Fail) => Err(Error::Timeout(timeout)),
            None => Err(Error::protocol(format!(
                "request {:#04x} stalled",
                req.request
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;

    const T: Duration = Duration::from_millis(10);

    #[test]
    fn answers_frames() {
        smol::block_on(async {
            let mut dev = FakeDevice::new();
            dev.set_register(0x08, 0x1122_3344);

            let mut frames = frame::encode_read(5, 0x08).unwrap().to_vec();
            frames.extend_from_slice(&frame::encode_write(6, 0x0c, 7).unwrap());
            dev.send(&frames, T).await.unwrap();

            let mut buf = [0; 8];
            assert_eq!(dev.recv(&mut buf, T).await.unwrap(), 8);
            assert_eq!(buf, [5, 0x02, 0x44, 0x33, 0x22, 0x11, 6, 0x01]);
            assert_eq!(dev.register(0x0c), 7);
            assert_eq!(dev.log, [Access::Read(0x08), Access::Write(0x0c, 7)]);

            assert!(dev.recv(&mut buf, T).await.unwrap_err().is_timeout());
        });
    }

    #[test]
    fn control_replies() {
        smol::block_on(async {
            let mut ctrl = FakeControl::new();
            ctrl.reply(0x30, &[0, 1, 2]).fail(0x33);

            let mut buf = [0xff; 16];
            let req = ControlRequest::new(0x30);
            assert_eq!(ctrl.control_read(req, &mut buf, T).await.unwrap(), 3);
            assert_eq!(buf[..4], [0, 1, 2, 0xff]);

            let req = ControlRequest::new(0x33);
            assert!(ctrl.control_read(req, &mut buf, T).await.is_err());
            let req = ControlRequest::new(0x40);
            assert!(ctrl.control_read(req, &mut buf, T).await.is_err());
        });
    }
}
