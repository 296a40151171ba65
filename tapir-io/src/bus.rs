use std::time::{Duration, Instant};

use tracing::debug;

use crate::{
    Error, Result, SpaceHex, Transport, bits,
    frame::{self, ACK_LEN, ECHO_LEN, READ_REPLY_LEN, WRITE_LEN},
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Register access as seen by peripheral drivers.
///
/// Transfer timeouts are chosen by the implementor.
pub trait RegisterAccess {
    fn read(&mut self, address: u32) -> impl Future<Output = Result<u32>>;

    fn write(&mut self, address: u32, value: u32) -> impl Future<Output = Result<()>>;

    /// Write every `(address, value)` pair in one round trip.
    fn write_batch(&mut self, pairs: &[(u32, u32)]) -> impl Future<Output = Result<()>>;

    /// Replace the bits selected by `mask` with `value`. Not atomic.
    fn read_modify_write(
        &mut self,
        address: u32,
        mask: u32,
        value: u32,
    ) -> impl Future<Output = Result<()>>;

    /// Fill `buf` from a streaming register.
    fn read_stream(&mut self, address: u32, buf: &mut [u8]) -> impl Future<Output = Result<()>>;

    fn write_stream(&mut self, address: u32, data: &[u8]) -> impl Future<Output = Result<()>>;

    /// Wait until `read(address) & mask == expected`. Returns `false` once
    /// `deadline` has passed without a match.
    fn poll(
        &mut self,
        address: u32,
        mask: u32,
        expected: u32,
        deadline: Duration,
    ) -> impl Future<Output = Result<bool>>;
}

/// Register bus over a byte transport.
///
/// Each call is one request/response exchange; a timeout leaves the transport
/// in an unknown state.
pub struct RegisterBus<T> {
    transport: T,
    seq: u8,
    timeout: Duration,
}

impl<T: Transport> RegisterBus<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            seq: 0,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Timeout used by the [`RegisterAccess`] methods.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    fn next_seq(&mut self) -> u8 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    async fn exchange(&mut self, request: &[u8], reply: &mut [u8], timeout: Duration) -> Result<()> {
        debug!(len = request.len(), data = %SpaceHex(request), "send");
        self.transport.send(request, timeout).await?;
        let len = self.transport.recv(reply, timeout).await?;
        debug!(len, data = %SpaceHex(&reply[..len]), "recv");
        if len != reply.len() {
            return Err(Error::protocol(format!(
                "short reply: {len} of {} bytes",
                reply.len()
            )));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn read(&mut self, address: u32, timeout: Duration) -> Result<u32> {
        let seq = self.next_seq();
        let request = frame::encode_read(seq, address)?;
        let mut reply = [0; READ_REPLY_LEN];
        self.exchange(&request, &mut reply, timeout).await?;
        frame::decode_read_response(&reply[ECHO_LEN..])
    }

    #[tracing::instrument(skip(self))]
    pub async fn write(&mut self, address: u32, value: u32, timeout: Duration) -> Result<()> {
        let seq = self.next_seq();
        let request = frame::encode_write(seq, address, value)?;
        let mut reply = [0; ACK_LEN];
        self.exchange(&request, &mut reply, timeout).await?;
        frame::decode_write_ack(&reply)
    }

    /// One send of every write frame, one receive of every ack.
    #[tracing::instrument(skip_all, fields(len = pairs.len()))]
    pub async fn write_batch(&mut self, pairs: &[(u32, u32)], timeout: Duration) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        for &(address, _) in pairs {
            frame::check_address(address)?;
        }
        let mut request = Vec::with_capacity(WRITE_LEN * pairs.len());
        for &(address, value) in pairs {
            let seq = self.next_seq();
            frame::write_write_into(&mut request, seq, address, value)?;
        }
        let mut reply = vec![0; ACK_LEN * pairs.len()];
        self.exchange(&request, &mut reply, timeout).await
    }

    #[tracing::instrument(skip(self, buf), fields(len = buf.len()))]
    pub async fn read_stream(
        &mut self,
        address: u32,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<()> {
        let seq = self.next_seq();
        let request = frame::encode_stream_read(seq, address, buf.len())?;
        let mut reply = vec![0; ECHO_LEN + buf.len()];
        self.exchange(&request, &mut reply, timeout).await?;
        buf.copy_from_slice(frame::decode_stream_read_response(&reply, buf.len())?);
        Ok(())
    }

    #[tracing::instrument(skip(self, data), fields(len = data.len()))]
    pub async fn write_stream(&mut self, address: u32, data: &[u8], timeout: Duration) -> Result<()> {
        let seq = self.next_seq();
        let request = frame::encode_stream_write(seq, address, data)?;
        let mut reply = [0; ACK_LEN];
        self.exchange(&request, &mut reply, timeout).await?;
        frame::decode_write_ack(&reply)
    }

    pub async fn read_modify_write(
        &mut self,
        address: u32,
        mask: u32,
        value: u32,
        timeout: Duration,
    ) -> Result<()> {
        let old = self.read(address, timeout).await?;
        self.write(address, bits::merge_masked(old, mask, value), timeout)
            .await
    }

    /// `deadline` bounds the whole wait. Each read gets the bus timeout or
    /// what is left of `deadline`, whichever is shorter.
    #[tracing::instrument(skip(self))]
    pub async fn poll(
        &mut self,
        address: u32,
        mask: u32,
        expected: u32,
        deadline: Duration,
    ) -> Result<bool> {
        let end = Instant::now() + deadline;
        loop {
            let left = end.saturating_duration_since(Instant::now());
            let timeout = self.timeout.min(left.max(POLL_INTERVAL));
            let value = match self.read(address, timeout).await {
                Ok(value) => value,
                Err(e) if e.is_timeout() && Instant::now() >= end => {
                    debug!("poll expired during read");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            };
            if value & mask == expected {
                return Ok(true);
            }
            if Instant::now() >= end {
                debug!(value, "poll expired");
                return Ok(false);
            }
            smol::Timer::after(POLL_INTERVAL).await;
        }
    }

    /// Fire-and-forget; no reply is awaited.
    #[tracing::instrument(skip(self))]
    pub async fn flush(&mut self, timeout: Duration) -> Result<()> {
        let seq = self.next_seq();
        let request = frame::encode_flush(seq);
        debug!(data = %SpaceHex(&request), "send");
        self.transport.send(&request, timeout).await
    }
}

impl<T: Transport> RegisterAccess for RegisterBus<T> {
    fn read(&mut self, address: u32) -> impl Future<Output = Result<u32>> {
        let timeout = self.timeout;
        RegisterBus::read(self, address, timeout)
    }

    fn write(&mut self, address: u32, value: u32) -> impl Future<Output = Result<()>> {
        let timeout = self.timeout;
        RegisterBus::write(self, address, value, timeout)
    }

    fn write_batch(&mut self, pairs: &[(u32, u32)]) -> impl Future<Output = Result<()>> {
        let timeout = self.timeout;
        RegisterBus::write_batch(self, pairs, timeout)
    }

    fn read_modify_write(
        &mut self,
        address: u32,
        mask: u32,
        value: u32,
    ) -> impl Future<Output = Result<()>> {
        let timeout = self.timeout;
        RegisterBus::read_modify_write(self, address, mask, value, timeout)
    }

    fn read_stream(&mut self, address: u32, buf: &mut [u8]) -> impl Future<Output = Result<()>> {
        let timeout = self.timeout;
        RegisterBus::read_stream(self, address, buf, timeout)
    }

    fn write_stream(&mut self, address: u32, data: &[u8]) -> impl Future<Output = Result<()>> {
        let timeout = self.timeout;
        RegisterBus::write_stream(self, address, data, timeout)
    }

    fn poll(
        &mut self,
        address: u32,
        mask: u32,
        expected: u32,
        deadline: Duration,
    ) -> impl Future<Output = Result<bool>> {
        RegisterBus::poll(self, address, mask, expected, deadline)
    }
}

impl<A: RegisterAccess> RegisterAccess for &mut A {
    fn read(&mut self, address: u32) -> impl Future<Output = Result<u32>> {
        A::read(&mut **self, address)
    }

    fn write(&mut self, address: u32, value: u32) -> impl Future<Output = Result<()>> {
        A::write(&mut **self, address, value)
    }

    fn write_batch(&mut self, pairs: &[(u32, u32)]) -> impl Future<Output = Result<()>> {
        A::write_batch(&mut **self, pairs)
    }

    fn read_modify_write(
        &mut self,
        address: u32,
        mask: u32,
        value: u32,
    ) -> impl Future<Output = Result<()>> {
        A::read_modify_write(&mut **self, address, mask, value)
    }

    fn read_stream(&mut self, address: u32, buf: &mut [u8]) -> impl Future<Output = Result<()>> {
        A::read_stream(&mut **self, address, buf)
    }

    fn write_stream(&mut self, address: u32, data: &[u8]) -> impl Future<Output = Result<()>> {
        A::write_stream(&mut **self, address, data)
    }

    fn poll(
        &mut self,
        address: u32,
        mask: u32,
        expected: u32,
        deadline: Duration,
    ) -> impl Future<Output = Result<bool>> {
        A::poll(&mut **self, address, mask, expected, deadline)
    }
}
