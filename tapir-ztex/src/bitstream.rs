use std::{
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use memchr::memmem;
use tapir_io::{ControlChannel, Error, Result, reverse_bits_in_place};
use tracing::{debug, info};

use crate::{CONTROL_TIMEOUT, Command, is_configured};

/// The first bytes of an upload are sometimes swallowed by the FX3.
pub const PREFIX_LEN: usize = 512;
/// Bytes per `fpga_send` control transaction.
pub const CHUNK_SIZE: usize = 2048;
/// Control endpoint max packet size. The firmware detects the end of the
/// image by a short final packet.
pub const MAX_PACKET_SIZE: usize = 64;

pub const SYNC_WORD: [u8; 4] = [0xaa, 0x99, 0x55, 0x66];
pub const SYNC_WORD_REVERSED: [u8; 4] = [0x55, 0x99, 0xaa, 0x66];

const CHUNK_TIMEOUT: Duration = Duration::from_millis(1000);

const _: () = assert!(CHUNK_SIZE % MAX_PACKET_SIZE == 0);

/// A configuration image in wire order, ready for upload.
#[derive(Debug, Clone)]
pub struct Bitstream {
    data: Vec<u8>,
    reversed: bool,
    padded: bool,
}

impl Bitstream {
    #[tracing::instrument(skip_all, fields(len = payload.len()))]
    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        let mut data = Vec::with_capacity(PREFIX_LEN + payload.len() + 1);
        data.resize(PREFIX_LEN, 0);
        data.extend_from_slice(payload);

        let normal = memmem::find(&data, &SYNC_WORD);
        let flipped = memmem::find(&data, &SYNC_WORD_REVERSED);
        debug!(?normal, ?flipped, "sync words");
        let reversed = match (normal, flipped) {
            (None, None) => return Err(Error::protocol("sync word missing")),
            (Some(n), Some(f)) => f <= n,
            (Some(_), None) => false,
            (None, Some(_)) => true,
        };
        if reversed {
            reverse_bits_in_place(&mut data);
        }

        let padded = data.len() % MAX_PACKET_SIZE == 0;
        if padded {
            data.push(0);
        }

        Ok(Self {
            data,
            reversed,
            padded,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let payload = std::fs::read(path)?;
        Self::from_bytes(&payload)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the payload bits were reversed to reach wire order.
    pub fn is_reversed(&self) -> bool {
        self.reversed
    }

    /// Whether a trailing zero byte was added for end detection.
    pub fn is_padded(&self) -> bool {
        self.padded
    }

    pub fn chunks(&self) -> std::slice::Chunks<'_, u8> {
        self.data.chunks(CHUNK_SIZE)
    }
}

/// Reset the FPGA, send `bitstream` chunk by chunk, then check that the FPGA
/// came up configured.
///
/// `notify` is advanced by the length of every acknowledged chunk.
#[tracing::instrument(skip_all, fields(len = bitstream.len()))]
pub async fn upload<C: ControlChannel>(
    ctrl: &mut C,
    bitstream: Bitstream,
    notify: Option<&AtomicUsize>,
) -> Result<()> {
    ctrl.control_write(Command::FpgaReset.request(), &[], CONTROL_TIMEOUT)
        .await?;

    for (idx, chunk) in bitstream.chunks().enumerate() {
        let sent = ctrl
            .control_write(Command::FpgaSend.request(), chunk, CHUNK_TIMEOUT)
            .await?;
        if sent != chunk.len() {
            return Err(Error::protocol(format!(
                "chunk {idx}: device took {sent} of {} bytes",
                chunk.len()
            )));
        }
        if let Some(notify) = notify {
            notify.fetch_add(sent, Ordering::Release);
        }
    }
    info!(reversed = bitstream.is_reversed(), "bitstream sent");

    if !is_configured(ctrl).await? {
        return Err(Error::protocol("not configured"));
    }
    info!("FPGA configured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tapir_io::fake::FakeControl;

    use super::*;

    fn image(len: usize, sync: [u8; 4]) -> Vec<u8> {
        let mut payload = vec![0xff; len];
        payload[16..20].copy_from_slice(&sync);
        payload
    }

    #[test]
    fn reversed_marker_only() {
        let mut payload = SYNC_WORD_REVERSED.to_vec();
        payload.extend_from_slice(&[0x01, 0x02, 0x80]);
        let bs = Bitstream::from_bytes(&payload).unwrap();
        assert!(bs.is_reversed());
        assert_eq!(&bs.as_bytes()[..PREFIX_LEN], &[0; PREFIX_LEN]);
        assert_eq!(
            &bs.as_bytes()[PREFIX_LEN..],
            &[0xaa, 0x99, 0x55, 0x66, 0x80, 0x40, 0x01]
        );
    }

    #[test]
    fn normal_marker_first() {
        let mut payload = SYNC_WORD.to_vec();
        payload.extend_from_slice(&SYNC_WORD_REVERSED);
        payload.push(0x01);
        let bs = Bitstream::from_bytes(&payload).unwrap();
        assert!(!bs.is_reversed());
        assert_eq!(&bs.as_bytes()[PREFIX_LEN..], &payload[..]);
    }

    #[test]
    fn reversed_marker_first() {
        let mut payload = SYNC_WORD_REVERSED.to_vec();
        payload.extend_from_slice(&SYNC_WORD);
        let bs = Bitstream::from_bytes(&payload).unwrap();
        assert!(bs.is_reversed());
        assert_eq!(
            &bs.as_bytes()[PREFIX_LEN..],
            &[0xaa, 0x99, 0x55, 0x66, 0x55, 0x99, 0xaa, 0x66]
        );
    }

    #[test]
    fn missing_marker() {
        let err = Bitstream::from_bytes(&[0xff; 100]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(matches!(Bitstream::from_bytes(&[]), Err(Error::Protocol(_))));
    }

    #[test]
    fn pad_rule() {
        // 2048 * 2 total
        let bs = Bitstream::from_bytes(&image(2 * CHUNK_SIZE - PREFIX_LEN, SYNC_WORD)).unwrap();
        assert!(bs.is_padded());
        assert_eq!(bs.len(), 2 * CHUNK_SIZE + 1);
        assert_eq!(bs.as_bytes().last(), Some(&0));

        let bs = Bitstream::from_bytes(&image(2 * CHUNK_SIZE - PREFIX_LEN + 37, SYNC_WORD))
            .unwrap();
        assert!(!bs.is_padded());
        assert_eq!(bs.len(), 2 * CHUNK_SIZE + 37);

        // final partial chunk of 128 bytes
        let bs = Bitstream::from_bytes(&image(CHUNK_SIZE + 128 - PREFIX_LEN, SYNC_WORD)).unwrap();
        assert!(bs.is_padded());

        for len in [1, 63, 100, 4000, 10_000] {
            let bs = Bitstream::from_bytes(&image(len + 20, SYNC_WORD_REVERSED)).unwrap();
            let last = bs.chunks().last().unwrap();
            assert_ne!(last.len() % MAX_PACKET_SIZE, 0, "len {len}");
        }
    }

    #[test]
    fn chunking() {
        let bs = Bitstream::from_bytes(&image(5000, SYNC_WORD)).unwrap();
        let lens: Vec<_> = bs.chunks().map(<[u8]>::len).collect();
        assert_eq!(lens, [2048, 2048, 1416]);
    }

    #[test]
    fn upload_sequence() {
        smol::block_on(async {
            let bs = Bitstream::from_bytes(&image(5000, SYNC_WORD)).unwrap();
            let expected = bs.as_bytes().to_vec();

            let mut ctrl = FakeControl::new();
            ctrl.reply(0x30, &[0]);
            let notify = AtomicUsize::new(0);
            upload(&mut ctrl, bs, Some(&notify)).await.unwrap();

            let codes: Vec<_> = ctrl.writes.iter().map(|(r, _)| r.request).collect();
            assert_eq!(codes, [0x31, 0x32, 0x32, 0x32]);
            assert_eq!(ctrl.payload(0x32), expected);
            assert_eq!(notify.load(Ordering::Acquire), expected.len());
            assert_eq!(ctrl.reads.len(), 1);
        });
    }

    #[test]
    fn upload_short_ack_aborts() {
        smol::block_on(async {
            let bs = Bitstream::from_bytes(&image(5000, SYNC_WORD)).unwrap();
            let mut ctrl = FakeControl::new();
            ctrl.reply(0x30, &[0]).short_ack_at(2);

            let err = upload(&mut ctrl, bs, None).await.unwrap_err();
            assert!(matches!(err, Error::Protocol(_)));
            assert_eq!(ctrl.writes.len(), 3);
            assert!(ctrl.reads.is_empty());
        });
    }

    #[test]
    fn upload_not_configured() {
        smol::block_on(async {
            let bs = Bitstream::from_bytes(&image(100, SYNC_WORD)).unwrap();
            let mut ctrl = FakeControl::new();
            ctrl.reply(0x30, &[1]);
            let err = upload(&mut ctrl, bs, None).await.unwrap_err();
            assert!(matches!(err, Error::Protocol(msg) if msg == "not configured"));
        });
    }

    #[test]
    fn upload_reset_failure() {
        smol::block_on(async {
            let bs = Bitstream::from_bytes(&image(100, SYNC_WORD)).unwrap();
            let mut ctrl = FakeControl::new();
            ctrl.fail(0x31);
            assert!(upload(&mut ctrl, bs, None).await.unwrap_err().is_timeout());
            assert!(ctrl.writes.is_empty());
        });
    }
}
