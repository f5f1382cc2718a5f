//! macy wire format — the report datagram.
//!
//! These bytes ARE the protocol. Every peer running any version of macy must
//! be able to parse what this module emits.
//!
//! Datagram layout:
//!   [0..4)   header "macy". The case of each letter is a feature bit
//!            (uppercase = set; bits 1, 2, 4, 8 for bytes 0..3).
//!   [4..)    one zstd frame, optionally followed by padding.
//!
//! Uncompressed frame content:
//!   u8 host_len, host bytes
//!   repeated: u8 addr_len, addr bytes, u64 big-endian nanoseconds
//!
//! A record with addr_len == 0 is padding and occupies only its length byte.
//! A partial record at the end of the content is ignored.

use std::io::Read;
use std::num::NonZeroUsize;
use std::time::Duration;

use zstd::zstd_safe::CParameter;

use crate::report::Report;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Datagram header with no feature bits set.
pub const HEADER: &[u8; 4] = b"macy";

/// zstd frame magic number, as it appears on the wire.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Longest host name or address string a record can carry.
pub const MAX_FIELD_LEN: usize = 255;

/// Largest decompressed payload a decoder will produce.
pub const MAX_DECODED_LEN: usize = 1 << 20;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_V4: usize = 65507;

/// Largest UDP payload over IPv6.
pub const MAX_DATAGRAM_V6: usize = 65527;

/// Size of the receive buffer an endpoint needs to hold any datagram.
pub const RECV_BUFFER_LEN: usize = 70000;

const DURATION_LEN: usize = 8;
const SKIPPABLE_MAGIC: u32 = 0x184d_2a50;
const SKIPPABLE_HEADER_LEN: usize = 8;
const BLOCK_HEADER_LEN: usize = 3;

// ── Feature bits ──────────────────────────────────────────────────────────────

/// Protocol feature set carried in the letter case of the header.
///
/// Each bit names one independent protocol feature. A decoder accepts exactly
/// the combinations listed in [`FeatureBits::SUPPORTED`]; an encoder only sets
/// bits for features it actually uses. Today no features exist, so every
/// conforming datagram starts with lowercase "macy".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureBits(u8);

impl FeatureBits {
    pub const NONE: FeatureBits = FeatureBits(0);

    /// Feature combinations this implementation can decode.
    pub const SUPPORTED: &'static [FeatureBits] = &[FeatureBits::NONE];

    /// Read the feature bits from a datagram header.
    ///
    /// Returns None if the first four bytes are not "macy" in any case.
    pub fn from_header(datagram: &[u8]) -> Option<Self> {
        let header = datagram.get(..HEADER.len())?;
        if !header.eq_ignore_ascii_case(HEADER) {
            return None;
        }
        let bits = header
            .iter()
            .zip(HEADER.iter())
            .enumerate()
            .filter(|(_, (&b, &lower))| b == lower.to_ascii_uppercase())
            .fold(0u8, |acc, (i, _)| acc | (1 << i));
        Some(FeatureBits(bits))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_supported(self) -> bool {
        Self::SUPPORTED.contains(&self)
    }

    /// The header bytes announcing this feature set.
    pub fn header(self) -> [u8; 4] {
        let mut out = *HEADER;
        for (i, b) in out.iter_mut().enumerate() {
            if self.0 & (1 << i) != 0 {
                b.make_ascii_uppercase();
            }
        }
        out
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when producing or interpreting a report datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram does not start with a macy header")]
    MalformedHeader,

    #[error("unsupported protocol feature bits: {0:#06b}")]
    UnsupportedVersion(u8),

    #[error("payload is not a zstd frame")]
    UnsupportedCompression,

    #[error("corrupt payload: {0}")]
    CorruptPayload(String),

    #[error("payload truncated before the host name")]
    Truncated,

    #[error("host name is {0} bytes, maximum {}", MAX_FIELD_LEN)]
    HostTooLong(usize),

    #[error("compression failed: {0}")]
    Compression(String),
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Report encoder. Decoding needs no state, see [`decode`].
#[derive(Debug, Clone)]
pub struct Codec {
    level: i32,
    target_size: Option<NonZeroUsize>,
}

impl Codec {
    /// Encoder at the maximum zstd level. With a target size every datagram
    /// that fits is padded to exactly that many bytes.
    pub fn new(target_size: Option<NonZeroUsize>) -> Self {
        Self {
            level: *zstd::compression_level_range().end(),
            target_size,
        }
    }

    /// Encode a report into a complete datagram.
    pub fn encode(&self, report: &Report) -> Result<Vec<u8>, WireError> {
        let payload = encode_payload(report)?;
        let mut frame = self.compress(&payload)?;

        if let Some(size) = self.target_size {
            let target = size.get().saturating_sub(HEADER.len());
            if frame.len() > target {
                tracing::warn!(
                    size = size.get(),
                    unpadded = frame.len() + HEADER.len(),
                    "report exceeds fixed payload size, sending unpadded"
                );
            } else {
                pad_frame(&mut frame, target)?;
            }
        }

        let mut datagram = Vec::with_capacity(HEADER.len() + frame.len());
        datagram.extend_from_slice(&FeatureBits::NONE.header());
        datagram.extend_from_slice(&frame);
        Ok(datagram)
    }

    fn compress(&self, payload: &[u8]) -> Result<Vec<u8>, WireError> {
        let compression = |e: std::io::Error| WireError::Compression(e.to_string());

        let mut compressor = zstd::bulk::Compressor::new(self.level).map_err(compression)?;
        // Padding rewrites the frame, so it must carry neither a checksum
        // nor a content size.
        compressor
            .set_parameter(CParameter::ChecksumFlag(false))
            .map_err(compression)?;
        compressor
            .set_parameter(CParameter::ContentSizeFlag(false))
            .map_err(compression)?;
        compressor
            .set_parameter(CParameter::DictIdFlag(false))
            .map_err(compression)?;
        compressor.compress(payload).map_err(compression)
    }
}

/// Decode a datagram into a report. Never returns a partial report.
pub fn decode(datagram: &[u8]) -> Result<Report, WireError> {
    let features = FeatureBits::from_header(datagram).ok_or(WireError::MalformedHeader)?;
    if !features.is_supported() {
        return Err(WireError::UnsupportedVersion(features.bits()));
    }

    let body = &datagram[HEADER.len()..];
    if body.len() < ZSTD_MAGIC.len() || body[..ZSTD_MAGIC.len()] != ZSTD_MAGIC {
        return Err(WireError::UnsupportedCompression);
    }

    let payload = decompress(body)?;
    decode_payload(&payload)
}

// ── Payload ───────────────────────────────────────────────────────────────────

fn encode_payload(report: &Report) -> Result<Vec<u8>, WireError> {
    let host = report.host.as_bytes();
    if host.len() > MAX_FIELD_LEN {
        return Err(WireError::HostTooLong(host.len()));
    }

    let mut buf = Vec::with_capacity(1 + host.len() + report.heard.len() * 48);
    buf.push(host.len() as u8);
    buf.extend_from_slice(host);

    for (addr, elapsed) in &report.heard {
        let bytes = addr.as_bytes();
        // A zero length would read back as padding.
        if bytes.is_empty() || bytes.len() > MAX_FIELD_LEN {
            tracing::debug!(addr = %addr, len = bytes.len(), "skipping unrepresentable address");
            continue;
        }
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        buf.push(bytes.len() as u8);
        buf.extend_from_slice(bytes);
        buf.extend_from_slice(&nanos.to_be_bytes());
    }

    Ok(buf)
}

fn decode_payload(payload: &[u8]) -> Result<Report, WireError> {
    let (&host_len, rest) = payload.split_first().ok_or(WireError::Truncated)?;
    let host_len = usize::from(host_len);
    if rest.len() < host_len {
        return Err(WireError::Truncated);
    }
    let (host, mut rest) = rest.split_at(host_len);
    let mut report = Report::new(String::from_utf8_lossy(host).into_owned());

    while let Some((&len, tail)) = rest.split_first() {
        let len = usize::from(len);
        if len == 0 {
            rest = tail;
            continue;
        }
        if tail.len() < len + DURATION_LEN {
            break;
        }
        let (addr, tail) = tail.split_at(len);
        let (nanos, tail) = tail.split_at(DURATION_LEN);
        let mut be = [0u8; DURATION_LEN];
        be.copy_from_slice(nanos);
        report.heard.insert(
            String::from_utf8_lossy(addr).into_owned(),
            Duration::from_nanos(u64::from_be_bytes(be)),
        );
        rest = tail;
    }

    Ok(report)
}

fn decompress(body: &[u8]) -> Result<Vec<u8>, WireError> {
    let corrupt = |e: std::io::Error| WireError::CorruptPayload(e.to_string());

    let decoder = zstd::stream::read::Decoder::new(body).map_err(corrupt)?;
    let mut payload = Vec::new();
    decoder
        .take(MAX_DECODED_LEN as u64 + 1)
        .read_to_end(&mut payload)
        .map_err(corrupt)?;

    if payload.len() > MAX_DECODED_LEN {
        return Err(WireError::CorruptPayload(format!(
            "decompressed payload exceeds {MAX_DECODED_LEN} bytes"
        )));
    }
    Ok(payload)
}

// ── Padding ───────────────────────────────────────────────────────────────────

/// Grow a zstd frame to exactly `target` bytes using zstd's own framing.
///
///   gap >= 8   trailing skippable frame
///   gap 3..=7  trailing raw block of zeros (zero-length address records)
///   gap 1..=2  dictionary ID field holding zero ("no dictionary")
fn pad_frame(frame: &mut Vec<u8>, target: usize) -> Result<(), WireError> {
    let gap = target.saturating_sub(frame.len());
    match gap {
        0 => Ok(()),
        1 | 2 => widen_dictionary_id(frame, gap),
        3..=7 => append_zero_block(frame, gap - BLOCK_HEADER_LEN),
        _ => {
            append_skippable(frame, gap - SKIPPABLE_HEADER_LEN);
            Ok(())
        }
    }
}

/// Offsets inside a single zstd frame, as far as padding needs them.
struct FrameLayout {
    descriptor: u8,
    dictionary_id_offset: usize,
    last_block_offset: usize,
    end: usize,
}

impl FrameLayout {
    fn parse(frame: &[u8]) -> Result<Self, WireError> {
        let invalid = |what: &str| WireError::Compression(format!("unexpected frame layout: {what}"));

        if frame.len() < ZSTD_MAGIC.len() + 1 || frame[..ZSTD_MAGIC.len()] != ZSTD_MAGIC {
            return Err(invalid("missing magic"));
        }
        let descriptor = frame[4];
        let single_segment = descriptor & 0x20 != 0;
        let dictionary_id_len = [0, 1, 2, 4][usize::from(descriptor & 0x03)];
        let content_size_len = match descriptor >> 6 {
            0 if single_segment => 1,
            0 => 0,
            1 => 2,
            2 => 4,
            _ => 8,
        };

        let dictionary_id_offset = 5 + usize::from(!single_segment);
        let mut pos = dictionary_id_offset + dictionary_id_len + content_size_len;
        loop {
            let header = frame
                .get(pos..pos + BLOCK_HEADER_LEN)
                .ok_or_else(|| invalid("block header past end"))?;
            let header =
                u32::from(header[0]) | u32::from(header[1]) << 8 | u32::from(header[2]) << 16;
            let last = header & 1 != 0;
            let content = match (header >> 1) & 0x03 {
                1 => 1,
                3 => return Err(invalid("reserved block type")),
                _ => (header >> 3) as usize,
            };
            if last {
                return Ok(Self {
                    descriptor,
                    dictionary_id_offset,
                    last_block_offset: pos,
                    end: pos + BLOCK_HEADER_LEN + content,
                });
            }
            pos += BLOCK_HEADER_LEN + content;
        }
    }
}

fn widen_dictionary_id(frame: &mut Vec<u8>, len: usize) -> Result<(), WireError> {
    let layout = FrameLayout::parse(frame)?;
    if layout.descriptor & 0x03 != 0 {
        return Err(WireError::Compression("frame already names a dictionary".into()));
    }
    // Dictionary_ID_flag 1 → 1 byte, 2 → 2 bytes.
    frame[4] = layout.descriptor | len as u8;
    let at = layout.dictionary_id_offset;
    frame.splice(at..at, std::iter::repeat(0u8).take(len));
    Ok(())
}

fn append_zero_block(frame: &mut Vec<u8>, zeros: usize) -> Result<(), WireError> {
    let layout = FrameLayout::parse(frame)?;
    if layout.descriptor & 0xe4 != 0 || layout.end != frame.len() {
        return Err(WireError::Compression(
            "frame carries a content size or checksum".into(),
        ));
    }
    frame[layout.last_block_offset] &= !1;
    // Raw block, last: type 0, Last_Block 1.
    let header = ((zeros as u32) << 3) | 1;
    frame.extend_from_slice(&header.to_le_bytes()[..BLOCK_HEADER_LEN]);
    frame.resize(frame.len() + zeros, 0);
    Ok(())
}

fn append_skippable(frame: &mut Vec<u8>, len: usize) {
    frame.extend_from_slice(&SKIPPABLE_MAGIC.to_le_bytes());
    frame.extend_from_slice(&(len as u32).to_le_bytes());
    frame.resize(frame.len() + len, 0);
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> Report {
        Report::new("alpha")
            .with_heard("192.0.2.20", Duration::from_secs(5))
            .with_heard("192.0.2.21", Duration::from_millis(1500))
            .with_heard("fe80::1%eth0", Duration::from_nanos(1))
            .with_heard("2001:db8::7", Duration::ZERO)
    }

    /// Datagram with an arbitrary uncompressed payload behind a valid header.
    fn datagram_of(payload: &[u8]) -> Vec<u8> {
        let mut out = HEADER.to_vec();
        out.extend(zstd::bulk::compress(payload, 3).unwrap());
        out
    }

    #[test]
    fn round_trip_preserves_host_and_heard() {
        let report = sample_report();
        let bytes = Codec::new(None).encode(&report).unwrap();
        assert_eq!(&bytes[..4], HEADER);
        assert_eq!(&bytes[4..8], &ZSTD_MAGIC);

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, report);
    }

    #[test]
    fn round_trip_with_no_records() {
        let report = Report::new("lonely");
        let decoded = decode(&Codec::new(None).encode(&report).unwrap()).unwrap();
        assert_eq!(decoded.host, "lonely");
        assert!(decoded.heard.is_empty());
    }

    #[test]
    fn round_trip_at_field_limits() {
        let host = "h".repeat(MAX_FIELD_LEN);
        let addr = "a".repeat(MAX_FIELD_LEN);
        let report = Report::new(host).with_heard(addr, Duration::from_nanos(u64::MAX));
        let decoded = decode(&Codec::new(None).encode(&report).unwrap()).unwrap();
        assert_eq!(decoded, report);
    }

    #[test]
    fn encode_rejects_long_host() {
        let report = Report::new("h".repeat(MAX_FIELD_LEN + 1));
        assert_eq!(
            Codec::new(None).encode(&report),
            Err(WireError::HostTooLong(MAX_FIELD_LEN + 1))
        );
    }

    #[test]
    fn encode_skips_unrepresentable_addresses() {
        let report = sample_report()
            .with_heard("", Duration::from_secs(1))
            .with_heard("x".repeat(300), Duration::from_secs(1));
        let decoded = decode(&Codec::new(None).encode(&report).unwrap()).unwrap();
        assert_eq!(decoded, sample_report());
    }

    #[test]
    fn fixed_size_is_exact_for_every_gap() {
        let report = sample_report();
        let unpadded = Codec::new(None).encode(&report).unwrap().len();

        // Covers the dictionary-ID, raw-block and skippable-frame paths.
        for size in unpadded..unpadded + 40 {
            let codec = Codec::new(NonZeroUsize::new(size));
            let bytes = codec.encode(&report).unwrap();
            assert_eq!(bytes.len(), size, "target {size}");
            assert_eq!(decode(&bytes).unwrap(), report, "target {size}");
        }
    }

    #[test]
    fn fixed_size_mtu_frame() {
        let report = sample_report();
        let bytes = Codec::new(NonZeroUsize::new(1400)).encode(&report).unwrap();
        assert_eq!(bytes.len(), 1400);
        assert_eq!(decode(&bytes).unwrap(), report);
    }

    #[test]
    fn oversized_report_is_sent_unpadded() {
        let report = sample_report();
        let unpadded = Codec::new(None).encode(&report).unwrap();
        let bytes = Codec::new(NonZeroUsize::new(unpadded.len() - 1))
            .encode(&report)
            .unwrap();
        assert_eq!(bytes.len(), unpadded.len());
        assert_eq!(decode(&bytes).unwrap(), report);
    }

    #[test]
    fn feature_bits_follow_letter_case() {
        assert_eq!(FeatureBits::from_header(b"macy"), Some(FeatureBits(0)));
        assert_eq!(FeatureBits::from_header(b"Macy"), Some(FeatureBits(1)));
        assert_eq!(FeatureBits::from_header(b"mAcY"), Some(FeatureBits(10)));
        assert_eq!(FeatureBits::from_header(b"MACY"), Some(FeatureBits(15)));
        assert_eq!(FeatureBits::from_header(b"macs"), None);
        assert_eq!(FeatureBits::from_header(b"mac"), None);
        assert_eq!(&FeatureBits(5).header(), b"MaCy");
        assert!(FeatureBits::NONE.is_supported());
        assert!(!FeatureBits(8).is_supported());
    }

    #[test]
    fn decode_rejects_short_and_foreign_headers() {
        assert_eq!(decode(b""), Err(WireError::MalformedHeader));
        assert_eq!(decode(b"mac"), Err(WireError::MalformedHeader));
        assert_eq!(decode(b"nope and more"), Err(WireError::MalformedHeader));
    }

    #[test]
    fn decode_rejects_unknown_feature_bits() {
        let mut bytes = Codec::new(None).encode(&sample_report()).unwrap();
        bytes[0] = b'M';
        assert_eq!(decode(&bytes), Err(WireError::UnsupportedVersion(1)));
        bytes[..4].copy_from_slice(b"MACY");
        assert_eq!(decode(&bytes), Err(WireError::UnsupportedVersion(15)));
    }

    #[test]
    fn decode_rejects_other_compression() {
        assert_eq!(decode(b"macy"), Err(WireError::UnsupportedCompression));
        assert_eq!(decode(b"macy\x28\xb5"), Err(WireError::UnsupportedCompression));
        assert_eq!(
            decode(b"macy\x1f\x8b\x08\x00rest"),
            Err(WireError::UnsupportedCompression)
        );
    }

    #[test]
    fn decode_rejects_corrupt_frame() {
        let mut bytes = HEADER.to_vec();
        bytes.extend_from_slice(&ZSTD_MAGIC);
        bytes.extend_from_slice(&[0xff; 16]);
        assert!(matches!(decode(&bytes), Err(WireError::CorruptPayload(_))));

        // Valid frame cut short.
        let full = Codec::new(None).encode(&sample_report()).unwrap();
        let cut = &full[..full.len() - 3];
        assert!(matches!(decode(cut), Err(WireError::CorruptPayload(_))));
    }

    #[test]
    fn decode_rejects_truncated_host() {
        assert_eq!(decode(&datagram_of(&[])), Err(WireError::Truncated));
        assert_eq!(decode(&datagram_of(b"\x0aabc")), Err(WireError::Truncated));
    }

    #[test]
    fn decode_skips_padding_and_ignores_trailing_partial_record() {
        let mut payload = vec![1, b'h'];
        payload.extend_from_slice(&[0, 0, 0]);
        payload.push(4);
        payload.extend_from_slice(b"10.1");
        payload.extend_from_slice(&7_000_000_000u64.to_be_bytes());
        payload.push(0);
        // Partial record: claims 5 bytes, has 2.
        payload.extend_from_slice(&[5, b'1', b'0']);

        let report = decode(&datagram_of(&payload)).unwrap();
        assert_eq!(report.host, "h");
        assert_eq!(report.heard.len(), 1);
        assert_eq!(report.heard["10.1"], Duration::from_secs(7));
    }
}
