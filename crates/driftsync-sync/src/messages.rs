//! Sync protocol frames and their wire codec.
//!
//! Every frame starts with a 1-byte kind discriminator and a 1-byte
//! protocol version, followed by a hand-rolled big-endian body (see
//! `driftsync_core::codec`). Frames on a transport are PADMÉ-padded so
//! their sizes leak almost nothing about the payload.
//!
//! A reconciliation frame carries range entries covering the full
//! timestamp key space in ascending order; each entry's payload says what
//! the sender knows about that range.

use bytes::Bytes;
use rand::RngCore;

use driftsync_core::codec::{pad_frame, unpad_frame, Reader, Writer};
use driftsync_core::{OwnerId, Timestamp, OWNER_ID_LEN, TIMESTAMP_LEN};
use driftsync_crypto::{WriteKey, WRITE_KEY_LEN};
use driftsync_store::{Fingerprint, FINGERPRINT_LEN};

use crate::error::{Result, SyncError};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Hard decode limits. Soft behavioral limits live in
/// [`crate::reconcile::ReconcileConfig`]; these bound what a decoder will
/// ever materialize from one frame.
pub mod limits {
    /// Max range entries per frame.
    pub const MAX_RANGES_PER_FRAME: usize = 4096;
    /// Max timestamps or items in one range payload.
    pub const MAX_ITEMS_PER_RANGE: usize = 100_000;
    /// Max bytes of error detail.
    pub const MAX_ERROR_DETAIL: usize = 1024;
}

/// Frame kind bytes.
mod kind {
    pub const INITIATOR: u8 = 1;
    pub const NON_INITIATOR: u8 = 2;
    pub const ERROR: u8 = 3;
}

/// Range payload tag bytes.
mod tag {
    pub const SKIP: u8 = 0;
    pub const FINGERPRINT: u8 = 1;
    pub const TIMESTAMPS: u8 = 2;
    pub const TIMESTAMPS_WITH_CHANGES: u8 = 3;
}

/// What the sender knows about one range of the key space.
#[derive(Debug, Clone, PartialEq)]
pub enum RangePayload {
    /// The range needs no further processing.
    Skip,
    /// Digest of the sender's timestamps in the range; the receiver
    /// compares against its own.
    Fingerprint(Fingerprint),
    /// The sender's explicit timestamps. An empty list tells the peer to
    /// send everything it has here.
    TimestampsList {
        /// Strictly ascending timestamps within the range.
        timestamps: Vec<Timestamp>,
        /// The list was truncated; the sender has more past the last item.
        has_more: bool,
    },
    /// Explicit timestamps with ciphertexts attached for the subset the
    /// peer is known to lack.
    TimestampsListWithChanges {
        /// Strictly ascending `(timestamp, ciphertext?)` pairs.
        items: Vec<(Timestamp, Option<Bytes>)>,
        /// The list was truncated; the sender has more past the last item.
        has_more: bool,
    },
}

/// One entry of a reconciliation frame: a payload covering the key
/// interval from the previous entry's upper bound (exclusive start) up to
/// `upper` (exclusive).
#[derive(Debug, Clone, PartialEq)]
pub struct RangeEntry {
    /// Exclusive upper bound. The last entry's bound is [`Timestamp::MAX`].
    pub upper: Timestamp,
    /// What the sender knows about the range.
    pub payload: RangePayload,
}

impl RangeEntry {
    /// Whether this entry requires no further processing.
    pub fn is_skip(&self) -> bool {
        matches!(self.payload, RangePayload::Skip)
    }
}

/// Whether every entry is a skip.
pub fn all_skip(ranges: &[RangeEntry]) -> bool {
    ranges.iter().all(RangeEntry::is_skip)
}

/// Error codes carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// Write key rejected.
    WriteKeyInvalid = 1,
    /// Protocol version not supported.
    VersionUnsupported = 2,
    /// Timestamp drift rejected.
    ClockDrift = 3,
    /// Malformed or out-of-order message.
    Protocol = 4,
    /// Persistence failed on the peer.
    Storage = 5,
}

impl ErrorCode {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ErrorCode::WriteKeyInvalid),
            2 => Some(ErrorCode::VersionUnsupported),
            3 => Some(ErrorCode::ClockDrift),
            4 => Some(ErrorCode::Protocol),
            5 => Some(ErrorCode::Storage),
            _ => None,
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Client → relay: opens or continues a reconciliation session.
    Initiator {
        /// The owner being synchronized.
        owner: OwnerId,
        /// Write authorization, validated before any write.
        write_key: WriteKey,
        /// Reconciliation entries covering the full key space.
        ranges: Vec<RangeEntry>,
    },
    /// Relay → client: the reconciliation response.
    NonInitiator {
        /// The owner being synchronized.
        owner: OwnerId,
        /// Reconciliation entries covering the full key space.
        ranges: Vec<RangeEntry>,
    },
    /// Either direction: the session failed.
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable detail.
        detail: String,
    },
}

impl Frame {
    /// Encode to wire bytes (unpadded).
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Writer::with_capacity(64);
        match self {
            Frame::Initiator {
                owner,
                write_key,
                ranges,
            } => {
                w.put_u8(kind::INITIATOR);
                w.put_u8(PROTOCOL_VERSION);
                w.put_bytes(owner.as_bytes());
                w.put_bytes(write_key.as_bytes());
                encode_ranges(&mut w, ranges)?;
            }
            Frame::NonInitiator { owner, ranges } => {
                w.put_u8(kind::NON_INITIATOR);
                w.put_u8(PROTOCOL_VERSION);
                w.put_bytes(owner.as_bytes());
                encode_ranges(&mut w, ranges)?;
            }
            Frame::Error { code, detail } => {
                w.put_u8(kind::ERROR);
                w.put_u8(PROTOCOL_VERSION);
                w.put_u8(*code as u8);
                let detail = detail.as_bytes();
                let truncated = &detail[..detail.len().min(limits::MAX_ERROR_DETAIL)];
                w.put_varbytes(truncated)
                    .map_err(|e| SyncError::Protocol(e.to_string()))?;
            }
        }
        Ok(w.finish())
    }

    /// Decode wire bytes (unpadded), checking the version byte.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let kind_byte = r.u8().map_err(protocol_err)?;
        let version = r.u8().map_err(protocol_err)?;
        if version != PROTOCOL_VERSION {
            return Err(SyncError::VersionUnsupported {
                local: PROTOCOL_VERSION,
                peer: version,
            });
        }

        let frame = match kind_byte {
            kind::INITIATOR => {
                let owner = read_owner(&mut r)?;
                let mut key = [0u8; WRITE_KEY_LEN];
                key.copy_from_slice(r.bytes(WRITE_KEY_LEN).map_err(protocol_err)?);
                let ranges = decode_ranges(&mut r)?;
                Frame::Initiator {
                    owner,
                    write_key: WriteKey::from_bytes(key),
                    ranges,
                }
            }
            kind::NON_INITIATOR => {
                let owner = read_owner(&mut r)?;
                let ranges = decode_ranges(&mut r)?;
                Frame::NonInitiator { owner, ranges }
            }
            kind::ERROR => {
                let code_byte = r.u8().map_err(protocol_err)?;
                let code = ErrorCode::from_u8(code_byte)
                    .ok_or_else(|| SyncError::Protocol(format!("unknown error code {code_byte}")))?;
                let detail = String::from_utf8_lossy(r.varbytes().map_err(protocol_err)?).into_owned();
                Frame::Error { code, detail }
            }
            other => return Err(SyncError::Protocol(format!("unknown frame kind {other}"))),
        };

        r.finish().map_err(protocol_err)?;
        Ok(frame)
    }

    /// Encode and PADMÉ-pad for a transport.
    pub fn encode_padded(&self, rng: &mut impl RngCore) -> Result<Bytes> {
        let body = self.encode()?;
        let padded = pad_frame(&body, rng).map_err(|e| SyncError::Protocol(e.to_string()))?;
        Ok(Bytes::from(padded))
    }

    /// Unpad and decode a transport frame.
    pub fn decode_padded(frame: &[u8]) -> Result<Self> {
        let body = unpad_frame(frame).map_err(protocol_err)?;
        Self::decode(body)
    }
}

fn protocol_err(e: driftsync_core::CoreError) -> SyncError {
    SyncError::Protocol(e.to_string())
}

fn read_owner(r: &mut Reader<'_>) -> Result<OwnerId> {
    let mut owner = [0u8; OWNER_ID_LEN];
    owner.copy_from_slice(r.bytes(OWNER_ID_LEN).map_err(protocol_err)?);
    Ok(OwnerId::from_bytes(owner))
}

fn encode_ranges(w: &mut Writer, ranges: &[RangeEntry]) -> Result<()> {
    if ranges.len() > limits::MAX_RANGES_PER_FRAME {
        return Err(SyncError::Protocol(format!(
            "{} range entries exceed the per-frame limit",
            ranges.len()
        )));
    }
    w.put_u32(ranges.len() as u32);
    for entry in ranges {
        w.put_bytes(&entry.upper.encode());
        match &entry.payload {
            RangePayload::Skip => w.put_u8(tag::SKIP),
            RangePayload::Fingerprint(fp) => {
                w.put_u8(tag::FINGERPRINT);
                w.put_bytes(fp.as_bytes());
            }
            RangePayload::TimestampsList {
                timestamps,
                has_more,
            } => {
                w.put_u8(tag::TIMESTAMPS);
                w.put_u32(timestamps.len() as u32);
                for ts in timestamps {
                    w.put_bytes(&ts.encode());
                }
                w.put_u8(u8::from(*has_more));
            }
            RangePayload::TimestampsListWithChanges { items, has_more } => {
                w.put_u8(tag::TIMESTAMPS_WITH_CHANGES);
                w.put_u32(items.len() as u32);
                for (ts, change) in items {
                    w.put_bytes(&ts.encode());
                    match change {
                        Some(bytes) => {
                            w.put_u8(1);
                            w.put_varbytes(bytes)
                                .map_err(|e| SyncError::Protocol(e.to_string()))?;
                        }
                        None => w.put_u8(0),
                    }
                }
                w.put_u8(u8::from(*has_more));
            }
        }
    }
    Ok(())
}

fn decode_ranges(r: &mut Reader<'_>) -> Result<Vec<RangeEntry>> {
    let count = r.u32().map_err(protocol_err)? as usize;
    if count > limits::MAX_RANGES_PER_FRAME {
        return Err(SyncError::Protocol(format!(
            "{count} range entries exceed the per-frame limit"
        )));
    }

    let mut ranges = Vec::with_capacity(count);
    let mut lo = Timestamp::ZERO;
    for i in 0..count {
        let upper = Timestamp::decode(r.bytes(TIMESTAMP_LEN).map_err(protocol_err)?)
            .map_err(protocol_err)?;
        if i > 0 && upper <= lo {
            return Err(SyncError::Protocol(
                "range upper bounds must be strictly ascending".into(),
            ));
        }

        let tag_byte = r.u8().map_err(protocol_err)?;
        let payload = match tag_byte {
            tag::SKIP => RangePayload::Skip,
            tag::FINGERPRINT => {
                let mut fp = [0u8; FINGERPRINT_LEN];
                fp.copy_from_slice(r.bytes(FINGERPRINT_LEN).map_err(protocol_err)?);
                RangePayload::Fingerprint(Fingerprint::from_bytes(fp))
            }
            tag::TIMESTAMPS => {
                let n = checked_item_count(r.u32().map_err(protocol_err)? as usize)?;
                let mut timestamps = Vec::with_capacity(n);
                for _ in 0..n {
                    let ts = Timestamp::decode(r.bytes(TIMESTAMP_LEN).map_err(protocol_err)?)
                        .map_err(protocol_err)?;
                    check_list_order(timestamps.last(), &ts, lo, upper)?;
                    timestamps.push(ts);
                }
                let has_more = r.u8().map_err(protocol_err)? != 0;
                RangePayload::TimestampsList {
                    timestamps,
                    has_more,
                }
            }
            tag::TIMESTAMPS_WITH_CHANGES => {
                let n = checked_item_count(r.u32().map_err(protocol_err)? as usize)?;
                let mut items: Vec<(Timestamp, Option<Bytes>)> = Vec::with_capacity(n);
                for _ in 0..n {
                    let ts = Timestamp::decode(r.bytes(TIMESTAMP_LEN).map_err(protocol_err)?)
                        .map_err(protocol_err)?;
                    check_list_order(items.last().map(|(t, _)| t), &ts, lo, upper)?;
                    let change = match r.u8().map_err(protocol_err)? {
                        0 => None,
                        1 => Some(Bytes::copy_from_slice(
                            r.varbytes().map_err(protocol_err)?,
                        )),
                        other => {
                            return Err(SyncError::Protocol(format!(
                                "invalid change flag {other}"
                            )))
                        }
                    };
                    items.push((ts, change));
                }
                let has_more = r.u8().map_err(protocol_err)? != 0;
                RangePayload::TimestampsListWithChanges { items, has_more }
            }
            other => {
                return Err(SyncError::Protocol(format!(
                    "unknown range payload tag {other}"
                )))
            }
        };

        ranges.push(RangeEntry { upper, payload });
        lo = upper;
    }

    if let Some(last) = ranges.last() {
        if last.upper != Timestamp::MAX {
            return Err(SyncError::Protocol(
                "range entries must cover the key space up to the maximum timestamp".into(),
            ));
        }
    }

    Ok(ranges)
}

fn checked_item_count(n: usize) -> Result<usize> {
    if n > limits::MAX_ITEMS_PER_RANGE {
        Err(SyncError::Protocol(format!(
            "{n} items exceed the per-range limit"
        )))
    } else {
        Ok(n)
    }
}

fn check_list_order(
    prev: Option<&Timestamp>,
    next: &Timestamp,
    lo: Timestamp,
    upper: Timestamp,
) -> Result<()> {
    if *next < lo || *next >= upper {
        return Err(SyncError::Protocol(
            "timestamp outside its range entry".into(),
        ));
    }
    if let Some(prev) = prev {
        if next <= prev {
            return Err(SyncError::Protocol(
                "timestamps must be strictly ascending within a list".into(),
            ));
        }
    }
    Ok(())
}
