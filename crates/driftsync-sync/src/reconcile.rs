//! Range-based set reconciliation over the timestamp key space.
//!
//! Two parties discover the symmetric difference of their message sets by
//! exchanging range entries: fingerprints narrow down where the sets
//! differ (splitting mismatched ranges at the median), explicit lists
//! resolve small ranges, and lists-with-changes carry the actual
//! ciphertexts once one side knows what the other lacks. A range whose
//! processing is finished is answered with Skip; the session is done when
//! a whole frame is skips.
//!
//! The step function is stateless with respect to the session: everything
//! it needs is the incoming entries and the local store. That is what
//! keeps the relay side a pure frame handler.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use driftsync_core::{Message, OwnerId, Timestamp, TimestampRange};
use driftsync_store::Storage;

use crate::error::{Result, SyncError};
use crate::messages::{RangeEntry, RangePayload};

/// Tunables for the reconciliation policy. Values are not normative; the
/// defaults match the reference deployment.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Ranges at or below this size switch from fingerprints to explicit
    /// timestamp lists.
    pub list_threshold: usize,
    /// Upper bound on items carried in one range payload; overflow sets
    /// `has_more` and narrows the entry to the covered prefix.
    pub max_items_per_frame: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            list_threshold: 50,
            max_items_per_frame: 500,
        }
    }
}

/// The outcome of processing one incoming frame.
#[derive(Debug, Default)]
pub struct ReconcileStep {
    /// Entries to send back, covering the full key space.
    pub ranges: Vec<RangeEntry>,
    /// Messages received with ciphertexts, to be applied atomically by
    /// the caller before the response is sent.
    pub to_write: Vec<Message>,
    /// Number of ciphertexts attached to the outgoing entries.
    pub sent_changes: usize,
}

impl ReconcileStep {
    /// Whether the response carries no further work for either side.
    pub fn is_settled(&self) -> bool {
        self.to_write.is_empty() && crate::messages::all_skip(&self.ranges)
    }
}

/// The reconciliation step function for one owner over one store.
pub struct Reconciler<'a, S: Storage + ?Sized> {
    storage: &'a S,
    owner: OwnerId,
    config: ReconcileConfig,
}

impl<'a, S: Storage + ?Sized> Reconciler<'a, S> {
    /// Create a reconciler.
    pub fn new(storage: &'a S, owner: OwnerId, config: ReconcileConfig) -> Self {
        Self {
            storage,
            owner,
            config,
        }
    }

    /// Build the opening entries for an initiator frame.
    ///
    /// Queued local messages ride along as a list-with-changes covering
    /// their span when they fit in one frame, so the common
    /// "small local edit" case uploads in a single round. Everything else
    /// opens with a fingerprint over the full key space.
    pub async fn initial_ranges(&self, queued: &[Message]) -> Result<Vec<RangeEntry>> {
        let total = self.storage.size(self.owner, TimestampRange::FULL).await?;
        if total == 0 {
            return Ok(vec![RangeEntry {
                upper: Timestamp::MAX,
                payload: RangePayload::TimestampsList {
                    timestamps: Vec::new(),
                    has_more: false,
                },
            }]);
        }

        if !queued.is_empty() && queued.len() <= self.config.max_items_per_frame {
            let queued_map: BTreeMap<Timestamp, Bytes> = queued
                .iter()
                .map(|m| (m.timestamp, m.change.clone()))
                .collect();
            let qmax = *queued_map.keys().next_back().expect("queued is non-empty");
            let boundary = qmax.successor().unwrap_or(Timestamp::MAX);
            let head = TimestampRange::new(Timestamp::ZERO, boundary);

            let local = self
                .storage
                .iterate_timestamps(self.owner, head, Some(self.config.max_items_per_frame + 1))
                .await?;
            if local.len() <= self.config.max_items_per_frame {
                let items: Vec<(Timestamp, Option<Bytes>)> = local
                    .iter()
                    .map(|ts| (*ts, queued_map.get(ts).cloned()))
                    .collect();
                let mut ranges = vec![RangeEntry {
                    upper: boundary,
                    payload: RangePayload::TimestampsListWithChanges {
                        items,
                        has_more: false,
                    },
                }];
                if boundary < Timestamp::MAX {
                    let rest = TimestampRange::new(boundary, Timestamp::MAX);
                    ranges.push(RangeEntry {
                        upper: Timestamp::MAX,
                        payload: RangePayload::Fingerprint(
                            self.storage.fingerprint(self.owner, rest).await?,
                        ),
                    });
                }
                return Ok(ranges);
            }
        }

        Ok(vec![RangeEntry {
            upper: Timestamp::MAX,
            payload: RangePayload::Fingerprint(
                self.storage
                    .fingerprint(self.owner, TimestampRange::FULL)
                    .await?,
            ),
        }])
    }

    /// Process an incoming frame's entries and produce the response.
    ///
    /// `to_write` must be applied to storage by the caller before the
    /// response entries go out; the entries already account for those
    /// writes.
    pub async fn respond(&self, incoming: &[RangeEntry]) -> Result<ReconcileStep> {
        let mut step = ReconcileStep::default();
        let mut lo = Timestamp::ZERO;

        for entry in incoming {
            let range = TimestampRange::new(lo, entry.upper);
            match &entry.payload {
                RangePayload::Skip => step.ranges.push(RangeEntry {
                    upper: range.hi,
                    payload: RangePayload::Skip,
                }),
                RangePayload::Fingerprint(theirs) => {
                    self.respond_fingerprint(range, *theirs, &mut step).await?;
                }
                RangePayload::TimestampsList {
                    timestamps,
                    has_more,
                } => {
                    self.respond_list(range, timestamps, &BTreeMap::new(), *has_more, &mut step)
                        .await?;
                }
                RangePayload::TimestampsListWithChanges { items, has_more } => {
                    let peer_has: Vec<Timestamp> = items.iter().map(|(ts, _)| *ts).collect();
                    let mut peer_changes = BTreeMap::new();
                    for (ts, change) in items {
                        if let Some(change) = change {
                            step.to_write.push(Message::new(*ts, change.clone()));
                            peer_changes.insert(*ts, change.clone());
                        }
                    }
                    self.respond_list(range, &peer_has, &peer_changes, *has_more, &mut step)
                        .await?;
                }
            }
            lo = entry.upper;
        }

        coalesce_skips(&mut step.ranges);
        Ok(step)
    }

    async fn respond_fingerprint(
        &self,
        range: TimestampRange,
        theirs: driftsync_store::Fingerprint,
        step: &mut ReconcileStep,
    ) -> Result<()> {
        let ours = self.storage.fingerprint(self.owner, range).await?;
        if ours == theirs {
            step.ranges.push(RangeEntry {
                upper: range.hi,
                payload: RangePayload::Skip,
            });
            return Ok(());
        }

        let size = self.storage.size(self.owner, range).await?;
        if size == 0 {
            // We have nothing here; an empty list invites the peer to
            // send everything in the range.
            step.ranges.push(RangeEntry {
                upper: range.hi,
                payload: RangePayload::TimestampsList {
                    timestamps: Vec::new(),
                    has_more: false,
                },
            });
            return Ok(());
        }

        if size <= self.config.list_threshold as u64 {
            let timestamps = self
                .storage
                .iterate_timestamps(self.owner, range, None)
                .await?;
            step.ranges.push(RangeEntry {
                upper: range.hi,
                payload: RangePayload::TimestampsList {
                    timestamps,
                    has_more: false,
                },
            });
            return Ok(());
        }

        // Mismatch over a large range: split in two around the median.
        let mid = self
            .storage
            .timestamp_at_rank(self.owner, range, size / 2)
            .await?
            .ok_or_else(|| SyncError::Protocol("median rank out of bounds".into()))?;
        let left = TimestampRange::new(range.lo, mid);
        let right = TimestampRange::new(mid, range.hi);
        step.ranges.push(RangeEntry {
            upper: mid,
            payload: RangePayload::Fingerprint(self.storage.fingerprint(self.owner, left).await?),
        });
        step.ranges.push(RangeEntry {
            upper: range.hi,
            payload: RangePayload::Fingerprint(self.storage.fingerprint(self.owner, right).await?),
        });
        Ok(())
    }

    /// Respond to an explicit peer list over `range`.
    ///
    /// The covered sub-range is bounded by the peer's truncation point
    /// (`has_more`) and by our own item cap; anything past it is
    /// re-covered with a fingerprint entry so reconciliation resumes
    /// there next round.
    async fn respond_list(
        &self,
        range: TimestampRange,
        peer_has: &[Timestamp],
        peer_changes: &BTreeMap<Timestamp, Bytes>,
        peer_has_more: bool,
        step: &mut ReconcileStep,
    ) -> Result<()> {
        let peer_hi = if peer_has_more {
            let last = peer_has.last().ok_or_else(|| {
                SyncError::Protocol("has_more set on an empty timestamp list".into())
            })?;
            last.successor().unwrap_or(range.hi).min(range.hi)
        } else {
            range.hi
        };

        let mut local = self
            .storage
            .iterate_timestamps(
                self.owner,
                TimestampRange::new(range.lo, peer_hi),
                Some(self.config.max_items_per_frame + 1),
            )
            .await?;
        let truncated = local.len() > self.config.max_items_per_frame;
        let covered_hi = if truncated {
            local.truncate(self.config.max_items_per_frame);
            local
                .last()
                .expect("truncated list is non-empty")
                .successor()
                .unwrap_or(peer_hi)
                .min(peer_hi)
        } else {
            peer_hi
        };

        let local_set: BTreeSet<Timestamp> = local.iter().copied().collect();
        let peer_in: Vec<Timestamp> = peer_has
            .iter()
            .copied()
            .filter(|ts| *ts < covered_hi)
            .collect();
        let peer_set: BTreeSet<Timestamp> = peer_in.iter().copied().collect();

        let to_send: Vec<Timestamp> = local
            .iter()
            .copied()
            .filter(|ts| !peer_set.contains(ts))
            .collect();
        let we_lack = peer_in
            .iter()
            .any(|ts| !local_set.contains(ts) && !peer_changes.contains_key(ts));

        let payload = if !to_send.is_empty() {
            let send_set: BTreeSet<Timestamp> = to_send.iter().copied().collect();
            let mut items: Vec<(Timestamp, Option<Bytes>)> = Vec::with_capacity(local.len());
            for ts in &local {
                let change = if send_set.contains(ts) {
                    match self.storage.read_change(self.owner, *ts).await? {
                        Some(change) => {
                            step.sent_changes += 1;
                            Some(change)
                        }
                        None => {
                            tracing::warn!(owner = %self.owner, timestamp = %ts, "timestamp indexed but ciphertext missing");
                            None
                        }
                    }
                } else {
                    None
                };
                items.push((*ts, change));
            }
            RangePayload::TimestampsListWithChanges {
                items,
                has_more: truncated,
            }
        } else if we_lack {
            // Nothing to push, but the peer still owes us data: advertise
            // what we hold so the peer can diff against it.
            RangePayload::TimestampsList {
                timestamps: local,
                has_more: truncated,
            }
        } else {
            RangePayload::Skip
        };

        if covered_hi > range.lo {
            step.ranges.push(RangeEntry {
                upper: covered_hi,
                payload,
            });
        }
        if covered_hi < range.hi {
            let rest = TimestampRange::new(covered_hi, range.hi);
            step.ranges.push(RangeEntry {
                upper: range.hi,
                payload: RangePayload::Fingerprint(
                    self.storage.fingerprint(self.owner, rest).await?,
                ),
            });
        }
        Ok(())
    }
}

/// Merge runs of consecutive skip entries, keeping the last upper bound.
fn coalesce_skips(ranges: &mut Vec<RangeEntry>) {
    let mut out: Vec<RangeEntry> = Vec::with_capacity(ranges.len());
    for entry in ranges.drain(..) {
        match (out.last_mut(), entry.is_skip()) {
            (Some(prev), true) if prev.is_skip() => prev.upper = entry.upper,
            _ => out.push(entry),
        }
    }
    *ranges = out;
}
