//! Splitting oversized messages into fragments, and reassembling fragments
//! back into messages.
//!
//! Datagrams are limited in size (about 1400 bytes over a typical network
//! path). To be able to send larger messages, a large payload is broken
//! into chunks by [`FragmentSender`], each chunk riding in its own reliable
//! frame, all sharing one `transfer_id`. On the receiving end,
//! [`FragmentReceiver`] collects the chunks per transfer and concatenates
//! them back into the full message once every index has arrived. A transfer
//! that stays incomplete for too long is discarded wholesale.

use {
    crate::frame::{ChainStamp, FragmentInfo},
    ahash::AHashMap,
    bytes::Bytes,
    std::time::{Duration, Instant},
    thiserror::Error,
};

/// Splits a message payload into fragments, assigning each transfer a fresh
/// id from a wrapping 16-bit counter.
#[derive(Debug)]
pub struct FragmentSender {
    max_frag_len: usize,
    max_frags: u32,
    next_transfer_id: u16,
}

/// Passed a message to [`FragmentSender::split`] which cannot be
/// represented in the configured maximum number of fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("message too large - {len} bytes would take {num_frags} / {max_frags} fragments")]
pub struct MessageTooBig {
    /// Length of the payload in bytes.
    pub len: usize,
    /// How many fragments the payload would take up.
    pub num_frags: usize,
    /// Maximum number of fragments allowed per message.
    pub max_frags: u32,
}

impl FragmentSender {
    /// Creates a new sender producing fragment payloads of at most
    /// `max_frag_len` bytes, refusing messages of more than `max_frags`
    /// fragments.
    ///
    /// # Panics
    ///
    /// Panics if `max_frag_len == 0`.
    #[must_use]
    pub fn new(max_frag_len: usize, max_frags: u32) -> Self {
        assert!(max_frag_len > 0);
        Self {
            max_frag_len,
            max_frags,
            next_transfer_id: 1,
        }
    }

    /// Gets the maximum payload length of a single fragment.
    #[must_use]
    pub const fn max_frag_len(&self) -> usize {
        self.max_frag_len
    }

    /// Splits a payload into `(info, chunk)` pairs ready to be framed.
    ///
    /// # Errors
    ///
    /// Errors if the payload would take more than the configured maximum
    /// number of fragments.
    pub fn split(
        &mut self,
        payload: &Bytes,
    ) -> Result<impl ExactSizeIterator<Item = (FragmentInfo, Bytes)> + '_, MessageTooBig> {
        let num_frags = payload.len().div_ceil(self.max_frag_len).max(1);
        let total = u32::try_from(num_frags)
            .ok()
            .filter(|total| *total <= self.max_frags)
            .ok_or(MessageTooBig {
                len: payload.len(),
                num_frags,
                max_frags: self.max_frags,
            })?;

        let transfer_id = self.next_transfer_id;
        self.next_transfer_id = match self.next_transfer_id.wrapping_add(1) {
            0 => 1,
            id => id,
        };

        let max_frag_len = self.max_frag_len;
        let payload = payload.clone();
        Ok((0..num_frags).map(move |index| {
            let start = index * max_frag_len;
            let end = (start + max_frag_len).min(payload.len());
            (
                FragmentInfo {
                    total,
                    index: index as u32,
                    transfer_id,
                },
                payload.slice(start..end),
            )
        }))
    }
}

/// Received an invalid fragment when reassembling fragments into a message.
///
/// Errors must not be treated as fatal: they can happen under packet
/// duplication or a confused peer, and leave the receiver in a valid state.
/// They do count towards the malformed-traffic rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReassembleError {
    /// Fragment index is at or past the declared total.
    #[error("fragment index {index} out of bounds for {total} fragments")]
    IndexOutOfBounds {
        /// Index of the fragment received.
        index: u32,
        /// Declared total fragment count of the transfer.
        total: u32,
    },
    /// Fragment declares a different total than the transfer it belongs to.
    #[error("fragment declares {total} total fragments, transfer has {expected}")]
    MismatchedTotal {
        /// Total declared by this fragment.
        total: u32,
        /// Total declared by the first fragment of the transfer.
        expected: u32,
    },
    /// This fragment index has already been received for this transfer.
    #[error("already received fragment {index}")]
    AlreadyReceived {
        /// Index of the fragment received.
        index: u32,
    },
    /// Fragment declares more total fragments than we are willing to buffer.
    #[error("{total} total fragments exceeds limit of {max_frags}")]
    TooManyFragments {
        /// Total declared by this fragment.
        total: u32,
        /// Maximum number of fragments allowed per message.
        max_frags: u32,
    },
}

/// A fully reassembled message, ready for the inbound pipeline.
#[derive(Debug, Clone)]
pub struct ReassembledMessage {
    /// Application message id, taken from the first arriving fragment.
    pub message_id: u32,
    /// Ordering stamp, taken from the first arriving fragment.
    pub chain: Option<ChainStamp>,
    /// The reassembled payload.
    pub payload: Bytes,
}

#[derive(Debug)]
struct Transfer {
    message_id: u32,
    chain: Option<ChainStamp>,
    total: u32,
    num_received: u32,
    chunks: Vec<Option<Bytes>>,
    started_at: Instant,
}

/// Collects fragments per transfer id and reassembles completed messages.
#[derive(Debug)]
pub struct FragmentReceiver {
    transfers: AHashMap<u16, Transfer>,
    max_frags: u32,
}

impl FragmentReceiver {
    /// Creates an empty receiver which refuses transfers of more than
    /// `max_frags` fragments.
    #[must_use]
    pub fn new(max_frags: u32) -> Self {
        Self {
            transfers: AHashMap::new(),
            max_frags,
        }
    }

    /// Gets the number of transfers currently being reassembled.
    #[must_use]
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// Returns `true` if no transfers are in progress.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Feeds one fragment in.
    ///
    /// If this completes its transfer, returns the reassembled message and
    /// forgets the transfer.
    ///
    /// # Errors
    ///
    /// Errors if the fragment is inconsistent with its transfer; the
    /// transfer itself is left untouched.
    pub fn reassemble(
        &mut self,
        now: Instant,
        message_id: u32,
        chain: Option<ChainStamp>,
        info: FragmentInfo,
        payload: Bytes,
    ) -> Result<Option<ReassembledMessage>, ReassembleError> {
        if info.total > self.max_frags {
            return Err(ReassembleError::TooManyFragments {
                total: info.total,
                max_frags: self.max_frags,
            });
        }

        let transfer = self
            .transfers
            .entry(info.transfer_id)
            .or_insert_with(|| Transfer {
                message_id,
                chain,
                total: info.total,
                num_received: 0,
                chunks: vec![None; info.total as usize],
                started_at: now,
            });

        if info.total != transfer.total {
            return Err(ReassembleError::MismatchedTotal {
                total: info.total,
                expected: transfer.total,
            });
        }
        let slot = transfer.chunks.get_mut(info.index as usize).ok_or(
            ReassembleError::IndexOutOfBounds {
                index: info.index,
                total: transfer.total,
            },
        )?;
        if slot.is_some() {
            return Err(ReassembleError::AlreadyReceived { index: info.index });
        }
        *slot = Some(payload);
        transfer.num_received += 1;

        if transfer.num_received < transfer.total {
            return Ok(None);
        }

        let transfer = self
            .transfers
            .remove(&info.transfer_id)
            .expect("transfer was just inserted or found at this key");
        let mut full = Vec::with_capacity(
            transfer
                .chunks
                .iter()
                .map(|chunk| chunk.as_ref().map_or(0, Bytes::len))
                .sum(),
        );
        for chunk in transfer.chunks {
            full.extend_from_slice(&chunk.expect("every chunk slot was filled"));
        }
        Ok(Some(ReassembledMessage {
            message_id: transfer.message_id,
            chain: transfer.chain,
            payload: Bytes::from(full),
        }))
    }

    /// Discards transfers that have been sitting incomplete for longer than
    /// `timeout`, returning how many were dropped.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.transfers.len();
        self.transfers
            .retain(|_, transfer| now.duration_since(transfer.started_at) < timeout);
        before - self.transfers.len()
    }
}
