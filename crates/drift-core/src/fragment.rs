//! Binary fragment envelope and reassembly.
//!
//! Any protocol payload larger than the link MTU travels as fragments:
//!
//! ```text
//! 0xF0 | fragment-id (8, LE) | index (2, LE) | total (2, LE) | ttl (1)
//!      | type (1) | recipient-len (1) | recipient (n) | payload...
//! ```
//!
//! The magic byte distinguishes fragments from single-packet protocol
//! messages. The fragment id is a 64-bit random identifier assigned once
//! per source payload; interleaving across concurrent senders is handled
//! by keying reassembly buffers on `(peer, fragment-id)`.
//!
//! On the relay path fragments are not forwarded as-is: the payload is
//! reassembled, re-encrypted and re-fragmented for the next hop's MTU with
//! the ttl byte decremented.

use crate::error::FrameError;
use crate::identity::PeerId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Magic byte of the binary fragment envelope.
pub const FRAGMENT_MAGIC: u8 = 0xF0;

/// Header size before the variable-length recipient.
pub const FIXED_HEADER_LEN: usize = 1 + 8 + 2 + 2 + 1 + 1 + 1;

/// Parsed fragment header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Identifier shared by all fragments of one payload.
    pub fragment_id: u64,
    /// Position of this fragment, in `[0, total)`.
    pub index: u16,
    /// Total fragments of the payload.
    pub total: u16,
    /// Remaining relay hops for the payload.
    pub ttl: u8,
    /// Inner packet type carried by the reassembled payload.
    pub inner_type: u8,
    /// Recipient identifier, length-prefixed on the wire.
    pub recipient: Vec<u8>,
}

impl FragmentHeader {
    /// Encoded size of this header.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_LEN + self.recipient.len()
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(FRAGMENT_MAGIC);
        out.extend_from_slice(&self.fragment_id.to_le_bytes());
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&self.total.to_le_bytes());
        out.push(self.ttl);
        out.push(self.inner_type);
        out.push(self.recipient.len() as u8);
        out.extend_from_slice(&self.recipient);
    }

    /// Parse a fragment, returning the header and the payload slice.
    ///
    /// # Errors
    ///
    /// - [`FrameError::TooShort`] below the fixed header size.
    /// - [`FrameError::MalformedFragment`] on a wrong magic byte, an index
    ///   outside `[0, total)`, or a truncated recipient.
    pub fn parse(bytes: &[u8]) -> Result<(Self, &[u8]), FrameError> {
        if bytes.len() < FIXED_HEADER_LEN {
            return Err(FrameError::TooShort {
                expected: FIXED_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[0] != FRAGMENT_MAGIC {
            return Err(FrameError::MalformedFragment);
        }
        let fragment_id = u64::from_le_bytes([
            bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7], bytes[8],
        ]);
        let index = u16::from_le_bytes([bytes[9], bytes[10]]);
        let total = u16::from_le_bytes([bytes[11], bytes[12]]);
        let ttl = bytes[13];
        let inner_type = bytes[14];
        let recipient_len = bytes[15] as usize;

        if total == 0 || index >= total {
            return Err(FrameError::MalformedFragment);
        }
        if bytes.len() < FIXED_HEADER_LEN + recipient_len {
            return Err(FrameError::MalformedFragment);
        }
        let recipient = bytes[FIXED_HEADER_LEN..FIXED_HEADER_LEN + recipient_len].to_vec();
        let payload = &bytes[FIXED_HEADER_LEN + recipient_len..];

        Ok((
            Self {
                fragment_id,
                index,
                total,
                ttl,
                inner_type,
                recipient,
            },
            payload,
        ))
    }
}

/// Check whether raw link bytes are a fragment envelope.
#[must_use]
pub fn is_fragment(bytes: &[u8]) -> bool {
    bytes.first() == Some(&FRAGMENT_MAGIC)
}

/// Split a payload into fragments sized for the given MTU.
///
/// Each returned packet is at most `mtu` bytes. The fragment id must be
/// fresh 64-bit randomness assigned by the caller, once per payload.
///
/// # Errors
///
/// Returns [`FrameError::PayloadOverflow`] when the MTU leaves no room for
/// payload after the header, or the payload needs more than `u16::MAX`
/// fragments.
pub fn fragment(
    payload: &[u8],
    mtu: u16,
    fragment_id: u64,
    ttl: u8,
    inner_type: u8,
    recipient: &[u8],
) -> Result<Vec<Vec<u8>>, FrameError> {
    if recipient.len() > u8::MAX as usize {
        return Err(FrameError::PayloadOverflow);
    }
    let header_len = FIXED_HEADER_LEN + recipient.len();
    let mtu = mtu as usize;
    if mtu <= header_len {
        return Err(FrameError::PayloadOverflow);
    }
    let chunk_len = mtu - header_len;
    let total = payload.len().div_ceil(chunk_len).max(1);
    let total = u16::try_from(total).map_err(|_| FrameError::PayloadOverflow)?;

    let mut fragments = Vec::with_capacity(total as usize);
    for (index, chunk) in payload.chunks(chunk_len).enumerate() {
        let header = FragmentHeader {
            fragment_id,
            index: index as u16,
            total,
            ttl,
            inner_type,
            recipient: recipient.to_vec(),
        };
        let mut packet = Vec::with_capacity(header_len + chunk.len());
        header.encode_into(&mut packet);
        packet.extend_from_slice(chunk);
        fragments.push(packet);
    }
    if fragments.is_empty() {
        // Zero-length payload still travels as one header-only fragment.
        let header = FragmentHeader {
            fragment_id,
            index: 0,
            total: 1,
            ttl,
            inner_type,
            recipient: recipient.to_vec(),
        };
        let mut packet = Vec::with_capacity(header_len);
        header.encode_into(&mut packet);
        fragments.push(packet);
    }
    Ok(fragments)
}

/// A fully reassembled payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletePayload {
    /// Source peer the fragments arrived from.
    pub peer: PeerId,
    /// The shared fragment id.
    pub fragment_id: u64,
    /// Remaining relay hops, as carried by the fragments.
    pub ttl: u8,
    /// Inner packet type of the payload.
    pub inner_type: u8,
    /// Recipient identifier from the header.
    pub recipient: Vec<u8>,
    /// Reassembled bytes.
    pub payload: Vec<u8>,
}

struct Buffer {
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
    stored_bytes: usize,
    total: u16,
    ttl: u8,
    inner_type: u8,
    recipient: Vec<u8>,
    last_activity: Instant,
}

/// Reassembly state across all peers.
///
/// Buffers are keyed by `(peer, fragment id)`, bounded in number (LRU by
/// last activity) and by a global byte budget, and expire after the
/// configured timeout.
pub struct Reassembler {
    buffers: HashMap<(PeerId, u64), Buffer>,
    max_buffers: usize,
    budget_bytes: usize,
    timeout: Duration,
    stored_bytes: usize,
}

impl Reassembler {
    /// Create a reassembler with the given bounds.
    #[must_use]
    pub fn new(max_buffers: usize, budget_bytes: usize, timeout: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            max_buffers,
            budget_bytes,
            timeout,
            stored_bytes: 0,
        }
    }

    /// Total bytes currently buffered.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.stored_bytes
    }

    /// Number of active buffers.
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Feed one fragment. Returns the complete payload once every index
    /// has arrived.
    ///
    /// Out-of-order fragments are accepted; a duplicate index overwrites
    /// idempotently. A fragment whose total, ttl, type or recipient
    /// disagrees with its buffer drops the whole buffer.
    ///
    /// # Errors
    ///
    /// - [`FrameError::MalformedFragment`] on parse failure or
    ///   inconsistent metadata.
    /// - [`FrameError::BufferExhausted`] when the payload alone exceeds
    ///   the byte budget.
    pub fn accept(
        &mut self,
        peer: PeerId,
        bytes: &[u8],
        now: Instant,
    ) -> Result<Option<CompletePayload>, FrameError> {
        let (header, payload) = FragmentHeader::parse(bytes)?;
        let key = (peer, header.fragment_id);

        if let Some(buffer) = self.buffers.get(&key) {
            if buffer.total != header.total
                || buffer.inner_type != header.inner_type
                || buffer.recipient != header.recipient
            {
                self.remove(&key);
                tracing::debug!(
                    peer = %peer,
                    fragment_id = header.fragment_id,
                    "dropping reassembly buffer with inconsistent metadata"
                );
                return Err(FrameError::MalformedFragment);
            }
        }

        if !self.buffers.contains_key(&key) {
            while self.buffers.len() >= self.max_buffers {
                if !self.evict_oldest() {
                    break;
                }
            }
            self.buffers.insert(
                key,
                Buffer {
                    parts: vec![None; header.total as usize],
                    received: 0,
                    stored_bytes: 0,
                    total: header.total,
                    ttl: header.ttl,
                    inner_type: header.inner_type,
                    recipient: header.recipient.clone(),
                    last_activity: now,
                },
            );
        }

        // Store the part; duplicates overwrite.
        let index = header.index as usize;
        let part_delta;
        {
            let Some(buffer) = self.buffers.get_mut(&key) else {
                return Err(FrameError::BufferExhausted);
            };
            let slot = &mut buffer.parts[index];
            let old_len = slot.as_ref().map_or(0, Vec::len);
            if slot.is_none() {
                buffer.received += 1;
            }
            buffer.stored_bytes = buffer.stored_bytes - old_len + payload.len();
            part_delta = payload.len() as isize - old_len as isize;
            *slot = Some(payload.to_vec());
            buffer.last_activity = now;
        }
        self.stored_bytes = (self.stored_bytes as isize + part_delta) as usize;

        // Enforce the global byte budget, newest buffer last to go.
        while self.stored_bytes > self.budget_bytes {
            if let Some(evicted_key) = self.oldest_key_excluding(&key) {
                self.remove(&evicted_key);
            } else {
                // This buffer alone blows the budget.
                self.remove(&key);
                return Err(FrameError::BufferExhausted);
            }
        }

        let complete = self
            .buffers
            .get(&key)
            .is_some_and(|buffer| buffer.received == buffer.total as usize);
        if !complete {
            return Ok(None);
        }

        let Some(buffer) = self.remove(&key) else {
            return Ok(None);
        };
        let mut assembled = Vec::with_capacity(buffer.stored_bytes);
        for part in buffer.parts {
            if let Some(part) = part {
                assembled.extend_from_slice(&part);
            }
        }
        Ok(Some(CompletePayload {
            peer,
            fragment_id: header.fragment_id,
            ttl: buffer.ttl,
            inner_type: buffer.inner_type,
            recipient: buffer.recipient,
            payload: assembled,
        }))
    }

    /// Drop buffers whose deadline passed. Returns the keys dropped; each
    /// is a payload lost to [`FrameError::ReassemblyTimeout`].
    pub fn expire(&mut self, now: Instant) -> Vec<(PeerId, u64)> {
        let timeout = self.timeout;
        let expired: Vec<(PeerId, u64)> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| {
                now.checked_duration_since(buffer.last_activity)
                    .is_some_and(|age| age >= timeout)
            })
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            self.remove(key);
            tracing::debug!(peer = %key.0, fragment_id = key.1, "reassembly timed out");
        }
        expired
    }

    fn remove(&mut self, key: &(PeerId, u64)) -> Option<Buffer> {
        let buffer = self.buffers.remove(key)?;
        self.stored_bytes -= buffer.stored_bytes;
        Some(buffer)
    }

    fn oldest_key_excluding(&self, keep: &(PeerId, u64)) -> Option<(PeerId, u64)> {
        self.buffers
            .iter()
            .filter(|(key, _)| *key != keep)
            .min_by_key(|(_, buffer)| buffer.last_activity)
            .map(|(key, _)| *key)
    }

    fn evict_oldest(&mut self) -> bool {
        let oldest = self
            .buffers
            .iter()
            .min_by_key(|(_, buffer)| buffer.last_activity)
            .map(|(key, _)| *key);
        match oldest {
            Some(key) => {
                self.remove(&key);
                true
            }
            None => false,
        }
    }
}
