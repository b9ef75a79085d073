//! ## ktrace-core::entry
//! **Trace record allocation**
//!
//! A record is built in one heap buffer reserved up front (fixed header fields
//! followed by the payload) and frozen into immutable [`Bytes`] once handed to a
//! sink queue. Reservation is fallible: a failed reservation drops the event
//! instead of aborting the producer.
//!
//! The producing context's recursion guard is held by the [`EntryBuilder`] and
//! handed back by `finish`, so trace machinery that runs while a record is
//! being built or queued cannot trace itself.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

use crate::context::{ActiveGuard, ContextId, TraceContext};
use crate::error::TraceError;
use crate::facility::EventKind;

/// Framing version written into every record header.
pub const RECORD_VERSION: u16 = 1;

/// Size of the fixed record header preceding every body.
pub const HEADER_LEN: usize = 40;

/// Metadata stamped on every record at allocation time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryHeader {
    pub kind: EventKind,
    pub context: ContextId,
    /// Logical timestamp: tracer-wide allocation sequence number.
    pub sequence: u64,
    /// Wall-clock time since the Unix epoch.
    pub timestamp: Duration,
}

impl EntryHeader {
    /// Little-endian layout:
    /// `body_len:u32 kind:u16 version:u16 pid:u32 lid:u32 seq:u64 secs:u64 nanos:u32 pad:u32`.
    fn encode(&self, body_len: usize) -> Bytes {
        let mut head = BytesMut::with_capacity(HEADER_LEN);
        // Bodies never outgrow a reservation, which allocate caps at u32::MAX.
        head.put_u32_le(body_len as u32);
        head.put_u16_le(self.kind.raw());
        head.put_u16_le(RECORD_VERSION);
        head.put_u32_le(self.context.pid);
        head.put_u32_le(self.context.lid);
        head.put_u64_le(self.sequence);
        head.put_u64_le(self.timestamp.as_secs());
        head.put_u32_le(self.timestamp.subsec_nanos());
        head.put_u32_le(0);
        head.freeze()
    }
}

/// A record under construction, owned by the producing context.
#[derive(Debug)]
pub struct EntryBuilder {
    header: EntryHeader,
    body: Vec<u8>,
    /// Body size reserved at allocation; the body never grows past it.
    reserved: usize,
    large: bool,
    guard: ActiveGuard,
}

impl EntryBuilder {
    /// Reserves storage for `fixed.len() + payload_size` bytes and stamps the header.
    ///
    /// Fails with [`TraceError::Busy`] if `context` is already inside the trace
    /// machinery, and with [`TraceError::ResourceExhausted`] if the body exceeds
    /// `max_size` or cannot be reserved.
    pub(crate) fn allocate(
        context: &Arc<TraceContext>,
        kind: EventKind,
        fixed: &[u8],
        payload_size: usize,
        sequence: u64,
        max_size: usize,
    ) -> Result<Self, TraceError> {
        let guard = context.enter().ok_or(TraceError::Busy)?;

        let size = fixed
            .len()
            .checked_add(payload_size)
            .filter(|size| *size <= max_size && *size <= u32::MAX as usize)
            .ok_or(TraceError::ResourceExhausted)?;
        let mut body = Vec::new();
        body.try_reserve_exact(size)
            .map_err(|_| TraceError::ResourceExhausted)?;
        body.extend_from_slice(fixed);

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        Ok(Self {
            header: EntryHeader {
                kind,
                context: guard.context().id(),
                sequence,
                timestamp,
            },
            body,
            reserved: size,
            large: false,
            guard,
        })
    }

    pub fn header(&self) -> &EntryHeader {
        &self.header
    }

    /// Appends payload bytes within the size reserved at allocation.
    ///
    /// Fails with [`TraceError::ResourceExhausted`], leaving the body
    /// untouched, if `data` does not fit.
    pub fn put_payload(&mut self, data: &[u8]) -> Result<&mut Self, TraceError> {
        if data.len() > self.remaining() {
            return Err(TraceError::ResourceExhausted);
        }
        self.body.extend_from_slice(data);
        Ok(self)
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Payload bytes that still fit in the reservation.
    pub fn remaining(&self) -> usize {
        self.reserved - self.body.len()
    }

    /// Requests the synchronous path when the submission is allowed to wait.
    pub fn mark_large(&mut self) -> &mut Self {
        self.large = true;
        self
    }

    pub fn is_large(&self) -> bool {
        self.large
    }

    pub(crate) fn context(&self) -> &Arc<TraceContext> {
        self.guard.context()
    }

    /// Freezes the record. The caller keeps the recursion guard until the
    /// entry has been queued.
    pub(crate) fn finish(self) -> (TraceEntry, ActiveGuard) {
        let head = self.header.encode(self.body.len());
        let entry = TraceEntry {
            header: self.header,
            head,
            body: Bytes::from(self.body),
            large: self.large,
        };
        (entry, self.guard)
    }
}

/// A frozen record, owned by a queue and then by the sink's writer.
#[derive(Clone, Debug)]
pub struct TraceEntry {
    header: EntryHeader,
    head: Bytes,
    body: Bytes,
    large: bool,
}

impl TraceEntry {
    pub fn header(&self) -> &EntryHeader {
        &self.header
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn is_large(&self) -> bool {
        self.large
    }

    /// Bytes this record occupies in the sink stream.
    pub fn wire_len(&self) -> usize {
        self.head.len() + self.body.len()
    }

    /// Non-empty slices making up the record on the wire.
    pub(crate) fn segments(&self) -> impl Iterator<Item = &[u8]> {
        [self.head.as_ref(), self.body.as_ref()]
            .into_iter()
            .filter(|s| !s.is_empty())
    }
}

/// Splits a sink stream back into `(kind, context, sequence, body)` tuples.
///
/// Stops at the first truncated record.
pub fn decode_stream(mut stream: &[u8]) -> Vec<(EventKind, ContextId, u64, Bytes)> {
    use bytes::Buf;

    let mut records = Vec::new();
    while stream.len() >= HEADER_LEN {
        let mut head = &stream[..HEADER_LEN];
        let body_len = head.get_u32_le() as usize;
        let kind = EventKind::new(head.get_u16_le());
        let _version = head.get_u16_le();
        let context = ContextId::new(head.get_u32_le(), head.get_u32_le());
        let sequence = head.get_u64_le();
        if stream.len() < HEADER_LEN + body_len {
            break;
        }
        let body = Bytes::copy_from_slice(&stream[HEADER_LEN..HEADER_LEN + body_len]);
        records.push((kind, context, sequence, body));
        stream = &stream[HEADER_LEN + body_len..];
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Arc<TraceContext> {
        TraceContext::new(ContextId::new(42, 7), "worker", 1000)
    }

    #[test]
    fn recursion_guard_rejects_nested_allocation() {
        let ctx = context();
        let outer = EntryBuilder::allocate(&ctx, EventKind::USER, b"", 8, 0, 1024).unwrap();
        let nested = EntryBuilder::allocate(&ctx, EventKind::USER, b"", 8, 1, 1024);
        assert!(matches!(nested, Err(TraceError::Busy)));

        drop(outer);
        assert!(EntryBuilder::allocate(&ctx, EventKind::USER, b"", 8, 2, 1024).is_ok());
    }

    #[test]
    fn finishing_hands_back_the_guard() {
        let ctx = context();
        let builder = EntryBuilder::allocate(&ctx, EventKind::CSW, b"", 0, 0, 1024).unwrap();
        assert!(ctx.in_trace());
        let (_entry, guard) = builder.finish();
        assert!(ctx.in_trace(), "still inside the trace machinery until queued");
        drop(guard);
        assert!(!ctx.in_trace());
    }

    #[test]
    fn payload_cannot_outgrow_the_reservation() {
        let ctx = context();
        let mut builder = EntryBuilder::allocate(&ctx, EventKind::USER, b"hd", 4, 0, 64).unwrap();
        assert_eq!(builder.remaining(), 4);
        builder.put_payload(b"ab").unwrap().put_payload(b"cd").unwrap();
        assert_eq!(builder.remaining(), 0);
        assert!(matches!(
            builder.put_payload(b"e"),
            Err(TraceError::ResourceExhausted)
        ));

        let mut empty = EntryBuilder::allocate(&context(), EventKind::USER, b"", 0, 1, 64).unwrap();
        assert!(matches!(
            empty.put_payload(&[0; 4096]),
            Err(TraceError::ResourceExhausted)
        ));
        assert_eq!(empty.body_len(), 0);

        let (entry, _guard) = builder.finish();
        assert_eq!(entry.body().as_ref(), b"hdabcd");
    }

    #[test]
    fn oversized_request_is_exhaustion_not_panic() {
        let ctx = context();
        let result = EntryBuilder::allocate(&ctx, EventKind::GENIO, b"hdr", 4096, 0, 1024);
        assert!(matches!(result, Err(TraceError::ResourceExhausted)));
        assert!(!ctx.in_trace(), "guard must be released on failure");

        let result = EntryBuilder::allocate(&ctx, EventKind::GENIO, b"", usize::MAX, 0, usize::MAX);
        assert!(matches!(result, Err(TraceError::ResourceExhausted)));
    }

    #[test]
    fn header_is_stamped_and_framed() {
        let ctx = context();
        let mut builder =
            EntryBuilder::allocate(&ctx, EventKind::SYSCALL, &[1, 0, 0, 0], 3, 99, 1024).unwrap();
        builder.put_payload(b"abc").unwrap();
        let (entry, _guard) = builder.finish();

        assert_eq!(entry.header().context, ContextId::new(42, 7));
        assert_eq!(entry.header().sequence, 99);
        assert_eq!(entry.wire_len(), HEADER_LEN + 7);

        let wire: Vec<u8> = entry.segments().flatten().copied().collect();
        let records = decode_stream(&wire);
        assert_eq!(records.len(), 1);
        let (kind, context, sequence, body) = &records[0];
        assert_eq!(*kind, EventKind::SYSCALL);
        assert_eq!(*context, ContextId::new(42, 7));
        assert_eq!(*sequence, 99);
        assert_eq!(body.as_ref(), &[1, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn empty_body_has_only_the_header_segment() {
        let ctx = context();
        let entry = EntryBuilder::allocate(&ctx, EventKind::CSW, b"", 0, 0, 1024)
            .unwrap()
            .finish()
            .0;
        assert_eq!(entry.segments().count(), 1);
    }
}
