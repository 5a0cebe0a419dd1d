//! Segmented zero-copy byte buffer
//!
//! A [`Buffer`] is a sequence of segments, each a view into a shared byte
//! array with a write watermark splitting it into a readable prefix and a
//! writable suffix. Appending from another buffer shares the underlying
//! arrays instead of copying; producing and consuming move the watermarks.
//!
//! Segments before the write cursor are purely readable, the cursor
//! segment may be mixed, and everything after it is purely writable.
//! Before readable data is shared (or inserted ahead of a mixed segment)
//! the mixed segment is split so shared prefixes stay read-only; that
//! split is what makes the shared-array mutation below sound.
//!
//! Buffers are not thread-safe; each is owned by a single fiber at a time.

use std::cell::UnsafeCell;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::io::{IoSlice, IoSliceMut};
use std::sync::Arc;

/// A reference-counted byte array. Readable regions handed out to other
/// buffers are never written again; writable regions belong to exactly one
/// segment. That protocol is what justifies `Send`/`Sync` here.
struct SharedArray {
    data: UnsafeCell<Box<[u8]>>,
}

unsafe impl Send for SharedArray {}
unsafe impl Sync for SharedArray {}

impl SharedArray {
    fn new(len: usize) -> Arc<SharedArray> {
        Arc::new(SharedArray {
            data: UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
        })
    }

    fn from_vec(storage: Vec<u8>) -> Arc<SharedArray> {
        Arc::new(SharedArray {
            data: UnsafeCell::new(storage.into_boxed_slice()),
        })
    }
}

/// A window into a [`SharedArray`]. Slicing produces a new window over the
/// same array without copying.
#[derive(Clone)]
struct SegmentData {
    array: Arc<SharedArray>,
    start: usize,
    len: usize,
}

impl SegmentData {
    fn new(len: usize) -> SegmentData {
        SegmentData {
            array: SharedArray::new(len),
            start: 0,
            len,
        }
    }

    fn from_vec(storage: Vec<u8>) -> SegmentData {
        let len = storage.len();
        SegmentData {
            array: SharedArray::from_vec(storage),
            start: 0,
            len,
        }
    }

    fn slice(&self, start: usize, len: usize) -> SegmentData {
        assert!(start <= self.len);
        assert!(start + len <= self.len);
        SegmentData {
            array: self.array.clone(),
            start: self.start + start,
            len,
        }
    }

    fn slice_from(&self, start: usize) -> SegmentData {
        self.slice(start, self.len - start)
    }

    /// Grow the window to cover `len` more bytes of the array (used when
    /// merging adjacent slices of the same array).
    fn extend(&mut self, len: usize) {
        self.len += len;
    }

    fn same_array(&self, other: &SegmentData) -> bool {
        Arc::ptr_eq(&self.array, &other.array)
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: the region [start, start+len) is not concurrently
        // written; see the invariant on `SharedArray`.
        unsafe {
            let data = &*self.array.data.get();
            std::slice::from_raw_parts(data.as_ptr().add(self.start), self.len)
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: writable windows belong to exactly one segment; no other
        // view of the array overlaps this region.
        unsafe {
            let data = &mut *self.array.data.get();
            std::slice::from_raw_parts_mut(data.as_mut_ptr().add(self.start), self.len)
        }
    }
}

/// One segment: a data window plus the watermark dividing its readable
/// prefix from its writable suffix.
struct Segment {
    write_index: usize,
    data: SegmentData,
}

impl Segment {
    fn new(len: usize) -> Segment {
        Segment {
            write_index: 0,
            data: SegmentData::new(len),
        }
    }

    /// A segment whose entire window is already readable.
    fn from_readable(data: SegmentData) -> Segment {
        Segment {
            write_index: data.len,
            data,
        }
    }

    /// A segment whose entire window is writable capacity.
    fn from_writable(data: SegmentData) -> Segment {
        Segment {
            write_index: 0,
            data,
        }
    }

    fn read_available(&self) -> usize {
        self.write_index
    }

    fn write_available(&self) -> usize {
        self.data.len - self.write_index
    }

    fn len(&self) -> usize {
        self.data.len
    }

    fn produce(&mut self, len: usize) {
        assert!(len <= self.write_available());
        self.write_index += len;
    }

    fn consume(&mut self, len: usize) {
        assert!(len <= self.read_available());
        self.write_index -= len;
        self.data = self.data.slice_from(len);
    }

    fn truncate(&mut self, len: usize) {
        assert!(len <= self.read_available());
        assert!(self.write_available() == 0);
        self.write_index = len;
        self.data = self.data.slice(0, len);
    }

    /// Absorb `len` adjacent bytes of the same array as readable data.
    fn extend(&mut self, len: usize) {
        self.data.extend(len);
        self.write_index += len;
    }

    fn read_slice(&self) -> &[u8] {
        &self.data.as_slice()[..self.write_index]
    }

    fn write_slice(&mut self, len: usize) -> &mut [u8] {
        let start = self.write_index;
        &mut self.data.as_mut_slice()[start..start + len]
    }

    /// Shareable view of the readable prefix.
    fn read_data(&self) -> SegmentData {
        self.data.slice(0, self.write_index)
    }

    /// View of the writable suffix.
    fn write_data(&self) -> SegmentData {
        self.data.slice_from(self.write_index)
    }
}

/// Segmented byte container with scatter/gather views and zero-copy
/// append.
pub struct Buffer {
    segments: VecDeque<Segment>,
    read_available: usize,
    write_available: usize,
    /// Index of the first segment with writable capacity;
    /// `segments.len()` when there is none.
    write_index: usize,
}

impl Buffer {
    /// An empty buffer.
    pub fn new() -> Buffer {
        Buffer {
            segments: VecDeque::new(),
            read_available: 0,
            write_available: 0,
            write_index: 0,
        }
    }

    /// Readable bytes.
    pub fn read_available(&self) -> usize {
        self.read_available
    }

    /// Writable capacity.
    pub fn write_available(&self) -> usize {
        self.write_available
    }

    /// Number of segments (primarily for tests).
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Take ownership of `storage` as writable capacity, without copying.
    /// The vector's length is the adopted capacity.
    pub fn adopt(&mut self, storage: Vec<u8>) {
        let len = storage.len();
        let segment = Segment::from_writable(SegmentData::from_vec(storage));
        self.add_capacity_segment(segment);
        self.write_available += len;
    }

    /// Ensure at least `len` contiguous-or-not writable bytes exist,
    /// allocating one oversized segment if needed.
    pub fn reserve(&mut self, len: usize) {
        if self.write_available < len {
            // Over-reserve to keep later appends from fragmenting.
            let segment = Segment::new(len * 2 - self.write_available);
            let grown = segment.len();
            self.add_capacity_segment(segment);
            self.write_available += grown;
        }
    }

    /// Place a fresh all-writable segment, keeping the cursor invariant.
    fn add_capacity_segment(&mut self, segment: Segment) {
        if self.read_available == 0 {
            // Nothing readable; putting capacity up front avoids
            // fragmenting the readable run later.
            self.segments.push_front(segment);
            self.write_index = 0;
        } else {
            self.segments.push_back(segment);
            if self.write_available == 0 {
                self.write_index = self.segments.len() - 1;
            }
        }
    }

    /// Drop all writable capacity.
    pub fn compact(&mut self) {
        if self.write_index < self.segments.len() {
            if self.segments[self.write_index].read_available() > 0 {
                let readable =
                    Segment::from_readable(self.segments[self.write_index].read_data());
                self.segments[self.write_index].consume(readable.read_available());
                self.segments.insert(self.write_index, readable);
                self.write_index += 1;
            }
            self.segments.truncate(self.write_index);
            self.write_available = 0;
        }
        debug_assert_eq!(self.write_available, 0);
    }

    /// Reset the buffer. With `clear_write_available_as_well` false the
    /// write-cursor segment is rewound to writable-only and kept.
    pub fn clear(&mut self, clear_write_available_as_well: bool) {
        if clear_write_available_as_well {
            self.segments.clear();
            self.read_available = 0;
            self.write_available = 0;
            self.write_index = 0;
        } else {
            self.read_available = 0;
            if self.write_index < self.segments.len() {
                let readable = self.segments[self.write_index].read_available();
                if readable > 0 {
                    self.segments[self.write_index].consume(readable);
                }
            }
            for _ in 0..self.write_index.min(self.segments.len()) {
                self.segments.pop_front();
            }
            self.write_index = 0;
        }
        debug_assert_eq!(self.read_available, 0);
    }

    /// Move `len` bytes from writable to readable across the write cursor.
    pub fn produce(&mut self, mut len: usize) {
        assert!(len <= self.write_available);
        self.read_available += len;
        self.write_available -= len;
        while len > 0 {
            let segment = &mut self.segments[self.write_index];
            let todo = len.min(segment.write_available());
            segment.produce(todo);
            len -= todo;
            if segment.write_available() == 0 {
                self.write_index += 1;
            }
        }
    }

    /// Remove `len` readable bytes from the front.
    pub fn consume(&mut self, mut len: usize) {
        assert!(len <= self.read_available);
        self.read_available -= len;
        while len > 0 {
            let segment = &mut self.segments[0];
            let todo = len.min(segment.read_available());
            segment.consume(todo);
            len -= todo;
            if segment.len() == 0 {
                self.segments.pop_front();
                self.write_index -= 1;
            }
        }
    }

    /// Drop readable bytes past the first `len`.
    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.read_available);
        if len == self.read_available {
            return;
        }
        self.split_mixed_segment();
        self.read_available = len;
        let mut remaining = len;
        let mut index = 0;
        while index < self.segments.len() && remaining > 0 {
            let segment = &mut self.segments[index];
            if remaining <= segment.read_available() {
                segment.truncate(remaining);
                remaining = 0;
                index += 1;
                break;
            }
            remaining -= segment.read_available();
            index += 1;
        }
        debug_assert_eq!(remaining, 0);
        while index < self.segments.len() && self.segments[index].read_available() > 0 {
            debug_assert_eq!(self.segments[index].write_available(), 0);
            self.segments.remove(index);
            self.write_index -= 1;
        }
    }

    /// If the cursor segment is mixed, split its readable prefix into a
    /// segment of its own so the prefix can be shared read-only.
    fn split_mixed_segment(&mut self) {
        if self.write_index < self.segments.len()
            && self.segments[self.write_index].read_available() != 0
        {
            let readable = Segment::from_readable(self.segments[self.write_index].read_data());
            self.segments[self.write_index].consume(readable.read_available());
            self.segments.insert(self.write_index, readable);
            self.write_index += 1;
        }
    }

    /// Append `len` bytes (default: everything) of `other` starting at
    /// `pos`, sharing the underlying arrays instead of copying.
    pub fn copy_in(&mut self, other: &Buffer, len: Option<usize>, mut pos: usize) {
        assert!(pos <= other.read_available, "position out of range");
        let mut len = len.unwrap_or(other.read_available - pos);
        assert!(other.read_available >= len + pos);
        if len == 0 {
            return;
        }

        self.split_mixed_segment();

        let mut source = 0;
        while pos != 0 && source < other.segments.len() {
            if pos < other.segments[source].read_available() {
                break;
            }
            pos -= other.segments[source].read_available();
            source += 1;
        }
        debug_assert!(source < other.segments.len());

        let mut first_source = true;
        while source < other.segments.len() {
            let todo = (other.segments[source].read_available() - pos).min(len);
            // When the tail of this buffer and the incoming slice are
            // adjacent windows of one array, grow the tail in place.
            let merged = first_source && self.read_available != 0 && {
                let previous = &self.segments[self.write_index - 1];
                let incoming = &other.segments[source].data;
                previous.data.same_array(incoming)
                    && previous.data.start + previous.read_available() == incoming.start + pos
            };
            if merged {
                let previous = &mut self.segments[self.write_index - 1];
                debug_assert_eq!(previous.write_available(), 0);
                previous.extend(todo);
            } else {
                let data = other.segments[source].read_data().slice(pos, todo);
                self.segments.insert(self.write_index, Segment::from_readable(data));
                self.write_index += 1;
            }
            self.read_available += todo;
            len -= todo;
            pos = 0;
            if len == 0 {
                break;
            }
            source += 1;
            first_source = false;
        }
        debug_assert_eq!(len, 0);
    }

    /// Append a byte slice, filling existing writable capacity first.
    pub fn copy_in_bytes(&mut self, data: &[u8]) {
        let mut data = data;
        while self.write_index < self.segments.len() && !data.is_empty() {
            let segment = &mut self.segments[self.write_index];
            let todo = data.len().min(segment.write_available());
            segment.write_slice(todo).copy_from_slice(&data[..todo]);
            segment.produce(todo);
            self.write_available -= todo;
            self.read_available += todo;
            data = &data[todo..];
            if segment.write_available() == 0 {
                self.write_index += 1;
            }
        }
        if !data.is_empty() {
            let mut segment = Segment::new(data.len());
            segment.write_slice(data.len()).copy_from_slice(data);
            segment.produce(data.len());
            self.segments.push_back(segment);
            self.read_available += data.len();
            self.write_index = self.segments.len();
        }
    }

    /// Append `len` bytes starting at `pos` into another buffer without
    /// consuming them here (zero-copy, like [`Buffer::copy_in`] reversed).
    pub fn copy_out_buffer(&self, dest: &mut Buffer, len: usize, pos: usize) {
        dest.copy_in(self, Some(len), pos);
    }

    /// Read `out.len()` bytes starting at `pos` without consuming them.
    pub fn copy_out(&self, out: &mut [u8], mut pos: usize) {
        let mut len = out.len();
        if len == 0 {
            return;
        }
        assert!(len + pos <= self.read_available);
        let mut written = 0;
        for segment in &self.segments {
            let readable = segment.read_available();
            if pos >= readable {
                pos -= readable;
                continue;
            }
            let todo = len.min(readable - pos);
            out[written..written + todo]
                .copy_from_slice(&segment.read_slice()[pos..pos + todo]);
            written += todo;
            len -= todo;
            pos = 0;
            if len == 0 {
                break;
            }
        }
        debug_assert_eq!(len, 0);
    }

    /// Scatter/gather views over the first `len` readable bytes.
    pub fn read_buffers(&self, len: Option<usize>) -> Vec<IoSlice<'_>> {
        let len = len.unwrap_or(self.read_available);
        assert!(len <= self.read_available);
        let mut result = Vec::with_capacity(self.segments.len());
        let mut remaining = len;
        for segment in &self.segments {
            if remaining == 0 {
                break;
            }
            let todo = remaining.min(segment.read_available());
            if todo > 0 {
                result.push(IoSlice::new(&segment.read_slice()[..todo]));
            }
            remaining -= todo;
        }
        debug_assert_eq!(remaining, 0);
        result
    }

    /// Scatter/gather views over `len` writable bytes (reserving first).
    pub fn write_buffers(&mut self, len: Option<usize>) -> Vec<IoSliceMut<'_>> {
        let len = len.unwrap_or(self.write_available);
        self.reserve(len);
        let mut result = Vec::with_capacity(self.segments.len());
        let mut remaining = len;
        let write_index = self.write_index;
        for segment in self.segments.range_mut(write_index..) {
            if remaining == 0 {
                break;
            }
            let todo = remaining.min(segment.write_available());
            result.push(IoSliceMut::new(segment.write_slice(todo)));
            remaining -= todo;
        }
        debug_assert_eq!(remaining, 0);
        result
    }

    /// A contiguous view of the first `len` readable bytes (default: all).
    ///
    /// If the leading segment already holds `len` contiguous bytes it is
    /// returned as-is. Otherwise, with `coalesce`, the readable data is
    /// consolidated into a single segment (reusing the write-cursor
    /// segment as scratch when it is big enough); without `coalesce`, as
    /// much as the leading segment provides is returned.
    pub fn read_buffer(&mut self, len: Option<usize>, coalesce: bool) -> &[u8] {
        let len = len.unwrap_or(self.read_available);
        assert!(len <= self.read_available);
        if len == 0 {
            return &[];
        }
        let front_readable = self.segments[0].read_available();
        if front_readable < len && coalesce {
            self.coalesce_readable();
        }
        let front = &self.segments[0];
        let available = len.min(front.read_available());
        &front.read_slice()[..available]
    }

    /// Consolidate every readable byte into one segment, dropping all
    /// writable capacity.
    fn coalesce_readable(&mut self) {
        let total = self.read_available;
        let reuse_cursor = self.write_index < self.segments.len()
            && self.segments[self.write_index].write_available() >= total;
        let consolidated = if reuse_cursor {
            // The cursor segment has room: copy everything into its write
            // region and slice that region off as the new readable run.
            let mut cursor = self.segments.remove(self.write_index).unwrap();
            {
                let own_len = cursor.read_available();
                let mut gathered = 0;
                // SAFETY: the destination is the cursor's writable suffix;
                // every source region (including the cursor's own readable
                // prefix, which sits immediately below the suffix in the
                // same array) is disjoint from it.
                let dest = cursor.write_slice(total).as_mut_ptr();
                for segment in self.segments.iter().take(self.write_index) {
                    let src = segment.read_slice();
                    unsafe {
                        std::ptr::copy_nonoverlapping(src.as_ptr(), dest.add(gathered), src.len());
                    }
                    gathered += src.len();
                }
                unsafe {
                    std::ptr::copy_nonoverlapping(dest.sub(own_len), dest.add(gathered), own_len);
                }
                gathered += own_len;
                debug_assert_eq!(gathered, total);
            }
            Segment::from_readable(cursor.write_data().slice(0, total))
        } else {
            let mut segment = Segment::new(total);
            self.copy_out(segment.write_slice(total), 0);
            segment.produce(total);
            segment
        };
        self.segments.clear();
        self.segments.push_back(consolidated);
        self.write_available = 0;
        self.write_index = self.segments.len();
    }

    /// A contiguous writable region of `len` bytes.
    ///
    /// Uses the cursor segment when it has room; otherwise, with
    /// `coalesce`, drops fragmented capacity and reserves anew; without
    /// it, returns as much as the cursor segment provides.
    pub fn write_buffer(&mut self, len: usize, coalesce: bool) -> &mut [u8] {
        if len == 0 {
            return &mut [];
        }
        if self.write_available == 0 {
            self.reserve(len);
        } else if self.segments[self.write_index].write_available() < len && coalesce {
            self.compact();
            self.reserve(len);
        }
        let segment = &mut self.segments[self.write_index];
        let available = len.min(segment.write_available());
        segment.write_slice(available)
    }

    /// Readable slices clipped to the first `limit` bytes.
    fn readable_spans(&self, limit: usize) -> Vec<&[u8]> {
        let mut spans = Vec::with_capacity(self.segments.len());
        let mut remaining = limit;
        for segment in &self.segments {
            if remaining == 0 {
                break;
            }
            let todo = remaining.min(segment.read_available());
            if todo > 0 {
                spans.push(&segment.read_slice()[..todo]);
            }
            remaining -= todo;
        }
        spans
    }

    /// Offset of the first occurrence of `delim` in the first `len`
    /// readable bytes (default: all).
    pub fn find_byte(&self, delim: u8, len: Option<usize>) -> Option<usize> {
        let limit = len.unwrap_or(self.read_available);
        assert!(limit <= self.read_available);
        let mut base = 0;
        for span in self.readable_spans(limit) {
            if let Some(position) = span.iter().position(|&b| b == delim) {
                return Some(base + position);
            }
            base += span.len();
        }
        None
    }

    /// Offset of the first occurrence of the byte string `delim` in the
    /// first `len` readable bytes. Matches spanning segment boundaries are
    /// found, and failed partial matches restart correctly: the result is
    /// the same as searching a flat copy.
    pub fn find(&self, delim: &[u8], len: Option<usize>) -> Option<usize> {
        let limit = len.unwrap_or(self.read_available);
        assert!(limit <= self.read_available);
        assert!(!delim.is_empty());
        if delim.len() > limit {
            return None;
        }
        let spans = self.readable_spans(limit);
        let mut span = 0;
        let mut offset = 0;
        for start in 0..=limit - delim.len() {
            let (mut si, mut so) = (span, offset);
            let mut matched = true;
            for &expected in delim {
                while so == spans[si].len() {
                    si += 1;
                    so = 0;
                }
                if spans[si][so] != expected {
                    matched = false;
                    break;
                }
                so += 1;
            }
            if matched {
                return Some(start);
            }
            offset += 1;
            while span < spans.len() && offset == spans[span].len() {
                span += 1;
                offset = 0;
            }
        }
        None
    }

    /// All readable bytes as an owned vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut result = vec![0u8; self.read_available];
        self.copy_out(&mut result, 0);
        result
    }

    /// Find `delim`, then consume and return everything up to it.
    ///
    /// With `eof_is_delim`, running out of data terminates the field and
    /// returns what is left; otherwise that is [`UnexpectedEof`]. With
    /// `include_delim` the delimiter is part of the result; it is consumed
    /// either way.
    ///
    /// [`UnexpectedEof`]: crate::error::Error::UnexpectedEof
    pub fn get_delimited(
        &mut self,
        delim: &[u8],
        eof_is_delim: bool,
        include_delim: bool,
    ) -> crate::Result<Vec<u8>> {
        let offset = self.find(delim, None);
        if offset.is_none() && !eof_is_delim {
            return Err(crate::Error::UnexpectedEof);
        }
        let hit_eof = offset.is_none();
        let offset = offset.unwrap_or(self.read_available);

        let result_len = offset + if !hit_eof && include_delim { delim.len() } else { 0 };
        let mut result = vec![0u8; result_len];
        self.copy_out(&mut result, 0);
        self.consume(result.len());
        if !hit_eof && !include_delim {
            self.consume(delim.len());
        }
        Ok(result)
    }

    /// Single-byte variant of [`Buffer::get_delimited`].
    pub fn get_delimited_byte(
        &mut self,
        delim: u8,
        eof_is_delim: bool,
        include_delim: bool,
    ) -> crate::Result<Vec<u8>> {
        self.get_delimited(&[delim], eof_is_delim, include_delim)
    }

    /// Call `visit` with each readable slice, in order, over the first
    /// `len` bytes (default: all).
    pub fn visit(&self, mut visit: impl FnMut(&[u8]), len: Option<usize>) {
        let limit = len.unwrap_or(self.read_available);
        assert!(limit <= self.read_available);
        for span in self.readable_spans(limit) {
            visit(span);
        }
    }

    fn cmp_slices(&self, other: &Buffer) -> Ordering {
        let mut left = self.readable_spans(self.read_available).into_iter();
        let mut right = other.readable_spans(other.read_available).into_iter();
        let (mut l, mut r): (&[u8], &[u8]) = (&[], &[]);
        loop {
            if l.is_empty() {
                l = left.next().unwrap_or(&[]);
            }
            if r.is_empty() {
                r = right.next().unwrap_or(&[]);
            }
            match (l.is_empty(), r.is_empty()) {
                (true, true) => return Ordering::Equal,
                (true, false) => return Ordering::Less,
                (false, true) => return Ordering::Greater,
                (false, false) => {}
            }
            let todo = l.len().min(r.len());
            match l[..todo].cmp(&r[..todo]) {
                Ordering::Equal => {
                    l = &l[todo..];
                    r = &r[todo..];
                }
                unequal => return unequal,
            }
        }
    }

    fn eq_slice(&self, mut other: &[u8]) -> bool {
        if other.len() != self.read_available {
            return false;
        }
        for span in self.readable_spans(self.read_available) {
            if &other[..span.len()] != span {
                return false;
            }
            other = &other[span.len()..];
        }
        true
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Buffer {
        let mut buffer = Buffer::new();
        buffer.copy_in_bytes(data);
        buffer
    }
}

impl From<&str> for Buffer {
    fn from(data: &str) -> Buffer {
        Buffer::from(data.as_bytes())
    }
}

impl Clone for Buffer {
    /// Zero-copy clone: the readable bytes are shared, writable capacity
    /// is not carried over.
    fn clone(&self) -> Buffer {
        let mut buffer = Buffer::new();
        buffer.copy_in(self, None, 0);
        buffer
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Buffer) -> bool {
        self.read_available == other.read_available
            && self.cmp_slices(other) == Ordering::Equal
    }
}

impl Eq for Buffer {}

impl PartialOrd for Buffer {
    fn partial_cmp(&self, other: &Buffer) -> Option<Ordering> {
        Some(self.cmp_slices(other))
    }
}

impl Ord for Buffer {
    fn cmp(&self, other: &Buffer) -> Ordering {
        self.cmp_slices(other)
    }
}

impl PartialEq<[u8]> for Buffer {
    fn eq(&self, other: &[u8]) -> bool {
        self.eq_slice(other)
    }
}

impl PartialEq<&[u8]> for Buffer {
    fn eq(&self, other: &&[u8]) -> bool {
        self.eq_slice(other)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("read_available", &self.read_available)
            .field("write_available", &self.write_available)
            .field("segments", &self.segments.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concat(slices: &[IoSlice<'_>]) -> Vec<u8> {
        let mut out = Vec::new();
        for s in slices {
            out.extend_from_slice(s);
        }
        out
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = Buffer::new();
        assert_eq!(buffer.read_available(), 0);
        assert_eq!(buffer.write_available(), 0);
        assert_eq!(buffer.segment_count(), 0);
        assert_eq!(buffer.to_vec(), b"");
    }

    #[test]
    fn test_copy_in_bytes_and_out() {
        let mut buffer = Buffer::new();
        buffer.copy_in_bytes(b"hello world");
        assert_eq!(buffer.read_available(), 11);
        assert_eq!(buffer.to_vec(), b"hello world");

        let mut out = [0u8; 5];
        buffer.copy_out(&mut out, 6);
        assert_eq!(&out, b"world");
        // copy_out did not consume.
        assert_eq!(buffer.read_available(), 11);
    }

    #[test]
    fn test_produce_consume_round_trip() {
        let mut buffer = Buffer::new();
        buffer.reserve(16);
        let initial_write = buffer.write_available();
        buffer.write_buffer(4, false).copy_from_slice(b"abcd");
        buffer.produce(4);
        assert_eq!(buffer.read_available(), 4);
        assert_eq!(buffer.write_available(), initial_write - 4);
        buffer.consume(4);
        assert_eq!(buffer.read_available(), 0);
    }

    #[test]
    fn test_consume_drops_suffix_equality() {
        let mut buffer = Buffer::new();
        buffer.copy_in_bytes(b"abcdefgh");
        let original = buffer.to_vec();
        let mut tmp = [0u8; 3];
        buffer.copy_out(&mut tmp, 0);
        buffer.consume(3);
        assert_eq!(buffer.read_available(), 5);
        assert_eq!(buffer.to_vec(), &original[3..]);
    }

    #[test]
    fn test_reserve_over_allocates() {
        let mut buffer = Buffer::new();
        buffer.reserve(100);
        assert_eq!(buffer.write_available(), 200);
        // Already satisfied: no growth.
        buffer.reserve(150);
        assert_eq!(buffer.write_available(), 200);
    }

    #[test]
    fn test_copy_in_is_zero_copy() {
        let mut source = Buffer::new();
        source.copy_in_bytes(b"0123456789");
        let mut dest = Buffer::new();
        dest.copy_in(&source, None, 0);
        assert_eq!(dest.to_vec(), b"0123456789");
        // Shared, not copied: one segment straight from the source.
        assert_eq!(dest.segment_count(), 1);

        let mut partial = Buffer::new();
        partial.copy_in(&source, Some(4), 3);
        assert_eq!(partial.to_vec(), b"3456");
    }

    #[test]
    fn test_copy_in_merges_adjacent_slices() {
        let mut source = Buffer::new();
        source.copy_in_bytes(b"0123456789");
        let mut dest = Buffer::new();
        dest.copy_in(&source, Some(5), 0);
        dest.copy_in(&source, Some(5), 5);
        // Adjacent windows of one array collapse into one segment.
        assert_eq!(dest.segment_count(), 1);
        assert_eq!(dest.to_vec(), b"0123456789");
    }

    #[test]
    fn test_copy_in_locatable_at_insertion_point() {
        let mut buffer = Buffer::new();
        buffer.copy_in_bytes(b"prefix");
        let insertion_point = buffer.read_available();
        buffer.copy_in_bytes(b"needle");
        assert_eq!(buffer.find(b"needle", None), Some(insertion_point));
    }

    #[test]
    fn test_read_buffers_concat_matches_flat_view() {
        let mut buffer = Buffer::new();
        buffer.copy_in_bytes(b"first-");
        let mut other = Buffer::new();
        other.copy_in_bytes(b"second");
        buffer.copy_in(&other, None, 0);
        assert!(buffer.segment_count() >= 2);
        assert_eq!(concat(&buffer.read_buffers(None)), buffer.to_vec());
        assert_eq!(concat(&buffer.read_buffers(Some(8))), b"first-se");
    }

    #[test]
    fn test_write_buffers_cover_request() {
        let mut buffer = Buffer::new();
        buffer.reserve(8);
        buffer.copy_in_bytes(b"xy");
        let views = buffer.write_buffers(Some(10));
        let total: usize = views.iter().map(|v| v.len()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_read_buffer_coalesces_across_segments() {
        let mut buffer = Buffer::new();
        buffer.copy_in_bytes(b"abc");
        let mut other = Buffer::new();
        other.copy_in_bytes(b"def");
        buffer.copy_in(&other, None, 0);
        assert!(buffer.segment_count() >= 2);

        // Without coalescing only the leading segment's bytes come back.
        assert_eq!(buffer.read_buffer(None, false), b"abc");
        // Coalescing produces the full contiguous run.
        assert_eq!(buffer.read_buffer(None, true), b"abcdef");
        assert_eq!(buffer.segment_count(), 1);
    }

    #[test]
    fn test_read_buffer_reuses_cursor_scratch() {
        let mut buffer = Buffer::new();
        buffer.copy_in_bytes(b"abc");
        let mut other = Buffer::new();
        other.copy_in_bytes(b"def");
        buffer.copy_in(&other, None, 0);
        // Plenty of writable room in the cursor segment.
        buffer.reserve(64);
        assert_eq!(buffer.read_buffer(None, true), b"abcdef");
        assert_eq!(buffer.to_vec(), b"abcdef");
    }

    #[test]
    fn test_find_across_segment_boundary() {
        let mut buffer = Buffer::new();
        buffer.copy_in_bytes(b"hel");
        let mut other = Buffer::new();
        other.copy_in_bytes(b"lo world");
        buffer.copy_in(&other, None, 0);
        assert!(buffer.segment_count() >= 2);
        assert_eq!(buffer.find(b"llo", None), Some(2));
        assert_eq!(buffer.find(b"lo w", None), Some(3));
        assert_eq!(buffer.find_byte(b'w', None), Some(6));
        assert_eq!(buffer.find(b"xyz", None), None);
    }

    #[test]
    fn test_find_restarts_failed_partial_match() {
        // A partial match that dies at a segment boundary must not eat the
        // bytes a later match starts in.
        let mut buffer = Buffer::new();
        buffer.copy_in_bytes(b"aa");
        let mut other = Buffer::new();
        other.copy_in_bytes(b"ab");
        buffer.copy_in(&other, None, 0);
        // Flat view is "aaab"; "aab" starts at 1.
        assert_eq!(buffer.find(b"aab", None), Some(1));
    }

    #[test]
    fn test_find_respects_length_limit() {
        let mut buffer = Buffer::new();
        buffer.copy_in_bytes(b"abcdef");
        assert_eq!(buffer.find(b"cd", Some(3)), None);
        assert_eq!(buffer.find(b"cd", Some(4)), Some(2));
        assert_eq!(buffer.find_byte(b'f', Some(5)), None);
    }

    #[test]
    fn test_get_delimited() {
        let mut buffer = Buffer::new();
        buffer.copy_in_bytes(b"one\ntwo\nthree");
        assert_eq!(buffer.get_delimited_byte(b'\n', true, true).unwrap(), b"one\n");
        assert_eq!(buffer.get_delimited_byte(b'\n', true, false).unwrap(), b"two");
        // EOF terminates the last field.
        assert_eq!(buffer.get_delimited_byte(b'\n', true, true).unwrap(), b"three");
        assert_eq!(buffer.read_available(), 0);
    }

    #[test]
    fn test_get_delimited_eof_error() {
        let mut buffer = Buffer::new();
        buffer.copy_in_bytes(b"no delimiter here");
        let err = buffer.get_delimited_byte(b'\n', false, true).unwrap_err();
        assert!(matches!(err, crate::Error::UnexpectedEof));
    }

    #[test]
    fn test_get_delimited_multi_byte() {
        let mut buffer = Buffer::new();
        buffer.copy_in_bytes(b"head\r\nbody");
        assert_eq!(buffer.get_delimited(b"\r\n", true, false).unwrap(), b"head");
        assert_eq!(buffer.to_vec(), b"body");
    }

    #[test]
    fn test_truncate() {
        let mut buffer = Buffer::new();
        buffer.copy_in_bytes(b"truncate me");
        buffer.truncate(8);
        assert_eq!(buffer.to_vec(), b"truncate");

        // Across segments.
        let mut head = Buffer::new();
        head.copy_in_bytes(b"abc");
        let mut tail = Buffer::new();
        tail.copy_in_bytes(b"defgh");
        head.copy_in(&tail, None, 0);
        head.truncate(4);
        assert_eq!(head.to_vec(), b"abcd");
    }

    #[test]
    fn test_clear_keeps_write_capacity() {
        let mut buffer = Buffer::new();
        buffer.reserve(32);
        buffer.copy_in_bytes(b"data");
        let write_before = buffer.write_available();
        buffer.clear(false);
        assert_eq!(buffer.read_available(), 0);
        assert_eq!(buffer.write_available(), write_before);

        buffer.copy_in_bytes(b"reused");
        assert_eq!(buffer.to_vec(), b"reused");
        buffer.clear(true);
        assert_eq!(buffer.write_available(), 0);
        assert_eq!(buffer.segment_count(), 0);
    }

    #[test]
    fn test_compact_drops_capacity() {
        let mut buffer = Buffer::new();
        buffer.copy_in_bytes(b"keep");
        buffer.reserve(64);
        buffer.compact();
        assert_eq!(buffer.write_available(), 0);
        assert_eq!(buffer.to_vec(), b"keep");
    }

    #[test]
    fn test_adopt_vector_as_capacity() {
        let mut buffer = Buffer::new();
        buffer.adopt(vec![0u8; 16]);
        assert_eq!(buffer.write_available(), 16);
        buffer.copy_in_bytes(b"adopted");
        assert_eq!(buffer.to_vec(), b"adopted");
        // The adopted segment was used, not a fresh allocation.
        assert_eq!(buffer.segment_count(), 1);
    }

    #[test]
    fn test_equality_across_segment_layouts() {
        let mut fragmented = Buffer::new();
        fragmented.copy_in_bytes(b"ab");
        let mut tail = Buffer::new();
        tail.copy_in_bytes(b"cd");
        fragmented.copy_in(&tail, None, 0);

        let flat = Buffer::from(&b"abcd"[..]);
        assert_eq!(fragmented, flat);
        assert_eq!(fragmented, &b"abcd"[..]);
        assert!(fragmented != &b"abce"[..]);

        let smaller = Buffer::from(&b"abca"[..]);
        assert_eq!(flat.cmp(&smaller), Ordering::Greater);
        assert_eq!(smaller.cmp(&flat), Ordering::Less);
        let prefix = Buffer::from(&b"abc"[..]);
        assert_eq!(prefix.cmp(&flat), Ordering::Less);
    }

    #[test]
    fn test_visit_covers_all_spans() {
        let mut buffer = Buffer::new();
        buffer.copy_in_bytes(b"xx");
        let mut other = Buffer::new();
        other.copy_in_bytes(b"yy");
        buffer.copy_in(&other, None, 0);
        let mut seen = Vec::new();
        buffer.visit(|span| seen.extend_from_slice(span), None);
        assert_eq!(seen, b"xxyy");
    }

    #[test]
    fn test_clone_shares_segments() {
        let mut buffer = Buffer::new();
        buffer.copy_in_bytes(b"shared");
        let clone = buffer.clone();
        assert_eq!(clone, buffer);
        buffer.consume(3);
        assert_eq!(clone.to_vec(), b"shared");
        assert_eq!(buffer.to_vec(), b"red");
    }

    #[test]
    fn test_mixed_segment_split_on_copy_in() {
        let mut buffer = Buffer::new();
        buffer.reserve(32);
        buffer.copy_in_bytes(b"mixed");
        // The cursor segment is now mixed (readable prefix + capacity).
        let mut other = Buffer::new();
        other.copy_in_bytes(b"tail");
        buffer.copy_in(&other, None, 0);
        assert_eq!(buffer.to_vec(), b"mixedtail");
        // Capacity survives behind the cursor.
        assert!(buffer.write_available() > 0);
        buffer.copy_in_bytes(b"+more");
        assert_eq!(buffer.to_vec(), b"mixedtail+more");
    }
}
