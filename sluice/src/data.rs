use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

/// Fixed chunk size. Views never straddle a chunk.
pub const CHUNK_SIZE: usize = 4096;

/// A reference-counted fixed-size byte chunk. One chunk may back many views
/// across many `Data` ropes; a view writes into its chunk only while it is
/// the sole owner.
struct Chunk {
    bytes: [u8; CHUNK_SIZE],
}

impl Chunk {
    fn new() -> Rc<Chunk> {
        Rc::new(Chunk {
            bytes: [0; CHUNK_SIZE],
        })
    }
}

/// A (chunk, offset, length) window. Owned by exactly one `Data`.
struct View {
    chunk: Rc<Chunk>,
    offset: usize,
    length: usize,
}

impl View {
    fn slice(&self) -> &[u8] {
        &self.chunk.bytes[self.offset..self.offset + self.length]
    }

    /// Splits off the last `n` bytes into a new view.
    fn pop(&mut self, n: usize) -> View {
        self.length -= n;
        View {
            chunk: self.chunk.clone(),
            offset: self.offset + self.length,
            length: n,
        }
    }

    /// Splits off the first `n` bytes into a new view.
    fn shift(&mut self, n: usize) -> View {
        let view = View {
            chunk: self.chunk.clone(),
            offset: self.offset,
            length: n,
        };
        self.offset += n;
        self.length -= n;
        view
    }
}

/// An ordered sequence of views behaving as one logical byte string.
///
/// Structural operations (`push` of another rope, `pop`, `shift`,
/// `shift_while`) move or split views without copying content. Appending raw
/// bytes writes in place when the tail chunk is exclusively owned and has
/// room, merging with the tail view.
#[derive(Default)]
pub struct Data {
    views: VecDeque<View>,
    size: usize,
}

impl Data {
    pub fn new() -> Data {
        Data {
            views: VecDeque::new(),
            size: 0,
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Data {
        let mut data = Data::new();
        data.push_slice(bytes);
        data
    }

    pub fn from_str(s: &str) -> Data {
        Data::from_slice(s.as_bytes())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn clear(&mut self) {
        self.views.clear();
        self.size = 0;
    }

    /// Appends another rope by moving its views over.
    pub fn push(&mut self, mut other: Data) {
        self.size += other.size;
        if let Some(front) = other.views.pop_front() {
            self.push_view(front);
        }
        // Only the seam can merge; the rest transfers wholesale.
        self.views.extend(other.views.drain(..));
        other.size = 0;
    }

    pub fn push_u8(&mut self, byte: u8) {
        self.push_slice(&[byte]);
    }

    pub fn push_str(&mut self, s: &str) {
        self.push_slice(s.as_bytes());
    }

    /// Appends raw bytes. Writes into the tail chunk while this rope is its
    /// only owner and tail room remains; allocates new chunks for the rest.
    pub fn push_slice(&mut self, bytes: &[u8]) {
        let mut p = bytes;
        if let Some(tail) = self.views.back_mut() {
            let end = tail.offset + tail.length;
            if end < CHUNK_SIZE {
                if let Some(chunk) = Rc::get_mut(&mut tail.chunk) {
                    let room = (CHUNK_SIZE - end).min(p.len());
                    chunk.bytes[end..end + room].copy_from_slice(&p[..room]);
                    tail.length += room;
                    self.size += room;
                    p = &p[room..];
                }
            }
        }
        while !p.is_empty() {
            let mut chunk = Chunk::new();
            let room = CHUNK_SIZE.min(p.len());
            Rc::get_mut(&mut chunk)
                .expect("freshly allocated chunk is unshared")
                .bytes[..room]
                .copy_from_slice(&p[..room]);
            p = &p[room..];
            self.views.push_back(View {
                chunk,
                offset: 0,
                length: room,
            });
            self.size += room;
        }
    }

    fn push_view(&mut self, view: View) {
        if view.length == 0 {
            return;
        }
        if let Some(tail) = self.views.back_mut() {
            if Rc::ptr_eq(&tail.chunk, &view.chunk) && tail.offset + tail.length == view.offset {
                tail.length += view.length;
                return;
            }
        }
        self.views.push_back(view);
    }

    fn unshift_view(&mut self, view: View) {
        if view.length == 0 {
            return;
        }
        if let Some(head) = self.views.front_mut() {
            if Rc::ptr_eq(&head.chunk, &view.chunk) && view.offset + view.length == head.offset {
                head.offset = view.offset;
                head.length += view.length;
                return;
            }
        }
        self.views.push_front(view);
    }

    /// Drops the last `n` bytes.
    pub fn pop(&mut self, mut n: usize) {
        while n > 0 {
            let tail = match self.views.back_mut() {
                Some(v) => v,
                None => break,
            };
            if tail.length <= n {
                n -= tail.length;
                self.size -= tail.length;
                self.views.pop_back();
            } else {
                tail.length -= n;
                self.size -= n;
                break;
            }
        }
    }

    /// Moves the last `n` bytes to the front of `out`.
    pub fn pop_to(&mut self, mut n: usize, out: &mut Data) {
        while n > 0 {
            let tail = match self.views.back_mut() {
                Some(v) => v,
                None => break,
            };
            if tail.length <= n {
                n -= tail.length;
                self.size -= tail.length;
                let view = self.views.pop_back().expect("tail checked above");
                out.size += view.length;
                out.unshift_view(view);
            } else {
                let view = tail.pop(n);
                self.size -= n;
                out.size += n;
                out.unshift_view(view);
                break;
            }
        }
    }

    /// Drops the first `n` bytes.
    pub fn shift(&mut self, mut n: usize) {
        while n > 0 {
            let head = match self.views.front_mut() {
                Some(v) => v,
                None => break,
            };
            if head.length <= n {
                n -= head.length;
                self.size -= head.length;
                self.views.pop_front();
            } else {
                head.offset += n;
                head.length -= n;
                self.size -= n;
                break;
            }
        }
    }

    /// Moves the first `n` bytes to the back of `out`.
    pub fn shift_to(&mut self, mut n: usize, out: &mut Data) {
        while n > 0 {
            let head = match self.views.front_mut() {
                Some(v) => v,
                None => break,
            };
            if head.length <= n {
                n -= head.length;
                self.size -= head.length;
                let view = self.views.pop_front().expect("head checked above");
                out.size += view.length;
                out.push_view(view);
            } else {
                let view = head.shift(n);
                self.size -= n;
                out.size += n;
                out.push_view(view);
                break;
            }
        }
    }

    /// Moves leading bytes satisfying `f` to `out`, stopping at the first byte
    /// that fails the predicate (which stays in `self`).
    pub fn shift_while(&mut self, mut f: impl FnMut(u8) -> bool, out: &mut Data) {
        loop {
            let head = match self.views.front_mut() {
                Some(v) => v,
                None => break,
            };
            let slice = head.slice();
            let mut n = 0;
            while n < slice.len() && f(slice[n]) {
                n += 1;
            }
            if n == slice.len() {
                self.size -= n;
                let view = self.views.pop_front().expect("head checked above");
                out.size += view.length;
                out.push_view(view);
            } else {
                if n > 0 {
                    let view = head.shift(n);
                    self.size -= n;
                    out.size += n;
                    out.push_view(view);
                }
                break;
            }
        }
    }

    /// Moves leading bytes to `out` up to and including the first byte for
    /// which `f` returns true.
    pub fn shift_until(&mut self, mut f: impl FnMut(u8) -> bool, out: &mut Data) {
        let mut hit = false;
        self.shift_while(
            |c| {
                if hit {
                    return false;
                }
                if f(c) {
                    hit = true;
                }
                true
            },
            out,
        );
    }

    /// Visits every (contiguous) byte run in order.
    pub fn for_each_chunk(&self, mut f: impl FnMut(&[u8])) {
        for view in &self.views {
            f(view.slice());
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        for view in &self.views {
            out.extend_from_slice(view.slice());
        }
        out
    }

    /// Copies the rope into `buf`, which must hold at least `len()` bytes.
    pub fn to_bytes(&self, buf: &mut [u8]) {
        let mut i = 0;
        for view in &self.views {
            let s = view.slice();
            buf[i..i + s.len()].copy_from_slice(s);
            i += s.len();
        }
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.to_vec()).into_owned()
    }

    /// Takes the whole rope, leaving this one empty.
    pub fn take_all(&mut self) -> Data {
        std::mem::replace(self, Data::new())
    }

    pub fn reader(&self) -> Reader {
        Reader {
            data: self,
            view: 0,
            offset: 0,
            position: 0,
        }
    }

    #[cfg(test)]
    fn view_count(&self) -> usize {
        self.views.len()
    }
}

impl Clone for Data {
    fn clone(&self) -> Data {
        let mut views = VecDeque::with_capacity(self.views.len());
        for v in &self.views {
            views.push_back(View {
                chunk: v.chunk.clone(),
                offset: v.offset,
                length: v.length,
            });
        }
        Data {
            views,
            size: self.size,
        }
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Data({} bytes, {} views)", self.size, self.views.len())
    }
}

impl PartialEq for Data {
    fn eq(&self, other: &Data) -> bool {
        self.size == other.size && self.to_vec() == other.to_vec()
    }
}

/// Sequential non-consuming reader over a rope. Codecs use this to pick typed
/// fields out of an already-framed payload.
pub struct Reader<'a> {
    data: &'a Data,
    view: usize,
    offset: usize,
    position: usize,
}

impl<'a> Reader<'a> {
    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.size - self.position
    }

    /// Next byte, or `None` at the end of the rope.
    pub fn get(&mut self) -> Option<u8> {
        while self.view < self.data.views.len() {
            let v = &self.data.views[self.view];
            if self.offset < v.length {
                let c = v.slice()[self.offset];
                self.offset += 1;
                self.position += 1;
                return Some(c);
            }
            self.view += 1;
            self.offset = 0;
        }
        None
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.get()
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        let hi = self.get()? as u16;
        let lo = self.get()? as u16;
        Some((hi << 8) | lo)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let mut n = 0u32;
        for _ in 0..4 {
            n = (n << 8) | self.get()? as u32;
        }
        Some(n)
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        let mut n = 0u64;
        for _ in 0..8 {
            n = (n << 8) | self.get()? as u64;
        }
        Some(n)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> bool {
        for b in buf.iter_mut() {
            match self.get() {
                Some(c) => *b = c,
                None => return false,
            }
        }
        true
    }

    /// Reads `n` bytes into a fresh rope. Returns `None` when fewer remain.
    pub fn read_data(&mut self, n: usize) -> Option<Data> {
        if self.remaining() < n {
            return None;
        }
        let mut out = Data::new();
        let mut left = n;
        while left > 0 {
            let v = &self.data.views[self.view];
            let avail = v.length - self.offset;
            if avail == 0 {
                self.view += 1;
                self.offset = 0;
                continue;
            }
            let take = avail.min(left);
            out.push_view(View {
                chunk: v.chunk.clone(),
                offset: v.offset + self.offset,
                length: take,
            });
            out.size += take;
            self.offset += take;
            self.position += take;
            left -= take;
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_push_slice_in_place_append() {
        let mut data = Data::new();
        data.push_slice(b"hello");
        data.push_slice(b" world");

        // Both writes land in the same exclusively-owned chunk.
        assert_eq!(data.view_count(), 1);
        assert_eq!(data.to_vec(), b"hello world");
    }

    #[test]
    fn test_push_shared_chunk_allocates() {
        let mut data = Data::new();
        data.push_slice(b"hello");
        let copy = data.clone();

        // The tail chunk is shared now, so the append may not write in place.
        data.push_slice(b"!");
        assert_eq!(data.to_vec(), b"hello!");
        assert_eq!(copy.to_vec(), b"hello");
    }

    #[test]
    fn test_shift_to_and_merge() {
        let mut data = Data::from_slice(b"abcdef");
        let mut front = Data::new();
        data.shift_to(3, &mut front);

        assert_eq!(front.to_vec(), b"abc");
        assert_eq!(data.to_vec(), b"def");

        // Putting the halves back together merges the adjacent views.
        front.push(data);
        assert_eq!(front.to_vec(), b"abcdef");
        assert_eq!(front.view_count(), 1);
    }

    #[test]
    fn test_pop_to_prepends() {
        let mut data = Data::from_slice(b"abcdef");
        let mut back = Data::new();
        data.pop_to(2, &mut back);
        data.pop_to(2, &mut back);

        assert_eq!(data.to_vec(), b"ab");
        assert_eq!(back.to_vec(), b"cdef");
    }

    #[test]
    fn test_shift_while_predicate() {
        let mut data = Data::from_slice(b"123abc");
        let mut digits = Data::new();
        data.shift_while(|c| c.is_ascii_digit(), &mut digits);

        assert_eq!(digits.to_vec(), b"123");
        assert_eq!(data.to_vec(), b"abc");
    }

    #[test]
    fn test_shift_until_includes_delimiter() {
        let mut data = Data::from_slice(b"line\nrest");
        let mut line = Data::new();
        data.shift_until(|c| c == b'\n', &mut line);

        assert_eq!(line.to_vec(), b"line\n");
        assert_eq!(data.to_vec(), b"rest");
    }

    #[test]
    fn test_cross_chunk_operations() {
        let big: Vec<u8> = (0..CHUNK_SIZE * 2 + 100).map(|i| i as u8).collect();
        let mut data = Data::from_slice(&big);
        assert_eq!(data.len(), big.len());

        let mut head = Data::new();
        data.shift_to(CHUNK_SIZE + 1, &mut head);
        assert_eq!(head.to_vec(), &big[..CHUNK_SIZE + 1]);
        assert_eq!(data.to_vec(), &big[CHUNK_SIZE + 1..]);
    }

    #[test]
    fn test_split_concat_preserves_bytes() {
        // For any split/concat sequence the observed bytes equal the original.
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let len = rng.gen_range(1..5000);
            let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let mut data = Data::from_slice(&bytes);

            let n = rng.gen_range(0..=len);
            let mut out = Data::new();
            data.shift_to(n, &mut out);
            out.push(data);
            assert_eq!(out.to_vec(), bytes);
        }
    }

    #[test]
    fn test_reader() {
        let mut data = Data::from_slice(b"\x01\x02\x03\x04rest");
        let mut tail = Data::new();
        data.shift_to(2, &mut tail);
        tail.push(data); // force a view boundary inside the reader's range

        let mut r = tail.reader();
        assert_eq!(r.read_u32(), Some(0x01020304));
        assert_eq!(r.position(), 4);
        let rest = r.read_data(4).unwrap();
        assert_eq!(rest.to_vec(), b"rest");
        assert_eq!(r.get(), None);
    }

    #[test]
    fn test_reader_read_data_short() {
        let data = Data::from_slice(b"ab");
        let mut r = data.reader();
        assert!(r.read_data(3).is_none());
        assert_eq!(r.position(), 0);
    }
}
