//! Packet buffers: reference-counted, chainable byte containers.
//!
//! A `Pbuf` is a chain of immutable segments. Cloning a handle increments the
//! reference count of every segment it covers; dropping the last handle over
//! a segment releases its storage. `cat` transfers ownership of an appended
//! chain, `chain` shares it so both owners free independently.

use std::sync::Arc;

use crate::support::{DriverError, DriverResult};
use crate::types::{Ip, Port};

struct Segment {
    data: Box<[u8]>,
}

pub struct Pbuf {
    segs: Vec<Arc<Segment>>,
    tot_len: usize,
    source: Option<(Ip, Port)>,
}

impl Clone for Pbuf {
    /// Equivalent of taking an additional reference on the whole chain.
    fn clone(&self) -> Pbuf {
        Pbuf {
            segs: self.segs.clone(),
            tot_len: self.tot_len,
            source: self.source,
        }
    }
}

impl Pbuf {
    /// Allocate a single zeroed segment of the requested length.
    pub fn new(len: usize) -> Pbuf {
        Pbuf::from_vec(vec![0; len])
    }

    pub fn from_vec(data: Vec<u8>) -> Pbuf {
        let tot_len = data.len();
        Pbuf {
            segs: vec![Arc::new(Segment {
                data: data.into_boxed_slice(),
            })],
            tot_len,
            source: None,
        }
    }

    pub fn from_slice(data: &[u8]) -> Pbuf {
        Pbuf::from_vec(data.to_vec())
    }

    /// Length of the first segment only.
    #[inline]
    pub fn len(&self) -> usize {
        self.segs.first().map_or(0, |seg| seg.data.len())
    }

    /// Length of the whole chain.
    #[inline]
    pub fn total_len(&self) -> usize {
        self.tot_len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tot_len == 0
    }

    #[inline]
    pub fn seg_count(&self) -> usize {
        self.segs.len()
    }

    /// Source endpoint for packets received on connectionless transports.
    #[inline]
    pub fn source(&self) -> Option<(Ip, Port)> {
        self.source
    }

    #[inline]
    pub fn set_source(&mut self, ip: Ip, port: Port) {
        self.source = Some((ip, port));
    }

    /// Mutable view of the head segment. Available only while this handle is
    /// the sole owner of that segment.
    pub fn payload_mut(&mut self) -> Option<&mut [u8]> {
        self.segs
            .first_mut()
            .and_then(Arc::get_mut)
            .map(|seg| &mut seg.data[..])
    }

    /// Append `other`, transferring ownership. The appended chain's head must
    /// not be shared; use [`Pbuf::chain`] to keep a reference to it.
    pub fn cat(&mut self, other: Pbuf) -> DriverResult<()> {
        if let Some(head) = other.segs.first() {
            if Arc::strong_count(head) > 1 {
                return Err(DriverError::Argument);
            }
        }
        self.tot_len += other.tot_len;
        self.segs.extend(other.segs);
        Ok(())
    }

    /// Append `other` while it keeps its own reference; both chains must be
    /// released before the shared storage is freed.
    pub fn chain(&mut self, other: &Pbuf) {
        self.tot_len += other.tot_len;
        self.segs.extend(other.segs.iter().cloned());
    }

    /// Copy up to `count` bytes starting at `offset` into `dst`. Returns the
    /// number of bytes copied.
    pub fn copy_to(&self, dst: &mut [u8], offset: usize) -> usize {
        let mut copied = 0;
        let mut skip = offset;

        for seg in &self.segs {
            let data = &seg.data[..];
            if skip >= data.len() {
                skip -= data.len();
                continue;
            }
            let avail = &data[skip..];
            skip = 0;

            let take = avail.len().min(dst.len() - copied);
            dst[copied..copied + take].copy_from_slice(&avail[..take]);
            copied += take;
            if copied == dst.len() {
                break;
            }
        }
        copied
    }

    /// Byte at the given chain offset, walking segment boundaries.
    pub fn byte_at(&self, offset: usize) -> Option<u8> {
        let mut skip = offset;
        for seg in &self.segs {
            if skip < seg.data.len() {
                return Some(seg.data[skip]);
            }
            skip -= seg.data.len();
        }
        None
    }

    /// Contiguous view starting at `offset`, bounded by the containing
    /// segment. Lets callers walk the chain without copying.
    pub fn linear_read(&self, offset: usize) -> Option<&[u8]> {
        let mut skip = offset;
        for seg in &self.segs {
            if skip < seg.data.len() {
                return Some(&seg.data[skip..]);
            }
            skip -= seg.data.len();
        }
        None
    }

    /// True when the chain contains exactly `needle` at `offset`.
    pub fn matches_at(&self, offset: usize, needle: &[u8]) -> bool {
        if offset + needle.len() > self.tot_len {
            return false;
        }
        needle
            .iter()
            .enumerate()
            .all(|(i, &b)| self.byte_at(offset + i) == Some(b))
    }

    /// String flavor of [`Pbuf::matches_at`].
    #[inline]
    pub fn strcmp(&self, offset: usize, needle: &str) -> bool {
        self.matches_at(offset, needle.as_bytes())
    }

    /// Find `needle` anywhere at or after `start`. Returns the chain offset
    /// of the first match.
    pub fn memfind(&self, needle: &[u8], start: usize) -> Option<usize> {
        if needle.is_empty() || self.tot_len < needle.len() {
            return None;
        }
        for offset in start..=(self.tot_len - needle.len()) {
            if self.matches_at(offset, needle) {
                return Some(offset);
            }
        }
        None
    }

    /// String flavor of [`Pbuf::memfind`].
    #[inline]
    pub fn strfind(&self, needle: &str, start: usize) -> Option<usize> {
        self.memfind(needle.as_bytes(), start)
    }

    /// Flatten the whole chain into one vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0; self.tot_len];
        self.copy_to(&mut out, 0);
        out
    }
}

impl std::fmt::Debug for Pbuf {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Pbuf")
            .field("segs", &self.segs.len())
            .field("tot_len", &self.tot_len)
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refcount(p: &Pbuf, seg: usize) -> usize {
        Arc::strong_count(&p.segs[seg])
    }

    #[test]
    fn test_new_is_zeroed() {
        let p = Pbuf::new(8);
        assert_eq!(p.total_len(), 8);
        assert_eq!(p.to_vec(), vec![0; 8]);
    }

    #[test]
    fn test_clone_increments_refs() {
        let p = Pbuf::from_slice(b"abc");
        assert_eq!(refcount(&p, 0), 1);

        let q = p.clone();
        assert_eq!(refcount(&p, 0), 2);

        drop(q);
        assert_eq!(refcount(&p, 0), 1);
    }

    #[test]
    fn test_cat_transfers_ownership() {
        let mut a = Pbuf::from_slice(b"Hello, ");
        let b = Pbuf::from_slice(b"World!");

        a.cat(b).unwrap();

        assert_eq!(a.total_len(), 13);
        assert_eq!(a.len(), 7);
        assert_eq!(a.to_vec(), b"Hello, World!");
        assert_eq!(refcount(&a, 1), 1);
    }

    #[test]
    fn test_cat_rejects_shared_head() {
        let mut a = Pbuf::from_slice(b"one");
        let b = Pbuf::from_slice(b"two");
        let _extra = b.clone();

        assert_eq!(a.cat(b).unwrap_err(), DriverError::Argument);
        assert_eq!(a.total_len(), 3);
    }

    #[test]
    fn test_chain_shares_segments() {
        let mut a = Pbuf::from_slice(b"head");
        let b = Pbuf::from_slice(b"tail");

        a.chain(&b);

        // Both the original handle and the chained-in copy hold a reference.
        assert_eq!(refcount(&b, 0), 2);
        assert_eq!(a.to_vec(), b"headtail");

        drop(a);
        assert_eq!(refcount(&b, 0), 1);
        assert_eq!(b.to_vec(), b"tail");
    }

    #[test]
    fn test_no_segment_freed_while_referenced() {
        let mut a = Pbuf::from_slice(b"aa");
        let b = Pbuf::from_slice(b"bb");
        a.chain(&b);

        let c = a.clone();
        drop(a);

        // `c` still reaches both segments; `b`'s storage has two owners.
        assert_eq!(c.to_vec(), b"aabb");
        assert_eq!(refcount(&b, 0), 2);
    }

    #[test]
    fn test_copy_across_boundaries() {
        let mut p = Pbuf::from_slice(b"0123");
        p.cat(Pbuf::from_slice(b"4567")).unwrap();

        let mut dst = [0u8; 5];
        let copied = p.copy_to(&mut dst, 2);

        assert_eq!(copied, 5);
        assert_eq!(&dst, b"23456");
    }

    #[test]
    fn test_copy_short_tail() {
        let p = Pbuf::from_slice(b"xy");
        let mut dst = [0u8; 8];
        assert_eq!(p.copy_to(&mut dst, 1), 1);
        assert_eq!(dst[0], b'y');
    }

    #[test]
    fn test_byte_at_and_linear_read() {
        let mut p = Pbuf::from_slice(b"ab");
        p.cat(Pbuf::from_slice(b"cde")).unwrap();

        assert_eq!(p.byte_at(0), Some(b'a'));
        assert_eq!(p.byte_at(2), Some(b'c'));
        assert_eq!(p.byte_at(5), None);

        assert_eq!(p.linear_read(1), Some(&b"b"[..]));
        assert_eq!(p.linear_read(3), Some(&b"de"[..]));
        assert_eq!(p.linear_read(5), None);
    }

    #[test]
    fn test_find_across_boundaries() {
        let mut p = Pbuf::from_slice(b"GET / HT");
        p.cat(Pbuf::from_slice(b"TP/1.1\r\n\r\n")).unwrap();

        assert_eq!(p.strfind("HTTP/1.1", 0), Some(6));
        assert_eq!(p.strfind("\r\n\r\n", 0), Some(14));
        assert_eq!(p.strfind("POST", 0), None);
        assert_eq!(p.memfind(b"HT", 7), Some(8));
    }

    #[test]
    fn test_payload_mut_requires_sole_owner() {
        let mut p = Pbuf::new(4);
        p.payload_mut().unwrap().copy_from_slice(b"data");
        assert_eq!(p.to_vec(), b"data");

        let _shared = p.clone();
        assert!(p.payload_mut().is_none());
    }

    #[test]
    fn test_source_endpoint() {
        let mut p = Pbuf::from_slice(b"dgram");
        assert_eq!(p.source(), None);
        p.set_source(Ip::V4([10, 0, 0, 1]), 1234);
        assert_eq!(p.source(), Some((Ip::V4([10, 0, 0, 1]), 1234)));
    }
}
