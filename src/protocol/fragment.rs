//! Splitting oversized payloads and putting them back together.
//!
//! A payload longer than the fragment size travels as a run of `FRAGMENT`
//! messages followed by one final `QUERY` or `RESPONSE` carrying the tail.
//! Fragments are numbered from 1 and every message declares the total
//! payload length, so the receiver can allocate the whole buffer up front
//! and write each fragment at `(number - 1) * fragment_size`.
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("fragment {got} out of order, expected {expected}")]
    OutOfOrder { expected: u8, got: u8 },

    #[error("fragment {number} ({len} bytes) overflows declared length {total}")]
    Overflow { number: u8, len: usize, total: usize },

    #[error("fragment count exhausted")]
    TooManyFragments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub number: u8,
    pub count: u8,
    pub bytes: &'a [u8],
}

/// Number of datagrams needed for `len` bytes. An empty payload still
/// needs one.
pub fn fragment_count(len: usize, fragment_size: usize) -> usize {
    if len == 0 { 1 } else { (len - 1) / fragment_size + 1 }
}

/// Splits `payload` into numbered fragments. The caller guarantees the
/// count fits in a `u8`.
pub fn split(payload: &[u8], fragment_size: usize) -> Vec<Fragment<'_>> {
    let count = fragment_count(payload.len(), fragment_size);
    (0..count)
        .map(|i| {
            let start = i * fragment_size;
            let end = (start + fragment_size).min(payload.len());
            Fragment {
                number: (i + 1) as u8,
                count: count as u8,
                bytes: &payload[start..end],
            }
        })
        .collect()
}

/// Inbound payload being rebuilt from fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembly {
    data: Vec<u8>,
    received: usize,
    fragment_size: usize,
    last: u8,
}

impl Reassembly {
    /// A payload that arrived in a single datagram.
    pub fn whole(bytes: Vec<u8>) -> Self {
        let received = bytes.len();
        Self {
            fragment_size: received,
            data: bytes,
            received,
            last: 1,
        }
    }

    /// Allocates the full buffer from the first fragment's declared length.
    pub fn start(
        total_len: usize,
        fragment_size: usize,
        first: &[u8],
    ) -> Result<Self, ReassemblyError> {
        let mut reassembly = Self {
            data: vec![0; total_len],
            received: 0,
            fragment_size,
            last: 0,
        };
        reassembly.accept(1, first)?;
        Ok(reassembly)
    }

    /// Writes fragment `number`; it must directly follow the last one.
    /// On error the buffer is left untouched.
    pub fn accept(&mut self, number: u8, bytes: &[u8]) -> Result<(), ReassemblyError> {
        let Some(expected) = self.last.checked_add(1) else {
            return Err(ReassemblyError::TooManyFragments);
        };
        if number != expected {
            return Err(ReassemblyError::OutOfOrder {
                expected,
                got: number,
            });
        }

        let overflow = ReassemblyError::Overflow {
            number,
            len: bytes.len(),
            total: self.data.len(),
        };
        let Some(end) = (usize::from(number) - 1)
            .checked_mul(self.fragment_size)
            .and_then(|offset| offset.checked_add(bytes.len()))
        else {
            return Err(overflow);
        };
        if end > self.data.len() {
            return Err(overflow);
        }
        let offset = end - bytes.len();

        self.data[offset..end].copy_from_slice(bytes);
        self.received += bytes.len();
        self.last = number;
        Ok(())
    }

    pub fn last(&self) -> u8 {
        self.last
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.data.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn counts_fragments() {
        assert_eq!(fragment_count(0, 1024), 1);
        assert_eq!(fragment_count(50, 1024), 1);
        assert_eq!(fragment_count(1024, 1024), 1);
        assert_eq!(fragment_count(1025, 1024), 2);
        assert_eq!(fragment_count(5000, 1024), 5);
    }

    #[test]
    fn split_five_thousand_bytes() {
        let data = payload(5000);
        let fragments = split(&data, 1024);

        assert_eq!(fragments.len(), 5);
        assert!(fragments[..4].iter().all(|f| f.bytes.len() == 1024));
        assert_eq!(fragments[4].bytes.len(), 904);
        assert!(fragments.iter().all(|f| f.count == 5));
        assert_eq!(
            fragments.iter().map(|f| f.number).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
    }

    #[test]
    fn split_empty_payload() {
        let fragments = split(&[], 1024);
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].bytes.is_empty());
    }

    #[test]
    fn reassembles_in_order() {
        for (len, size) in [(5000, 1024), (2049, 1024), (300, 7), (16, 8)] {
            let data = payload(len);
            let fragments = split(&data, size);

            let mut reassembly = Reassembly::start(len, size, fragments[0].bytes).unwrap();
            for f in &fragments[1..] {
                assert!(!reassembly.is_complete());
                reassembly.accept(f.number, f.bytes).unwrap();
            }

            assert!(reassembly.is_complete());
            assert_eq!(reassembly.into_bytes(), data);
        }
    }

    #[test]
    fn rejects_out_of_order_fragment() {
        let data = payload(3000);
        let fragments = split(&data, 1024);
        let mut reassembly = Reassembly::start(3000, 1024, fragments[0].bytes).unwrap();
        let before = reassembly.clone();

        assert_eq!(
            reassembly.accept(3, fragments[2].bytes),
            Err(ReassemblyError::OutOfOrder {
                expected: 2,
                got: 3
            })
        );
        assert_eq!(
            reassembly.accept(1, fragments[0].bytes),
            Err(ReassemblyError::OutOfOrder {
                expected: 2,
                got: 1
            })
        );
        assert_eq!(reassembly, before);
    }

    #[test]
    fn rejects_overflowing_fragment() {
        let mut reassembly = Reassembly::start(1500, 1024, &[1; 1024]).unwrap();

        assert_eq!(
            reassembly.accept(2, &[2; 1024]),
            Err(ReassemblyError::Overflow {
                number: 2,
                len: 1024,
                total: 1500
            })
        );
        assert_eq!(reassembly.last(), 1);
    }

    #[test]
    fn first_fragment_larger_than_total_is_rejected() {
        assert!(Reassembly::start(10, 1024, &[0; 20]).is_err());
    }

    #[test]
    fn whole_payload_is_complete() {
        let reassembly = Reassembly::whole(b"hello".to_vec());
        assert!(reassembly.is_complete());
        assert_eq!(reassembly.into_bytes(), b"hello");
    }

    #[test]
    fn no_fragment_follows_the_last_number() {
        let data = payload(1000);
        let mut reassembly = Reassembly::start(1000, 1, &data[..1]).unwrap();
        for number in 2..=255u8 {
            let i = usize::from(number) - 1;
            reassembly.accept(number, &data[i..i + 1]).unwrap();
        }
        assert_eq!(reassembly.last(), 255);
        let before = reassembly.clone();

        assert_eq!(
            reassembly.accept(0, &data[255..256]),
            Err(ReassemblyError::TooManyFragments)
        );
        assert_eq!(reassembly, before);
    }

    #[test]
    fn fragment_zero_is_out_of_order() {
        let mut reassembly = Reassembly::start(10, 4, &[1; 4]).unwrap();

        assert_eq!(
            reassembly.accept(0, &[2; 4]),
            Err(ReassemblyError::OutOfOrder {
                expected: 2,
                got: 0
            })
        );
    }
}
