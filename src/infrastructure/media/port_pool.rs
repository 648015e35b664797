//! RTP port pair allocation
//!
//! A free-list over a configured UDP range. RTP takes the even port, RTCP
//! the odd companion. The lock is never held across I/O.

use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

use crate::{DomainError, Result};

/// An allocated (RTP, RTCP) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub rtp: u16,
}

impl PortPair {
    pub fn rtcp(&self) -> u16 {
        self.rtp + 1
    }
}

/// Free-list allocator over [min, max]
pub struct RtpPortPool {
    free: Mutex<VecDeque<u16>>,
    min: u16,
    max: u16,
}

impl RtpPortPool {
    /// `min` must be even; the range is carved into (even, odd) pairs.
    pub fn new(min: u16, max: u16) -> Self {
        assert!(min % 2 == 0, "RTP range must start on an even port");
        assert!(max > min);
        let free: VecDeque<u16> = (min..=max).step_by(2).filter(|p| p + 1 <= max).collect();
        Self {
            free: Mutex::new(free),
            min,
            max,
        }
    }

    /// Take a pair from the pool.
    pub fn allocate(&self) -> Result<PortPair> {
        let mut free = self.free.lock().unwrap();
        match free.pop_front() {
            Some(rtp) => {
                debug!(rtp, rtcp = rtp + 1, "allocated media port pair");
                Ok(PortPair { rtp })
            }
            None => {
                metrics::counter!("pbx_media_port_exhausted_total").increment(1);
                Err(DomainError::ResourceExhausted("RTP port pool empty".into()))
            }
        }
    }

    /// Return a pair to the pool. Out-of-range or duplicate ports are
    /// ignored rather than corrupting the free list.
    pub fn release(&self, pair: PortPair) {
        if pair.rtp < self.min || pair.rtp > self.max || pair.rtp % 2 != 0 {
            return;
        }
        let mut free = self.free.lock().unwrap();
        if !free.contains(&pair.rtp) {
            debug!(rtp = pair.rtp, "released media port pair");
            free.push_back(pair.rtp);
        }
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairs_are_even_odd_and_disjoint() {
        let pool = RtpPortPool::new(10000, 10007);
        assert_eq!(pool.available(), 4);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let pair = pool.allocate().unwrap();
            assert_eq!(pair.rtp % 2, 0);
            assert_eq!(pair.rtcp(), pair.rtp + 1);
            assert!(seen.insert(pair.rtp), "pair handed out twice");
        }
    }

    #[test]
    fn test_exhaustion_and_release() {
        let pool = RtpPortPool::new(10000, 10003);
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();

        match pool.allocate() {
            Err(DomainError::ResourceExhausted(_)) => {}
            other => panic!("expected exhaustion, got {:?}", other),
        }

        pool.release(a);
        assert_eq!(pool.available(), 1);
        let again = pool.allocate().unwrap();
        assert_eq!(again.rtp, a.rtp);
    }

    #[test]
    fn test_double_release_is_ignored() {
        let pool = RtpPortPool::new(10000, 10003);
        let a = pool.allocate().unwrap();
        pool.release(a);
        pool.release(a);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_foreign_port_ignored() {
        let pool = RtpPortPool::new(10000, 10003);
        pool.release(PortPair { rtp: 20000 });
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_odd_range_tail_dropped() {
        // 10000..=10004 only fits two complete pairs
        let pool = RtpPortPool::new(10000, 10004);
        assert_eq!(pool.available(), 2);
    }
}
