use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::transport::{Transport, TransportError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConditions {
    pub loss_percent: f32,
    pub min_latency_ms: u32,
    pub max_latency_ms: u32,
    pub jitter_ms: u32,
}

impl LinkConditions {
    pub fn is_clean(&self) -> bool {
        self.loss_percent <= 0.0 && self.max_latency_ms == 0 && self.jitter_ms == 0
    }

    pub fn should_drop(&self, rng: &mut fastrand::Rng) -> bool {
        self.loss_percent > 0.0 && rng.f32() * 100.0 < self.loss_percent
    }

    pub fn delay(&self, rng: &mut fastrand::Rng) -> Duration {
        let range = self.max_latency_ms.saturating_sub(self.min_latency_ms);
        let spread = if range > 0 { rng.u32(0..=range) } else { 0 };
        let jitter = if self.jitter_ms > 0 {
            rng.u32(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis((self.min_latency_ms + spread + jitter) as u64)
    }
}

#[derive(Debug)]
struct DelayedDatagram {
    /// Offset from the conditioner's start.
    release_time: Duration,
    bytes: Vec<u8>,
    addr: SocketAddr,
}

impl PartialEq for DelayedDatagram {
    fn eq(&self, other: &Self) -> bool {
        self.release_time == other.release_time
    }
}

impl Eq for DelayedDatagram {}

impl PartialOrd for DelayedDatagram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedDatagram {
    fn cmp(&self, other: &Self) -> Ordering {
        // min-heap on release time
        other.release_time.cmp(&self.release_time)
    }
}

/// Wraps a transport and degrades its outbound traffic: random loss plus
/// latency and jitter. Held datagrams are released on the next poll.
///
/// Time comes from the wall clock unless [`LinkConditioner::with_manual_clock`]
/// is used, in which case only [`LinkConditioner::advance`] moves it.
pub struct LinkConditioner<T> {
    inner: T,
    conditions: LinkConditions,
    rng: fastrand::Rng,
    outbound: BinaryHeap<DelayedDatagram>,
    dropped: u64,
    start: Instant,
    manual: Option<Duration>,
}

impl<T: Transport> LinkConditioner<T> {
    pub fn new(inner: T, conditions: LinkConditions) -> Self {
        Self::with_seed(inner, conditions, fastrand::u64(..))
    }

    pub fn with_seed(inner: T, conditions: LinkConditions, seed: u64) -> Self {
        Self {
            inner,
            conditions,
            rng: fastrand::Rng::with_seed(seed),
            outbound: BinaryHeap::new(),
            dropped: 0,
            start: Instant::now(),
            manual: None,
        }
    }

    /// Stops following the wall clock. Held datagrams are then released only
    /// as [`advance`](Self::advance) moves time forward.
    pub fn with_manual_clock(mut self) -> Self {
        self.manual = Some(self.now());
        self
    }

    pub fn advance(&mut self, dt: Duration) {
        if let Some(elapsed) = &mut self.manual {
            *elapsed += dt;
        }
    }

    pub fn set_conditions(&mut self, conditions: LinkConditions) {
        self.conditions = conditions;
    }

    pub fn conditions(&self) -> &LinkConditions {
        &self.conditions
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn held(&self) -> usize {
        self.outbound.len()
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn now(&self) -> Duration {
        self.manual.unwrap_or_else(|| self.start.elapsed())
    }

    fn release_due(&mut self) -> Result<(), TransportError> {
        let now = self.now();
        while self
            .outbound
            .peek()
            .is_some_and(|delayed| delayed.release_time <= now)
        {
            if let Some(delayed) = self.outbound.pop() {
                self.inner.send_to(&delayed.bytes, delayed.addr)?;
            }
        }
        Ok(())
    }
}

impl<T: Transport> Transport for LinkConditioner<T> {
    fn send_to(&mut self, bytes: &[u8], addr: SocketAddr) -> Result<usize, TransportError> {
        if self.conditions.should_drop(&mut self.rng) {
            self.dropped += 1;
            return Ok(bytes.len());
        }

        let delay = self.conditions.delay(&mut self.rng);
        if delay.is_zero() {
            return self.inner.send_to(bytes, addr);
        }

        let release_time = self.now() + delay;
        self.outbound.push(DelayedDatagram {
            release_time,
            bytes: bytes.to_vec(),
            addr,
        });
        Ok(bytes.len())
    }

    fn poll_recv(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, TransportError> {
        self.release_due()?;
        self.inner.poll_recv(buf)
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }
}
