//! Port reservation for test servers.
//!
//! Launching many test servers in parallel means two of them can pick the
//! same "free" port. A [`PortSource`] hands out ports that are exclusive
//! within the process until they are released; a [`PortReservation`] owns the
//! ports a fixture acquired and returns all of them exactly once.

use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;
use tracing::{debug, warn};

/// How many OS-assigned ports `FreePorts` tries per requested port.
const MAX_PICK_ATTEMPTS: u32 = 64;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("could not reserve {requested} port(s) after {attempts} attempts")]
    Exhausted { requested: usize, attempts: u32 },
    #[error("port probe failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of provisionally exclusive loopback ports.
pub trait PortSource: Send + Sync + fmt::Debug {
    /// Reserve `count` ports. Returned ports are not handed out again until released.
    fn acquire(&self, count: usize) -> Result<Vec<u16>, PortError>;

    /// Return previously acquired ports.
    fn release(&self, ports: &[u16]);
}

/// In-process allocator backed by the OS ephemeral range.
///
/// Candidates come from binding `127.0.0.1:0`; the listener is dropped
/// immediately, so the port is only "probably free". Exclusivity holds
/// between reservations made through the same `FreePorts`.
#[derive(Debug)]
pub struct FreePorts {
    reserved: Mutex<HashSet<u16>>,
    probe: fn() -> std::io::Result<u16>,
}

impl Default for FreePorts {
    fn default() -> Self {
        Self::with_probe(Self::probe)
    }
}

impl FreePorts {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_probe(probe: fn() -> std::io::Result<u16>) -> Self {
        Self {
            reserved: Mutex::new(HashSet::new()),
            probe,
        }
    }

    /// Process-wide allocator shared by every fixture that doesn't bring its own.
    pub fn global() -> Arc<FreePorts> {
        static GLOBAL: OnceLock<Arc<FreePorts>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(FreePorts::new())))
    }

    /// Ports currently reserved.
    pub fn reserved_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<u16>> {
        // A panic while holding the lock cannot leave the set half-updated.
        self.reserved
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn probe() -> std::io::Result<u16> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        Ok(listener.local_addr()?.port())
    }
}

impl PortSource for FreePorts {
    fn acquire(&self, count: usize) -> Result<Vec<u16>, PortError> {
        let mut ports = Vec::with_capacity(count);
        let budget = MAX_PICK_ATTEMPTS.saturating_mul(u32::try_from(count).unwrap_or(u32::MAX));
        let mut attempts = 0;

        while ports.len() < count {
            if attempts >= budget {
                // Hand back what we got so a failed acquire reserves nothing.
                self.release(&ports);
                return Err(PortError::Exhausted {
                    requested: count,
                    attempts,
                });
            }
            attempts += 1;

            let port = match (self.probe)() {
                Ok(port) => port,
                Err(e) => {
                    self.release(&ports);
                    return Err(e.into());
                }
            };
            if self.lock().insert(port) {
                ports.push(port);
            }
        }

        debug!(?ports, "reserved ports");
        Ok(ports)
    }

    fn release(&self, ports: &[u16]) {
        let mut reserved = self.lock();
        for port in ports {
            if !reserved.remove(port) {
                warn!(port, "released a port that was not reserved");
            }
        }
    }
}

/// Ports owned by one fixture, released together exactly once.
///
/// Released on [`PortReservation::release`] or on drop, whichever comes first.
pub struct PortReservation {
    source: Arc<dyn PortSource>,
    ports: Vec<u16>,
}

impl fmt::Debug for PortReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortReservation")
            .field("ports", &self.ports)
            .finish_non_exhaustive()
    }
}

impl PortReservation {
    pub fn new(source: Arc<dyn PortSource>) -> Self {
        Self {
            source,
            ports: Vec::new(),
        }
    }

    /// Acquire one more port and keep it with the rest.
    pub fn take_one(&mut self) -> Result<u16, PortError> {
        let acquired = self.source.acquire(1)?;
        let Some(&port) = acquired.first() else {
            return Err(PortError::Exhausted {
                requested: 1,
                attempts: 0,
            });
        };
        // Keep everything the source handed over so it all goes back on release.
        self.ports.extend(acquired);
        Ok(port)
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Return all held ports to the source. Later calls are no-ops.
    pub fn release(&mut self) {
        if self.ports.is_empty() {
            return;
        }
        let ports = std::mem::take(&mut self.ports);
        debug!(?ports, "releasing ports");
        self.source.release(&ports);
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Debug, Default)]
    struct CountingSource {
        next: AtomicUsize,
        releases: Mutex<Vec<Vec<u16>>>,
    }

    impl PortSource for CountingSource {
        fn acquire(&self, count: usize) -> Result<Vec<u16>, PortError> {
            Ok((0..count)
                .map(|_| 20_000 + self.next.fetch_add(1, Ordering::SeqCst) as u16)
                .collect())
        }

        fn release(&self, ports: &[u16]) {
            self.releases.lock().unwrap().push(ports.to_vec());
        }
    }

    #[test]
    fn reservation_accumulates_and_releases_once() {
        let source = Arc::new(CountingSource::default());
        let mut reservation = PortReservation::new(Arc::clone(&source) as Arc<dyn PortSource>);

        assert!(reservation.is_empty());
        assert_eq!(reservation.take_one().unwrap(), 20_000);
        assert_eq!(reservation.take_one().unwrap(), 20_001);
        assert_eq!(reservation.ports(), &[20_000, 20_001]);

        reservation.release();
        reservation.release();
        drop(reservation);

        let releases = source.releases.lock().unwrap();
        assert_eq!(*releases, vec![vec![20_000, 20_001]]);
    }

    #[test]
    fn dropping_reservation_releases_ports() {
        let source = Arc::new(CountingSource::default());
        {
            let mut reservation =
                PortReservation::new(Arc::clone(&source) as Arc<dyn PortSource>);
            reservation.take_one().unwrap();
        }
        assert_eq!(*source.releases.lock().unwrap(), vec![vec![20_000]]);
    }

    #[test]
    fn empty_reservation_never_calls_release() {
        let source = Arc::new(CountingSource::default());
        drop(PortReservation::new(Arc::clone(&source) as Arc<dyn PortSource>));
        assert!(source.releases.lock().unwrap().is_empty());
    }

    #[test]
    fn free_ports_are_distinct_and_bindable() {
        let ports = FreePorts::new();
        let acquired = ports.acquire(4).unwrap();
        let unique: HashSet<_> = acquired.iter().copied().collect();
        assert_eq!(unique.len(), 4);
        assert_eq!(ports.reserved_count(), 4);

        for port in &acquired {
            TcpListener::bind((Ipv4Addr::LOCALHOST, *port)).unwrap();
        }

        ports.release(&acquired);
        assert_eq!(ports.reserved_count(), 0);
    }

    #[test]
    fn failed_probe_returns_partial_reservation() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn flaky() -> std::io::Result<u16> {
            match CALLS.fetch_add(1, Ordering::SeqCst) {
                n @ 0..=1 => Ok(31_000 + n as u16),
                _ => Err(std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no ports")),
            }
        }

        let ports = FreePorts::with_probe(flaky);
        let err = ports.acquire(4).unwrap_err();
        assert!(matches!(err, PortError::Io(_)), "got {err}");
        assert_eq!(ports.reserved_count(), 0);

        // The two probed ports are free for the next caller.
        CALLS.store(0, Ordering::SeqCst);
        assert_eq!(ports.acquire(2).unwrap(), vec![31_000, 31_001]);
    }

    #[test]
    fn releasing_unknown_port_is_ignored() {
        let ports = FreePorts::new();
        ports.release(&[1]);
        assert_eq!(ports.reserved_count(), 0);
    }

    #[test]
    fn concurrent_acquires_never_overlap() {
        let ports = Arc::new(FreePorts::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ports = Arc::clone(&ports);
                thread::spawn(move || ports.acquire(4).unwrap())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(seen.insert(port), "port {port} handed out twice");
            }
        }
        assert_eq!(ports.reserved_count(), 32);
    }
}
