//! Host port allocation for sandbox view ports.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use crate::config::PortRangeConfig;
use crate::error::OrchestratorError;

/// Hands out ports from a fixed range and takes them back when a job ends.
///
/// Released ports go to the back of the free-list, so a port just given up by
/// a terminated job is the last one to be reused.
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRangeConfig,
    pool: Mutex<PortPool>,
}

#[derive(Debug)]
struct PortPool {
    free: VecDeque<u16>,
    in_use: HashSet<u16>,
}

impl PortAllocator {
    pub fn new(range: PortRangeConfig) -> Self {
        Self {
            range,
            pool: Mutex::new(PortPool {
                free: (range.base..range.end()).collect(),
                in_use: HashSet::new(),
            }),
        }
    }

    pub fn allocate(&self) -> Result<u16, OrchestratorError> {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        let port = pool
            .free
            .pop_front()
            .ok_or(OrchestratorError::PortsExhausted {
                start: self.range.base,
                end: self.range.end(),
            })?;
        pool.in_use.insert(port);
        Ok(port)
    }

    /// Return a port to the pool. Releasing a port that is not allocated is a
    /// no-op.
    pub fn release(&self, port: u16) {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if pool.in_use.remove(&port) {
            pool.free.push_back(port);
        }
    }

    pub fn in_use(&self) -> usize {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_use
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(count: u16) -> PortAllocator {
        PortAllocator::new(PortRangeConfig { base: 7000, count })
    }

    #[test]
    fn test_allocates_distinct_ports() {
        let ports = allocator(3);
        let a = ports.allocate().unwrap();
        let b = ports.allocate().unwrap();
        let c = ports.allocate().unwrap();
        assert_eq!((a, b, c), (7000, 7001, 7002));
        assert_eq!(ports.in_use(), 3);
    }

    #[test]
    fn test_exhaustion_reports_range() {
        let ports = allocator(1);
        ports.allocate().unwrap();
        let err = ports.allocate().unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::PortsExhausted {
                start: 7000,
                end: 7001
            }
        ));
    }

    #[test]
    fn test_released_port_is_reused_last() {
        let ports = allocator(3);
        let a = ports.allocate().unwrap();
        ports.release(a);
        assert_eq!(ports.allocate().unwrap(), 7001);
        assert_eq!(ports.allocate().unwrap(), 7002);
        assert_eq!(ports.allocate().unwrap(), a);
    }

    #[test]
    fn test_double_release_is_ignored() {
        let ports = allocator(2);
        let a = ports.allocate().unwrap();
        ports.release(a);
        ports.release(a);
        ports.release(9999);
        assert_eq!(ports.in_use(), 0);
        assert_eq!(ports.allocate().unwrap(), 7001);
        assert_eq!(ports.allocate().unwrap(), a);
        assert!(ports.allocate().is_err());
    }
}
