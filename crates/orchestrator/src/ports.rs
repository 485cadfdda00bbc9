//! Port block allocation.
//!
//! Ports are handed out as contiguous blocks: candidate start offsets are
//! scanned upwards from `base + 1` and each block is tested as a whole, so
//! a partially free block is skipped. The allocator only reads the reserved
//! set it is given; nothing is reserved until the caller commits.

use std::collections::BTreeSet;
use std::path::Path;

use sandbox_core::AuxiliaryPorts;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};

/// Highest port number the allocator will hand out.
pub const MAX_PORT: u16 = u16::MAX;

/// Marker file that protects a sandbox directory from being replaced.
pub const LOCK_MARKER: &str = "no_clear";

/// What a batch needs from the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRequest {
    /// Ports are searched from `base + 1`.
    pub base: u16,
    pub count: u32,
    pub auxiliary: AuxiliaryPorts,
    /// Distance between the primary and the auxiliary base port.
    pub auxiliary_delta: u16,
}

/// Ports chosen for a batch, in node-ordinal order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAllocation {
    pub primary: Vec<u16>,
    /// `None` when the nodes do not serve an auxiliary port.
    pub auxiliary: Option<Vec<u16>>,
}

impl PortAllocation {
    /// Primary and auxiliary ports of the node at `ordinal` (1-based).
    pub fn for_node(&self, ordinal: u32) -> Option<(u16, Option<u16>)> {
        let index = usize::try_from(ordinal.checked_sub(1)?).ok()?;
        let primary = *self.primary.get(index)?;
        let auxiliary = match &self.auxiliary {
            Some(ports) => Some(*ports.get(index)?),
            None => None,
        };
        Some((primary, auxiliary))
    }

    pub fn all_ports(&self) -> Vec<u16> {
        let mut ports = self.primary.clone();
        if let Some(auxiliary) = &self.auxiliary {
            ports.extend(auxiliary);
        }
        ports
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    horizon: u16,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self { horizon: MAX_PORT }
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the search to ports at or below `horizon`.
    pub fn with_horizon(horizon: u16) -> Self {
        Self { horizon }
    }

    /// Find the lowest block of `count` consecutive ports above `base` with
    /// no member in `reserved`.
    pub fn find_free_block(
        &self,
        base: u16,
        count: u32,
        reserved: &BTreeSet<u16>,
    ) -> Result<Vec<u16>> {
        self.scan(u32::from(base), count, reserved)
    }

    fn scan(&self, base: u32, count: u32, reserved: &BTreeSet<u16>) -> Result<Vec<u16>> {
        if count == 0 {
            return Err(OrchestratorError::InvalidRequest(
                "cannot allocate an empty port block".to_string(),
            ));
        }

        let horizon = u32::from(self.horizon);
        let mut start = base + 1;

        while count <= horizon && start + count - 1 <= horizon {
            // Block end is within the horizon, so every member fits in u16.
            let block: Vec<u16> = (start..start + count).map(|p| p as u16).collect();
            if block.iter().all(|p| !reserved.contains(p)) {
                debug!(base, start, count, "Found free port block");
                return Ok(block);
            }
            start += 1;
        }

        Err(OrchestratorError::ResourceExhausted {
            base,
            count,
            horizon: self.horizon,
        })
    }

    /// Allocate the primary block and, when the nodes support it, the
    /// auxiliary block.
    ///
    /// A missing auxiliary block is fatal unless the request marked the
    /// auxiliary ports optional, in which case they are disabled for every
    /// node.
    pub fn allocate(
        &self,
        request: &PortRequest,
        reserved: &BTreeSet<u16>,
    ) -> Result<PortAllocation> {
        let primary = self.find_free_block(request.base, request.count, reserved)?;

        if !request.auxiliary.enabled {
            info!(ports = ?primary, "Allocated port block");
            return Ok(PortAllocation {
                primary,
                auxiliary: None,
            });
        }

        // The auxiliary block must not overlap the primary one.
        let mut taken = reserved.clone();
        taken.extend(primary.iter().copied());

        let auxiliary_base = u32::from(request.base) + u32::from(request.auxiliary_delta);
        let auxiliary = match self.scan(auxiliary_base, request.count, &taken) {
            Ok(block) => Some(block),
            Err(e) if request.auxiliary.optional => {
                warn!(error = %e, "No auxiliary port block available, disabling auxiliary ports");
                None
            }
            Err(e) => return Err(e),
        };

        info!(ports = ?primary, auxiliary = ?auxiliary, "Allocated port blocks");
        Ok(PortAllocation { primary, auxiliary })
    }

    /// Check an allocation against a fresh view of reserved ports
    /// immediately before anything is created or removed.
    ///
    /// Any single conflict rejects the whole allocation.
    pub fn revalidate(&self, allocation: &PortAllocation, live_reserved: &BTreeSet<u16>) -> Result<()> {
        let mut seen = BTreeSet::new();
        for port in allocation.all_ports() {
            if !seen.insert(port) {
                return Err(OrchestratorError::PortConflict {
                    port,
                    reason: "allocated twice in the same batch".to_string(),
                });
            }
            if live_reserved.contains(&port) {
                return Err(OrchestratorError::PortConflict {
                    port,
                    reason: "already used by another deployment".to_string(),
                });
            }
            if port > self.horizon {
                return Err(OrchestratorError::PortConflict {
                    port,
                    reason: format!("above the port limit {}", self.horizon),
                });
            }
        }

        debug!(ports = seen.len(), "Port allocation revalidated");
        Ok(())
    }

    /// Fail unless `target_dir` is still free to be created.
    pub fn check_target(target_dir: &Path) -> Result<()> {
        if target_dir.join(LOCK_MARKER).exists() {
            return Err(OrchestratorError::DirectoryConflict {
                path: target_dir.to_path_buf(),
                reason: "the directory is locked".to_string(),
            });
        }
        if target_dir.exists() {
            return Err(OrchestratorError::DirectoryConflict {
                path: target_dir.to_path_buf(),
                reason: "the directory was created by someone else".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn reserved(ports: &[u16]) -> BTreeSet<u16> {
        ports.iter().copied().collect()
    }

    fn request(base: u16, count: u32, auxiliary: AuxiliaryPorts) -> PortRequest {
        PortRequest {
            base,
            count,
            auxiliary,
            auxiliary_delta: 10000,
        }
    }

    #[test]
    fn test_block_skips_reserved_port() {
        let allocator = PortAllocator::new();
        let block = allocator
            .find_free_block(20000, 3, &reserved(&[20001]))
            .unwrap();
        assert_eq!(block, vec![20002, 20003, 20004]);
    }

    #[test]
    fn test_block_starts_after_base() {
        let allocator = PortAllocator::new();
        let block = allocator.find_free_block(20000, 2, &BTreeSet::new()).unwrap();
        assert_eq!(block, vec![20001, 20002]);
    }

    #[test]
    fn test_partially_free_block_is_rejected() {
        let allocator = PortAllocator::new();
        // 20001-20002 are free but 20003 is not, so the scan must move past it.
        let block = allocator
            .find_free_block(20000, 3, &reserved(&[20003, 20005]))
            .unwrap();
        assert_eq!(block, vec![20006, 20007, 20008]);
    }

    #[test]
    fn test_block_properties_hold_for_many_bases() {
        let allocator = PortAllocator::new();
        let taken = reserved(&[5001, 5003, 5004, 5010, 5011, 5020]);

        for base in 5000..5030u16 {
            for count in 2..6u32 {
                let block = allocator.find_free_block(base, count, &taken).unwrap();
                assert_eq!(block.len(), count as usize);
                assert!(block.iter().all(|p| *p > base));
                assert!(block.iter().all(|p| !taken.contains(p)));
                assert!(block.windows(2).all(|w| w[1] == w[0] + 1));
            }
        }
    }

    #[test]
    fn test_exhausted_below_horizon() {
        let allocator = PortAllocator::with_horizon(20005);
        let taken = reserved(&[20003]);
        let before = taken.clone();

        let err = allocator.find_free_block(20000, 3, &taken).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::ResourceExhausted {
                base: 20000,
                count: 3,
                horizon: 20005
            }
        ));
        assert_eq!(taken, before);
    }

    #[test]
    fn test_block_may_end_at_horizon() {
        let allocator = PortAllocator::new();
        let block = allocator
            .find_free_block(MAX_PORT - 3, 3, &BTreeSet::new())
            .unwrap();
        assert_eq!(block, vec![MAX_PORT - 2, MAX_PORT - 1, MAX_PORT]);

        assert!(allocator
            .find_free_block(MAX_PORT - 2, 3, &BTreeSet::new())
            .is_err());
    }

    #[test]
    fn test_empty_block_rejected() {
        let allocator = PortAllocator::new();
        assert!(matches!(
            allocator.find_free_block(20000, 0, &BTreeSet::new()),
            Err(OrchestratorError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_allocate_without_auxiliary() {
        let allocator = PortAllocator::new();
        let allocation = allocator
            .allocate(&request(20000, 3, AuxiliaryPorts::disabled()), &BTreeSet::new())
            .unwrap();
        assert_eq!(allocation.primary, vec![20001, 20002, 20003]);
        assert!(allocation.auxiliary.is_none());
        assert_eq!(allocation.for_node(2), Some((20002, None)));
        assert_eq!(allocation.for_node(0), None);
        assert_eq!(allocation.for_node(4), None);
    }

    #[test]
    fn test_allocate_with_auxiliary() {
        let allocator = PortAllocator::new();
        let allocation = allocator
            .allocate(
                &request(20000, 3, AuxiliaryPorts::required()),
                &reserved(&[30002]),
            )
            .unwrap();
        assert_eq!(allocation.primary, vec![20001, 20002, 20003]);
        assert_eq!(allocation.auxiliary, Some(vec![30003, 30004, 30005]));
        assert_eq!(allocation.for_node(1), Some((20001, Some(30003))));
        assert_eq!(allocation.all_ports().len(), 6);
    }

    #[test]
    fn test_auxiliary_never_overlaps_primary() {
        let allocator = PortAllocator::new();
        let mut req = request(20000, 3, AuxiliaryPorts::required());
        req.auxiliary_delta = 1;

        let allocation = allocator.allocate(&req, &BTreeSet::new()).unwrap();
        assert_eq!(allocation.primary, vec![20001, 20002, 20003]);
        assert_eq!(allocation.auxiliary, Some(vec![20004, 20005, 20006]));
    }

    #[test]
    fn test_required_auxiliary_failure_is_fatal() {
        let allocator = PortAllocator::with_horizon(30000);
        let err = allocator
            .allocate(&request(20000, 3, AuxiliaryPorts::required()), &BTreeSet::new())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ResourceExhausted { .. }));
    }

    #[test]
    fn test_optional_auxiliary_failure_disables_feature() {
        let allocator = PortAllocator::with_horizon(30000);
        let allocation = allocator
            .allocate(&request(20000, 3, AuxiliaryPorts::optional()), &BTreeSet::new())
            .unwrap();
        assert_eq!(allocation.primary, vec![20001, 20002, 20003]);
        assert!(allocation.auxiliary.is_none());
    }

    #[test]
    fn test_revalidate_accepts_clean_allocation() {
        let allocator = PortAllocator::new();
        let allocation = PortAllocation {
            primary: vec![20001, 20002],
            auxiliary: Some(vec![30001, 30002]),
        };

        allocator
            .revalidate(&allocation, &reserved(&[20000]))
            .unwrap();
    }

    #[test]
    fn test_revalidate_rejects_any_taken_port() {
        let allocator = PortAllocator::new();
        let allocation = PortAllocation {
            primary: vec![20001, 20002],
            auxiliary: Some(vec![30001, 30002]),
        };

        let err = allocator
            .revalidate(&allocation, &reserved(&[30002]))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::PortConflict { port: 30002, .. }));
    }

    #[test]
    fn test_revalidate_rejects_duplicate_ports() {
        let allocation = PortAllocation {
            primary: vec![20001, 20002],
            auxiliary: Some(vec![20002, 20003]),
        };

        let err = PortAllocator::new()
            .revalidate(&allocation, &BTreeSet::new())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::PortConflict { port: 20002, .. }));
    }

    #[test]
    fn test_check_target_rejects_existing_or_locked_directory() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("multi");
        PortAllocator::check_target(&target).unwrap();

        std::fs::create_dir(&target).unwrap();
        let err = PortAllocator::check_target(&target).unwrap_err();
        assert!(matches!(err, OrchestratorError::DirectoryConflict { .. }));

        std::fs::write(target.join(LOCK_MARKER), "").unwrap();
        match PortAllocator::check_target(&target).unwrap_err() {
            OrchestratorError::DirectoryConflict { reason, .. } => {
                assert!(reason.contains("locked"))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
