//! Ordered map of the areas in one address space.
//!
//! Areas are keyed by start address in a [`BTreeMap`], which gives point lookup through the
//! predecessor of an address and ordered scans for placement. The map has no lock of its own;
//! every access happens under the owning address space's lock.

use alloc::collections::BTreeMap;
use core::ops::{Bound, Range};

use crate::{Area, AreaFlags, AreaId, Placement, VirtualAddress, VmError, arch::PAGE_SIZE};

/// The non-overlapping areas of one address space, within a fixed domain.
#[derive(Debug)]
pub struct AreaMap {
    domain: Range<VirtualAddress>,
    areas: BTreeMap<VirtualAddress, Area>,
    next_id: u64,
}

impl AreaMap {
    /// Creates an empty map whose areas must lie within `domain`.
    pub fn new(domain: Range<VirtualAddress>) -> Self {
        assert!(
            domain.start.is_aligned(PAGE_SIZE) && domain.end.is_aligned(PAGE_SIZE),
            "area map domain must be page-aligned"
        );
        Self {
            domain,
            areas: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn domain(&self) -> Range<VirtualAddress> {
        self.domain.clone()
    }

    pub fn len(&self) -> usize {
        self.areas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// Returns the area containing `address`.
    pub fn find(&self, address: VirtualAddress) -> Option<&Area> {
        self.areas
            .range(..=address)
            .next_back()
            .map(|(_, area)| area)
            .filter(|area| area.contains(address))
    }

    /// Returns the lowest area starting above `address`.
    pub fn next_above(&self, address: VirtualAddress) -> Option<&Area> {
        self.areas
            .range((Bound::Excluded(address), Bound::Unbounded))
            .next()
            .map(|(_, area)| area)
    }

    /// Iterates the areas in ascending address order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Area> {
        self.areas.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Area> {
        self.areas.values_mut()
    }

    /// Inserts `area`, choosing its start according to `placement`.
    ///
    /// For [`Placement::Exact`] the area's start is used as is. For the searching placements it
    /// is a hint; an unaligned hint is rounded inwards, and a zero hint means "anywhere". The
    /// area is assigned a fresh [`AreaId`] and the committed area is returned.
    pub fn insert(&mut self, mut area: Area, placement: Placement) -> Result<&Area, VmError> {
        if area.size == 0 || area.size % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }

        let start = match placement {
            Placement::Exact => {
                if !area.start.is_aligned(PAGE_SIZE) {
                    return Err(VmError::InvalidArgument);
                }
                self.check_exact(area.start.as_usize(), area.size)?
            }
            Placement::SearchLow => self.search_low(area.start.as_usize(), area.size)?,
            Placement::SearchHigh => self.search_high(area.start.as_usize(), area.size)?,
        };

        area.start = VirtualAddress::new(start);
        area.id = AreaId::new(self.next_id);
        self.next_id += 1;

        Ok(self.areas.entry(area.start).or_insert(area))
    }

    /// Detaches the area containing `address`.
    pub fn remove(&mut self, address: VirtualAddress) -> Result<Area, VmError> {
        let start = self.find(address).ok_or(VmError::NotFound)?.start;
        self.areas.remove(&start).ok_or(VmError::NotFound)
    }

    /// Whether `[start, end)` lies in the domain and overlaps no area.
    pub fn is_free(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        start >= self.domain.start
            && end <= self.domain.end
            && start < end
            && self
                .areas
                .range(..end)
                .next_back()
                .is_none_or(|(_, area)| area.end() <= start)
    }

    /// Moves the start of the area beginning at `start` down to `new_start`.
    pub(crate) fn grow_down(
        &mut self,
        start: VirtualAddress,
        new_start: VirtualAddress,
    ) -> Result<&Area, VmError> {
        if !new_start.is_aligned(PAGE_SIZE) || new_start >= start {
            return Err(VmError::InvalidArgument);
        }
        if !self.is_free(new_start, start) {
            return Err(VmError::RangeConflict);
        }

        let mut area = self.areas.remove(&start).ok_or(VmError::NotFound)?;
        debug_assert!(area.flags.contains(AreaFlags::GROWABLE));
        area.size += start - new_start;
        area.start = new_start;
        Ok(self.areas.entry(new_start).or_insert(area))
    }

    fn check_exact(&self, start: usize, size: usize) -> Result<usize, VmError> {
        let end = start.checked_add(size).ok_or(VmError::RangeConflict)?;
        let (low, high) = self.bounds();
        if start < low || end > high {
            return Err(VmError::RangeConflict);
        }

        let overlaps = self
            .areas
            .range(..VirtualAddress::new(end))
            .next_back()
            .is_some_and(|(_, area)| area.end().as_usize() > start);
        if overlaps {
            return Err(VmError::RangeConflict);
        }
        Ok(start)
    }

    /// Lowest fitting start at or above `hint`, scanning areas in ascending order.
    fn search_low(&self, hint: usize, size: usize) -> Result<usize, VmError> {
        let (low, high) = self.bounds();
        let mut candidate = hint
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(VmError::OutOfSpace)?
            .max(low);

        for area in self.areas.values() {
            let (area_start, area_end) = (area.start.as_usize(), area.end().as_usize());
            if area_end <= candidate {
                continue;
            }
            let candidate_end = candidate.checked_add(size).ok_or(VmError::OutOfSpace)?;
            if candidate_end <= area_start {
                break;
            }
            candidate = area_end;
        }

        match candidate.checked_add(size) {
            Some(end) if end <= high => Ok(candidate),
            _ => Err(VmError::OutOfSpace),
        }
    }

    /// Highest fitting start whose end is at or below `hint`, scanning areas in descending
    /// order.
    fn search_high(&self, hint: usize, size: usize) -> Result<usize, VmError> {
        let (low, high) = self.bounds();
        let mut end = if hint == 0 {
            high
        } else {
            (hint & !(PAGE_SIZE - 1)).min(high)
        };

        for area in self.areas.values().rev() {
            let (area_start, area_end) = (area.start.as_usize(), area.end().as_usize());
            if area_start >= end {
                continue;
            }
            if end.checked_sub(size).is_some_and(|start| area_end <= start) {
                break;
            }
            end = area_start;
        }

        match end.checked_sub(size) {
            Some(start) if start >= low => Ok(start),
            _ => Err(VmError::OutOfSpace),
        }
    }

    fn bounds(&self) -> (usize, usize) {
        (self.domain.start.as_usize(), self.domain.end.as_usize())
    }
}
