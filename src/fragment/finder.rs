//! Fragment index.
//!
//! Pure lookups over a level's fragment list: match a buffer end position to
//! the fragment that should be loaded next, match a wall-clock timestamp to
//! a fragment, and locate discontinuity boundaries. The list is ordered by
//! `start` and `sn` is contiguous, so everything here is a binary search or
//! a bounded scan.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;

use crate::types::Fragment;

/// Position of a fragment relative to a probe time, with slack around the
/// boundaries. The slack is clamped to half the fragment duration so that
/// very short fragments cannot be skipped entirely.
pub(crate) fn fragment_tolerance_cmp(frag: &Fragment, probe: f64, tolerance: f64) -> Ordering {
    let tol = tolerance.min(frag.duration / 2.0);
    if frag.start + frag.duration - tol <= probe {
        Ordering::Less
    } else if frag.start - tol > probe {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

/// Find the fragment whose interval covers `buffer_end`.
///
/// When `prev` is the last loaded fragment and its successor covers the
/// probe, the successor is returned without searching. A probe before the
/// first fragment returns the first fragment; a probe at or past the end of
/// the last returns `None` (end of stream is the caller's concern).
pub fn find_fragment_by_pts<'a>(
    prev: Option<&Fragment>,
    fragments: &'a [Fragment],
    buffer_end: f64,
    tolerance: f64,
) -> Option<&'a Fragment> {
    let first = fragments.first()?;

    // Hot path: the fragment right after the previous one.
    if let Some(prev) = prev {
        let next_sn = prev.sn + 1;
        if next_sn >= first.sn {
            let idx = (next_sn - first.sn) as usize;
            if let Some(candidate) = fragments.get(idx) {
                if fragment_tolerance_cmp(candidate, buffer_end, tolerance) == Ordering::Equal {
                    return Some(candidate);
                }
            }
        }
    }

    match fragments.binary_search_by(|f| fragment_tolerance_cmp(f, buffer_end, tolerance)) {
        Ok(idx) => Some(&fragments[idx]),
        // Probe before the window: start from the first fragment.
        Err(0) => Some(first),
        Err(_) => None,
    }
}

/// Find the fragment whose program-date-time interval contains `pdt`, or
/// the nearest fragment within `tolerance` seconds of it.
pub fn find_fragment_by_pdt<'a>(
    fragments: &'a [Fragment],
    pdt: DateTime<Utc>,
    tolerance: f64,
) -> Option<&'a Fragment> {
    let mut nearest: Option<(&Fragment, f64)> = None;
    for frag in fragments {
        let (start, end) = match (frag.program_date_time, frag.end_program_date_time()) {
            (Some(s), Some(e)) => (s, e),
            _ => continue,
        };
        if pdt >= start && pdt < end {
            return Some(frag);
        }
        let distance = if pdt < start {
            (start - pdt).num_milliseconds() as f64 / 1000.0
        } else {
            (pdt - end).num_milliseconds() as f64 / 1000.0
        };
        if distance <= tolerance {
            match nearest {
                Some((_, best)) if best <= distance => {}
                _ => nearest = Some((frag, distance)),
            }
        }
    }
    nearest.map(|(f, _)| f)
}

/// First fragment carrying discontinuity counter `cc`.
///
/// `cc` is non-decreasing along the playlist, so the boundary is found by
/// binary search.
pub fn find_first_fragment_with_cc(fragments: &[Fragment], cc: u32) -> Option<&Fragment> {
    let idx = fragments.partition_point(|f| f.cc < cc);
    fragments.get(idx).filter(|f| f.cc == cc)
}

/// Resolve `sn` to its slot in a contiguous fragment window.
pub fn fragment_by_sn(fragments: &[Fragment], sn: u64) -> Option<&Fragment> {
    let first = fragments.first()?;
    if sn < first.sn {
        return None;
    }
    fragments.get((sn - first.sn) as usize)
}
