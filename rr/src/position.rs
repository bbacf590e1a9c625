//! Fractional positions for ordered siblings
//!
//! New keys are placed halfway between their neighbours so a move touches a
//! single row. When two neighbours get too close for a distinct midpoint the
//! whole sibling list is renumbered at [`POSITION_SPACING`] intervals.

use thiserror::Error;

/// Gap between consecutive positions after a renumber
pub const POSITION_SPACING: f64 = 10_000.0;

/// Smallest gap that still admits a midpoint
pub const MIN_GAP: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PositionError {
    #[error("no room between {before} and {after}; renumber siblings")]
    Exhausted { before: f64, after: f64 },

    #[error("bounds out of order: {before} >= {after}")]
    OutOfOrder { before: f64, after: f64 },

    #[error("position must be finite")]
    NonFinite,
}

/// Key strictly between `before` and `after`; either side may be open
pub fn between(before: Option<f64>, after: Option<f64>) -> Result<f64, PositionError> {
    for bound in [before, after].into_iter().flatten() {
        if !bound.is_finite() {
            return Err(PositionError::NonFinite);
        }
    }

    match (before, after) {
        (None, None) => Ok(POSITION_SPACING),
        (Some(b), None) => beyond(b, b + POSITION_SPACING),
        (None, Some(a)) => beyond(a, a - POSITION_SPACING),
        (Some(b), Some(a)) => {
            if b >= a {
                return Err(PositionError::OutOfOrder { before: b, after: a });
            }
            let mid = b + (a - b) / 2.0;
            if a - b <= MIN_GAP || mid <= b || mid >= a {
                return Err(PositionError::Exhausted { before: b, after: a });
            }
            Ok(mid)
        }
    }
}

/// Edge key stepped away from `bound`; large magnitudes round back onto it
fn beyond(bound: f64, next: f64) -> Result<f64, PositionError> {
    if !next.is_finite() || next == bound {
        return Err(PositionError::Exhausted {
            before: bound,
            after: bound,
        });
    }
    Ok(next)
}

/// Evenly spaced positions for `items`, keeping their current order
pub fn renumber<K: Clone>(items: &[(K, f64)]) -> Vec<(K, f64)> {
    items
        .iter()
        .enumerate()
        .map(|(i, (key, _))| (key.clone(), (i as f64 + 1.0) * POSITION_SPACING))
        .collect()
}

/// Result of placing one item among ordered siblings
#[derive(Debug, Clone, PartialEq)]
pub struct Placement<K> {
    /// Position for the placed item
    pub position: f64,
    /// New positions for siblings, present only if a renumber was needed
    pub renumbered: Option<Vec<(K, f64)>>,
}

/// Position for an item inserted at `index` among `siblings` (sorted ascending)
pub fn place<K: Clone>(siblings: &[(K, f64)], index: usize) -> Result<Placement<K>, PositionError> {
    let index = index.min(siblings.len());
    let before = index.checked_sub(1).map(|i| siblings[i].1);
    let after = siblings.get(index).map(|s| s.1);

    match between(before, after) {
        Ok(position) => Ok(Placement {
            position,
            renumbered: None,
        }),
        Err(PositionError::Exhausted { .. }) | Err(PositionError::OutOfOrder { .. }) => {
            let renumbered = renumber(siblings);
            let before = index.checked_sub(1).map(|i| renumbered[i].1);
            let after = renumbered.get(index).map(|s| s.1);
            let position = between(before, after)?;
            Ok(Placement {
                position,
                renumbered: Some(renumbered),
            })
        }
        Err(e) => Err(e),
    }
}
