//! The shift-multiply loop of Cannon's algorithm.
//!
//! Each of the R rounds multiplies the held A and B tiles into the
//! accumulator, then (except after the last round) rotates A one step left
//! and B one step up around the torus. Optionally the tiles are first skewed
//! so that rank (i, j) holds A(i, i+j) and B(i+j, j), which makes the result
//! correct for arbitrary operands.

use crate::block::{LocalBlockStore, TileSlots};
use crate::error::{Error, Result};
use crate::topology::TorusContext;
use tracing::{debug, trace};

const TAG_A: i32 = 1;
const TAG_B: i32 = 2;
const TAG_ALIGN_A: i32 = 3;
const TAG_ALIGN_B: i32 = 4;

/// `c += a × b` for row-major `edge`×`edge` tiles.
///
/// The i-k-j loop order keeps the innermost access contiguous; every
/// `c[i][j]` still sums its products in ascending k, so results are
/// bit-for-bit reproducible.
pub fn multiply_accumulate(a: &[f64], b: &[f64], c: &mut [f64], edge: usize) {
    for i in 0..edge {
        let c_row = &mut c[i * edge..(i + 1) * edge];
        for k in 0..edge {
            let a_ik = a[i * edge + k];
            let b_row = &b[k * edge..(k + 1) * edge];
            for (c_ij, &b_kj) in c_row.iter_mut().zip(b_row) {
                *c_ij += a_ik * b_kj;
            }
        }
    }
}

/// Work performed by one rank during [`ShiftMultiplyEngine::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundStats {
    /// Local multiply-accumulate steps (always R).
    pub multiplies: usize,
    /// Round exchanges, each rotating both A and B (always R − 1).
    pub exchanges: usize,
    /// Pre-loop skew exchanges actually performed (0, 1 or 2).
    pub alignment_shifts: usize,
}

/// Runs Cannon's rounds on one rank.
pub struct ShiftMultiplyEngine<'a> {
    torus: &'a TorusContext,
    align: bool,
}

impl<'a> ShiftMultiplyEngine<'a> {
    /// Engine over `torus`. With `align`, tiles are skewed before round 0.
    pub fn new(torus: &'a TorusContext, align: bool) -> Self {
        ShiftMultiplyEngine { torus, align }
    }

    /// Send the live tile to `dest` and receive its replacement from `source`
    /// into the scratch buffer, then swap.
    fn rotate(&self, slots: &mut TileSlots, dest: i32, source: i32, tag: i32) -> Result<()> {
        let (live, scratch) = slots.split();
        self.torus
            .comm()
            .sendrecv(live, dest, tag, scratch, source, tag)?;
        slots.swap();
        Ok(())
    }

    /// Skew: row i of A moves i tiles left, column j of B moves j tiles up.
    fn skew(&self, store: &mut LocalBlockStore) -> Result<usize> {
        let cart = self.torus.cart();
        let coordinate = self.torus.coordinate;
        let missing = || Error::Internal("periodic shift without partner".into());
        let mut shifts = 0;

        if coordinate.row != 0 {
            let (source, dest) = cart.shift(1, -(coordinate.row as isize))?;
            let (source, dest) = (source.ok_or_else(missing)?, dest.ok_or_else(missing)?);
            self.rotate(store.a_slots_mut(), dest, source, TAG_ALIGN_A)?;
            shifts += 1;
        }
        if coordinate.col != 0 {
            let (source, dest) = cart.shift(0, -(coordinate.col as isize))?;
            let (source, dest) = (source.ok_or_else(missing)?, dest.ok_or_else(missing)?);
            self.rotate(store.b_slots_mut(), dest, source, TAG_ALIGN_B)?;
            shifts += 1;
        }
        Ok(shifts)
    }

    /// Run exactly R multiply steps and R − 1 exchanges.
    ///
    /// Any communication failure ends the run; a round is complete only once
    /// both the A and the B exchange have finished.
    pub fn run(&self, store: &mut LocalBlockStore) -> Result<RoundStats> {
        let side = self.torus.grid.side();
        let neighbors = self.torus.neighbors;
        let edge = store.edge();
        let mut stats = RoundStats::default();

        if self.align {
            stats.alignment_shifts = self.skew(store)?;
        }

        for round in 0..side {
            let (a, b, c) = store.operands_and_accumulator();
            multiply_accumulate(a, b, c, edge);
            stats.multiplies += 1;
            trace!(round, "multiply-accumulate done");

            if round == side - 1 {
                break;
            }

            self.rotate(store.a_slots_mut(), neighbors.left, neighbors.right, TAG_A)?;
            self.rotate(store.b_slots_mut(), neighbors.up, neighbors.down, TAG_B)?;
            stats.exchanges += 1;
        }

        debug!(
            multiplies = stats.multiplies,
            exchanges = stats.exchanges,
            alignment_shifts = stats.alignment_shifts,
            "shift-multiply finished"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiply_accumulate_adds_into_existing_values() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [5.0, 6.0, 7.0, 8.0];
        let mut c = [1.0; 4];
        multiply_accumulate(&a, &b, &mut c, 2);
        assert_eq!(c, [20.0, 23.0, 44.0, 51.0]);
    }

    #[test]
    fn multiply_accumulate_ones_sums_edge() {
        let a = vec![1.0; 16];
        let b = vec![1.0; 16];
        let mut c = vec![0.0; 16];
        multiply_accumulate(&a, &b, &mut c, 4);
        assert!(c.iter().all(|&v| v == 4.0));
    }
}
