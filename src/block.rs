//! Per-rank tile storage.
//!
//! A [`LocalBlockStore`] owns one rank's operand tiles and its accumulator.
//! Each operand tile lives in a pair of equally sized buffers: the live one is
//! multiplied and sent, the scratch one receives the neighbour's tile, and the
//! two swap roles after every exchange. Sent data is never overwritten while
//! it is still being sent.

use crate::error::{Error, Result};
use crate::topology::{Coordinate, TorusContext};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::str::FromStr;

fn allocate(len: usize) -> Result<Vec<f64>> {
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|_| Error::Allocation(len))?;
    data.resize(len, 0.0);
    Ok(data)
}

/// Deterministic generator for the elements of a global operand matrix.
///
/// Every rank evaluates the generator only for its own tile, so the full
/// matrix is never materialised outside the coordinator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    /// Every element equals the value.
    Uniform(f64),
    /// The identity matrix.
    Identity,
    /// Integer pattern `((3i + 7j) mod 11) - 5`.
    Pattern,
    /// Seeded integers in {3, 4}; reproducible for a given seed.
    Random {
        /// Generator seed
        seed: u64,
    },
}

impl Default for Operand {
    fn default() -> Self {
        Operand::Uniform(1.0)
    }
}

impl Operand {
    /// Element (i, j) of an `n`-wide matrix.
    pub fn value(&self, n: usize, i: usize, j: usize) -> f64 {
        let mut out = [0.0];
        self.fill(n, i, j, 1, 1, &mut out);
        out[0]
    }

    /// Write the `rows`×`cols` block starting at (`row0`, `col0`) of an
    /// `n`-wide matrix into `out`, row-major.
    pub fn fill(&self, n: usize, row0: usize, col0: usize, rows: usize, cols: usize, out: &mut [f64]) {
        for (r, row) in out.chunks_mut(cols).take(rows).enumerate() {
            let i = row0 + r;
            match *self {
                Operand::Uniform(v) => row.fill(v),
                Operand::Identity => {
                    for (c, x) in row.iter_mut().enumerate() {
                        *x = if i == col0 + c { 1.0 } else { 0.0 };
                    }
                }
                Operand::Pattern => {
                    for (c, x) in row.iter_mut().enumerate() {
                        *x = ((3 * i + 7 * (col0 + c)) % 11) as f64 - 5.0;
                    }
                }
                Operand::Random { seed } => {
                    // One stream per global row; skip to this block's first column.
                    let mut rng = StdRng::seed_from_u64(
                        seed ^ (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
                    );
                    for _ in 0..col0.min(n) {
                        let _: i32 = rng.gen_range(3..=4);
                    }
                    for x in row.iter_mut() {
                        *x = f64::from(rng.gen_range(3..=4i32));
                    }
                }
            }
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Uniform(v) => write!(f, "uniform:{v}"),
            Operand::Identity => write!(f, "identity"),
            Operand::Pattern => write!(f, "pattern"),
            Operand::Random { seed } => write!(f, "random:{seed}"),
        }
    }
}

impl FromStr for Operand {
    type Err = String;

    /// Parses `uniform[:v]`, `identity`, `pattern` or `random[:seed]`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (kind, arg) = match s.split_once(':') {
            Some((kind, arg)) => (kind, Some(arg)),
            None => (s, None),
        };
        match (kind, arg) {
            ("uniform", None) => Ok(Operand::Uniform(1.0)),
            ("uniform", Some(v)) => v
                .parse()
                .map(Operand::Uniform)
                .map_err(|e| format!("bad uniform value {v:?}: {e}")),
            ("identity", None) => Ok(Operand::Identity),
            ("pattern", None) => Ok(Operand::Pattern),
            ("random", None) => Ok(Operand::Random { seed: 0 }),
            ("random", Some(seed)) => seed
                .parse()
                .map(|seed| Operand::Random { seed })
                .map_err(|e| format!("bad random seed {seed:?}: {e}")),
            _ => Err(format!(
                "unknown operand {s:?} (expected uniform[:v], identity, pattern or random[:seed])"
            )),
        }
    }
}

/// A dense L×L row-major block.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    edge: usize,
    data: Vec<f64>,
}

impl Tile {
    /// Allocate a zero-filled tile.
    pub fn zeroed(edge: usize) -> Result<Self> {
        Ok(Tile {
            edge,
            data: allocate(edge * edge)?,
        })
    }

    /// Edge length L.
    pub fn edge(&self) -> usize {
        self.edge
    }

    /// Element at local (i, j).
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.edge + j]
    }

    /// Row-major elements.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Mutable row-major elements.
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }
}

/// Live buffer plus scratch buffer for one rotating operand tile.
#[derive(Debug)]
pub(crate) struct TileSlots {
    slots: [Vec<f64>; 2],
    live: usize,
}

impl TileSlots {
    fn new(len: usize) -> Result<Self> {
        Ok(TileSlots {
            slots: [allocate(len)?, allocate(len)?],
            live: 0,
        })
    }

    pub(crate) fn live(&self) -> &[f64] {
        &self.slots[self.live]
    }

    fn live_mut(&mut self) -> &mut [f64] {
        &mut self.slots[self.live]
    }

    /// The live tile (to send) and the scratch buffer (to receive into).
    pub(crate) fn split(&mut self) -> (&[f64], &mut [f64]) {
        let [first, second] = &mut self.slots;
        if self.live == 0 {
            (first.as_slice(), second.as_mut_slice())
        } else {
            (second.as_slice(), first.as_mut_slice())
        }
    }

    /// Make the freshly received scratch buffer the live tile.
    pub(crate) fn swap(&mut self) {
        self.live ^= 1;
    }
}

/// One rank's operand tiles and accumulator.
#[derive(Debug)]
pub struct LocalBlockStore {
    edge: usize,
    a: TileSlots,
    b: TileSlots,
    c: Tile,
}

impl LocalBlockStore {
    /// Allocate zeroed A, B (each with a scratch buffer) and accumulator tiles.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if any buffer cannot be reserved.
    pub fn allocate(edge: usize) -> Result<Self> {
        let len = edge
            .checked_mul(edge)
            .ok_or(Error::Allocation(usize::MAX))?;
        Ok(LocalBlockStore {
            edge,
            a: TileSlots::new(len)?,
            b: TileSlots::new(len)?,
            c: Tile::zeroed(edge)?,
        })
    }

    /// Fill the operand tiles with the blocks at `coordinate` of the global
    /// `n`×`n` operands and zero the accumulator.
    pub fn populate(&mut self, coordinate: Coordinate, n: usize, a: &Operand, b: &Operand) {
        let (row0, col0) = (coordinate.row * self.edge, coordinate.col * self.edge);
        a.fill(n, row0, col0, self.edge, self.edge, self.a.live_mut());
        b.fill(n, row0, col0, self.edge, self.edge, self.b.live_mut());
        self.c.as_mut_slice().fill(0.0);
    }

    /// Allocate and populate the tiles for this rank's torus position.
    pub fn for_torus(torus: &TorusContext, a: &Operand, b: &Operand) -> Result<Self> {
        let mut store = Self::allocate(torus.tile_edge())?;
        store.populate(torus.coordinate, torus.matrix_size, a, b);
        Ok(store)
    }

    /// Edge length L of every tile.
    pub fn edge(&self) -> usize {
        self.edge
    }

    /// Currently held A tile.
    pub fn a(&self) -> &[f64] {
        self.a.live()
    }

    /// Currently held B tile.
    pub fn b(&self) -> &[f64] {
        self.b.live()
    }

    /// Partial result.
    pub fn accumulator(&self) -> &Tile {
        &self.c
    }

    pub(crate) fn a_slots_mut(&mut self) -> &mut TileSlots {
        &mut self.a
    }

    pub(crate) fn b_slots_mut(&mut self) -> &mut TileSlots {
        &mut self.b
    }

    /// Borrow the live operands and the accumulator at once.
    pub(crate) fn operands_and_accumulator(&mut self) -> (&[f64], &[f64], &mut [f64]) {
        (self.a.live(), self.b.live(), self.c.as_mut_slice())
    }

    /// Release the operand tiles and their scratch buffers, keeping only the
    /// accumulator.
    pub fn into_accumulator(self) -> Tile {
        self.c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn populate_uniform_and_zero_accumulator() {
        let mut store = LocalBlockStore::allocate(3).unwrap();
        store.populate(
            Coordinate { row: 1, col: 2 },
            9,
            &Operand::Uniform(1.0),
            &Operand::Uniform(2.0),
        );
        assert!(store.a().iter().all(|&v| v == 1.0));
        assert!(store.b().iter().all(|&v| v == 2.0));
        assert!(store.accumulator().as_slice().iter().all(|&v| v == 0.0));
        assert_eq!(store.accumulator().edge(), 3);
    }

    #[test]
    fn tiles_take_their_global_block() {
        let mut store = LocalBlockStore::allocate(2).unwrap();
        store.populate(
            Coordinate { row: 1, col: 0 },
            4,
            &Operand::Pattern,
            &Operand::Identity,
        );
        for i in 0..2 {
            for j in 0..2 {
                assert_eq!(store.a()[i * 2 + j], Operand::Pattern.value(4, 2 + i, j));
                assert_eq!(store.b()[i * 2 + j], 0.0);
            }
        }
    }

    #[test]
    fn random_operand_is_reproducible_per_element() {
        let op = Operand::Random { seed: 42 };
        let mut block = [0.0; 4];
        op.fill(8, 2, 6, 2, 2, &mut block);
        assert_eq!(block[0], op.value(8, 2, 6));
        assert_eq!(block[3], op.value(8, 3, 7));
        assert!(block.iter().all(|&v| v == 3.0 || v == 4.0));
    }

    #[test]
    fn slots_swap_roles() {
        let mut slots = TileSlots::new(2).unwrap();
        {
            let (live, scratch) = slots.split();
            assert_eq!(live, &[0.0, 0.0]);
            scratch.copy_from_slice(&[5.0, 6.0]);
        }
        slots.swap();
        assert_eq!(slots.live(), &[5.0, 6.0]);
    }

    #[test]
    fn operand_parsing() {
        assert_eq!("uniform".parse(), Ok(Operand::Uniform(1.0)));
        assert_eq!("uniform:2.5".parse(), Ok(Operand::Uniform(2.5)));
        assert_eq!("random:7".parse(), Ok(Operand::Random { seed: 7 }));
        assert_eq!("pattern".parse::<Operand>().unwrap().to_string(), "pattern");
        assert!("zeros".parse::<Operand>().is_err());
    }
}
