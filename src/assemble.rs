//! Collecting accumulator tiles into the full product at the coordinator.

use crate::block::Tile;
use crate::error::{Error, Result};
use crate::topology::{Coordinate, TorusContext};
use std::fmt;

/// The assembled N×N product, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalResult {
    n: usize,
    data: Vec<f64>,
}

impl GlobalResult {
    /// Wrap a row-major `n`×`n` buffer.
    pub fn from_vec(n: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != n * n {
            return Err(Error::CountMismatch {
                expected: n * n,
                received: data.len(),
            });
        }
        Ok(GlobalResult { n, data })
    }

    /// Edge length N.
    pub fn size(&self) -> usize {
        self.n
    }

    /// Element (i, j).
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n + j]
    }

    /// Row-major elements.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Iterate over rows.
    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.data.chunks(self.n.max(1))
    }

    /// Largest elementwise absolute difference, or infinity on a shape
    /// mismatch.
    pub fn max_abs_diff(&self, other: &GlobalResult) -> f64 {
        if self.n != other.n {
            return f64::INFINITY;
        }
        self.data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

impl fmt::Display for GlobalResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.rows() {
            for v in row {
                write!(f, "{v:.6} ")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Place gathered tiles by the grid position of the rank that sent them.
///
/// `gathered` holds one `edge`×`edge` tile per rank, in rank order. Each tile
/// lands at rows `row·edge..` and columns `col·edge..` of the result, where
/// (row, col) comes from `coordinate_of`, never from the rank number itself.
pub fn place_tiles<F>(gathered: &[f64], edge: usize, side: usize, coordinate_of: F) -> Result<GlobalResult>
where
    F: Fn(i32) -> Result<Coordinate>,
{
    let n = edge * side;
    let tile_len = edge * edge;
    if gathered.len() != tile_len * side * side {
        return Err(Error::CountMismatch {
            expected: tile_len * side * side,
            received: gathered.len(),
        });
    }

    let mut data = Vec::new();
    data.try_reserve_exact(n * n)
        .map_err(|_| Error::Allocation(n * n))?;
    data.resize(n * n, 0.0);

    for (rank, tile) in gathered.chunks(tile_len.max(1)).enumerate() {
        let Coordinate { row, col } = coordinate_of(rank as i32)?;
        if row >= side || col >= side {
            return Err(Error::InvalidTopology(format!(
                "rank {rank} placed at ({row}, {col}) outside a {side}x{side} grid"
            )));
        }
        for (i, tile_row) in tile.chunks(edge).enumerate() {
            let start = (row * edge + i) * n + col * edge;
            data[start..start + edge].copy_from_slice(tile_row);
        }
    }
    GlobalResult::from_vec(n, data)
}

/// Gathers every rank's accumulator at the coordinator.
pub struct ResultAssembler<'a> {
    torus: &'a TorusContext,
}

impl<'a> ResultAssembler<'a> {
    /// Assembler over `torus`.
    pub fn new(torus: &'a TorusContext) -> Self {
        ResultAssembler { torus }
    }

    /// Collectively gather `tile` from every rank.
    ///
    /// Returns the full product on the coordinator and `None` elsewhere. The
    /// tiles are only read, so assembling the same tiles again yields an
    /// identical result.
    pub fn assemble(&self, tile: &Tile) -> Result<Option<GlobalResult>> {
        let comm = self.torus.comm();
        let coordinator = self.torus.coordinator;
        if comm.rank() != coordinator {
            comm.gather(tile.as_slice(), &mut [], coordinator)?;
            return Ok(None);
        }

        let mut gathered = vec![0.0; tile.as_slice().len() * comm.size() as usize];
        comm.gather(tile.as_slice(), &mut gathered, coordinator)?;
        let result = place_tiles(&gathered, tile.edge(), self.torus.grid.side(), |rank| {
            self.torus.coordinate_of(rank)
        })?;
        tracing::info!(n = result.size(), "global result assembled");
        Ok(Some(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiles_follow_coordinates_not_rank_order() {
        // Four 1x1 tiles from ranks laid out column-major.
        let gathered = [0.0, 1.0, 2.0, 3.0];
        let result = place_tiles(&gathered, 1, 2, |rank| {
            Ok(Coordinate {
                row: rank as usize % 2,
                col: rank as usize / 2,
            })
        })
        .unwrap();
        assert_eq!(result.as_slice(), &[0.0, 2.0, 1.0, 3.0]);
    }

    #[test]
    fn two_by_two_tiles_land_at_offsets() {
        let mut gathered = Vec::new();
        for rank in 0..4 {
            gathered.extend(std::iter::repeat(rank as f64).take(4));
        }
        let result = place_tiles(&gathered, 2, 2, |rank| {
            Ok(Coordinate {
                row: rank as usize / 2,
                col: rank as usize % 2,
            })
        })
        .unwrap();
        assert_eq!(result.size(), 4);
        assert_eq!(result.get(0, 0), 0.0);
        assert_eq!(result.get(1, 3), 1.0);
        assert_eq!(result.get(3, 0), 2.0);
        assert_eq!(result.get(2, 2), 3.0);
    }

    #[test]
    fn rejects_wrong_gather_length() {
        let err = place_tiles(&[0.0; 3], 1, 2, |_| Ok(Coordinate { row: 0, col: 0 })).unwrap_err();
        assert_eq!(
            err,
            Error::CountMismatch {
                expected: 4,
                received: 3
            }
        );
    }

    #[test]
    fn display_prints_rows() {
        let result = GlobalResult::from_vec(2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(
            result.to_string(),
            "1.000000 2.000000 \n3.000000 4.000000 \n"
        );
        assert_eq!(result.max_abs_diff(&result), 0.0);
    }
}
