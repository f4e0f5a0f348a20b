//! Cartesian process topologies and the torus context used by Cannon's
//! algorithm.
//!
//! [`dims_create`] and [`CartComm`] follow `MPI_Dims_create`,
//! `MPI_Cart_create`, `MPI_Cart_coords` and `MPI_Cart_shift`: ranks are laid
//! out row-major and periodic axes wrap around. [`TopologyBuilder`] turns a
//! world communicator into an immutable [`TorusContext`] after the coordinator
//! has validated the configuration for everyone.

use crate::comm::Communicator;
use crate::error::{ConfigError, Error, Result};

/// Fill the zero entries of `dims` with a balanced factorisation of `nnodes`.
///
/// Non-zero entries are kept as constraints. Free entries receive the prime
/// factors of what remains, largest first, each into the currently smallest
/// free dimension, and are then written back in non-increasing order.
///
/// ```
/// use ferrocannon::dims_create;
///
/// let mut dims = [0, 0];
/// dims_create(12, &mut dims).unwrap();
/// assert_eq!(dims, [4, 3]);
///
/// let mut dims = [0, 4, 1];
/// dims_create(12, &mut dims).unwrap();
/// assert_eq!(dims, [3, 4, 1]);
/// ```
pub fn dims_create(nnodes: usize, dims: &mut [usize]) -> Result<()> {
    if nnodes == 0 {
        return Err(Error::InvalidCount(0));
    }
    if dims.is_empty() {
        return Err(Error::InvalidTopology("no dimensions requested".into()));
    }

    let fixed: usize = dims.iter().filter(|&&d| d != 0).product();
    if nnodes % fixed != 0 {
        return Err(Error::InvalidTopology(format!(
            "fixed dimensions {dims:?} do not divide {nnodes} nodes"
        )));
    }
    let free = dims.iter().filter(|&&d| d == 0).count();
    let mut remaining = nnodes / fixed;
    if free == 0 {
        if remaining != 1 {
            return Err(Error::InvalidTopology(format!(
                "dimensions {dims:?} do not multiply to {nnodes}"
            )));
        }
        return Ok(());
    }

    let mut factors = Vec::new();
    let mut p = 2;
    while p * p <= remaining {
        while remaining % p == 0 {
            factors.push(p);
            remaining /= p;
        }
        p += 1;
    }
    if remaining > 1 {
        factors.push(remaining);
    }

    let mut sizes = vec![1usize; free];
    for &factor in factors.iter().rev() {
        if let Some(smallest) = sizes.iter_mut().min() {
            *smallest *= factor;
        }
    }
    sizes.sort_unstable_by(|a, b| b.cmp(a));

    let mut sizes = sizes.into_iter();
    for d in dims.iter_mut().filter(|d| **d == 0) {
        *d = sizes.next().unwrap_or(1);
    }
    Ok(())
}

/// A communicator with an attached Cartesian topology.
#[derive(Clone)]
pub struct CartComm {
    comm: Communicator,
    dims: Vec<usize>,
    periods: Vec<bool>,
}

impl CartComm {
    /// Attach a Cartesian topology to a duplicate of `comm`.
    ///
    /// Collective. `dims` must multiply to exactly `comm.size()`; ranks keep
    /// their numbering and are mapped to coordinates row-major.
    pub fn create(comm: &Communicator, dims: &[usize], periods: &[bool]) -> Result<Self> {
        if dims.is_empty() || dims.len() != periods.len() {
            return Err(Error::InvalidTopology(format!(
                "dims {dims:?} and periods {periods:?} disagree"
            )));
        }
        let cells: usize = dims.iter().product();
        if cells != comm.size() as usize {
            return Err(Error::InvalidTopology(format!(
                "grid {dims:?} has {cells} cells for {} processes",
                comm.size()
            )));
        }
        Ok(CartComm {
            comm: comm.duplicate()?,
            dims: dims.to_vec(),
            periods: periods.to_vec(),
        })
    }

    /// The communicator carrying traffic on this topology.
    pub fn comm(&self) -> &Communicator {
        &self.comm
    }

    /// Extent of each axis.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Periodicity of each axis.
    pub fn periods(&self) -> &[bool] {
        &self.periods
    }

    /// Grid coordinates of `rank`.
    pub fn coords(&self, rank: i32) -> Result<Vec<usize>> {
        if rank < 0 || rank >= self.comm.size() {
            return Err(Error::InvalidRank(rank));
        }
        let mut rest = rank as usize;
        let mut coords = vec![0; self.dims.len()];
        for (axis, &extent) in self.dims.iter().enumerate().rev() {
            coords[axis] = rest % extent;
            rest /= extent;
        }
        Ok(coords)
    }

    /// Rank at `coords`, wrapping periodic axes. Returns `None` when a
    /// coordinate falls off a non-periodic axis.
    pub fn rank_of(&self, coords: &[isize]) -> Result<Option<i32>> {
        if coords.len() != self.dims.len() {
            return Err(Error::InvalidTopology(format!(
                "expected {} coordinates, got {}",
                self.dims.len(),
                coords.len()
            )));
        }
        let mut rank = 0usize;
        for ((&c, &extent), &periodic) in coords.iter().zip(&self.dims).zip(&self.periods) {
            let extent_i = extent as isize;
            let c = if periodic {
                c.rem_euclid(extent_i)
            } else if (0..extent_i).contains(&c) {
                c
            } else {
                return Ok(None);
            };
            rank = rank * extent + c as usize;
        }
        Ok(Some(rank as i32))
    }

    /// Source and destination of a shift by `disp` along `direction` for the
    /// calling rank: data moves from `source` to this rank and from this rank
    /// to `dest`.
    pub fn shift(&self, direction: usize, disp: isize) -> Result<(Option<i32>, Option<i32>)> {
        if direction >= self.dims.len() {
            return Err(Error::InvalidTopology(format!(
                "direction {direction} out of range for {} dimensions",
                self.dims.len()
            )));
        }
        let here: Vec<isize> = self
            .coords(self.comm.rank())?
            .into_iter()
            .map(|c| c as isize)
            .collect();
        let mut towards = here.clone();
        towards[direction] += disp;
        let mut from = here;
        from[direction] -= disp;
        Ok((self.rank_of(&from)?, self.rank_of(&towards)?))
    }
}

/// Shape of the square process grid: `rows == cols == √P`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    /// Number of grid rows
    pub rows: usize,
    /// Number of grid columns
    pub cols: usize,
}

impl Grid {
    /// Side length R of the square grid.
    pub fn side(&self) -> usize {
        self.rows
    }

    /// Number of processes covered.
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Always false for a validated grid.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A process's (row, col) position in the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Coordinate {
    /// Grid row
    pub row: usize,
    /// Grid column
    pub col: usize,
}

/// Ranks of the four torus neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborSet {
    /// Rank at (row, col − 1)
    pub left: i32,
    /// Rank at (row, col + 1)
    pub right: i32,
    /// Rank at (row − 1, col)
    pub up: i32,
    /// Rank at (row + 1, col)
    pub down: i32,
}

/// Immutable per-rank topology: grid, own position, neighbours and the torus
/// communicator. Built once by [`TopologyBuilder::build`] and passed by
/// reference to every later stage.
#[derive(Clone)]
pub struct TorusContext {
    /// Grid shape
    pub grid: Grid,
    /// This rank's position
    pub coordinate: Coordinate,
    /// This rank's neighbours
    pub neighbors: NeighborSet,
    /// Global matrix edge N
    pub matrix_size: usize,
    /// Rank that assembles the result
    pub coordinator: i32,
    cart: CartComm,
}

impl TorusContext {
    /// The periodic 2D topology.
    pub fn cart(&self) -> &CartComm {
        &self.cart
    }

    /// Communicator carrying all torus traffic.
    pub fn comm(&self) -> &Communicator {
        self.cart.comm()
    }

    /// This rank's id.
    pub fn rank(&self) -> i32 {
        self.cart.comm().rank()
    }

    /// Tile edge L = N / R.
    pub fn tile_edge(&self) -> usize {
        self.matrix_size / self.grid.side()
    }

    /// Grid position of any rank.
    pub fn coordinate_of(&self, rank: i32) -> Result<Coordinate> {
        let coords = self.cart.coords(rank)?;
        Ok(Coordinate {
            row: coords[0],
            col: coords[1],
        })
    }
}

/// Builds the square torus for a process group.
#[derive(Debug, Clone, Copy)]
pub struct TopologyBuilder {
    coordinator: i32,
}

impl Default for TopologyBuilder {
    fn default() -> Self {
        Self::new(0)
    }
}

impl TopologyBuilder {
    /// Builder whose validation runs on `coordinator`.
    pub fn new(coordinator: i32) -> Self {
        TopologyBuilder { coordinator }
    }

    /// Check the process count and matrix size without communicating.
    pub fn validate(procs: i32, matrix_size: usize) -> std::result::Result<Grid, ConfigError> {
        let side = Self::balanced_side(procs);
        if side == 0 || side * side != procs as usize {
            return Err(ConfigError::NonSquareProcessCount { procs });
        }
        if matrix_size == 0 {
            return Err(ConfigError::EmptyMatrix);
        }
        if matrix_size % side != 0 {
            return Err(ConfigError::IndivisibleMatrix {
                size: matrix_size,
                side,
            });
        }
        Ok(Grid {
            rows: side,
            cols: side,
        })
    }

    fn balanced_side(procs: i32) -> usize {
        let mut dims = [0usize; 2];
        match dims_create(procs.max(0) as usize, &mut dims) {
            Ok(()) if dims[0] == dims[1] => dims[0],
            _ => 0,
        }
    }

    /// Collectively validate, then build the torus.
    ///
    /// The coordinator decides and broadcasts the verdict; every rank then
    /// branches on the same value, so either all ranks get a
    /// [`TorusContext`] or all return the same [`ConfigError`]. On failure the
    /// coordinator logs the diagnostic and aborts the universe.
    pub fn build(&self, world: &Communicator, matrix_size: usize) -> Result<TorusContext> {
        let procs = world.size();
        let mut verdict = [0i32];
        if world.rank() == self.coordinator {
            if let Err(err) = Self::validate(procs, matrix_size) {
                verdict[0] = err.code();
            }
        }
        world.broadcast(&mut verdict, self.coordinator)?;

        let mut dims = [0usize; 2];
        dims_create(procs as usize, &mut dims)?;
        if let Some(err) = ConfigError::from_code(verdict[0], procs, matrix_size, dims[0]) {
            if world.rank() == self.coordinator {
                tracing::error!(%err, procs, matrix_size, "invalid configuration");
                world.abort(err.code());
            }
            return Err(err.into());
        }
        let grid = Self::validate(procs, matrix_size)?;

        let cart = CartComm::create(world, &[grid.rows, grid.cols], &[true, true])?;
        let coords = cart.coords(world.rank())?;
        let coordinate = Coordinate {
            row: coords[0],
            col: coords[1],
        };
        let missing = || Error::Internal("periodic shift without partner".into());
        let (left, right) = cart.shift(1, 1)?;
        let (up, down) = cart.shift(0, 1)?;
        let neighbors = NeighborSet {
            left: left.ok_or_else(missing)?,
            right: right.ok_or_else(missing)?,
            up: up.ok_or_else(missing)?,
            down: down.ok_or_else(missing)?,
        };
        tracing::debug!(
            row = coordinate.row,
            col = coordinate.col,
            ?neighbors,
            "torus position resolved"
        );

        Ok(TorusContext {
            grid,
            coordinate,
            neighbors,
            matrix_size,
            coordinator: self.coordinator,
            cart,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Universe;
    use proptest::prelude::*;

    #[test]
    fn dims_create_matches_mpi_examples() {
        let mut dims = [0, 0, 0];
        dims_create(12, &mut dims).unwrap();
        assert_eq!(dims, [3, 2, 2]);

        let mut dims = [6, 0, 0];
        dims_create(12, &mut dims).unwrap();
        assert_eq!(dims, [6, 2, 1]);

        let mut dims = [0, 0];
        dims_create(10, &mut dims).unwrap();
        assert_eq!(dims, [5, 2]);

        let mut dims = [5, 0];
        assert!(dims_create(12, &mut dims).is_err());
    }

    #[test]
    fn validate_rejects_bad_shapes() {
        assert_eq!(
            TopologyBuilder::validate(10, 16),
            Err(ConfigError::NonSquareProcessCount { procs: 10 })
        );
        assert_eq!(
            TopologyBuilder::validate(9, 16),
            Err(ConfigError::IndivisibleMatrix { size: 16, side: 3 })
        );
        assert_eq!(
            TopologyBuilder::validate(4, 0),
            Err(ConfigError::EmptyMatrix)
        );
        assert_eq!(
            TopologyBuilder::validate(1, 5),
            Ok(Grid { rows: 1, cols: 1 })
        );
    }

    #[test]
    fn validate_rejects_empty_and_negative_process_counts() {
        for procs in [0, -1, -4] {
            assert_eq!(
                TopologyBuilder::validate(procs, 16),
                Err(ConfigError::NonSquareProcessCount { procs })
            );
        }
    }

    #[test]
    fn neighbors_wrap_around_on_four_by_four() {
        let results = Universe::run(16, |world| {
            let torus = TopologyBuilder::default().build(&world, 16)?;
            Ok((torus.coordinate, torus.neighbors))
        })
        .unwrap();

        let rank_at = |row: usize, col: usize| (row * 4 + col) as i32;
        for (rank, result) in results.into_iter().enumerate() {
            let (coord, n) = result.unwrap();
            assert_eq!(coord, Coordinate { row: rank / 4, col: rank % 4 });
            assert_eq!(n.left, rank_at(coord.row, (coord.col + 3) % 4));
            assert_eq!(n.right, rank_at(coord.row, (coord.col + 1) % 4));
            assert_eq!(n.up, rank_at((coord.row + 3) % 4, coord.col));
            assert_eq!(n.down, rank_at((coord.row + 1) % 4, coord.col));
        }
    }

    #[test]
    fn column_zero_left_is_column_three() {
        let results = Universe::run(16, |world| {
            let torus = TopologyBuilder::default().build(&world, 16)?;
            Ok(torus.neighbors)
        })
        .unwrap();
        // Rank 4 sits at (1, 0); rank 7 at (1, 3); rank 13 at (3, 1).
        assert_eq!(results[4].as_ref().unwrap().left, 7);
        assert_eq!(results[1].as_ref().unwrap().up, 13);
    }

    #[test]
    fn non_square_count_fails_on_every_rank() {
        let results = Universe::run(10, |world| {
            TopologyBuilder::default().build(&world, 16).map(|_| ())
        })
        .unwrap();
        for result in results {
            assert_eq!(
                result,
                Err(Error::Config(ConfigError::NonSquareProcessCount { procs: 10 }))
            );
        }
    }

    #[test]
    fn non_periodic_shift_has_no_partner_at_edge() {
        let results = Universe::run(3, |world| {
            let cart = CartComm::create(&world, &[3], &[false])?;
            cart.shift(0, 1)
        })
        .unwrap();
        assert_eq!(*results[0].as_ref().unwrap(), (None, Some(1)));
        assert_eq!(*results[2].as_ref().unwrap(), (Some(1), None));
    }

    proptest! {
        #[test]
        fn square_counts_give_square_grids(side in 1usize..40) {
            let mut dims = [0, 0];
            dims_create(side * side, &mut dims).unwrap();
            prop_assert_eq!(dims, [side, side]);
            prop_assert_eq!(
                TopologyBuilder::validate((side * side) as i32, side * 3),
                Ok(Grid { rows: side, cols: side })
            );
        }

        #[test]
        fn non_square_counts_are_rejected(procs in 2i32..2000) {
            let root = (procs as f64).sqrt().round() as i32;
            prop_assume!(root * root != procs);
            prop_assert_eq!(
                TopologyBuilder::validate(procs, 64),
                Err(ConfigError::NonSquareProcessCount { procs })
            );
        }

        #[test]
        fn factorisation_covers_all_nodes(nnodes in 1usize..5000) {
            let mut dims = [0, 0, 0];
            dims_create(nnodes, &mut dims).unwrap();
            prop_assert_eq!(dims.iter().product::<usize>(), nnodes);
            prop_assert!(dims[0] >= dims[1] && dims[1] >= dims[2]);
        }
    }
}
