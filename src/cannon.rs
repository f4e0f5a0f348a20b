//! One-call driver for Cannon's algorithm.
//!
//! [`multiply`] runs the whole pipeline on one rank: validate and build the
//! torus, populate the tiles, run the shift-multiply rounds, time them, and
//! gather the product at the coordinator.
//!
//! ```
//! use ferrocannon::{cannon, CannonConfig, Operand, Universe};
//!
//! let config = CannonConfig::with_size(6).operands(Operand::Pattern, Operand::Random { seed: 1 });
//! let reports = Universe::run(9, |world| cannon::multiply(&world, &config)).unwrap();
//!
//! let report = reports[0].as_ref().unwrap().as_ref().unwrap();
//! assert_eq!(report.max_abs_error(&config), 0.0);
//! assert!(reports[1..].iter().all(|r| r.as_ref().unwrap().is_none()));
//! ```

use crate::assemble::{GlobalResult, ResultAssembler};
use crate::block::{LocalBlockStore, Operand};
use crate::comm::Communicator;
use crate::config::CannonConfig;
use crate::engine::{multiply_accumulate, RoundStats, ShiftMultiplyEngine};
use crate::error::Result;
use crate::topology::{Grid, TopologyBuilder};
use crate::{ReduceOp, Universe};
use tracing::info;

/// Outcome of a run, held by the coordinator only.
#[derive(Debug, Clone)]
pub struct Report {
    /// The assembled product.
    pub result: GlobalResult,
    /// Wall-clock seconds of the shift-multiply phase, maximum over ranks.
    pub elapsed: f64,
    /// Number of ranks used.
    pub processes: i32,
    /// Shape of the process grid.
    pub grid: Grid,
    /// Coordinator's round counters.
    pub stats: RoundStats,
    /// Sum of every accumulator entry across all ranks.
    pub checksum: f64,
}

impl Report {
    /// Largest deviation from the serial product of the configured operands.
    pub fn max_abs_error(&self, config: &CannonConfig) -> f64 {
        match serial_product(config.matrix_size, &config.a, &config.b) {
            Ok(expected) => self.result.max_abs_diff(&expected),
            Err(_) => f64::INFINITY,
        }
    }
}

/// Single-rank reference product of two generated `n`×`n` operands.
pub fn serial_product(n: usize, a: &Operand, b: &Operand) -> Result<GlobalResult> {
    let mut lhs = vec![0.0; n * n];
    let mut rhs = vec![0.0; n * n];
    let mut out = vec![0.0; n * n];
    a.fill(n, 0, 0, n, n, &mut lhs);
    b.fill(n, 0, 0, n, n, &mut rhs);
    multiply_accumulate(&lhs, &rhs, &mut out, n);
    GlobalResult::from_vec(n, out)
}

/// Run Cannon's algorithm on this rank.
///
/// Every rank of `world` must call this with the same `config`. Returns
/// `Some(report)` on the coordinator and `None` elsewhere.
///
/// # Errors
///
/// Configuration errors are returned identically on every rank before any
/// tile is allocated. Communication and allocation failures end the run.
pub fn multiply(world: &Communicator, config: &CannonConfig) -> Result<Option<Report>> {
    let torus = TopologyBuilder::new(config.coordinator).build(world, config.matrix_size)?;
    let comm = torus.comm();
    if comm.rank() == torus.coordinator {
        info!(
            procs = comm.size(),
            side = torus.grid.side(),
            n = config.matrix_size,
            tile = torus.tile_edge(),
            align = config.align,
            "starting shift-multiply"
        );
    }

    let mut store = LocalBlockStore::for_torus(&torus, &config.a, &config.b)?;

    let start = Universe::wtime();
    let stats = ShiftMultiplyEngine::new(&torus, config.align).run(&mut store)?;
    comm.barrier()?;
    let elapsed = comm.allreduce_scalar(Universe::wtime() - start, ReduceOp::Max)?;

    let accumulator = store.into_accumulator();
    let local_sum: f64 = accumulator.as_slice().iter().sum();
    let mut checksum = [0.0];
    comm.reduce(&[local_sum], &mut checksum, ReduceOp::Sum, torus.coordinator)?;

    let assembled = ResultAssembler::new(&torus).assemble(&accumulator)?;
    Ok(assembled.map(|result| {
        info!(elapsed, checksum = checksum[0], "run complete");
        Report {
            result,
            elapsed,
            processes: comm.size(),
            grid: torus.grid,
            stats,
            checksum: checksum[0],
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_product_of_ones_is_n() {
        let product = serial_product(5, &Operand::Uniform(1.0), &Operand::Uniform(1.0)).unwrap();
        assert!(product.as_slice().iter().all(|&v| v == 5.0));
    }

    #[test]
    fn serial_product_with_identity_is_operand() {
        let product = serial_product(4, &Operand::Pattern, &Operand::Identity).unwrap();
        for i in 0..4 {
            for j in 0..4 {
                assert_eq!(product.get(i, j), Operand::Pattern.value(4, i, j));
            }
        }
    }
}
