//! # ferrocannon
//!
//! Cannon's algorithm for dense matrix multiplication on a periodic 2D grid of
//! cooperating ranks, together with the small message-passing layer it runs on.
//!
//! This crate provides:
//! - An in-process [`Universe`] of ranks (one thread each) with a
//!   [`Communicator`] offering MPI-style point-to-point and collective
//!   operations, generic over [`MpiDatatype`]
//! - Cartesian topologies ([`CartComm`], [`dims_create`]) with periodic
//!   wraparound
//! - The shift-multiply engine ([`ShiftMultiplyEngine`]), the per-rank tile
//!   store ([`LocalBlockStore`]) and result assembly at a coordinator
//!   ([`ResultAssembler`])
//! - A one-call driver, [`cannon::multiply`], used by the `ferrocannon` binary
//! - With the `mpi` feature, `Mpi::init()` and `Mpi::world()`: the same
//!   [`Communicator`] backed by a real MPI library, for runs under `mpiexec`
//!
//! ## Quick Start
//!
//! ```
//! use ferrocannon::{cannon, CannonConfig, Universe};
//!
//! fn main() -> Result<(), ferrocannon::Error> {
//!     let config = CannonConfig::default(); // 16x16 matrices of ones
//!     let reports = Universe::run(4, |world| cannon::multiply(&world, &config))?;
//!
//!     let report = reports[0].clone()?.expect("rank 0 coordinates");
//!     assert!(report.result.as_slice().iter().all(|&v| v == 16.0));
//!     Ok(())
//! }
//! ```
//!
//! ## Failure model
//!
//! Every failure is fatal to the whole computation. Configuration errors are
//! decided by the coordinator and broadcast before any tile is allocated, so
//! all ranks leave through the same path. A rank that panics or returns any
//! other error aborts the universe, so its peers fail with [`Error::Aborted`];
//! a rank that returns successfully unblocks peers still waiting on it with
//! [`Error::PeerExited`].

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow certain pedantic lints for existing code
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::similar_names)]

mod assemble;
mod block;
pub mod cannon;
mod comm;
mod config;
mod datatype;
mod engine;
mod error;
mod fabric;
#[cfg(feature = "mpi")]
mod native;
mod status;
mod topology;

pub use assemble::{place_tiles, GlobalResult, ResultAssembler};
pub use block::{LocalBlockStore, Operand, Tile};
pub use cannon::Report;
pub use comm::Communicator;
pub use config::CannonConfig;
pub use datatype::{DatatypeTag, MpiDatatype, Payload};
pub use engine::{multiply_accumulate, RoundStats, ShiftMultiplyEngine};
pub use error::{ConfigError, Error, Result};
#[cfg(feature = "mpi")]
pub use native::Mpi;
pub use status::Status;
pub use topology::{
    dims_create, CartComm, Coordinate, Grid, NeighborSet, TopologyBuilder, TorusContext,
};

use fabric::{Endpoint, Fabric};
use std::rc::Rc;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Instant;

/// Reduction operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Sum of values
    Sum,
    /// Maximum value
    Max,
    /// Minimum value
    Min,
    /// Product of values
    Prod,
}

/// Process-wide epoch for [`Universe::wtime`].
static EPOCH: OnceLock<Instant> = OnceLock::new();

/// A group of ranks executing the same program in lockstep.
///
/// Each rank runs on its own thread and only talks to the others through its
/// [`Communicator`]; no memory is shared between ranks.
///
/// # Example
///
/// ```
/// use ferrocannon::{ReduceOp, Universe};
///
/// let sums = Universe::run(4, |world| {
///     world.allreduce_scalar(world.rank() as f64, ReduceOp::Sum)
/// })
/// .unwrap();
/// assert!(sums.into_iter().all(|s| s.unwrap() == 6.0));
/// ```
pub struct Universe;

/// Signals the end of a rank to its peers when the rank's thread unwinds or
/// returns. Holds the endpoint so the rank's inbox outlives the signal.
struct ExitGuard {
    endpoint: Rc<Endpoint>,
    failure: Option<i32>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            self.endpoint.abort(-1);
        } else if let Some(code) = self.failure {
            self.endpoint.abort(code);
        } else {
            self.endpoint.depart();
        }
    }
}

impl Universe {
    /// Launch `size` ranks, run `f` on each with its world communicator, and
    /// return every rank's outcome in rank order.
    ///
    /// A rank that panics or returns an error not already shared by every rank
    /// aborts the universe. A panic is reported as [`Error::Internal`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCount`] if `size < 1`, or [`Error::Internal`]
    /// if a rank thread could not be started.
    pub fn run<T, F>(size: i32, f: F) -> Result<Vec<Result<T>>>
    where
        T: Send,
        F: Fn(Communicator) -> Result<T> + Sync,
    {
        if size < 1 {
            return Err(Error::InvalidCount(i64::from(size)));
        }
        EPOCH.get_or_init(Instant::now);

        let (fabric, inboxes) = Fabric::new(size as usize);
        let f = &f;
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(inboxes.len());
            for (rank, inbox) in inboxes.into_iter().enumerate() {
                let rank = rank as i32;
                let rank_fabric = Arc::clone(&fabric);
                let spawned = thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn_scoped(scope, move || {
                        let endpoint = Rc::new(Endpoint::new(rank, rank_fabric, inbox));
                        let mut guard = ExitGuard {
                            endpoint: Rc::clone(&endpoint),
                            failure: None,
                        };
                        let span = tracing::debug_span!("rank", rank);
                        let _enter = span.enter();
                        let outcome = f(Communicator::world(endpoint));
                        if let Err(e) = &outcome {
                            guard.failure = e.abort_code();
                            if guard.failure.is_some() {
                                tracing::warn!(error = %e, "rank failed");
                            }
                        }
                        outcome
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        // Ranks already running would wait forever on the missing ones.
                        fabric.abort(rank, -1);
                        return Err(Error::Internal(format!("failed to spawn rank {rank}: {e}")));
                    }
                }
            }

            Ok(handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(Error::Internal(format!("rank {rank} panicked"))))
                })
                .collect())
        })
    }

    /// Get the current wall-clock time in seconds.
    ///
    /// Monotonic; suitable for timing, not for correctness.
    pub fn wtime() -> f64 {
        EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_universe() {
        let err = Universe::run(0, |_world| Ok(())).unwrap_err();
        assert_eq!(err, Error::InvalidCount(0));
    }

    #[test]
    fn panicking_rank_aborts_peers() {
        let results = Universe::run(3, |world| {
            if world.rank() == 1 {
                panic!("rank 1 fails");
            }
            let mut buf = [0.0f64; 1];
            world.recv(&mut buf, 1, 0)?;
            Ok(())
        })
        .unwrap();
        assert!(matches!(results[1], Err(Error::Internal(_))));
        assert_eq!(results[0], Err(Error::Aborted { origin: 1, code: -1 }));
        assert_eq!(results[2], Err(Error::Aborted { origin: 1, code: -1 }));
    }

    #[test]
    fn failing_rank_aborts_independent_peers() {
        let results = Universe::run(3, |world| {
            let rank = world.rank();
            if rank == 1 {
                return Err(Error::Internal("rank 1 fails".into()));
            }
            // Ranks 0 and 2 only wait on each other, and neither ever sends.
            let mut buf = [0u8; 1];
            world.recv(&mut buf, 2 - rank, 0)?;
            Ok(())
        })
        .unwrap();
        assert_eq!(results[1], Err(Error::Internal("rank 1 fails".into())));
        assert_eq!(results[0], Err(Error::Aborted { origin: 1, code: 1 }));
        assert_eq!(results[2], Err(Error::Aborted { origin: 1, code: 1 }));
    }

    #[test]
    fn shared_configuration_error_does_not_abort() {
        let results = Universe::run(2, |world| {
            if world.rank() == 0 {
                return Err(Error::Config(ConfigError::EmptyMatrix));
            }
            let mut buf = [0u8; 1];
            world.recv(&mut buf, 0, 0)?;
            Ok(())
        })
        .unwrap();
        assert_eq!(results[0], Err(Error::Config(ConfigError::EmptyMatrix)));
        assert_eq!(results[1], Err(Error::PeerExited(0)));
    }

    #[test]
    fn early_return_unblocks_waiting_peer() {
        let results = Universe::run(2, |world| {
            if world.rank() == 0 {
                return Ok(());
            }
            let mut buf = [0u8; 1];
            world.recv(&mut buf, 0, 0)?;
            Ok(())
        })
        .unwrap();
        assert_eq!(results[0], Ok(()));
        assert_eq!(results[1], Err(Error::PeerExited(0)));
    }

    #[test]
    fn wtime_is_monotonic() {
        let t0 = Universe::wtime();
        let t1 = Universe::wtime();
        assert!(t1 >= t0);
    }
}
