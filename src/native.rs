//! MPI backend, enabled with the `mpi` feature.
//!
//! [`Mpi`] owns the MPI environment of a program started by `mpiexec`, one
//! process per rank. Its world communicator is an ordinary [`Communicator`],
//! so [`cannon::multiply`](crate::cannon::multiply) runs on it unchanged.

use crate::comm::Communicator;
use crate::datatype::MpiDatatype;
use crate::error::{Error, Result};
use crate::status::Status;
use crate::ReduceOp;
use mpi::collective::SystemOperation;
use mpi::environment::Universe as MpiUniverse;
use mpi::point_to_point::{self, send_receive_into_with_tags};
use mpi::topology::SimpleCommunicator;
use mpi::traits::{
    Communicator as _, CommunicatorCollectives, Destination, Equivalence, Root, Source,
};
use std::marker::PhantomData;

/// MPI environment handle.
///
/// There can only be one instance at a time. When dropped, it finalizes MPI.
///
/// # Example
///
/// ```no_run
/// use ferrocannon::{cannon, CannonConfig, Mpi};
///
/// let mpi = Mpi::init().expect("Failed to initialize MPI");
/// let world = mpi.world();
/// let report = cannon::multiply(&world, &CannonConfig::default()).unwrap();
/// // MPI is finalized when `mpi` goes out of scope
/// ```
pub struct Mpi {
    universe: MpiUniverse,
    /// Marker to make Mpi !Send and !Sync
    _marker: PhantomData<*const ()>,
}

impl Mpi {
    /// Initialize MPI.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyInitialized`] if MPI is already initialized.
    pub fn init() -> Result<Self> {
        let universe = mpi::initialize().ok_or(Error::AlreadyInitialized)?;
        Ok(Mpi {
            universe,
            _marker: PhantomData,
        })
    }

    /// Get a handle to `MPI_COMM_WORLD`.
    pub fn world(&self) -> Communicator {
        Communicator::native(NativeComm {
            comm: self.universe.world(),
        })
    }

    /// Get the current wall-clock time (`MPI_Wtime`).
    pub fn wtime() -> f64 {
        mpi::time()
    }
}

fn system_op(op: ReduceOp) -> SystemOperation {
    match op {
        ReduceOp::Sum => SystemOperation::sum(),
        ReduceOp::Max => SystemOperation::max(),
        ReduceOp::Min => SystemOperation::min(),
        ReduceOp::Prod => SystemOperation::product(),
    }
}

/// Native MPI communicator behind a [`Communicator`]. Ranks, tags and buffer
/// lengths are checked by the caller; MPI itself aborts the job on any
/// failure it detects.
pub(crate) struct NativeComm {
    comm: SimpleCommunicator,
}

impl NativeComm {
    pub(crate) fn rank(&self) -> i32 {
        self.comm.rank()
    }

    pub(crate) fn size(&self) -> i32 {
        self.comm.size()
    }

    pub(crate) fn duplicate(&self) -> Self {
        NativeComm {
            comm: self.comm.duplicate(),
        }
    }

    pub(crate) fn abort(&self, code: i32) -> ! {
        tracing::error!(rank = self.rank(), code, "aborting MPI job");
        self.comm.abort(code)
    }

    pub(crate) fn barrier(&self) {
        self.comm.barrier();
    }

    pub(crate) fn send<T: MpiDatatype>(&self, data: &[T], dest: i32, tag: i32) {
        self.comm.process_at_rank(dest).send_with_tag(data, tag);
    }

    pub(crate) fn recv<T: MpiDatatype>(
        &self,
        buf: &mut [T],
        source: i32,
        tag: i32,
    ) -> Result<Status> {
        let status = self
            .comm
            .process_at_rank(source)
            .receive_into_with_tag(buf, tag);
        checked_status::<T>(&status, buf.len())
    }

    pub(crate) fn sendrecv<T: MpiDatatype>(
        &self,
        send: &[T],
        dest: i32,
        sendtag: i32,
        recv: &mut [T],
        source: i32,
        recvtag: i32,
    ) -> Result<Status> {
        let status = send_receive_into_with_tags(
            send,
            &self.comm.process_at_rank(dest),
            sendtag,
            recv,
            &self.comm.process_at_rank(source),
            recvtag,
        );
        checked_status::<T>(&status, recv.len())
    }

    pub(crate) fn broadcast<T: MpiDatatype>(&self, data: &mut [T], root: i32) {
        self.comm.process_at_rank(root).broadcast_into(data);
    }

    pub(crate) fn gather<T: MpiDatatype>(&self, send: &[T], recv: &mut [T], root: i32) {
        let root_process = self.comm.process_at_rank(root);
        if self.rank() == root {
            root_process.gather_into_root(send, recv);
        } else {
            root_process.gather_into(send);
        }
    }

    pub(crate) fn reduce<T: MpiDatatype>(&self, send: &[T], recv: &mut [T], op: ReduceOp, root: i32) {
        let root_process = self.comm.process_at_rank(root);
        if self.rank() == root {
            root_process.reduce_into_root(send, recv, system_op(op));
        } else {
            root_process.reduce_into(send, system_op(op));
        }
    }

    pub(crate) fn allreduce<T: MpiDatatype>(&self, send: &[T], recv: &mut [T], op: ReduceOp) {
        self.comm.all_reduce_into(send, recv, system_op(op));
    }
}

/// A message shorter than the receive buffer is accepted by MPI; reject it
/// the same way the fabric does.
fn checked_status<T: MpiDatatype>(status: &point_to_point::Status, expected: usize) -> Result<Status> {
    let count = status.count(<T as Equivalence>::equivalent_datatype());
    let received = count.max(0) as usize;
    if received != expected {
        return Err(Error::CountMismatch { expected, received });
    }
    Ok(Status {
        source: status.source_rank(),
        tag: status.tag(),
        count: i64::from(count),
    })
}
