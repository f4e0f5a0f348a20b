//! Safe communicator operations.
//!
//! A [`Communicator`] runs over one of two backends: the in-process fabric of
//! a [`Universe`](crate::Universe), or (with the `mpi` feature) a native MPI
//! communicator obtained from `Mpi::world`. Argument checks happen here, once,
//! so both backends reject the same misuse with the same error.

use crate::datatype::MpiDatatype;
use crate::error::{Error, Result};
use crate::fabric::{Endpoint, WORLD_CONTEXT};
#[cfg(feature = "mpi")]
use crate::native::NativeComm;
use crate::status::Status;
use crate::ReduceOp;
use std::rc::Rc;

// Reserved (negative) tags for collective traffic on the fabric.
const TAG_BARRIER: i32 = -1;
const TAG_BARRIER_RELEASE: i32 = -2;
const TAG_BCAST: i32 = -3;
const TAG_GATHER: i32 = -4;
const TAG_REDUCE: i32 = -5;

/// A communicator.
///
/// This type binds one rank to a communication context and provides
/// point-to-point and collective operations. Messages sent on one
/// communicator never match receives posted on another, even between the same
/// pair of ranks.
///
/// # Example
///
/// ```
/// use ferrocannon::Universe;
///
/// Universe::run(4, |world| {
///     println!("I am rank {} of {}", world.rank(), world.size());
///     Ok(())
/// })
/// .unwrap();
/// ```
#[derive(Clone)]
pub struct Communicator {
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    Local(LocalComm),
    #[cfg(feature = "mpi")]
    Mpi(Rc<NativeComm>),
}

impl Communicator {
    /// Get the world communicator of a fabric endpoint.
    pub(crate) fn world(endpoint: Rc<Endpoint>) -> Self {
        Communicator {
            backend: Backend::Local(LocalComm {
                endpoint,
                context: WORLD_CONTEXT,
            }),
        }
    }

    #[cfg(feature = "mpi")]
    pub(crate) fn native(comm: NativeComm) -> Self {
        Communicator {
            backend: Backend::Mpi(Rc::new(comm)),
        }
    }

    /// Get the rank of the calling process in this communicator.
    pub fn rank(&self) -> i32 {
        match &self.backend {
            Backend::Local(local) => local.endpoint.rank(),
            #[cfg(feature = "mpi")]
            Backend::Mpi(native) => native.rank(),
        }
    }

    /// Get the number of processes in this communicator.
    pub fn size(&self) -> i32 {
        match &self.backend {
            Backend::Local(local) => local.endpoint.size(),
            #[cfg(feature = "mpi")]
            Backend::Mpi(native) => native.size(),
        }
    }

    /// Duplicate this communicator.
    ///
    /// Collective: every rank must call it in the same order. The duplicate
    /// has the same ranks but a fresh context.
    pub fn duplicate(&self) -> Result<Self> {
        let backend = match &self.backend {
            Backend::Local(local) => Backend::Local(LocalComm {
                endpoint: Rc::clone(&local.endpoint),
                context: local.endpoint.allocate_context(),
            }),
            #[cfg(feature = "mpi")]
            Backend::Mpi(native) => Backend::Mpi(Rc::new(native.duplicate())),
        };
        Ok(Communicator { backend })
    }

    /// Terminate every rank.
    ///
    /// On the fabric, all pending and later operations on every rank fail with
    /// [`Error::Aborted`] and the returned error is meant to be propagated by
    /// the caller. Under MPI the whole job is terminated and this call does
    /// not return.
    pub fn abort(&self, code: i32) -> Error {
        match &self.backend {
            Backend::Local(local) => local.endpoint.abort(code),
            #[cfg(feature = "mpi")]
            Backend::Mpi(native) => native.abort(code),
        }
    }

    fn check_rank(&self, rank: i32) -> Result<()> {
        if rank < 0 || rank >= self.size() {
            return Err(Error::InvalidRank(rank));
        }
        Ok(())
    }

    fn check_tag(tag: i32) -> Result<()> {
        if tag < 0 {
            return Err(Error::InvalidTag(tag));
        }
        Ok(())
    }

    // ========================================================================
    // Synchronization
    // ========================================================================

    /// Barrier synchronization.
    ///
    /// All processes in the communicator must call this function. No process
    /// will return until all processes have entered the barrier.
    pub fn barrier(&self) -> Result<()> {
        match &self.backend {
            Backend::Local(local) => local.barrier(),
            #[cfg(feature = "mpi")]
            Backend::Mpi(native) => {
                native.barrier();
                Ok(())
            }
        }
    }

    // ========================================================================
    // Point-to-Point Communication
    // ========================================================================

    /// Send a slice to another process.
    ///
    /// Sends on the fabric are buffered and return immediately.
    pub fn send<T: MpiDatatype>(&self, data: &[T], dest: i32, tag: i32) -> Result<()> {
        Self::check_tag(tag)?;
        self.check_rank(dest)?;
        match &self.backend {
            Backend::Local(local) => local.post(data, dest, tag),
            #[cfg(feature = "mpi")]
            Backend::Mpi(native) => {
                native.send(data, dest, tag);
                Ok(())
            }
        }
    }

    /// Receive exactly `data.len()` elements from `source` with `tag`.
    pub fn recv<T: MpiDatatype>(&self, data: &mut [T], source: i32, tag: i32) -> Result<Status> {
        Self::check_tag(tag)?;
        self.check_rank(source)?;
        match &self.backend {
            Backend::Local(local) => local.take(data, source, tag),
            #[cfg(feature = "mpi")]
            Backend::Mpi(native) => native.recv(data, source, tag),
        }
    }

    /// Combined send and receive.
    ///
    /// Sends `send` to `dest` and receives into `recv` from `source` in one
    /// call. Safe for cyclic shifts where every rank sends to one neighbor and
    /// receives from another. `send` and `recv` are distinct buffers.
    #[allow(clippy::too_many_arguments)]
    pub fn sendrecv<T: MpiDatatype>(
        &self,
        send: &[T],
        dest: i32,
        sendtag: i32,
        recv: &mut [T],
        source: i32,
        recvtag: i32,
    ) -> Result<Status> {
        Self::check_tag(sendtag)?;
        Self::check_tag(recvtag)?;
        self.check_rank(dest)?;
        self.check_rank(source)?;
        match &self.backend {
            Backend::Local(local) => {
                local.post(send, dest, sendtag)?;
                local.take(recv, source, recvtag)
            }
            #[cfg(feature = "mpi")]
            Backend::Mpi(native) => native.sendrecv(send, dest, sendtag, recv, source, recvtag),
        }
    }

    // ========================================================================
    // Blocking Collectives
    // ========================================================================

    /// Broadcast a slice from root to all processes.
    ///
    /// # Arguments
    ///
    /// * `data` - Buffer to broadcast (input at root, output at others)
    /// * `root` - Rank of the root process
    pub fn broadcast<T: MpiDatatype>(&self, data: &mut [T], root: i32) -> Result<()> {
        self.check_rank(root)?;
        match &self.backend {
            Backend::Local(local) => local.broadcast(data, root),
            #[cfg(feature = "mpi")]
            Backend::Mpi(native) => {
                native.broadcast(data, root);
                Ok(())
            }
        }
    }

    /// Gather values to the root process.
    ///
    /// Each process sends `send.len()` elements. Root receives them in rank
    /// order, so `recv` must hold `send.len() * size` elements there; it is
    /// ignored on other ranks.
    pub fn gather<T: MpiDatatype>(&self, send: &[T], recv: &mut [T], root: i32) -> Result<()> {
        self.check_rank(root)?;
        let at_root = self.rank() == root;
        if at_root && recv.len() != send.len() * self.size() as usize {
            return Err(Error::InvalidBuffer);
        }
        match &self.backend {
            Backend::Local(local) => local.gather(send, recv, root),
            #[cfg(feature = "mpi")]
            Backend::Mpi(native) => {
                native.gather(send, recv, root);
                Ok(())
            }
        }
    }

    /// Reduce values to the root process.
    ///
    /// # Arguments
    ///
    /// * `send` - Data to send from this process
    /// * `recv` - Buffer for result (only significant at root)
    /// * `op` - Reduction operation
    /// * `root` - Rank of the root process
    pub fn reduce<T: MpiDatatype>(
        &self,
        send: &[T],
        recv: &mut [T],
        op: ReduceOp,
        root: i32,
    ) -> Result<()> {
        self.check_rank(root)?;
        if self.rank() == root && send.len() != recv.len() {
            return Err(Error::InvalidBuffer);
        }
        match &self.backend {
            Backend::Local(local) => local.reduce(send, recv, op, root),
            #[cfg(feature = "mpi")]
            Backend::Mpi(native) => {
                native.reduce(send, recv, op, root);
                Ok(())
            }
        }
    }

    /// All-reduce values (reduce and broadcast result to all).
    pub fn allreduce<T: MpiDatatype>(&self, send: &[T], recv: &mut [T], op: ReduceOp) -> Result<()> {
        if send.len() != recv.len() {
            return Err(Error::InvalidBuffer);
        }
        match &self.backend {
            Backend::Local(local) => {
                local.reduce(send, recv, op, 0)?;
                local.broadcast(recv, 0)
            }
            #[cfg(feature = "mpi")]
            Backend::Mpi(native) => {
                native.allreduce(send, recv, op);
                Ok(())
            }
        }
    }

    /// All-reduce a single value.
    ///
    /// Convenience method for reducing a single scalar.
    pub fn allreduce_scalar<T: MpiDatatype>(&self, value: T, op: ReduceOp) -> Result<T> {
        let send = [value];
        let mut recv = [value];
        self.allreduce(&send, &mut recv, op)?;
        Ok(recv[0])
    }
}

/// Fabric backend: one rank's endpoint plus the context that isolates this
/// communicator's traffic. Ranks and buffer lengths are checked by the caller.
#[derive(Clone)]
struct LocalComm {
    endpoint: Rc<Endpoint>,
    context: u32,
}

impl LocalComm {
    fn rank(&self) -> i32 {
        self.endpoint.rank()
    }

    fn size(&self) -> i32 {
        self.endpoint.size()
    }

    fn post<T: MpiDatatype>(&self, data: &[T], dest: i32, tag: i32) -> Result<()> {
        self.endpoint.send(self.context, dest, tag, T::pack(data))
    }

    fn take<T: MpiDatatype>(&self, buf: &mut [T], source: i32, tag: i32) -> Result<Status> {
        let payload = self.endpoint.recv(self.context, source, tag)?;
        let data = T::unpack(payload).map_err(|other| Error::DatatypeMismatch {
            expected: T::TAG,
            received: other.tag(),
        })?;
        if data.len() != buf.len() {
            return Err(Error::CountMismatch {
                expected: buf.len(),
                received: data.len(),
            });
        }
        buf.copy_from_slice(&data);
        Ok(Status {
            source,
            tag,
            count: data.len() as i64,
        })
    }

    /// Linear barrier through rank 0.
    fn barrier(&self) -> Result<()> {
        let empty: [u8; 0] = [];
        if self.rank() == 0 {
            for source in 1..self.size() {
                self.take(&mut [0u8; 0], source, TAG_BARRIER)?;
            }
            for dest in 1..self.size() {
                self.post(&empty, dest, TAG_BARRIER_RELEASE)?;
            }
        } else {
            self.post(&empty, 0, TAG_BARRIER)?;
            self.take(&mut [0u8; 0], 0, TAG_BARRIER_RELEASE)?;
        }
        Ok(())
    }

    fn broadcast<T: MpiDatatype>(&self, data: &mut [T], root: i32) -> Result<()> {
        if self.rank() == root {
            for dest in (0..self.size()).filter(|&r| r != root) {
                self.post(data, dest, TAG_BCAST)?;
            }
        } else {
            self.take(data, root, TAG_BCAST)?;
        }
        Ok(())
    }

    fn gather<T: MpiDatatype>(&self, send: &[T], recv: &mut [T], root: i32) -> Result<()> {
        if self.rank() != root {
            return self.post(send, root, TAG_GATHER);
        }
        for (source, chunk) in recv.chunks_mut(send.len().max(1)).enumerate() {
            let source = source as i32;
            if source == root {
                chunk.copy_from_slice(send);
            } else {
                self.take(chunk, source, TAG_GATHER)?;
            }
        }
        Ok(())
    }

    fn reduce<T: MpiDatatype>(&self, send: &[T], recv: &mut [T], op: ReduceOp, root: i32) -> Result<()> {
        if self.rank() != root {
            return self.post(send, root, TAG_REDUCE);
        }

        // Combine in rank order so every run yields the same floating-point result.
        let mut incoming = send.to_vec();
        for source in 0..self.size() {
            if source == root {
                incoming.copy_from_slice(send);
            } else {
                self.take(&mut incoming, source, TAG_REDUCE)?;
            }
            if source == 0 {
                recv.copy_from_slice(&incoming);
            } else {
                for (acc, &x) in recv.iter_mut().zip(&incoming) {
                    *acc = T::combine(op, *acc, x);
                }
            }
        }
        Ok(())
    }
}

// Communicators are not Send or Sync: each one belongs to its rank's thread.

#[cfg(test)]
mod tests {
    use crate::{Error, ReduceOp, Universe};

    #[test]
    fn gather_orders_by_rank() {
        let results = Universe::run(4, |world| {
            let rank = world.rank();
            let send = [rank * 10, rank * 10 + 1];
            let mut recv = if rank == 2 { vec![0; 8] } else { vec![] };
            world.gather(&send, &mut recv, 2)?;
            Ok(recv)
        })
        .unwrap();
        assert_eq!(
            *results[2].as_ref().unwrap(),
            vec![0, 1, 10, 11, 20, 21, 30, 31]
        );
        assert!(results[0].as_ref().unwrap().is_empty());
    }

    #[test]
    fn allreduce_scalar_sum_and_max() {
        let results = Universe::run(5, |world| {
            let r = world.rank() as f64;
            let sum = world.allreduce_scalar(r, ReduceOp::Sum)?;
            let max = world.allreduce_scalar(r, ReduceOp::Max)?;
            Ok((sum, max))
        })
        .unwrap();
        for result in results {
            assert_eq!(result.unwrap(), (10.0, 4.0));
        }
    }

    #[test]
    fn ring_sendrecv_is_deadlock_free() {
        let results = Universe::run(6, |world| {
            let rank = world.rank();
            let size = world.size();
            let next = (rank + 1) % size;
            let prev = (rank + size - 1) % size;
            let mut recv = [0i64; 2];
            let status = world.sendrecv(&[rank as i64; 2], next, 0, &mut recv, prev, 0)?;
            assert_eq!(status.source, prev);
            world.barrier()?;
            Ok(recv[0])
        })
        .unwrap();
        for (rank, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), ((rank + 5) % 6) as i64);
        }
    }

    #[test]
    fn mismatched_receive_is_reported() {
        let results = Universe::run(2, |world| {
            if world.rank() == 0 {
                world.send(&[1.0f32, 2.0], 1, 0)?;
                world.send(&[1.0f64, 2.0, 3.0], 1, 1)?;
                return Ok(());
            }
            let mut as_f64 = [0.0f64; 2];
            let err = world.recv(&mut as_f64, 0, 0).unwrap_err();
            assert!(matches!(err, Error::DatatypeMismatch { .. }));
            let err = world.recv(&mut as_f64, 0, 1).unwrap_err();
            assert_eq!(
                err,
                Error::CountMismatch {
                    expected: 2,
                    received: 3
                }
            );
            Ok(())
        })
        .unwrap();
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn rejects_reserved_tags_and_bad_ranks() {
        let results = Universe::run(1, |world| {
            assert_eq!(world.send(&[1u8], 0, -1), Err(Error::InvalidTag(-1)));
            assert_eq!(world.send(&[1u8], 3, 0), Err(Error::InvalidRank(3)));
            Ok(())
        })
        .unwrap();
        assert!(results[0].is_ok());
    }

    #[test]
    fn duplicate_isolates_traffic() {
        let results = Universe::run(2, |world| {
            let dup = world.duplicate()?;
            assert_eq!((dup.rank(), dup.size()), (world.rank(), world.size()));
            let peer = 1 - world.rank();
            dup.send(&[1u32], peer, 0)?;
            world.send(&[2u32], peer, 0)?;
            let mut a = [0u32];
            let mut b = [0u32];
            world.recv(&mut a, peer, 0)?;
            dup.recv(&mut b, peer, 0)?;
            Ok((a[0], b[0]))
        })
        .unwrap();
        for result in results {
            assert_eq!(result.unwrap(), (2, 1));
        }
    }
}
