//! Message status information.
//!
//! This module provides the [`Status`] struct returned by receive operations,
//! describing the message that was matched.

/// Information about a received message.
///
/// Returned by [`Communicator::recv`](crate::Communicator::recv) and
/// [`Communicator::sendrecv`](crate::Communicator::sendrecv).
///
/// # Example
///
/// ```
/// use ferrocannon::Universe;
///
/// let results = Universe::run(2, |world| {
///     let peer = 1 - world.rank();
///     let mut recv = [0.0f64; 3];
///     let status = world.sendrecv(&[1.0, 2.0, 3.0], peer, 5, &mut recv, peer, 5)?;
///     Ok((status.source, status.tag, status.count))
/// })
/// .unwrap();
/// assert_eq!(*results[0].as_ref().unwrap(), (1, 5, 3));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Source rank of the message.
    pub source: i32,
    /// Tag of the message.
    pub tag: i32,
    /// Number of elements in the message.
    pub count: i64,
}
