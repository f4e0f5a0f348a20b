//! Message datatype trait and typed payloads.
//!
//! This module provides the [`MpiDatatype`] trait, a sealed trait that maps Rust
//! primitive types to the typed [`Payload`] carried between ranks. A receiver
//! that asks for a different type than the sender used gets
//! [`Error::DatatypeMismatch`](crate::Error::DatatypeMismatch) instead of
//! reinterpreted bytes.
//!
//! # Supported Types
//!
//! `f32`, `f64`, `i32`, `i64`, `u8`, `u32` and `u64`. With the `mpi` feature
//! each of them is also an [`mpi::datatype::Equivalence`], so the same generic
//! calls go straight to the MPI library.

use crate::ReduceOp;

/// Seals the trait against external implementations.
mod sealed {
    #[cfg(not(feature = "mpi"))]
    pub trait Sealed {}

    #[cfg(feature = "mpi")]
    pub trait Sealed: mpi::datatype::Equivalence {}
}

/// Element type tag attached to every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatatypeTag {
    /// 32-bit floating point
    F32,
    /// 64-bit floating point
    F64,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 8-bit unsigned integer
    U8,
    /// 32-bit unsigned integer
    U32,
    /// 64-bit unsigned integer
    U64,
}

/// An owned, typed message body in flight between two ranks.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// `f32` elements
    F32(Vec<f32>),
    /// `f64` elements
    F64(Vec<f64>),
    /// `i32` elements
    I32(Vec<i32>),
    /// `i64` elements
    I64(Vec<i64>),
    /// `u8` elements
    U8(Vec<u8>),
    /// `u32` elements
    U32(Vec<u32>),
    /// `u64` elements
    U64(Vec<u64>),
}

impl Payload {
    /// Element type carried by this payload.
    pub fn tag(&self) -> DatatypeTag {
        match self {
            Payload::F32(_) => DatatypeTag::F32,
            Payload::F64(_) => DatatypeTag::F64,
            Payload::I32(_) => DatatypeTag::I32,
            Payload::I64(_) => DatatypeTag::I64,
            Payload::U8(_) => DatatypeTag::U8,
            Payload::U32(_) => DatatypeTag::U32,
            Payload::U64(_) => DatatypeTag::U64,
        }
    }

    /// Number of elements carried.
    pub fn len(&self) -> usize {
        match self {
            Payload::F32(v) => v.len(),
            Payload::F64(v) => v.len(),
            Payload::I32(v) => v.len(),
            Payload::I64(v) => v.len(),
            Payload::U8(v) => v.len(),
            Payload::U32(v) => v.len(),
            Payload::U64(v) => v.len(),
        }
    }

    /// True when the payload carries no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Trait for types that can be used in communication operations.
///
/// This is a **sealed trait**: it cannot be implemented outside this crate.
/// Supported types: [`f32`], [`f64`], [`i32`], [`i64`], [`u8`], [`u32`], [`u64`].
///
/// # Example
///
/// ```
/// use ferrocannon::Universe;
///
/// let results = Universe::run(2, |world| {
///     // Works with f64
///     let mut data_f64 = vec![world.rank() as f64; 4];
///     world.broadcast(&mut data_f64, 0)?;
///
///     // Works with i32
///     let mut data_i32 = vec![world.rank(); 4];
///     world.broadcast(&mut data_i32, 1)?;
///     Ok((data_f64[0], data_i32[0]))
/// })
/// .unwrap();
/// assert!(results.iter().all(|r| *r.as_ref().unwrap() == (0.0, 1)));
/// ```
pub trait MpiDatatype: sealed::Sealed + Copy + Send + PartialOrd + 'static {
    /// The datatype tag checked on every receive.
    const TAG: DatatypeTag;

    /// Copy a slice into an owned payload.
    fn pack(data: &[Self]) -> Payload;

    /// Take the elements back out, or hand the payload back on a type mismatch.
    fn unpack(payload: Payload) -> std::result::Result<Vec<Self>, Payload>;

    /// Combine two elements under a reduction operation.
    fn combine(op: ReduceOp, a: Self, b: Self) -> Self;
}

macro_rules! impl_mpi_datatype {
    ($ty:ty, $tag:expr, $variant:ident) => {
        impl sealed::Sealed for $ty {}
        impl MpiDatatype for $ty {
            const TAG: DatatypeTag = $tag;

            fn pack(data: &[Self]) -> Payload {
                Payload::$variant(data.to_vec())
            }

            fn unpack(payload: Payload) -> std::result::Result<Vec<Self>, Payload> {
                match payload {
                    Payload::$variant(v) => Ok(v),
                    other => Err(other),
                }
            }

            fn combine(op: ReduceOp, a: Self, b: Self) -> Self {
                match op {
                    ReduceOp::Sum => a + b,
                    ReduceOp::Prod => a * b,
                    ReduceOp::Max => {
                        if b > a {
                            b
                        } else {
                            a
                        }
                    }
                    ReduceOp::Min => {
                        if b < a {
                            b
                        } else {
                            a
                        }
                    }
                }
            }
        }
    };
}

impl_mpi_datatype!(f32, DatatypeTag::F32, F32);
impl_mpi_datatype!(f64, DatatypeTag::F64, F64);
impl_mpi_datatype!(i32, DatatypeTag::I32, I32);
impl_mpi_datatype!(i64, DatatypeTag::I64, I64);
impl_mpi_datatype!(u8, DatatypeTag::U8, U8);
impl_mpi_datatype!(u32, DatatypeTag::U32, U32);
impl_mpi_datatype!(u64, DatatypeTag::U64, U64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_tags_payload_with_element_type() {
        assert_eq!(f64::pack(&[1.0, 2.0]).tag(), DatatypeTag::F64);
        assert_eq!(i32::pack(&[7]).tag(), DatatypeTag::I32);
        assert_eq!(u8::pack(&[]).tag(), DatatypeTag::U8);
        assert!(u8::pack(&[]).is_empty());
        assert_eq!(u64::pack(&[1, 2, 3]).len(), 3);
    }

    #[test]
    fn unpack_rejects_foreign_payload() {
        let payload = f32::pack(&[1.5]);
        let back = f64::unpack(payload).unwrap_err();
        assert_eq!(back.tag(), DatatypeTag::F32);
        assert_eq!(f32::unpack(back).unwrap(), vec![1.5]);
    }

    #[test]
    fn combine_follows_reduce_op() {
        assert_eq!(f64::combine(ReduceOp::Sum, 2.0, 3.0), 5.0);
        assert_eq!(f64::combine(ReduceOp::Prod, 2.0, 3.0), 6.0);
        assert_eq!(i32::combine(ReduceOp::Max, -4, 9), 9);
        assert_eq!(u32::combine(ReduceOp::Min, 4, 9), 4);
    }
}
