//! Run configuration for the distributed multiplication.

use crate::block::Operand;

/// Parameters shared by every rank of a run.
///
/// All ranks must use the same configuration; only the coordinator's view is
/// validated, and its verdict is broadcast to the others.
#[derive(Debug, Clone, PartialEq)]
pub struct CannonConfig {
    /// Global matrix edge N; must be divisible by the grid side.
    pub matrix_size: usize,
    /// Generator for the left operand A.
    pub a: Operand,
    /// Generator for the right operand B.
    pub b: Operand,
    /// Skew the tiles before round 0 (standard Cannon alignment).
    pub align: bool,
    /// Rank that validates the configuration and assembles the result.
    pub coordinator: i32,
}

impl Default for CannonConfig {
    /// 16×16 matrices of ones on rank 0, aligned.
    fn default() -> Self {
        CannonConfig {
            matrix_size: 16,
            a: Operand::Uniform(1.0),
            b: Operand::Uniform(1.0),
            align: true,
            coordinator: 0,
        }
    }
}

impl CannonConfig {
    /// Default configuration for an `n`×`n` problem.
    pub fn with_size(n: usize) -> Self {
        CannonConfig {
            matrix_size: n,
            ..Self::default()
        }
    }

    /// Replace both operand generators.
    pub fn operands(mut self, a: Operand, b: Operand) -> Self {
        self.a = a;
        self.b = b;
        self
    }

    /// Enable or disable the pre-loop skew.
    pub fn aligned(mut self, align: bool) -> Self {
        self.align = align;
        self
    }
}
