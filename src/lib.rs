//! ALICE-I2S: packed 1.58-bit ternary weights and decode-and-multiply matvec
//!
//! > "Never dequantize a matrix you only need to multiply once."
//!
//! Ternary weights {-1, 0, +1} are stored in the i2_s layout (2 bits per
//! weight, 128-element blocks, one global scale) and multiplied against
//! activation vectors straight from the packed bytes.
//!
//! # Features
//!
//! - **i2_s codec**: bit-exact block layout, addressing and serialization
//! - **Float kernels**: `matvec` / `matvec_t` (f32 activations)
//! - **Fused int8 kernels**: `matvec_i8` / `matvec_t_i8` with zero-point correction
//! - **Backends**: scalar reference, portable 8-wide lanes, AVX2 + FMA
//! - **DPS**: every kernel writes a caller-owned destination, zero allocation
//!
//! # Example
//!
//! ```rust
//! use alice_i2s::{matvec, matvec_t, Code, PackedTernary};
//!
//! // 128 x 1 matrix of +1 with scale 2.0
//! let w = PackedTernary::from_fn(128, 1, 2.0, |_, _| Code::Plus).unwrap();
//!
//! let mut y = vec![0.0f32; 128];
//! matvec(&mut y, w.packed(), 128, 1, &[3.0], w.scale()).unwrap();
//! assert!(y.iter().all(|&v| v == 6.0));
//!
//! let mut yt = [0.0f32; 1];
//! matvec_t(&mut yt, w.packed(), 128, 1, &[1.0; 128], w.scale()).unwrap();
//! assert_eq!(yt, [256.0]);
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           ALICE-I2S                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌────────────────────┐  │
//! │  │   quantize   │──▶│    codec     │──▶│ PackedMatrix<'a>   │  │
//! │  │ f32 → i2_s   │   │ i2_s blocks  │   │ (validated view)   │  │
//! │  │ f32 → int8   │   │ + LE scale   │   └─────────┬──────────┘  │
//! │  └──────────────┘   └──────────────┘             │             │
//! │                                                   ▼             │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │  ops::Kernels (backend resolved once, KernelConfig)      │   │
//! │  │  matvec │ matvec_t │ matvec_i8 │ matvec_t_i8 │ windows   │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                          │                                      │
//! │                          ▼                                      │
//! │  ┌──────────────┬──────────────────┬─────────────────────────┐ │
//! │  │   scalar     │  lanes [f32; 8]  │  avx2 (shift/mask+FMA)  │ │
//! │  └──────────────┴──────────────────┴─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod ops;
pub mod quantize;

// ============================================================================
// Core Re-exports
// ============================================================================

pub use backend::Backend;
pub use config::{BackendChoice, KernelConfig};
pub use error::{KernelError, Result};

// Codec
pub use codec::{
    locate,
    packed_len,
    serialized_len,
    store,
    PackedMatrix,  // Borrowed, validated
    PackedTernary, // Owned, for model loading
};

// DPS kernels (the hot path)
pub use ops::{matvec, matvec_i8, matvec_quantized, matvec_t, matvec_t_i8, FusedArgs, Kernels};

// Quantization
pub use quantize::{quantize_activations, quantize_weights, QuantStats, QuantizedActivations};

// ============================================================================
// i2_s Code
// ============================================================================

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One 2-bit i2_s code
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    /// -1
    Minus = 0b00,
    /// 0
    Zero = 0b01,
    /// +1
    Plus = 0b10,
    /// Never produced; decodes as 0 in the float kernels
    Reserved = 0b11,
}

impl Code {
    /// Convert from i8 (-1, 0, +1); anything else is zero
    #[inline(always)]
    pub const fn from_i8(v: i8) -> Self {
        match v {
            1 => Code::Plus,
            -1 => Code::Minus,
            _ => Code::Zero,
        }
    }

    /// Ternary value (`Reserved` → 0)
    #[inline(always)]
    pub const fn to_i8(self) -> i8 {
        match self {
            Code::Minus => -1,
            Code::Plus => 1,
            Code::Zero | Code::Reserved => 0,
        }
    }

    /// Convert from the low two bits
    #[inline(always)]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => Code::Minus,
            0b01 => Code::Zero,
            0b10 => Code::Plus,
            _ => Code::Reserved,
        }
    }

    /// Raw 2-bit value
    #[inline(always)]
    pub const fn bits(self) -> u8 {
        self as u8
    }

    /// Float weight before scaling
    #[inline(always)]
    pub fn weight(self) -> f32 {
        codec::CODE_WEIGHTS[self as usize]
    }
}

// ============================================================================
// Prelude
// ============================================================================

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::codec::{PackedMatrix, PackedTernary};
    pub use crate::ops::{matvec, matvec_i8, matvec_t, matvec_t_i8, Kernels};
    pub use crate::quantize::{quantize_activations, QuantizedActivations};
    pub use crate::{Backend, Code, KernelConfig, KernelError};
}

// ============================================================================
// Tests
// ============================================================================
