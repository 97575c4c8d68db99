//! i2_s Codec: block layout, addressing, and the packed tensor container
//!
//! A `rows × cols` ternary matrix is flattened column-major (`idx = r + rows*c`)
//! and stored as 2-bit codes in 32-byte blocks of 128 elements:
//!
//! ```text
//! block  bi  = idx / 128          byte   = packed[bi*32 + gp]
//! offset off = idx % 128          bits   = [6-2g : 5-2g]  (MSB pair first)
//! group  g   = off / 32
//! pos    gp  = off % 32
//!
//! byte gp of a block:  [ g0 | g1 | g2 | g3 ]
//!                        │    │    │    └── element 96+gp
//!                        │    │    └─────── element 64+gp
//!                        │    └──────────── element 32+gp
//!                        └───────────────── element gp
//! ```
//!
//! Loading the 32 bytes of a block and applying four shift+mask passes yields
//! the four 32-element lane-groups `[0,32) [32,64) [64,96) [96,128)` in order.
//! The serialized form appends one little-endian `f32` global scale.

use core::ops::Range;

use crate::error::{KernelError, Result};
use crate::Code;

/// Logical elements per block
pub const BLOCK_ELEMS: usize = 128;

/// Bytes per block (4 codes per byte)
pub const BLOCK_BYTES: usize = 32;

/// Elements per lane-group (one group per bit-pair of a byte)
pub const GROUP_ELEMS: usize = 32;

/// Lane-groups per block
pub const GROUPS: usize = BLOCK_ELEMS / GROUP_ELEMS;

/// Size of the trailing global scale
pub const SCALE_BYTES: usize = 4;

/// Float weight for each 2-bit code. Reserved `11` decodes to zero.
pub const CODE_WEIGHTS: [f32; 4] = [-1.0, 0.0, 1.0, 0.0];

/// Byte → four raw codes, group order (`[g0, g1, g2, g3]`).
pub const BYTE_CODES: [[u8; 4]; 256] = build_byte_codes();

/// Byte → four float weights, group order.
pub const BYTE_WEIGHTS: [[f32; 4]; 256] = build_byte_weights();

const fn build_byte_codes() -> [[u8; 4]; 256] {
    let mut table = [[0u8; 4]; 256];
    let mut b = 0;
    while b < 256 {
        let byte = b as u8;
        table[b] = [byte >> 6, (byte >> 4) & 0b11, (byte >> 2) & 0b11, byte & 0b11];
        b += 1;
    }
    table
}

const fn build_byte_weights() -> [[f32; 4]; 256] {
    let codes = build_byte_codes();
    let mut table = [[0.0f32; 4]; 256];
    let mut b = 0;
    while b < 256 {
        let mut g = 0;
        while g < 4 {
            table[b][g] = CODE_WEIGHTS[codes[b][g] as usize];
            g += 1;
        }
        b += 1;
    }
    table
}

/// Bit shift of lane-group `group` inside a byte.
#[inline(always)]
pub const fn group_shift(group: usize) -> u32 {
    (6 - 2 * group) as u32
}

/// Byte position and bit shift holding flattened element `idx`.
#[inline(always)]
pub const fn code_position(idx: usize) -> (usize, u32) {
    let off = idx % BLOCK_ELEMS;
    let byte = (idx / BLOCK_ELEMS) * BLOCK_BYTES + off % GROUP_ELEMS;
    (byte, group_shift(off / GROUP_ELEMS))
}

/// Read the 2-bit code of flattened element `idx`.
///
/// # Panics
/// Panics if `idx` addresses a byte past the end of `packed`.
#[inline(always)]
pub fn locate(packed: &[u8], idx: usize) -> u8 {
    let (byte, shift) = code_position(idx);
    (packed[byte] >> shift) & 0b11
}

/// Write the 2-bit code of flattened element `idx`, leaving its neighbours intact.
///
/// # Panics
/// Panics if `idx` addresses a byte past the end of `packed`.
#[inline]
pub fn store(packed: &mut [u8], idx: usize, code: u8) {
    let (byte, shift) = code_position(idx);
    let mask = 0b11u8 << shift;
    packed[byte] = (packed[byte] & !mask) | ((code & 0b11) << shift);
}

/// Packed bytes needed for `count` logical elements (whole blocks).
#[inline]
pub const fn packed_len(count: usize) -> usize {
    count.div_ceil(BLOCK_ELEMS) * BLOCK_BYTES
}

/// Packed bytes plus trailing scale for `count` logical elements.
#[inline]
pub const fn serialized_len(count: usize) -> usize {
    packed_len(count) + SCALE_BYTES
}

fn element_count(rows: usize, cols: usize) -> Result<usize> {
    if rows == 0 || cols == 0 {
        return Err(KernelError::InvalidDimension { rows, cols });
    }
    rows.checked_mul(cols)
        .ok_or(KernelError::InvalidDimension { rows, cols })
}

// ============================================================================
// PackedMatrix: validated borrowed view
// ============================================================================

/// Borrowed view over packed i2_s bytes with validated dimensions.
///
/// Every kernel runs against this view; constructing one is the only
/// place dimension and length checks happen.
#[derive(Clone, Copy, Debug)]
pub struct PackedMatrix<'a> {
    packed: &'a [u8],
    rows: usize,
    cols: usize,
}

impl<'a> PackedMatrix<'a> {
    /// Validate dimensions against the packed buffer.
    ///
    /// `packed` may be longer than the layout needs (e.g. still carrying
    /// its trailing scale).
    pub fn new(packed: &'a [u8], rows: usize, cols: usize) -> Result<Self> {
        let expected = packed_len(element_count(rows, cols)?);
        if packed.len() < expected {
            return Err(KernelError::PackedTooShort { expected, actual: packed.len() });
        }
        Ok(Self { packed, rows, cols })
    }

    /// Number of rows
    #[inline]
    pub fn rows(&self) -> usize { self.rows }

    /// Number of columns
    #[inline]
    pub fn cols(&self) -> usize { self.cols }

    /// Underlying packed bytes
    #[inline]
    pub fn packed(&self) -> &'a [u8] { self.packed }

    /// Raw code at `(row, col)`.
    #[inline(always)]
    pub fn code_at(&self, row: usize, col: usize) -> u8 {
        locate(self.packed, row + self.rows * col)
    }

    /// True when every column starts on a block boundary.
    #[inline]
    pub fn is_block_aligned(&self) -> bool {
        self.rows % BLOCK_ELEMS == 0
    }

    /// Blocks per column. Only meaningful when block aligned.
    #[inline]
    pub fn blocks_per_col(&self) -> usize {
        self.rows / BLOCK_ELEMS
    }

    /// The 32 bytes of row-block `block` in column `col`.
    ///
    /// Requires a block-aligned matrix.
    #[inline(always)]
    pub fn block(&self, col: usize, block: usize) -> &'a [u8] {
        debug_assert!(self.is_block_aligned());
        let start = (col * self.blocks_per_col() + block) * BLOCK_BYTES;
        &self.packed[start..start + BLOCK_BYTES]
    }

    /// Row-block range covering rows `start..start + len`, if that window
    /// is made of whole blocks of an aligned matrix.
    #[inline]
    pub fn block_range(&self, start: usize, len: usize) -> Option<Range<usize>> {
        if self.is_block_aligned() && start % BLOCK_ELEMS == 0 && len % BLOCK_ELEMS == 0 {
            Some(start / BLOCK_ELEMS..(start + len) / BLOCK_ELEMS)
        } else {
            None
        }
    }
}

// ============================================================================
// PackedTernary: owned tensor (model loading, inspection)
// ============================================================================

/// Owned i2_s tensor: packed codes plus one global scale.
#[derive(Clone, Debug, PartialEq)]
pub struct PackedTernary {
    packed: Vec<u8>,
    rows: usize,
    cols: usize,
    scale: f32,
}

impl PackedTernary {
    /// Build from a closure producing the code at `(row, col)`.
    ///
    /// Padding in a trailing partial block is filled with [`Code::Zero`].
    pub fn from_fn<F>(rows: usize, cols: usize, scale: f32, mut f: F) -> Result<Self>
    where
        F: FnMut(usize, usize) -> Code,
    {
        let count = element_count(rows, cols)?;
        // 0x55 = four Code::Zero pairs
        let mut packed = vec![0x55u8; packed_len(count)];
        for c in 0..cols {
            for r in 0..rows {
                store(&mut packed, r + rows * c, f(r, c).bits());
            }
        }
        Ok(Self { packed, rows, cols, scale })
    }

    /// Build from column-major ternary values (-1, 0, +1).
    ///
    /// Any other value packs as zero.
    pub fn from_ternary(values: &[i8], rows: usize, cols: usize, scale: f32) -> Result<Self> {
        let count = element_count(rows, cols)?;
        if values.len() != count {
            return Err(KernelError::LengthMismatch {
                buffer: "values",
                expected: count,
                actual: values.len(),
            });
        }
        Self::from_fn(rows, cols, scale, |r, c| Code::from_i8(values[r + rows * c]))
    }

    /// Wrap already-packed bytes.
    pub fn from_packed(mut packed: Vec<u8>, rows: usize, cols: usize, scale: f32) -> Result<Self> {
        let expected = packed_len(element_count(rows, cols)?);
        if packed.len() < expected {
            return Err(KernelError::PackedTooShort { expected, actual: packed.len() });
        }
        packed.truncate(expected);
        Ok(Self { packed, rows, cols, scale })
    }

    /// Parse the on-disk form: packed blocks followed by a little-endian f32 scale.
    pub fn from_bytes(bytes: &[u8], rows: usize, cols: usize) -> Result<Self> {
        let count = element_count(rows, cols)?;
        let data_len = packed_len(count);
        let expected = data_len + SCALE_BYTES;
        if bytes.len() < expected {
            return Err(KernelError::Truncated { expected, actual: bytes.len() });
        }
        let mut raw = [0u8; SCALE_BYTES];
        raw.copy_from_slice(&bytes[data_len..expected]);
        Ok(Self {
            packed: bytes[..data_len].to_vec(),
            rows,
            cols,
            scale: f32::from_le_bytes(raw),
        })
    }

    /// Serialize to the on-disk form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.packed.len() + SCALE_BYTES);
        out.extend_from_slice(&self.packed);
        out.extend_from_slice(&self.scale.to_le_bytes());
        out
    }

    /// Code at `(row, col)`.
    ///
    /// # Panics
    /// Panics if the position is out of range.
    #[inline]
    pub fn code(&self, row: usize, col: usize) -> Code {
        assert!(row < self.rows && col < self.cols, "position ({row}, {col}) out of range");
        Code::from_bits(locate(&self.packed, row + self.rows * col))
    }

    /// Real-valued weight at `(row, col)` (`code value × scale`).
    #[inline]
    pub fn weight(&self, row: usize, col: usize) -> f32 {
        self.code(row, col).weight() * self.scale
    }

    /// Validated view for the kernels.
    #[inline]
    pub fn as_matrix(&self) -> PackedMatrix<'_> {
        PackedMatrix { packed: &self.packed, rows: self.rows, cols: self.cols }
    }

    /// Number of rows
    #[inline]
    pub fn rows(&self) -> usize { self.rows }

    /// Number of columns
    #[inline]
    pub fn cols(&self) -> usize { self.cols }

    /// Global scale
    #[inline]
    pub fn scale(&self) -> f32 { self.scale }

    /// Raw packed bytes (without the scale)
    #[inline]
    pub fn packed(&self) -> &[u8] { &self.packed }

    /// Memory footprint of the packed codes in bytes
    #[inline]
    pub fn memory_bytes(&self) -> usize { self.packed.len() }

    /// Compression ratio vs FP32
    pub fn compression_ratio(&self) -> f32 {
        (self.rows * self.cols * 4) as f32 / self.packed.len() as f32
    }

    /// Occurrences of each raw code `0..=3` over the logical elements.
    pub fn code_histogram(&self) -> [usize; 4] {
        let mut counts = [0usize; 4];
        for idx in 0..self.rows * self.cols {
            counts[locate(&self.packed, idx) as usize] += 1;
        }
        counts
    }

    /// Number of reserved `11` codes. Must be zero for the fused kernels
    /// to be exact.
    pub fn reserved_count(&self) -> usize {
        self.code_histogram()[Code::Reserved as usize]
    }

    /// Column-major f32 copy with the scale applied.
    ///
    /// For inspection and reference checks; the kernels never call this.
    pub fn dequantize(&self) -> Vec<f32> {
        (0..self.rows * self.cols)
            .map(|idx| CODE_WEIGHTS[locate(&self.packed, idx) as usize] * self.scale)
            .collect()
    }
}
