//! Interpretation of the 32-bit words stored in scan and sort buffers.
//!
//! Buffers are type-erased: every element is a whole number of 32-bit words,
//! and the leading word of a record is its key. These helpers give the words
//! a numeric domain, both for accumulating sums and for mapping sort keys onto
//! an order-preserving unsigned key space.

/// Number of bits sorted per radix-sort pass.
pub const RADIX_BITS: u32 = 4;

/// Number of buckets per radix-sort pass.
pub const NWAY: usize = 1 << RADIX_BITS;

/// Numeric domain of a 32-bit word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum ValueType {
    #[default]
    Uint = 0,
    Int = 1,
    Float = 2,
}

impl ValueType {
    /// Specialization flag selecting this domain in the scan kernels.
    pub const fn flag(self) -> &'static str {
        match self {
            ValueType::Uint => "DATA_TYPE_UINT",
            ValueType::Int => "DATA_TYPE_INT",
            ValueType::Float => "DATA_TYPE_FLOAT",
        }
    }

    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(ValueType::Uint),
            1 => Some(ValueType::Int),
            2 => Some(ValueType::Float),
            _ => None,
        }
    }

    /// Adds two words in this domain. Integer domains wrap.
    #[inline]
    pub fn add(self, a: u32, b: u32) -> u32 {
        match self {
            ValueType::Uint => a.wrapping_add(b),
            ValueType::Int => (a as i32).wrapping_add(b as i32) as u32,
            ValueType::Float => (f32::from_bits(a) + f32::from_bits(b)).to_bits(),
        }
    }

    /// Maps a key onto the unsigned key space so that unsigned comparison
    /// orders keys by their value in this domain.
    #[inline]
    pub fn order_preserving(self, word: u32) -> u32 {
        match self {
            ValueType::Uint => word,
            ValueType::Int => word ^ 0x8000_0000,
            ValueType::Float => {
                // Negative floats flip every bit, positive ones only the sign.
                let mask = ((word as i32) >> 31) as u32 | 0x8000_0000;
                word ^ mask
            }
        }
    }
}

/// Direction of a sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum SortOrder {
    #[default]
    Ascending = 0,
    Descending = 1,
}

impl SortOrder {
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(SortOrder::Ascending),
            1 => Some(SortOrder::Descending),
            _ => None,
        }
    }
}

/// The unsigned radix key of a record key.
///
/// Descending order inverts the key instead of reversing the sort, which
/// keeps equal keys in their original relative order.
#[inline]
pub fn sort_key(key_type: ValueType, order: SortOrder, word: u32) -> u32 {
    let key = key_type.order_preserving(word);
    match order {
        SortOrder::Ascending => key,
        SortOrder::Descending => !key,
    }
}

/// The radix digit of `key` starting at `bit_shift`.
#[inline]
pub fn digit(key: u32, bit_shift: u32) -> usize {
    ((key >> bit_shift) & (NWAY as u32 - 1)) as usize
}

/// Position of the highest set bit plus one; zero for zero.
#[inline]
pub fn bit_length(value: u32) -> u32 {
    32 - value.leading_zeros()
}

/// Number of key bits a sort must cover.
///
/// Unsigned keys bounded by `max_value` only need the bits of the bound;
/// signed and float keys always span the full word.
pub fn key_bits(key_type: ValueType, max_value: u32) -> u32 {
    match key_type {
        ValueType::Uint => bit_length(max_value),
        ValueType::Int | ValueType::Float => 32,
    }
}
