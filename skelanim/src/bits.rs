use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// One bit per channel of a channel group (at most 128 channels).
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct ValidBits(u128);

impl ValidBits {
    pub const CAPACITY: usize = 128;
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self(u128::MAX);

    pub const fn from_bits(bits: u128) -> Self {
        Self(bits)
    }

    /// Bits `0..count` set.
    pub fn first(count: usize) -> Self {
        if count >= Self::CAPACITY {
            Self::ALL
        } else {
            Self((1u128 << count) - 1)
        }
    }

    pub const fn bits(self) -> u128 {
        self.0
    }

    pub fn is_bit_set(self, bit: usize) -> bool {
        bit < Self::CAPACITY && self.0 & (1u128 << bit) != 0
    }

    pub fn set_bit(&mut self, bit: usize) {
        if bit < Self::CAPACITY {
            self.0 |= 1u128 << bit;
        }
    }

    pub fn clear_bit(&mut self, bit: usize) {
        if bit < Self::CAPACITY {
            self.0 &= !(1u128 << bit);
        }
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }
}

impl BitOr for ValidBits {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for ValidBits {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitOrAssign for ValidBits {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ValidBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValidBits({:#034x})", self.0)
    }
}

/// One bit per segment (at most 32 segments).
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct SegmentMask(u32);

impl SegmentMask {
    pub const CAPACITY: usize = 32;
    pub const EMPTY: Self = Self(0);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn single(segment: usize) -> Self {
        let mut mask = Self::EMPTY;
        mask.insert(segment);
        mask
    }

    /// Segments `0..count`.
    pub fn first(count: usize) -> Self {
        if count >= Self::CAPACITY {
            Self(u32::MAX)
        } else {
            Self((1u32 << count) - 1)
        }
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, segment: usize) -> bool {
        segment < Self::CAPACITY && self.0 & (1u32 << segment) != 0
    }

    pub fn insert(&mut self, segment: usize) {
        if segment < Self::CAPACITY {
            self.0 |= 1u32 << segment;
        }
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_superset_of(self, other: Self) -> bool {
        other.0 & !self.0 == 0
    }

    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Set segments in ascending order.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        let bits = self.0;
        (0..Self::CAPACITY).filter(move |&i| bits & (1u32 << i) != 0)
    }
}

impl BitOr for SegmentMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for SegmentMask {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitOrAssign for SegmentMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for SegmentMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// The five independently tracked outputs of a segment.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OutputKind {
    JointParams,
    FloatChannels,
    Transforms,
    SkinningMats,
    OutputControls,
}

impl OutputKind {
    pub const ALL: [OutputKind; 5] = [
        OutputKind::JointParams,
        OutputKind::FloatChannels,
        OutputKind::Transforms,
        OutputKind::SkinningMats,
        OutputKind::OutputControls,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn mask(self) -> OutputMask {
        OutputMask(1 << self as u8)
    }
}

/// Set of requested output kinds. [`OutputMask::NONE`] asks the scheduler to run
/// segments regardless of what they already produced.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct OutputMask(u8);

impl OutputMask {
    pub const NONE: Self = Self(0);
    pub const JOINT_PARAMS: Self = OutputKind::JointParams.mask();
    pub const FLOAT_CHANNELS: Self = OutputKind::FloatChannels.mask();
    pub const TRANSFORMS: Self = OutputKind::Transforms.mask();
    pub const SKINNING_MATS: Self = OutputKind::SkinningMats.mask();
    pub const OUTPUT_CONTROLS: Self = OutputKind::OutputControls.mask();
    pub const ALL: Self = Self(0b1_1111);

    pub fn contains(self, kind: OutputKind) -> bool {
        self.0 & kind.mask().0 != 0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn kinds(self) -> impl Iterator<Item = OutputKind> {
        OutputKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl BitOr for OutputMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for OutputMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for OutputMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.kinds()).finish()
    }
}
