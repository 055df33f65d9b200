//! Classification flags of a track state.

use serde::{Deserialize, Serialize};

/// A single classification bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TrackStateFlag {
    /// The state carries a measurement that entered the fit
    Measurement = 0,
    /// The state carries parameters
    Parameter = 1,
    /// The measurement was rejected by the fit
    Outlier = 2,
    /// A sensitive surface was crossed without a measurement
    Hole = 3,
    /// Material was encountered
    Material = 4,
    /// The measurement is shared with another track
    SharedHit = 5,
}

impl TrackStateFlag {
    pub const ALL: [TrackStateFlag; 6] = [
        Self::Measurement,
        Self::Parameter,
        Self::Outlier,
        Self::Hole,
        Self::Material,
        Self::SharedHit,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Set of [`TrackStateFlag`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackStateType(u8);

impl TrackStateType {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0b11_1111)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn test(&self, flag: TrackStateFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    pub fn set(&mut self, flag: TrackStateFlag) -> &mut Self {
        self.0 |= flag.bit();
        self
    }

    pub fn reset(&mut self, flag: TrackStateFlag) -> &mut Self {
        self.0 &= !flag.bit();
        self
    }

    pub fn with(mut self, flag: TrackStateFlag) -> Self {
        self.set(flag);
        self
    }

    pub fn is_measurement(&self) -> bool {
        self.test(TrackStateFlag::Measurement)
    }

    pub fn is_outlier(&self) -> bool {
        self.test(TrackStateFlag::Outlier)
    }

    pub fn is_hole(&self) -> bool {
        self.test(TrackStateFlag::Hole)
    }

    pub fn is_shared_hit(&self) -> bool {
        self.test(TrackStateFlag::SharedHit)
    }
}

impl std::fmt::Display for TrackStateType {
    /// Prints the flags most significant first, e.g. `SMHOPM=001001`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SMHOPM=")?;
        for flag in TrackStateFlag::ALL.iter().rev() {
            write!(f, "{}", u8::from(self.test(*flag)))?;
        }
        Ok(())
    }
}
