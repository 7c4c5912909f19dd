use std::fmt;
use std::str::FromStr;

use super::constants::{NUMBER_OF_CHANNELS, NUMBER_OF_CHIPS};
use super::error::AsuError;

/// The module flavour mounted on a slab. Decides which geometry table is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsuVersion {
    /// Standard front-end board, identified by its version number
    Fev(u8),
    /// Chip-on-board; uses the rotated mapping table
    Cob,
}

impl AsuVersion {
    pub fn is_cob(&self) -> bool {
        matches!(self, Self::Cob)
    }
}

impl FromStr for AsuVersion {
    type Err = AsuError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("cob") {
            Ok(Self::Cob)
        } else if let Ok(version) = trimmed.parse::<u8>() {
            Ok(Self::Fev(version))
        } else {
            Err(AsuError::InvalidVersion(s.to_string()))
        }
    }
}

impl fmt::Display for AsuVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fev(v) => write!(f, "{v}"),
            Self::Cob => write!(f, "COB"),
        }
    }
}

/// Full electronics address of a single readout channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelID {
    pub slab: u8,
    pub chip: u8,
    pub channel: u8,
}

impl ChannelID {
    pub fn new(slab: u8, chip: u8, channel: u8) -> Self {
        Self {
            slab,
            chip,
            channel,
        }
    }

    /// Dense unique id, usable both as a hash key and as a bit-set index
    pub fn uuid(&self) -> usize {
        generate_uuid(self.slab, self.chip, self.channel)
    }
}

impl fmt::Display for ChannelID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slab {} chip {} channel {}",
            self.slab, self.chip, self.channel
        )
    }
}

/// Generate a unique id number for a given channel location
pub fn generate_uuid(slab: u8, chip: u8, channel: u8) -> usize {
    (channel as usize)
        + (chip as usize) * (NUMBER_OF_CHANNELS as usize)
        + (slab as usize) * (NUMBER_OF_CHIPS as usize) * (NUMBER_OF_CHANNELS as usize)
}

/// Generate a unique id for a chip/channel pair, ignoring the slab
pub fn generate_chip_uuid(chip: u8, channel: u8) -> usize {
    generate_uuid(0, chip, channel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asu_version_parsing() {
        assert_eq!(AsuVersion::from_str("COB").unwrap(), AsuVersion::Cob);
        assert_eq!(AsuVersion::from_str(" cob ").unwrap(), AsuVersion::Cob);
        assert_eq!(AsuVersion::from_str("13").unwrap(), AsuVersion::Fev(13));
        assert!(AsuVersion::from_str("FEV13").is_err());
    }

    #[test]
    fn test_uuid_is_unique_per_channel() {
        let a = ChannelID::new(0, 15, 63).uuid();
        let b = ChannelID::new(1, 0, 0).uuid();
        assert_eq!(a + 1, b);
        assert_ne!(ChannelID::new(2, 3, 4).uuid(), ChannelID::new(2, 4, 3).uuid());
    }
}
