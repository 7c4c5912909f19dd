// Geometry of a slab. The SKIROC electronics address a channel as [chip, channel]; the
// physics wants to know where that channel sits on the wafer. Every slab of a given ASU
// flavour shares the same table, so a table is keyed by chip/channel only:
// [chip, channel] -> (x, y)
// COB boards are mounted rotated with respect to the FEV boards and have their own table.
use fxhash::FxHashMap;
use std::path::Path;

use super::calibration::{parse_field, read_table};
use super::constants::{NUMBER_OF_CHANNELS, NUMBER_OF_CHIPS};
use super::error::CalibrationLoadError;
use super::hardware_id::generate_chip_uuid;

const ENTRIES_PER_LINE: usize = 4; // chip, channel, x, y

/// ChannelMap contains the mapping of SKIROC chip/channel to the (x, y) position of the pad in mm.
#[derive(Debug, Clone, Default)]
pub struct ChannelMap {
    map: FxHashMap<usize, (f32, f32)>,
}

impl ChannelMap {
    /// Read a mapping table. Each data row holds `chip channel x y`.
    pub fn new(path: &Path) -> Result<Self, CalibrationLoadError> {
        let mut cm = ChannelMap::default();
        for (line, entries) in read_table(path, ENTRIES_PER_LINE)? {
            let chip: u8 = parse_field(path, line, &entries[0])?;
            let channel: u8 = parse_field(path, line, &entries[1])?;
            if chip >= NUMBER_OF_CHIPS || channel >= NUMBER_OF_CHANNELS {
                return Err(CalibrationLoadError::BadFileFormat {
                    path: path.to_path_buf(),
                    line,
                    reason: format!("chip {chip} / channel {channel} out of range"),
                });
            }
            let x: f32 = parse_field(path, line, &entries[2])?;
            let y: f32 = parse_field(path, line, &entries[3])?;
            cm.map.insert(generate_chip_uuid(chip, channel), (x, y));
        }
        Ok(cm)
    }

    /// Get the pad position of a chip/channel.
    ///
    /// If returns None the chip/channel does not exist in the map
    pub fn get_position(&self, chip: u8, channel: u8) -> Option<(f32, f32)> {
        self.map.get(&generate_chip_uuid(chip, channel)).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.txt");
        std::fs::write(
            &path,
            "# chip channel x y\n0 0 -88.0 -88.0\n\n15 63 88.0 88.0 # corner\n",
        )
        .unwrap();
        let map = ChannelMap::new(&path).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get_position(15, 63), Some((88.0, 88.0)));
        assert_eq!(map.get_position(1, 1), None);
    }

    #[test]
    fn test_out_of_range_chip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.txt");
        std::fs::write(&path, "16 0 1.0 1.0\n").unwrap();
        assert!(matches!(
            ChannelMap::new(&path),
            Err(CalibrationLoadError::BadFileFormat { line: 1, .. })
        ));
    }
}
