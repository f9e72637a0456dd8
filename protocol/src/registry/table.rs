//! Compiled default parameter table.
//!
//! Indices match a common firmware build. They are replaced by discovery
//! results at startup and must not be trusted on their own.

use crate::codec::{ScalePrefix, ValueFormat};

/// Entry of the compiled table.
#[derive(Copy, Clone, Debug)]
pub(crate) struct TableEntry {
    pub idx: u16,
    pub ext_id: &'static str,
    pub min: i32,
    pub max: i32,
    pub format: ValueFormat,
    pub read_only: bool,
    pub name: &'static str,
}

const fn entry(
    idx: u16,
    ext_id: &'static str,
    min: i32,
    max: i32,
    format: ValueFormat,
    read_only: bool,
    name: &'static str,
) -> TableEntry {
    TableEntry {
        idx,
        ext_id,
        min,
        max,
        format,
        read_only,
        name,
    }
}

const INT: ValueFormat = ValueFormat::Int;
const TEMP: ValueFormat = ValueFormat::Temp;
const TEMP_BYTE: ValueFormat = ValueFormat::TempByte;
const TEMP_UINT: ValueFormat = ValueFormat::TempUint;
const DP1: ValueFormat = ValueFormat::Scaled {
    prefix: ScalePrefix::Dp,
    places: 1,
};
const RP1: ValueFormat = ValueFormat::Scaled {
    prefix: ScalePrefix::Rp,
    places: 1,
};

pub(crate) const DEFAULT_TABLE: &[TableEntry] = &[
    entry(1, "E555E4E11002E9", 0, 5, INT, false, "ACCESS_LEVEL"),
    entry(22, "C02D7CE3A909E9", 0, 1, INT, false, "ADDITIONAL_BLOCKED"),
    entry(46, "A1A9A3A2D20E6F", 0, 20, INT, false, "ADDITIONAL_DHW_ACKNOWLEDGED"),
    entry(59, "F0B27A85EB0F07", 0, 1, INT, true, "ALARM_STATUS"),
    entry(97, "0405D2D4200F1B", 0, 1, INT, false, "BLOCKING_SIGNAL_ACTIVE"),
    entry(163, "1C2E6F9E3A0C32", 0, 1, INT, true, "COMPRESSOR_ALARM"),
    entry(195, "C6E4E2D33E0D8F", 0, 1, INT, true, "COMPRESSOR_BLOCKED"),
    entry(219, "8B32E50F930A11", 0, 1200, DP1, true, "COMPRESSOR_REAL_FREQUENCY"),
    entry(256, "E3F07A41D20C2A", 0, 2, INT, false, "COMPRESSOR_STATE"),
    entry(385, "6B41C8F5CF0A02", 0, 1, INT, false, "DHW_BOOST_ACTIVE"),
    entry(398, "2DA2B9C8360A33", 0, 2, INT, false, "DHW_CALCULATED_SETPOINT_MODE"),
    entry(409, "E9C6E3BD760DCA", 60, 130, TEMP_BYTE, false, "DHW_TEMP_ECO"),
    entry(410, "A7D6E26E040BDA", 60, 130, TEMP_BYTE, false, "DHW_TEMP_COMFORT"),
    entry(422, "A89A9B93C80C8B", 0, 1, INT, false, "DHW_TIMEPROGRAM"),
    entry(780, "60F4AF35950BEB", -400, 1000, TEMP, true, "GT1_TEMP"),
    entry(781, "5A7FA43E1F0CB6", -500, 500, TEMP, true, "GT2_TEMP"),
    entry(782, "D43F7C0EC20C70", -400, 1000, TEMP, true, "GT3_TEMP"),
    entry(784, "E20BD6C3AA0B41", -400, 1000, TEMP, true, "GT5_TEMP"),
    entry(785, "C7A2FDAFB80A84", -400, 1400, TEMP, true, "GT6_TEMP"),
    entry(787, "F0E5A3A2E20BE8", -400, 1000, TEMP, true, "GT8_TEMP"),
    entry(788, "9D2D2D7A6E0A6D", -400, 1000, TEMP, true, "GT9_TEMP"),
    entry(789, "5C57E4E86D0C1C", -400, 1000, TEMP, true, "GT10_TEMP"),
    entry(790, "F9D2C4C7F30C5D", -400, 1000, TEMP, true, "GT11_TEMP"),
    entry(880, "DEB9C7D3DF0A8E", 0, 2, INT, false, "HEATING_SEASON_MODE"),
    entry(896, "4C4D8CF0A10C42", 10, 35, TEMP_UINT, false, "HEATING_SEASON_LIMIT"),
    entry(932, "A1F63E50F70A31", 0, 100, RP1, false, "HEAT_CURVE_SLOPE"),
    entry(1001, "7A7B3E29B70DE2", 0, 3, INT, false, "HEAT_CARRIER_PUMP_MODE"),
    entry(1103, "6A6B06F0EC0D52", 0, 100, INT, true, "HEAT_CARRIER_PUMP_SPEED"),
    entry(1536, "00D7E0E0990D3F", -100, 100, TEMP, false, "ROOM_INFLUENCE_OFFSET"),
    entry(1700, "AE2D4B5EC10B95", 0, 65535, INT, true, "OPERATING_HOURS_COMPRESSOR"),
    entry(1701, "AA3D7E7E020BA5", 0, 65535, INT, true, "OPERATING_HOURS_ADDITIONAL"),
    entry(2475, "1ECC2F7F940D8A", 0, 48, INT, false, "XDHW_TIME"),
    entry(2477, "B3F43D0E6D0E22", 50, 65, TEMP_UINT, false, "XDHW_STOP_TEMP"),
    entry(2480, "4BB3F8DB750DAE", 0, 1, INT, true, "XDHW_ACTIVE"),
    entry(2501, "0CA07B1DB20A0E", 0, 2, INT, false, "ZONE1_MODE"),
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn unique() {
        let names: HashSet<_> = DEFAULT_TABLE.iter().map(|e| e.name).collect();
        let indices: HashSet<_> = DEFAULT_TABLE.iter().map(|e| e.idx).collect();

        assert_eq!(names.len(), DEFAULT_TABLE.len(), "names should be unique");
        assert_eq!(indices.len(), DEFAULT_TABLE.len(), "indices should be unique");
    }

    #[test]
    fn well_formed() {
        for entry in DEFAULT_TABLE {
            assert!(entry.min <= entry.max, "{} bounds should be ordered", entry.name);
            assert_eq!(entry.ext_id.len(), 14, "{} external ID should be 7 bytes", entry.name);
            assert!(
                entry.ext_id.chars().all(|c| c.is_ascii_hexdigit()),
                "{} external ID should be hex",
                entry.name
            );
            assert!(entry.idx <= 0x0fff, "{} index should fit 12 bits", entry.name);
        }
    }
}
