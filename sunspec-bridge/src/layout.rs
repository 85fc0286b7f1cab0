//! SunSpec register contract as the Fronius meter client actually reads it.
//!
//! Register numbers are 1-based SunSpec numbers (40001 holds `SunS`). A Modbus
//! request for PDU address `n` reads register number `n + 1`.
//!
//! [`MODEL_213`] lists the documented Model 213 points. [`OVERRIDES`] moves the
//! points the consumer reads from other registers, and [`PRIORITY`] settles
//! registers claimed by more than one point. [`ResolvedLayout`] combines the
//! three into the placement the encoder uses.

use std::fmt;

use crate::codec::{Address, Quantity};
use crate::snapshot::Phase::{self, A, B, C};

/// First register of the SunSpec map (`SunS` marker).
pub const SUNSPEC_BASE: Address = 40001;
/// Model 1 (common block) header.
pub const COMMON_MODEL_ADDR: Address = 40003;
pub const COMMON_MODEL_ID: u16 = 1;
pub const COMMON_MODEL_LENGTH: u16 = 65;
/// Model 213 (three-phase wye meter, float) header.
pub const METER_MODEL_ADDR: Address = 40070;
pub const METER_MODEL_ID: u16 = 213;
pub const METER_MODEL_LENGTH: u16 = 124;
/// First data register of Model 213.
pub const METER_DATA_ADDR: Address = METER_MODEL_ADDR + 2;
/// End-of-map marker (`0xFFFF`, length `0`).
pub const END_MARKER_ADDR: Address = METER_DATA_ADDR + METER_MODEL_LENGTH;
/// Number of registers served, from [`SUNSPEC_BASE`] through the end marker.
pub const REGISTER_COUNT: Quantity = END_MARKER_ADDR + 2 - SUNSPEC_BASE;

/// Offset between a Modbus PDU address and the SunSpec register number.
pub const PDU_ADDRESS_OFFSET: Address = 1;

/// Register encoding of a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    U32,
    F32,
}

impl Encoding {
    pub fn word_size(self) -> Quantity {
        match self {
            Encoding::U32 | Encoding::F32 => 2,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::U32 => f.write_str("uint32"),
            Encoding::F32 => f.write_str("float32"),
        }
    }
}

/// Model 213 points filled by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Current,
    PhaseCurrent(Phase),
    VoltageLn,
    PhaseVoltage(Phase),
    VoltageLl,
    VoltageAb,
    VoltageBc,
    VoltageCa,
    Frequency,
    Power,
    PhasePower(Phase),
    ApparentPower,
    PhaseApparentPower(Phase),
    ReactivePower,
    PhaseReactivePower(Phase),
    PowerFactor,
    PhasePowerFactor(Phase),
    ExportedEnergy,
    ImportedEnergy,
    ExportedApparentEnergy,
    ImportedApparentEnergy,
    Events,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(entry(*self).name)
    }
}

/// One documented point of the register contract.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldEntry {
    pub field: Field,
    /// SunSpec point name.
    pub name: &'static str,
    /// Documented start register.
    pub addr: Address,
    /// Encoding published in the SunSpec documentation.
    pub documented: Encoding,
    /// Encoding the consumer decodes.
    pub encoding: Encoding,
    /// Scale factor; multiply the stored value by it to get the actual value.
    pub x: f64,
    pub unit: &'static str,
}

const fn point(
    field: Field,
    name: &'static str,
    addr: Address,
    documented: Encoding,
    encoding: Encoding,
    unit: &'static str,
) -> FieldEntry {
    FieldEntry {
        field,
        name,
        addr,
        documented,
        encoding,
        x: 1.0,
        unit,
    }
}

const fn float(field: Field, name: &'static str, addr: Address, unit: &'static str) -> FieldEntry {
    point(field, name, addr, Encoding::F32, Encoding::F32, unit)
}

/// Energy totals are documented as `uint32` but decoded as `float32`.
const fn energy(field: Field, name: &'static str, addr: Address, unit: &'static str) -> FieldEntry {
    point(field, name, addr, Encoding::U32, Encoding::F32, unit)
}

/// Documented Model 213 points written by the bridge.
pub static MODEL_213: &[FieldEntry] = &[
    float(Field::Current, "A", 40072, "A"),
    float(Field::PhaseCurrent(A), "AphA", 40074, "A"),
    float(Field::PhaseCurrent(B), "AphB", 40076, "A"),
    float(Field::PhaseCurrent(C), "AphC", 40078, "A"),
    float(Field::VoltageLn, "PhV", 40080, "V"),
    float(Field::PhaseVoltage(A), "PhVphA", 40082, "V"),
    float(Field::PhaseVoltage(B), "PhVphB", 40084, "V"),
    float(Field::PhaseVoltage(C), "PhVphC", 40086, "V"),
    float(Field::VoltageLl, "PPV", 40088, "V"),
    float(Field::VoltageAb, "PPVphAB", 40090, "V"),
    float(Field::VoltageBc, "PPVphBC", 40092, "V"),
    float(Field::VoltageCa, "PPVphCA", 40094, "V"),
    float(Field::Frequency, "Hz", 40096, "Hz"),
    float(Field::Power, "W", 40098, "W"),
    float(Field::PhasePower(A), "WphA", 40100, "W"),
    float(Field::PhasePower(B), "WphB", 40102, "W"),
    float(Field::PhasePower(C), "WphC", 40104, "W"),
    float(Field::ApparentPower, "VA", 40106, "VA"),
    float(Field::PhaseApparentPower(A), "VAphA", 40108, "VA"),
    float(Field::PhaseApparentPower(B), "VAphB", 40110, "VA"),
    float(Field::PhaseApparentPower(C), "VAphC", 40112, "VA"),
    float(Field::ReactivePower, "VAR", 40114, "var"),
    float(Field::PhaseReactivePower(A), "VARphA", 40116, "var"),
    float(Field::PhaseReactivePower(B), "VARphB", 40118, "var"),
    float(Field::PhaseReactivePower(C), "VARphC", 40120, "var"),
    float(Field::PowerFactor, "PF", 40122, ""),
    float(Field::PhasePowerFactor(A), "PFphA", 40124, ""),
    float(Field::PhasePowerFactor(B), "PFphB", 40126, ""),
    float(Field::PhasePowerFactor(C), "PFphC", 40128, ""),
    energy(Field::ExportedEnergy, "TotWhExp", 40130, "Wh"),
    energy(Field::ImportedEnergy, "TotWhImp", 40138, "Wh"),
    energy(Field::ExportedApparentEnergy, "TotVAhExp", 40146, "VAh"),
    energy(Field::ImportedApparentEnergy, "TotVAhImp", 40154, "VAh"),
    point(Field::Events, "Evt", 40194, Encoding::U32, Encoding::U32, ""),
];

/// Registers the consumer actually reads for the scrambled points.
///
/// The power block is read four registers early, on top of the documented
/// line-to-line voltages, which in turn are read from the documented phase
/// power registers. `WphC` lands on `Hz`.
pub static OVERRIDES: &[(Field, Address)] = &[
    (Field::Power, 40090),
    (Field::PhasePower(A), 40092),
    (Field::PhasePower(B), 40094),
    (Field::PhasePower(C), 40096),
    (Field::VoltageAb, 40100),
    (Field::VoltageBc, 40102),
    (Field::VoltageCa, 40104),
];

/// Points that win a register claimed by more than one point.
pub static PRIORITY: &[Field] = &[Field::Frequency];

/// Documented entry of a field.
pub fn entry(field: Field) -> &'static FieldEntry {
    MODEL_213
        .iter()
        .find(|e| e.field == field)
        .unwrap_or_else(|| unreachable!("{field:?} missing from MODEL_213"))
}

/// Register the consumer reads `field` from.
pub fn actual_address(field: Field) -> Address {
    OVERRIDES
        .iter()
        .find(|(f, _)| *f == field)
        .map(|(_, addr)| *addr)
        .unwrap_or_else(|| entry(field).addr)
}

/// Where a field ends up in the served register image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub field: Field,
    pub addr: Address,
    pub encoding: Encoding,
    pub x: f64,
    pub unit: &'static str,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {} {}", self.field, self.addr, self.encoding)?;
        if self.x != 1.0 {
            write!(f, " x{}", self.x)?;
        }
        if !self.unit.is_empty() {
            write!(f, " [{}]", self.unit)?;
        }
        Ok(())
    }
}

impl Placement {
    fn end(&self) -> Address {
        self.addr + self.encoding.word_size()
    }

    fn overlaps(&self, other: &Placement) -> bool {
        self.addr < other.end() && other.addr < self.end()
    }
}

/// A field that is derived but not exposed because a higher priority field
/// occupies its register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shadowed {
    pub field: Field,
    pub addr: Address,
    pub by: Field,
}

impl fmt::Display for Shadowed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is not exposed: register {} carries {}",
            self.field, self.addr, self.by
        )
    }
}

/// Final register placement with every conflict settled.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLayout {
    placements: Vec<Placement>,
    shadowed: Vec<Shadowed>,
}

impl ResolvedLayout {
    pub fn resolve() -> Self {
        let mut candidates = MODEL_213
            .iter()
            .map(|e| Placement {
                field: e.field,
                addr: actual_address(e.field),
                encoding: e.encoding,
                x: e.x,
                unit: e.unit,
            })
            .collect::<Vec<_>>();
        // Stable: priority fields first, then table order.
        candidates.sort_by_key(|p| !PRIORITY.contains(&p.field));

        let mut placements: Vec<Placement> = Vec::with_capacity(candidates.len());
        let mut shadowed = vec![];
        for candidate in candidates {
            let winner = placements
                .iter()
                .find(|p| p.overlaps(&candidate))
                .map(|p| p.field);
            match winner {
                Some(by) => shadowed.push(Shadowed {
                    field: candidate.field,
                    addr: candidate.addr,
                    by,
                }),
                None => placements.push(candidate),
            }
        }
        placements.sort_by_key(|p| p.addr);

        Self {
            placements,
            shadowed,
        }
    }

    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    pub fn placement(&self, field: Field) -> Option<&Placement> {
        self.placements.iter().find(|p| p.field == field)
    }

    /// Fields that are computed but not readable by the consumer.
    pub fn shadowed(&self) -> &[Shadowed] {
        &self.shadowed
    }
}

impl Default for ResolvedLayout {
    fn default() -> Self {
        Self::resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_constants() {
        assert_eq!(METER_DATA_ADDR, 40072);
        assert_eq!(END_MARKER_ADDR, 40196);
        assert_eq!(REGISTER_COUNT, 197);
        assert_eq!(COMMON_MODEL_ADDR + 2 + COMMON_MODEL_LENGTH, METER_MODEL_ADDR);
    }

    #[test]
    fn test_documented_table_is_consistent() {
        for pair in MODEL_213.windows(2) {
            assert!(
                pair[0].addr + pair[0].documented.word_size() <= pair[1].addr,
                "{} overlaps {}",
                pair[0].name,
                pair[1].name
            );
        }
        for e in MODEL_213 {
            assert!(e.addr >= METER_DATA_ADDR);
            assert!(e.addr + e.encoding.word_size() <= END_MARKER_ADDR);
        }
    }

    #[test]
    fn test_energy_points_are_read_as_float() {
        for field in [
            Field::ExportedEnergy,
            Field::ImportedEnergy,
            Field::ExportedApparentEnergy,
            Field::ImportedApparentEnergy,
        ] {
            let e = entry(field);
            assert_eq!(e.documented, Encoding::U32);
            assert_eq!(e.encoding, Encoding::F32);
        }
    }

    #[test]
    fn test_overrides_win_over_documented_addresses() {
        let layout = ResolvedLayout::resolve();
        for (field, addr) in OVERRIDES {
            assert_ne!(entry(*field).addr, *addr);
            if let Some(placement) = layout.placement(*field) {
                assert_eq!(placement.addr, *addr, "{field}");
            }
        }
        assert_eq!(layout.placement(Field::Power).unwrap().addr, 40090);
        assert_eq!(layout.placement(Field::VoltageAb).unwrap().addr, 40100);
    }

    #[test]
    fn test_frequency_shadows_phase_c_power() {
        let layout = ResolvedLayout::resolve();
        assert_eq!(layout.placement(Field::Frequency).unwrap().addr, 40096);
        assert!(layout.placement(Field::PhasePower(C)).is_none());
        assert_eq!(
            layout.shadowed(),
            &[Shadowed {
                field: Field::PhasePower(C),
                addr: 40096,
                by: Field::Frequency,
            }]
        );
        assert_eq!(
            layout.shadowed()[0].to_string(),
            "WphC is not exposed: register 40096 carries Hz"
        );
    }

    #[test]
    fn test_placements_do_not_overlap() {
        let layout = ResolvedLayout::resolve();
        assert_eq!(layout.placements().len(), MODEL_213.len() - 1);
        for pair in layout.placements().windows(2) {
            assert!(!pair[0].overlaps(&pair[1]));
        }
    }

    #[test]
    fn test_placement_describes_register() {
        let layout = ResolvedLayout::resolve();
        assert_eq!(
            layout.placement(Field::Power).unwrap().to_string(),
            "W @ 40090 float32 [W]"
        );
        assert_eq!(
            layout.placement(Field::ImportedEnergy).unwrap().to_string(),
            "TotWhImp @ 40138 float32 [Wh]"
        );
        assert_eq!(
            layout.placement(Field::PowerFactor).unwrap().to_string(),
            "PF @ 40122 float32"
        );
    }
}
