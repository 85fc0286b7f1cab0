use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{string_to_words, Encode, Word};
use crate::layout::{
    Encoding, Field, ResolvedLayout, COMMON_MODEL_ADDR, COMMON_MODEL_ID, COMMON_MODEL_LENGTH,
    END_MARKER_ADDR, METER_MODEL_ADDR, METER_MODEL_ID, METER_MODEL_LENGTH, SUNSPEC_BASE,
};
use crate::model::ElectricalModel;
use crate::registers::RegisterImage;

/// Identification strings published in the SunSpec common block (Model 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceIdentity {
    pub manufacturer: String,
    pub model: String,
    pub options: String,
    pub version: String,
    pub serial: String,
    pub device_address: u16,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            manufacturer: "linux-script".to_string(),
            model: "Shelly-bridge".to_string(),
            options: String::new(),
            version: "20260210-1200".to_string(),
            serial: "8813BFFEA84C".to_string(),
            device_address: 0xFFFF,
        }
    }
}

/// Turns an [`ElectricalModel`] into the register image the inverter reads.
#[derive(Debug, Clone)]
pub struct RegisterEncoder {
    layout: ResolvedLayout,
    template: RegisterImage,
}

impl RegisterEncoder {
    pub fn new(identity: &DeviceIdentity) -> Self {
        let mut template = RegisterImage::new();

        template.insert(SUNSPEC_BASE, &string_to_words("SunS", 2));
        template.insert(COMMON_MODEL_ADDR, &[COMMON_MODEL_ID, COMMON_MODEL_LENGTH]);
        let mut addr = COMMON_MODEL_ADDR + 2;
        for (text, cnt) in [
            (&identity.manufacturer, 16),
            (&identity.model, 16),
            (&identity.options, 8),
            (&identity.version, 8),
            (&identity.serial, 16),
        ] {
            template.insert(addr, &string_to_words(text, cnt));
            addr += cnt;
        }
        template.insert(addr, &[identity.device_address]);

        template.insert(METER_MODEL_ADDR, &[METER_MODEL_ID, METER_MODEL_LENGTH]);
        template.insert(END_MARKER_ADDR, &[0xFFFF, 0]);

        Self {
            layout: ResolvedLayout::resolve(),
            template,
        }
    }

    pub fn layout(&self) -> &ResolvedLayout {
        &self.layout
    }

    /// Image served before the first successful poll: static blocks, zero measurements.
    pub fn initial_image(&self) -> RegisterImage {
        self.template.clone()
    }

    pub fn encode(&self, model: &ElectricalModel) -> RegisterImage {
        let mut image = self.template.clone();
        for placement in self.layout.placements() {
            let value = field_value(model, placement.field) / placement.x;
            image.insert(placement.addr, &encode_value(value, placement.encoding));
        }
        image
    }
}

fn encode_value(value: f64, encoding: Encoding) -> Vec<Word> {
    match encoding {
        Encoding::F32 => (value as f32).to_be_words(),
        Encoding::U32 => (value.round().clamp(0.0, f64::from(u32::MAX)) as u32).to_be_words(),
    }
}

fn field_value(model: &ElectricalModel, field: Field) -> f64 {
    match field {
        Field::Current => model.total_current,
        Field::PhaseCurrent(phase) => model.phase(phase).current,
        Field::VoltageLn => model.voltage_ln,
        Field::PhaseVoltage(phase) => model.phase(phase).voltage,
        Field::VoltageLl => model.voltage_ll,
        Field::VoltageAb => model.line_voltages[0],
        Field::VoltageBc => model.line_voltages[1],
        Field::VoltageCa => model.line_voltages[2],
        Field::Frequency => model.frequency,
        Field::Power => model.total.real,
        Field::PhasePower(phase) => model.phase(phase).power.real,
        Field::ApparentPower => model.total.apparent,
        Field::PhaseApparentPower(phase) => model.phase(phase).power.apparent,
        Field::ReactivePower => model.total.reactive,
        Field::PhaseReactivePower(phase) => model.phase(phase).power.reactive,
        Field::PowerFactor => model.total.power_factor,
        Field::PhasePowerFactor(phase) => model.phase(phase).power.power_factor,
        // No VAh metering upstream, the Wh totals stand in.
        Field::ExportedEnergy | Field::ExportedApparentEnergy => model.exported_energy,
        Field::ImportedEnergy | Field::ImportedApparentEnergy => model.imported_energy,
        Field::Events => 0.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyCounter {
    Imported,
    Exported,
}

impl fmt::Display for EnergyCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnergyCounter::Imported => write!(f, "imported"),
            EnergyCounter::Exported => write!(f, "exported"),
        }
    }
}

/// An energy counter went backwards (meter reset or rollover). The new value
/// is still published.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{counter} energy counter decreased from {previous} Wh to {current} Wh")]
pub struct EncodingInconsistency {
    pub counter: EnergyCounter,
    pub previous: f64,
    pub current: f64,
}

/// Tracks the last published energy counters to spot decreases.
#[derive(Debug, Clone, Default)]
pub struct EnergyCounters {
    tolerance: f64,
    last: Option<(f64, f64)>,
}

impl EnergyCounters {
    /// `tolerance` is the decrease in Wh that is still accepted silently.
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance: tolerance.max(0.0),
            last: None,
        }
    }

    /// Record the model's counters and report every counter that decreased.
    pub fn check(&mut self, model: &ElectricalModel) -> Vec<EncodingInconsistency> {
        let current = (model.imported_energy, model.exported_energy);
        let mut inconsistencies = vec![];
        if let Some((imported, exported)) = self.last {
            for (counter, previous, now) in [
                (EnergyCounter::Imported, imported, current.0),
                (EnergyCounter::Exported, exported, current.1),
            ] {
                if previous - now > self.tolerance {
                    inconsistencies.push(EncodingInconsistency {
                        counter,
                        previous,
                        current: now,
                    });
                }
            }
        }
        self.last = Some(current);
        inconsistencies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Decode;
    use crate::layout::{actual_address, entry, OVERRIDES};
    use crate::model::{derive, tests::sample_snapshot};
    use crate::snapshot::Phase;
    use proptest::prelude::*;

    fn read_f32(image: &RegisterImage, addr: u16) -> f32 {
        f32::from_be_words(&image.read(addr, 2).unwrap()).unwrap()
    }

    fn encoded_sample() -> (ElectricalModel, RegisterImage) {
        let model = derive(&sample_snapshot()).unwrap();
        let image = RegisterEncoder::new(&DeviceIdentity::default()).encode(&model);
        (model, image)
    }

    #[test]
    fn test_static_blocks() {
        let (_, image) = encoded_sample();
        assert_eq!(image.read(40001, 4).unwrap(), vec![0x5375, 0x6E53, 1, 65]);
        assert_eq!(image.read(40005, 6).unwrap(), vec![27753, 28277, 30765, 29539, 29289, 28788]);
        assert_eq!(image.read(40021, 7).unwrap(), vec![21352, 25964, 27769, 11618, 29289, 25703, 0x6500]);
        assert_eq!(image.read(40053, 6).unwrap(), vec![14392, 12595, 16966, 17989, 16696, 13379]);
        assert_eq!(image.get(40069), Some(0xFFFF));
        assert_eq!(image.read(40070, 2).unwrap(), vec![213, 124]);
        assert_eq!(image.read(40196, 2).unwrap(), vec![0xFFFF, 0]);
    }

    #[test]
    fn test_initial_image_has_headers_and_no_measurements() {
        let encoder = RegisterEncoder::new(&DeviceIdentity::default());
        let image = encoder.initial_image();
        assert_eq!(image.get(40070), Some(213));
        assert_eq!(image.read(40072, 124).unwrap(), vec![0; 124]);
    }

    #[test]
    fn test_scrambled_fields_land_on_override_addresses() {
        let (model, image) = encoded_sample();

        assert_eq!(read_f32(&image, 40090), model.total.real as f32);
        assert_eq!(read_f32(&image, 40092), model.phase(Phase::A).power.real as f32);
        assert_eq!(read_f32(&image, 40094), model.phase(Phase::B).power.real as f32);
        assert_eq!(read_f32(&image, 40100), model.line_voltages[0] as f32);
        assert_eq!(read_f32(&image, 40102), model.line_voltages[1] as f32);
        assert_eq!(read_f32(&image, 40104), model.line_voltages[2] as f32);
        // Documented `W` register is left empty.
        assert_eq!(read_f32(&image, entry(Field::Power).addr), 0.0);

        for (field, addr) in OVERRIDES {
            assert_eq!(actual_address(*field), *addr);
        }
    }

    #[test]
    fn test_frequency_wins_shared_register() {
        let (model, image) = encoded_sample();
        assert_eq!(read_f32(&image, 40096), 50.0);
        assert_ne!(read_f32(&image, 40096), model.phase(Phase::C).power.real as f32);
    }

    #[test]
    fn test_unscrambled_fields_keep_documented_addresses() {
        let (model, image) = encoded_sample();
        assert_eq!(read_f32(&image, 40072), model.total_current as f32);
        assert_eq!(read_f32(&image, 40082), 229.1_f64 as f32);
        assert_eq!(read_f32(&image, 40106), model.total.apparent as f32);
        assert_eq!(read_f32(&image, 40122), model.total.power_factor as f32);
        assert!(read_f32(&image, 40122) > 0.0);
    }

    #[test]
    fn test_energy_counters_are_floats() {
        let (_, image) = encoded_sample();
        assert_eq!(read_f32(&image, 40130), 287_703.0);
        assert_eq!(read_f32(&image, 40138), 3_461_821.0);
        assert_eq!(read_f32(&image, 40146), 287_703.0);
        assert_eq!(read_f32(&image, 40154), 3_461_821.0);
        assert_eq!(image.read(40194, 2).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_uint32_energy_reads_back_as_garbage() {
        let words = 3_461_821_u32.to_be_words();
        let misread = f32::from_be_words(&words).unwrap();
        assert!(misread.is_subnormal());
        assert!(misread.abs() < 1e-37);
    }

    #[test]
    fn test_signed_values_survive_encoding() {
        let mut snapshot = sample_snapshot();
        for phase in snapshot.phases.iter_mut() {
            phase.power = -phase.power * 0.8;
        }
        snapshot.total_power = snapshot.phase_power_sum();
        let model = derive(&snapshot).unwrap();
        let image = RegisterEncoder::new(&DeviceIdentity::default()).encode(&model);

        assert_eq!(read_f32(&image, 40090), model.total.real as f32);
        assert!(read_f32(&image, 40090) < 0.0);
        assert!(read_f32(&image, 40122) < 0.0);
        assert!(read_f32(&image, 40114) < 0.0);
    }

    #[test]
    fn test_energy_counter_decrease_is_reported_not_clamped() {
        let mut counters = EnergyCounters::new(0.0);
        let (mut model, _) = encoded_sample();
        assert!(counters.check(&model).is_empty());

        model.imported_energy += 10.0;
        assert!(counters.check(&model).is_empty());

        model.exported_energy = 12.0;
        let reported = counters.check(&model);
        assert_eq!(
            reported,
            vec![EncodingInconsistency {
                counter: EnergyCounter::Exported,
                previous: 287_703.0,
                current: 12.0,
            }]
        );

        let image = RegisterEncoder::new(&DeviceIdentity::default()).encode(&model);
        assert_eq!(read_f32(&image, 40130), 12.0);
    }

    #[test]
    fn test_energy_counter_tolerance() {
        let mut counters = EnergyCounters::new(5.0);
        let (mut model, _) = encoded_sample();
        counters.check(&model);
        model.imported_energy -= 4.0;
        assert!(counters.check(&model).is_empty());
        model.imported_energy -= 6.0;
        assert_eq!(counters.check(&model).len(), 1);
    }

    proptest! {
        #[test]
        fn prop_energy_round_trips_through_float_registers(wh in 0u32..=(1 << 24)) {
            let (mut model, _) = encoded_sample();
            model.imported_energy = f64::from(wh);
            let image = RegisterEncoder::new(&DeviceIdentity::default()).encode(&model);
            prop_assert_eq!(f64::from(read_f32(&image, 40138)), f64::from(wh));
        }
    }
}
