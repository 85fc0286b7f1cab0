use std::fmt;

use crate::snapshot::{Phase, TelemetrySnapshot};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DerivationError {
    #[error("{quantity} is not finite ({value})")]
    NonFinite { quantity: String, value: f64 },
    #[error("{quantity} must not be negative ({value})")]
    Negative { quantity: String, value: f64 },
    #[error("no phase voltage reported")]
    NoVoltage,
}

/// Real, apparent and reactive power of one phase or of the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PowerTriangle {
    /// Signed real power P in W.
    pub real: f64,
    /// Apparent power S in VA, always `>= |P|`.
    pub apparent: f64,
    /// Reactive power Q in var, signed like `real`.
    pub reactive: f64,
    /// Power factor in `[-1, 1]`, negative when the aggregate is exporting.
    pub power_factor: f64,
}

impl PowerTriangle {
    /// Complete the triangle from real power and the measured `V x I` product.
    ///
    /// `exporting` is the aggregate direction and decides the power factor sign.
    pub fn new(real: f64, measured_apparent: f64, exporting: bool) -> Self {
        let apparent = measured_apparent.max(real.abs());
        let magnitude = (apparent * apparent - real * real).max(0.0).sqrt();
        let reactive = if real < 0.0 { -magnitude } else { magnitude };

        let power_factor = if apparent == 0.0 {
            0.0
        } else {
            let ratio = (real / apparent).abs().clamp(0.0, 1.0);
            if exporting {
                -ratio
            } else {
                ratio
            }
        };

        Self {
            real,
            apparent,
            reactive,
            power_factor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhaseModel {
    /// Phase-to-neutral voltage in V (average of the other phases when not reported).
    pub voltage: f64,
    pub current: f64,
    pub power: PowerTriangle,
}

/// Direction of the aggregate energy flow at the grid connection point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Import,
    Export,
    Balanced,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Import => write!(f, "IMPORT"),
            Direction::Export => write!(f, "EXPORT"),
            Direction::Balanced => write!(f, "BALANCED"),
        }
    }
}

/// Complete electrical state derived from one [`TelemetrySnapshot`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ElectricalModel {
    pub phases: [PhaseModel; 3],
    pub total: PowerTriangle,
    /// Sum of the phase currents in A.
    pub total_current: f64,
    /// Average phase-to-neutral voltage in V.
    pub voltage_ln: f64,
    /// Line-to-line voltages AB, BC and CA in V.
    pub line_voltages: [f64; 3],
    /// Average line-to-line voltage in V.
    pub voltage_ll: f64,
    pub frequency: f64,
    /// Cumulative imported energy in Wh, verbatim from upstream.
    pub imported_energy: f64,
    /// Cumulative exported energy in Wh, verbatim from upstream.
    pub exported_energy: f64,
}

impl ElectricalModel {
    pub fn phase(&self, phase: Phase) -> &PhaseModel {
        &self.phases[phase.index()]
    }

    pub fn direction(&self) -> Direction {
        if self.total.real > 0.0 {
            Direction::Import
        } else if self.total.real < 0.0 {
            Direction::Export
        } else {
            Direction::Balanced
        }
    }
}

/// Line-to-line voltage of two phases 120° apart.
pub fn line_to_line(v_x: f64, v_y: f64) -> f64 {
    (v_x * v_x + v_y * v_y + v_x * v_y).sqrt()
}

fn finite(quantity: impl FnOnce() -> String, value: f64) -> Result<f64, DerivationError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(DerivationError::NonFinite {
            quantity: quantity(),
            value,
        })
    }
}

fn magnitude(quantity: impl Fn() -> String, value: f64) -> Result<f64, DerivationError> {
    let value = finite(&quantity, value)?;
    if value < 0.0 {
        return Err(DerivationError::Negative {
            quantity: quantity(),
            value,
        });
    }
    Ok(value)
}

/// Derive the full electrical model from a raw reading.
///
/// Rejects negative or non-finite magnitudes and non-finite powers, so the
/// returned model is always safe to encode.
pub fn derive(snapshot: &TelemetrySnapshot) -> Result<ElectricalModel, DerivationError> {
    let mut voltages = [None; 3];
    let mut currents = [0.0; 3];
    let mut powers = [0.0; 3];
    for phase in Phase::ALL {
        let reading = snapshot.phase(phase);
        let i = phase.index();
        voltages[i] = reading
            .voltage
            .map(|v| magnitude(|| format!("phase {phase:?} voltage"), v))
            .transpose()?;
        currents[i] = magnitude(|| format!("phase {phase:?} current"), reading.current)?;
        powers[i] = finite(|| format!("phase {phase:?} power"), reading.power)?;
    }
    let total_power = finite(|| "total power".to_string(), snapshot.total_power)?;
    let frequency = magnitude(|| "frequency".to_string(), snapshot.frequency)?;
    let imported_energy = magnitude(|| "imported energy".to_string(), snapshot.imported_energy)?;
    let exported_energy = magnitude(|| "exported energy".to_string(), snapshot.exported_energy)?;

    let reported = voltages.iter().flatten().copied().collect::<Vec<_>>();
    if reported.is_empty() {
        return Err(DerivationError::NoVoltage);
    }
    let voltage_ln = reported.iter().sum::<f64>() / reported.len() as f64;
    let voltages = voltages.map(|v| v.unwrap_or(voltage_ln));

    let exporting = total_power < 0.0;
    let phases: [PhaseModel; 3] = std::array::from_fn(|i| PhaseModel {
        voltage: voltages[i],
        current: currents[i],
        power: PowerTriangle::new(powers[i], voltages[i] * currents[i], exporting),
    });

    let measured_apparent = phases.iter().map(|p| p.power.apparent).sum::<f64>();
    let total = PowerTriangle::new(total_power, measured_apparent, exporting);

    let [v_a, v_b, v_c] = voltages;
    let line_voltages = [
        line_to_line(v_a, v_b),
        line_to_line(v_b, v_c),
        line_to_line(v_c, v_a),
    ];
    let voltage_ll = line_voltages.iter().sum::<f64>() / 3.0;

    Ok(ElectricalModel {
        phases,
        total,
        total_current: currents.iter().sum(),
        voltage_ln,
        line_voltages,
        voltage_ll,
        frequency,
        imported_energy,
        exported_energy,
    })
}
