/// Phases of a three-phase meter in SunSpec order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    A,
    B,
    C,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::A, Phase::B, Phase::C];

    pub fn index(self) -> usize {
        match self {
            Phase::A => 0,
            Phase::B => 1,
            Phase::C => 2,
        }
    }
}

/// Raw per-phase measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhaseReading {
    /// Phase-to-neutral voltage in V, `None` when the meter did not report it.
    pub voltage: Option<f64>,
    /// Current magnitude in A.
    pub current: f64,
    /// Signed real power in W, negative when exporting.
    pub power: f64,
}

/// One normalized reading of the upstream meter, taken once per poll cycle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TelemetrySnapshot {
    pub phases: [PhaseReading; 3],
    /// Signed aggregate real power in W, as reported upstream.
    pub total_power: f64,
    /// Grid frequency in Hz.
    pub frequency: f64,
    /// Cumulative imported energy in Wh.
    pub imported_energy: f64,
    /// Cumulative exported energy in Wh.
    pub exported_energy: f64,
}

impl TelemetrySnapshot {
    pub fn phase(&self, phase: Phase) -> &PhaseReading {
        &self.phases[phase.index()]
    }

    /// Signed sum of the per-phase real powers.
    pub fn phase_power_sum(&self) -> f64 {
        self.phases.iter().map(|p| p.power).sum()
    }

    /// Absolute difference between the reported aggregate and the phase sum.
    pub fn power_imbalance(&self) -> f64 {
        (self.total_power - self.phase_power_sum()).abs()
    }
}
