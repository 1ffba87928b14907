use anyhow::Result;
use tracing::warn;

use crate::geofence::{self, FenceDef};
use crate::position::AccuracyGate;

pub fn check_accuracy_gate(gate: &AccuracyGate) -> Result<()> {
    anyhow::ensure!(gate.min_sats >= 3, "gnss.min_sats too low (need >= 3 for a 2D fix)");
    anyhow::ensure!(
        gate.max_hdop > 0.5 && gate.max_hdop <= 25.0,
        "gnss.max_hdop out of range (0.5..=25)"
    );
    Ok(())
}

pub fn check_geofences(defs: &[FenceDef], hysteresis_m: f64) -> Result<()> {
    anyhow::ensure!(
        hysteresis_m.is_finite() && hysteresis_m >= 0.0,
        "geofence.hysteresis_m must be >= 0"
    );
    geofence::validate(defs)?;
    for d in defs {
        if (d.radius_m as f64) <= hysteresis_m {
            warn!(
                "geofence {}: radius {}m <= hysteresis {}m, ENTER can never fire",
                d.id, d.radius_m, hysteresis_m
            );
        }
    }
    if defs.is_empty() {
        warn!("geofence: no fences configured");
    }
    Ok(())
}
