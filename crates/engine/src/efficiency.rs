use rusqlite::{Connection, OptionalExtension};

/// Efficiency multiplier for an installed production core.
///
/// Unknown or absent cores, and stored values that are not a positive finite
/// number, resolve to `1.0`.
pub fn resolve_efficiency(conn: &Connection, core_id: Option<&str>) -> anyhow::Result<f64> {
    let Some(core_id) = core_id else {
        return Ok(1.0);
    };
    let stored: Option<f64> = conn
        .query_row(
            "SELECT efficiency FROM production_cores WHERE id = ?1",
            [core_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(normalize_efficiency(stored))
}

pub fn normalize_efficiency(stored: Option<f64>) -> f64 {
    match stored {
        Some(e) if e.is_finite() && e > 0.0 => e,
        _ => 1.0,
    }
}

/// Milliseconds per run; higher efficiency means a shorter run, never zero.
pub fn time_per_run_ms(craft_time_seconds: f64, efficiency: f64) -> i64 {
    let ms = (craft_time_seconds.max(0.0) * 1000.0 / normalize_efficiency(Some(efficiency))).round();
    if ms.is_finite() {
        (ms as i64).max(1)
    } else {
        i64::MAX
    }
}
