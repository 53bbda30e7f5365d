use anyhow::Result;

use crate::MissionConfig;

pub fn check_limits(cfg: &MissionConfig) -> Result<()> {
    anyhow::ensure!(cfg.max_waypoints >= 1 && cfg.max_waypoints <= 120, "mission.max_waypoints should be 1..120");
    anyhow::ensure!(cfg.min_alt_m >= 0.0, "mission.min_alt_m negative");
    anyhow::ensure!(cfg.max_alt_m > cfg.min_alt_m, "mission.max_alt_m must exceed min_alt_m");
    anyhow::ensure!(
        cfg.default_alt_m >= cfg.min_alt_m && cfg.default_alt_m <= cfg.max_alt_m,
        "mission.default_alt_m outside min/max altitude"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass() {
        check_limits(&MissionConfig::default()).unwrap();
    }

    #[test]
    fn inverted_altitudes_fail() {
        let cfg = MissionConfig { min_alt_m: 80.0, max_alt_m: 20.0, ..Default::default() };
        assert!(check_limits(&cfg).is_err());
    }
}
