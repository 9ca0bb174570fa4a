use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::battery::BatteryConfig;
use crate::provider::ProviderConfig;
use crate::thermal::ThermalConfig;

/// Top-level settings tree for the replay engine.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct Settings {
    #[validate(nested)]
    #[serde(default)]
    pub engine: EngineSettings,

    #[validate(nested)]
    #[serde(default)]
    pub tariffs: TariffSettings,

    #[serde(default)]
    pub thermal: ThermalConfig,

    #[serde(default)]
    pub provider: ProviderConfig,

    /// Battery attached at startup; None leaves the simulation batteryless
    /// until `SetBattery`.
    #[serde(default)]
    pub battery: Option<BatteryConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct EngineSettings {
    /// Wall-clock ticker period.
    #[serde(default = "default_tick_interval_ms")]
    #[validate(range(min = 10, max = 10_000))]
    pub tick_interval_ms: u64,

    /// Seconds of simulated time per wall second.
    #[serde(default = "default_speed")]
    #[validate(range(min = 0.1, max = 2_592_000.0))]
    pub default_speed: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TariffSettings {
    /// Export revenue multiplier, accounts for grid fees.
    #[serde(default = "default_export_coefficient")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub export_coefficient: f64,

    /// Exports below this spot price count as "cheap exports" (PLN/kWh).
    #[serde(default = "default_cheap_price_threshold")]
    pub cheap_price_threshold: f64,

    /// Net-billing import tariff (PLN/kWh).
    #[serde(default = "default_fixed_tariff")]
    #[validate(range(min = 0.0))]
    pub fixed_tariff: f64,

    /// Distribution fee per net-metering-credited kWh (PLN/kWh).
    #[serde(default = "default_distribution_fee")]
    #[validate(range(min = 0.0))]
    pub distribution_fee: f64,

    /// Fraction of exported energy credited to the net-metering bank.
    #[serde(default = "default_net_metering_ratio")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub net_metering_ratio: f64,
}

fn default_tick_interval_ms() -> u64 {
    100
}
fn default_speed() -> f64 {
    60.0
}
fn default_export_coefficient() -> f64 {
    0.8
}
fn default_cheap_price_threshold() -> f64 {
    0.2
}
fn default_fixed_tariff() -> f64 {
    1.0
}
fn default_distribution_fee() -> f64 {
    0.3
}
fn default_net_metering_ratio() -> f64 {
    0.8
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            default_speed: default_speed(),
        }
    }
}

impl Default for TariffSettings {
    fn default() -> Self {
        Self {
            export_coefficient: default_export_coefficient(),
            cheap_price_threshold: default_cheap_price_threshold(),
            fixed_tariff: default_fixed_tariff(),
            distribution_fee: default_distribution_fee(),
            net_metering_ratio: default_net_metering_ratio(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            engine: EngineSettings::default(),
            tariffs: TariffSettings::default(),
            thermal: ThermalConfig::default(),
            provider: ProviderConfig::default(),
            battery: None,
        }
    }
}

impl Settings {
    /// Load from `config/default.toml` overlaid with `HER__`-prefixed
    /// environment variables (`HER__ENGINE__TICK_INTERVAL_MS` and so on).
    pub fn load() -> Result<Self> {
        let settings: Settings = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("HER__").split("__"))
            .extract()
            .context("failed to parse configuration")?;
        settings
            .validate()
            .context("configuration validation failed")?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.engine.tick_interval_ms, 100);
        assert_eq!(settings.tariffs.export_coefficient, 0.8);
    }

    #[test]
    fn test_speed_range_is_enforced() {
        let mut settings = Settings::default();
        settings.engine.default_speed = 0.01;
        assert!(settings.validate().is_err());
        settings.engine.default_speed = 3_000_000.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_deserialize_from_toml_fragment() {
        let settings: Settings = toml::from_str(
            r#"
            [engine]
            tick_interval_ms = 250
            default_speed = 3600.0

            [tariffs]
            export_coefficient = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(settings.engine.tick_interval_ms, 250);
        assert_eq!(settings.tariffs.export_coefficient, 0.5);
        // untouched sections fall back to defaults
        assert_eq!(settings.tariffs.fixed_tariff, 1.0);
    }
}
