//! Register decoders for the supported sensor families.
//!
//! Decoders are pure over a [`RegisterSource`], so they run identically
//! against a live Modbus context and against canned registers in tests.

use async_trait::async_trait;
use std::collections::BTreeMap;

use canopy_core::error::Result;
use canopy_core::metrics::Metric;

use super::config::{
    DeviceConfig, DriverConfig, GasComboConfig, LinearConfig, RegisterFunction, WeatherChannel,
    WeatherStationConfig,
};

/// Weather station register layout.
const WEATHER_PRIMARY_ADDR: u16 = 0x0000;
const WEATHER_PRIMARY_COUNT: u16 = 6;
const WEATHER_SECONDARY_ADDR: u16 = 0x0008;
const WEATHER_SECONDARY_COUNT: u16 = 12;
const WEATHER_RAIN_ADDR: u16 = 0x0014;
const WEATHER_RAIN_COUNT: u16 = 8;

/// Something that can read Modbus registers from a unit on the bus.
#[async_trait]
pub trait RegisterSource: Send {
    async fn read_holding(&mut self, unit: u8, addr: u16, count: u16) -> Result<Vec<u16>>;
    async fn read_input(&mut self, unit: u8, addr: u16, count: u16) -> Result<Vec<u16>>;
}

async fn read(
    source: &mut dyn RegisterSource,
    function: RegisterFunction,
    unit: u8,
    addr: u16,
    count: u16,
) -> Result<Vec<u16>> {
    match function {
        RegisterFunction::Holding => source.read_holding(unit, addr, count).await,
        RegisterFunction::Input => source.read_input(unit, addr, count).await,
    }
}

/// Two registers as a signed 32-bit value in thousandths.
fn decode_s32_milli(high: u16, low: u16) -> f64 {
    let raw = ((high as u32) << 16) | low as u32;
    (raw as i32) as f64 / 1000.0
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Decoder for one configured device.
#[derive(Debug, Clone)]
pub enum DeviceDecoder {
    Linear(LinearConfig),
    GasCombo(GasComboConfig),
    WeatherStation(WeatherStationConfig),
}

impl DeviceDecoder {
    pub fn from_config(config: &DeviceConfig) -> Self {
        match &config.driver {
            DriverConfig::Linear(cfg) => DeviceDecoder::Linear(cfg.clone()),
            DriverConfig::GasCombo(cfg) => DeviceDecoder::GasCombo(cfg.clone()),
            DriverConfig::WeatherStation(cfg) => DeviceDecoder::WeatherStation(cfg.clone()),
        }
    }

    /// Read and decode one device. Returns the decoded metrics; any bus or
    /// device fault surfaces as an error for the caller's retry logic.
    pub async fn read(
        &self,
        unit: u8,
        source: &mut dyn RegisterSource,
    ) -> Result<BTreeMap<Metric, f64>> {
        match self {
            DeviceDecoder::Linear(cfg) => Self::read_linear(cfg, unit, source).await,
            DeviceDecoder::GasCombo(cfg) => Self::read_gas_combo(cfg, unit, source).await,
            DeviceDecoder::WeatherStation(cfg) => Self::read_weather(cfg, unit, source).await,
        }
    }

    async fn read_linear(
        cfg: &LinearConfig,
        unit: u8,
        source: &mut dyn RegisterSource,
    ) -> Result<BTreeMap<Metric, f64>> {
        let regs = read(source, cfg.function, unit, cfg.register, 1).await?;
        let raw = if cfg.signed {
            regs[0] as i16 as f64
        } else {
            regs[0] as f64
        };
        let mut value = raw * cfg.scale + cfg.offset;
        if let Some(decimals) = cfg.decimals {
            value = round_to(value, decimals);
        }
        let mut out = BTreeMap::new();
        out.insert(cfg.output, value);
        Ok(out)
    }

    async fn read_gas_combo(
        cfg: &GasComboConfig,
        unit: u8,
        source: &mut dyn RegisterSource,
    ) -> Result<BTreeMap<Metric, f64>> {
        let regs = read(source, cfg.function, unit, cfg.register, 3).await?;
        let mut out = BTreeMap::new();
        if let Some(metric) = cfg.outputs.co2 {
            out.insert(metric, regs[0] as f64);
        }
        if let Some(metric) = cfg.outputs.temperature {
            out.insert(metric, regs[1] as i16 as f64 / 100.0);
        }
        if let Some(metric) = cfg.outputs.humidity {
            out.insert(metric, regs[2] as f64 / 100.0);
        }
        Ok(out)
    }

    async fn read_weather(
        cfg: &WeatherStationConfig,
        unit: u8,
        source: &mut dyn RegisterSource,
    ) -> Result<BTreeMap<Metric, f64>> {
        let mut channels: BTreeMap<WeatherChannel, f64> = BTreeMap::new();

        let primary = source
            .read_holding(unit, WEATHER_PRIMARY_ADDR, WEATHER_PRIMARY_COUNT)
            .await?;
        for (i, channel) in [
            WeatherChannel::AirTemperature,
            WeatherChannel::AirHumidity,
            WeatherChannel::BarometricPressure,
        ]
        .into_iter()
        .enumerate()
        {
            channels.insert(channel, decode_s32_milli(primary[i * 2], primary[i * 2 + 1]));
        }

        let secondary = source
            .read_holding(unit, WEATHER_SECONDARY_ADDR, WEATHER_SECONDARY_COUNT)
            .await?;
        for (i, channel) in [
            WeatherChannel::WindDirectionMin,
            WeatherChannel::WindDirectionMax,
            WeatherChannel::WindDirectionAvg,
            WeatherChannel::WindSpeedMin,
            WeatherChannel::WindSpeedMax,
            WeatherChannel::WindSpeedAvg,
        ]
        .into_iter()
        .enumerate()
        {
            channels.insert(
                channel,
                decode_s32_milli(secondary[i * 2], secondary[i * 2 + 1]),
            );
        }

        // The rain block is only read when something maps to it; stations
        // without the rain module answer that range with an exception.
        if cfg.outputs.keys().any(|c| c.is_rain()) {
            let rain = source
                .read_holding(unit, WEATHER_RAIN_ADDR, WEATHER_RAIN_COUNT)
                .await?;
            for (i, channel) in [
                WeatherChannel::RainAccumulation,
                WeatherChannel::RainDuration,
                WeatherChannel::RainIntensity,
            ]
            .into_iter()
            .enumerate()
            {
                channels.insert(channel, decode_s32_milli(rain[i * 2], rain[i * 2 + 1]));
            }
        }

        let mut out = BTreeMap::new();
        for (channel, metric) in &cfg.outputs {
            if let Some(value) = channels.get(channel) {
                out.insert(*metric, *value);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use canopy_core::error::Error;
    use std::collections::HashMap;

    /// Canned register map keyed by (unit, address).
    #[derive(Debug, Default)]
    pub struct FakeRegisters {
        pub holding: HashMap<(u8, u16), Vec<u16>>,
        pub input: HashMap<(u8, u16), Vec<u16>>,
        pub reads: usize,
        pub fail_units: Vec<u8>,
    }

    #[async_trait]
    impl RegisterSource for FakeRegisters {
        async fn read_holding(&mut self, unit: u8, addr: u16, count: u16) -> Result<Vec<u16>> {
            self.reads += 1;
            if self.fail_units.contains(&unit) {
                return Err(Error::Transport(format!("unit {unit} timed out")));
            }
            let regs = self
                .holding
                .get(&(unit, addr))
                .ok_or_else(|| Error::Transport(format!("illegal address {addr:#06x}")))?;
            Ok(regs.iter().copied().take(count as usize).collect())
        }

        async fn read_input(&mut self, unit: u8, addr: u16, count: u16) -> Result<Vec<u16>> {
            self.reads += 1;
            if self.fail_units.contains(&unit) {
                return Err(Error::Transport(format!("unit {unit} timed out")));
            }
            let regs = self
                .input
                .get(&(unit, addr))
                .ok_or_else(|| Error::Transport(format!("illegal address {addr:#06x}")))?;
            Ok(regs.iter().copied().take(count as usize).collect())
        }
    }
}
