//! One serial bus: the live Modbus context and the fault state machine.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_modbus::client::{rtu, Context, Reader};
use tokio_modbus::slave::{Slave, SlaveContext};
use tokio_serial::SerialStream;
use tracing::{debug, warn};

use canopy_core::error::{Error, Result};
use canopy_core::metrics::Metric;

use super::config::{BusConfig, DeviceConfig, Parity};
use super::decode::{DeviceDecoder, RegisterSource};

/// Delay before the single in-cycle retry of a failed device read.
const RETRY_DELAY: Duration = Duration::from_millis(500);
/// Failed cycles tolerated before the bus is parked.
const MAX_CONSECUTIVE_ERRORS: u32 = 3;
/// How long a parked bus stays untouched before an optimistic reset.
const REINIT_INTERVAL: Duration = Duration::from_secs(30);

/// Live Modbus-RTU context over a serial line.
pub struct ModbusSource {
    ctx: Context,
    timeout: Duration,
}

impl ModbusSource {
    /// Open the serial port and attach an RTU context.
    pub fn open(config: &BusConfig) -> Result<Self> {
        let data_bits = match config.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = if config.stop_bits == 2 {
            tokio_serial::StopBits::Two
        } else {
            tokio_serial::StopBits::One
        };
        let parity = match config.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let builder = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity);
        let stream = SerialStream::open(&builder)
            .map_err(|e| Error::Transport(format!("open {}: {e}", config.port)))?;
        Ok(Self {
            ctx: rtu::attach(stream),
            timeout: Duration::from_millis(config.timeout_ms),
        })
    }
}

#[async_trait]
impl RegisterSource for ModbusSource {
    async fn read_holding(&mut self, unit: u8, addr: u16, count: u16) -> Result<Vec<u16>> {
        self.ctx.set_slave(Slave(unit));
        let response = tokio::time::timeout(
            self.timeout,
            self.ctx.read_holding_registers(addr, count),
        )
        .await
        .map_err(|_| Error::Transport(format!("unit {unit}: request timed out")))?
        .map_err(|e| Error::Transport(format!("unit {unit}: {e}")))?
        .map_err(|e| Error::Transport(format!("unit {unit}: modbus exception {e}")))?;
        Ok(response)
    }

    async fn read_input(&mut self, unit: u8, addr: u16, count: u16) -> Result<Vec<u16>> {
        self.ctx.set_slave(Slave(unit));
        let response =
            tokio::time::timeout(self.timeout, self.ctx.read_input_registers(addr, count))
                .await
                .map_err(|_| Error::Transport(format!("unit {unit}: request timed out")))?
                .map_err(|e| Error::Transport(format!("unit {unit}: {e}")))?
                .map_err(|e| Error::Transport(format!("unit {unit}: modbus exception {e}")))?;
        Ok(response)
    }
}

/// One bus with its devices and failure bookkeeping.
pub struct SerialBus<S: RegisterSource> {
    id: String,
    devices: Vec<(DeviceConfig, DeviceDecoder)>,
    source: S,
    consecutive_errors: u32,
    parked_until: Option<Instant>,
}

impl<S: RegisterSource> SerialBus<S> {
    pub fn new(config: &BusConfig, source: S) -> Self {
        let devices = config
            .devices
            .iter()
            .map(|d| (d.clone(), DeviceDecoder::from_config(d)))
            .collect();
        Self {
            id: config.id.clone(),
            devices,
            source,
            consecutive_errors: 0,
            parked_until: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the bus is parked after repeated failures.
    pub fn is_parked(&self) -> bool {
        self.parked_until.is_some()
    }

    /// Poll every device once.
    ///
    /// Returns one entry per metric the cycle touched: `Some` with a fresh
    /// reading, `None` for metrics whose device failed (their stale values
    /// must not be trusted). A parked bus returns an empty map until its
    /// reinit interval elapses.
    pub async fn poll_cycle(&mut self) -> BTreeMap<Metric, Option<f64>> {
        if let Some(until) = self.parked_until {
            if Instant::now() < until {
                return BTreeMap::new();
            }
            debug!(bus = %self.id, "reinit interval elapsed, resuming polls");
            self.parked_until = None;
            self.consecutive_errors = 0;
        }

        let mut out = BTreeMap::new();
        let mut cycle_failed = false;
        for (config, decoder) in &self.devices {
            let first = decoder.read(config.unit_id, &mut self.source).await;
            let result = match first {
                Ok(values) => Ok(values),
                Err(e) => {
                    debug!(bus = %self.id, device = %config.id, error = %e, "read failed, retrying");
                    sleep(RETRY_DELAY).await;
                    decoder.read(config.unit_id, &mut self.source).await
                }
            };
            match result {
                Ok(values) => {
                    for (metric, value) in values {
                        out.insert(metric, Some(value));
                    }
                }
                Err(e) => {
                    warn!(bus = %self.id, device = %config.id, error = %e, "device read failed");
                    for metric in config.expected_metrics() {
                        out.insert(metric, None);
                    }
                    cycle_failed = true;
                }
            }
        }

        if cycle_failed {
            self.consecutive_errors += 1;
            if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                warn!(
                    bus = %self.id,
                    errors = self.consecutive_errors,
                    "bus unavailable, parking for {}s",
                    REINIT_INTERVAL.as_secs()
                );
                self.parked_until = Some(Instant::now() + REINIT_INTERVAL);
            }
        } else {
            self.consecutive_errors = 0;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::config::{DriverConfig, LinearConfig, RegisterFunction};
    use crate::serial::decode::testing::FakeRegisters;

    fn linear_device(id: &str, unit: u8, register: u16, output: Metric) -> DeviceConfig {
        DeviceConfig {
            id: id.into(),
            unit_id: unit,
            driver: DriverConfig::Linear(LinearConfig {
                register,
                function: RegisterFunction::Holding,
                scale: 1.0,
                offset: 0.0,
                signed: false,
                decimals: None,
                output,
            }),
        }
    }

    fn bus_config(devices: Vec<DeviceConfig>) -> BusConfig {
        BusConfig {
            id: "rs485-1".into(),
            port: "/dev/ttyUSB0".into(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            timeout_ms: 1000,
            poll_interval_s: 5.0,
            devices,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_failure_is_isolated() {
        let mut source = FakeRegisters::default();
        source.holding.insert((1, 0), vec![21]);
        source.fail_units.push(2);
        let config = bus_config(vec![
            linear_device("inside", 1, 0, Metric::InternalTemp),
            linear_device("outside", 2, 0, Metric::ExternalTemp),
        ]);
        let mut bus = SerialBus::new(&config, source);
        let out = bus.poll_cycle().await;
        assert_eq!(out[&Metric::InternalTemp], Some(21.0));
        assert_eq!(out[&Metric::ExternalTemp], None);
        assert!(!bus.is_parked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_cycle_reports_values() {
        let mut source = FakeRegisters::default();
        source.holding.insert((1, 0), vec![42]);
        let config = bus_config(vec![linear_device("inside", 1, 0, Metric::InternalTemp)]);
        let mut bus = SerialBus::new(&config, source);
        let out = bus.poll_cycle().await;
        assert_eq!(out[&Metric::InternalTemp], Some(42.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bus_parks_after_repeated_failures_and_resumes() {
        let mut source = FakeRegisters::default();
        source.fail_units.push(1);
        let config = bus_config(vec![linear_device("inside", 1, 0, Metric::InternalTemp)]);
        let mut bus = SerialBus::new(&config, source);

        for _ in 0..3 {
            let out = bus.poll_cycle().await;
            assert_eq!(out[&Metric::InternalTemp], None);
        }
        assert!(bus.is_parked());

        // While parked, no reads happen at all.
        assert!(bus.poll_cycle().await.is_empty());

        // After the reinit interval the bus tries again optimistically.
        tokio::time::advance(Duration::from_secs(31)).await;
        let out = bus.poll_cycle().await;
        assert_eq!(out[&Metric::InternalTemp], None);
        // One failed cycle after a reset does not park it again.
        assert!(!bus.is_parked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_error_counter() {
        let mut source = FakeRegisters::default();
        source.fail_units.push(1);
        let config = bus_config(vec![linear_device("inside", 1, 0, Metric::InternalTemp)]);
        let mut bus = SerialBus::new(&config, source);
        bus.poll_cycle().await;
        bus.poll_cycle().await;

        bus.source.fail_units.clear();
        bus.source.holding.insert((1, 0), vec![5]);
        let out = bus.poll_cycle().await;
        assert_eq!(out[&Metric::InternalTemp], Some(5.0));

        bus.source.fail_units.push(1);
        bus.poll_cycle().await;
        bus.poll_cycle().await;
        // Two failures after a success stay below the parking threshold.
        assert!(!bus.is_parked());
    }
}
