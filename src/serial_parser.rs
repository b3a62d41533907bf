//! Protocolo de líneas del IMU por puerto serie.
//!
//! Cada línea es una de tres cosas:
//! - `Package count: N` (contador de paquete del firmware)
//! - exactamente 7 campos separados por tabulador: ax ay az gx gy gz ts
//! - cualquier otro texto (mensajes de estado)

use serde::Serialize;
use std::collections::BTreeSet;
use std::ops::Bound::{Excluded, Unbounded};
use tracing::{debug, warn};

use crate::error::LineError;
use crate::types::{
    ImuSample, Sample, SampleSink, GRAVITY, IMU_ACC_LSB_DIV, IMU_AX, IMU_DEVICE_TS, IMU_GX,
    IMU_HOST_TS,
};

const PACKAGE_PREFIX: &str = "Package count: ";
const SAMPLE_FIELDS: usize = 7;

#[derive(Debug, Clone, PartialEq)]
pub enum SerialLine {
    PackageCount(u64),
    Sample { imu: ImuSample, device_ts: f64 },
    Status(String),
}

/// Clasifica y convierte una línea
pub fn parse_line(line: &str, gyro_divisor: f64) -> Result<SerialLine, LineError> {
    let line = line.trim_end_matches(['\r', '\n']);

    if let Some(count) = line.strip_prefix(PACKAGE_PREFIX) {
        let count = count.trim().parse::<u64>().map_err(|_| LineError::BadField {
            index: 0,
            value: count.to_string(),
        })?;
        return Ok(SerialLine::PackageCount(count));
    }

    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != SAMPLE_FIELDS {
        return Ok(SerialLine::Status(line.to_string()));
    }

    let mut raw = [0i64; 6];
    for (i, slot) in raw.iter_mut().enumerate() {
        *slot = parse_field(fields[i], i)?;
    }
    let device_ts: f64 = fields[6].trim().parse().map_err(|_| LineError::BadField {
        index: 6,
        value: fields[6].to_string(),
    })?;

    let acc = remap_axes([
        raw[0] as f64 / IMU_ACC_LSB_DIV * GRAVITY,
        raw[1] as f64 / IMU_ACC_LSB_DIV * GRAVITY,
        raw[2] as f64 / IMU_ACC_LSB_DIV * GRAVITY,
    ]);
    let gyro = remap_axes([
        raw[3] as f64 / gyro_divisor,
        raw[4] as f64 / gyro_divisor,
        raw[5] as f64 / gyro_divisor,
    ]);

    Ok(SerialLine::Sample {
        imu: ImuSample { acc, gyro },
        device_ts,
    })
}

fn parse_field(field: &str, index: usize) -> Result<i64, LineError> {
    field.trim().parse().map_err(|_| LineError::BadField {
        index,
        value: field.to_string(),
    })
}

/// Montaje del sensor en la pulsera: (x, y, z) -> (-y, -x, -z)
fn remap_axes(v: [f64; 3]) -> [f64; 3] {
    [-v[1], -v[0], -v[2]]
}

/// Estimación de pérdidas a partir del conjunto de contadores de paquete
/// distintos. Da igual el orden de llegada; un contador ya visto solo se
/// cuenta como repetido.
#[derive(Debug, Clone, Default)]
pub struct PackageLossTracker {
    samples_per_package: u64,
    counters: BTreeSet<u64>,
    /// Σ(hueco − 1) sobre el conjunto ordenado
    lost: u64,
    repeated: u64,
    /// Muestras vistas en total y al recibir el contador mínimo y el máximo
    samples: u64,
    samples_at_min: u64,
    samples_at_max: u64,
}

impl PackageLossTracker {
    pub fn new(samples_per_package: u64) -> Self {
        Self {
            samples_per_package,
            ..Self::default()
        }
    }

    pub fn record_sample(&mut self) {
        self.samples += 1;
    }

    pub fn record_package(&mut self, count: u64) {
        if self.counters.contains(&count) {
            self.repeated += 1;
            return;
        }
        let below = self.counters.range(..count).next_back().copied();
        let above = self.counters.range((Excluded(count), Unbounded)).next().copied();
        match (below, above) {
            // parte un hueco en dos: un perdido menos
            (Some(_), Some(_)) => self.lost -= 1,
            (Some(below), None) => self.lost += count - below - 1,
            (None, Some(above)) => self.lost += above - count - 1,
            (None, None) => {}
        }
        if below.is_none() {
            self.samples_at_min = self.samples;
        }
        if above.is_none() {
            self.samples_at_max = self.samples;
        }
        self.counters.insert(count);
    }

    /// Σ(hueco − 1) / (contadores únicos + Σ(hueco − 1))
    pub fn package_loss(&self) -> f64 {
        let total = self.counters.len() as u64 + self.lost;
        if total == 0 {
            0.0
        } else {
            self.lost as f64 / total as f64
        }
    }

    /// 1 − observadas / esperadas entre el contador mínimo y el máximo
    pub fn data_loss(&self) -> f64 {
        let (Some(first), Some(last)) = (self.counters.first(), self.counters.last()) else {
            return 0.0;
        };
        let expected = (last - first) * self.samples_per_package;
        if expected == 0 {
            return 0.0;
        }
        let observed = self.samples_at_max.abs_diff(self.samples_at_min);
        (1.0 - observed as f64 / expected as f64).clamp(0.0, 1.0)
    }

    pub fn repeated(&self) -> u64 {
        self.repeated
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImuStats {
    pub samples: u64,
    pub packages: u64,
    pub status_lines: u64,
    pub bad_lines: u64,
    pub package_loss: f64,
    pub data_loss: f64,
}

/// Lector de líneas con estado: convierte, empuja los 8 canales y lleva
/// la contabilidad de pérdidas
pub struct ImuReader {
    gyro_divisor: f64,
    tracker: PackageLossTracker,
    stats: ImuStats,
}

impl ImuReader {
    pub fn new(gyro_divisor: f64, samples_per_package: u64) -> Self {
        Self {
            gyro_divisor,
            tracker: PackageLossTracker::new(samples_per_package),
            stats: ImuStats::default(),
        }
    }

    /// Procesa una línea recibida en `host_ts`. Devuelve la muestra si la había.
    pub fn handle_line<S: SampleSink>(
        &mut self,
        line: &str,
        host_ts: f64,
        sink: &mut S,
    ) -> Option<ImuSample> {
        match parse_line(line, self.gyro_divisor) {
            Ok(SerialLine::Sample { imu, device_ts }) => {
                for i in 0..3 {
                    sink.push_sample(IMU_AX + i, Sample::Value(imu.acc[i]));
                    sink.push_sample(IMU_GX + i, Sample::Value(imu.gyro[i]));
                }
                sink.push_sample(IMU_DEVICE_TS, Sample::Value(device_ts));
                sink.push_sample(IMU_HOST_TS, Sample::Value(host_ts));
                self.tracker.record_sample();
                self.stats.samples += 1;
                Some(imu)
            }
            Ok(SerialLine::PackageCount(count)) => {
                self.tracker.record_package(count);
                self.stats.packages += 1;
                None
            }
            Ok(SerialLine::Status(text)) => {
                if !text.trim().is_empty() {
                    debug!("[IMU] {}", text);
                }
                self.stats.status_lines += 1;
                None
            }
            Err(e) => {
                warn!("⚠️  [IMU] Línea descartada: {}", e);
                self.stats.bad_lines += 1;
                None
            }
        }
    }

    pub fn stats(&self) -> ImuStats {
        ImuStats {
            package_loss: self.tracker.package_loss(),
            data_loss: self.tracker.data_loss(),
            ..self.stats.clone()
        }
    }
}
