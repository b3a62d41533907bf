use serde::{Deserialize, Serialize};
use std::fmt;

/// Valor de un canal en un tick: dato real o marcador de pérdida.
/// `Missing` es distinto de cero; los consumidores lo ven como NaN.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Sample {
    Value(f64),
    Missing,
}

impl Sample {
    /// Valor numérico, NaN si falta
    pub fn as_f64(self) -> f64 {
        match self {
            Sample::Value(v) => v,
            Sample::Missing => f64::NAN,
        }
    }

    pub fn is_missing(self) -> bool {
        matches!(self, Sample::Missing)
    }

    pub fn value(self) -> Option<f64> {
        match self {
            Sample::Value(v) => Some(v),
            Sample::Missing => None,
        }
    }
}

impl From<f64> for Sample {
    fn from(v: f64) -> Self {
        if v.is_nan() {
            Sample::Missing
        } else {
            Sample::Value(v)
        }
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sample::Value(v) => write!(f, "{}", v),
            Sample::Missing => write!(f, "nan"),
        }
    }
}

/// Destino de las muestras decodificadas (colas de ingestión del ChannelBuffer,
/// o un Vec en los tests)
pub trait SampleSink {
    fn push_sample(&mut self, channel: usize, sample: Sample);
}

impl SampleSink for Vec<Vec<Sample>> {
    fn push_sample(&mut self, channel: usize, sample: Sample) {
        if let Some(queue) = self.get_mut(channel) {
            queue.push(sample);
        }
    }
}

/// Una muestra del IMU ya convertida: aceleración en m/s², giro en deg/s
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    pub acc: [f64; 3],
    pub gyro: [f64; 3],
}

/// Constantes del sistema
pub const SEQUENCE_MODULUS: usize = 256;
pub const CHANNELS_PER_CHAPTER: usize = 4;
pub const GROUP_BYTES: usize = 4; // flag de overflow + 3 bytes big-endian
pub const OVERFLOW_FLAG: u8 = 15;
pub const PPG_ACCEL_CHANNELS: usize = 3;
pub const PPG_ACCEL_SCALE: f64 = 8.0 * 9.8; // ±8 g
pub const IMU_CHANNELS: usize = 8; // ax, ay, az, gx, gy, gz, ts dispositivo, ts host
pub const IMU_ACC_LSB_DIV: f64 = 16384.0; // 2^14
pub const GRAVITY: f64 = 9.81;

/// Índices de canal del IMU
pub const IMU_AX: usize = 0;
pub const IMU_GX: usize = 3;
pub const IMU_DEVICE_TS: usize = 6;
pub const IMU_HOST_TS: usize = 7;

/// Segundos desde epoch (reloj del host)
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_is_nan_not_zero() {
        assert!(Sample::Missing.as_f64().is_nan());
        assert_ne!(Sample::Missing, Sample::Value(0.0));
        assert_eq!(Sample::from(f64::NAN), Sample::Missing);
        assert_eq!(Sample::from(2.5).value(), Some(2.5));
    }

    #[test]
    fn test_display_matches_dump_format() {
        assert_eq!(Sample::Value(1.5).to_string(), "1.5");
        assert_eq!(Sample::Missing.to_string(), "nan");
    }

    #[test]
    fn test_vec_sink_ignores_unknown_channel() {
        let mut sink: Vec<Vec<Sample>> = vec![Vec::new(); 2];
        sink.push_sample(1, Sample::Value(3.0));
        sink.push_sample(7, Sample::Value(3.0));
        assert_eq!(sink[1], vec![Sample::Value(3.0)]);
        assert!(sink[0].is_empty());
    }
}
