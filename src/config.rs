use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::types::{CHANNELS_PER_CHAPTER, IMU_CHANNELS, PPG_ACCEL_CHANNELS};

/// Configuración completa de una sesión de sensado
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ppg: PpgConfig,
    pub imu: ImuConfig,
    pub buffer: BufferConfig,
    pub belief: BeliefConfig,
    pub rotation: RotationConfig,
    pub orientation: OrientationConfig,
    pub debounce: DebounceConfig,
    pub inference: InferenceConfig,
}

/// Parámetros de la pulsera PPG
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PpgConfig {
    /// Canales ópticos (múltiplo de 4, default: 16)
    pub n_channels: usize,
    /// Frecuencia de muestreo en Hz (default: 112.22)
    pub sample_rate: f64,
    /// Ventana de inferencia en segundos (default: 5)
    pub window_seconds: f64,
    /// Ventana del buffer de volcado en segundos (default: 2)
    pub flush_seconds: f64,
    /// Capítulo de marca de tiempo, una vez por segundo (default: 19)
    pub timestamp_chapter: u8,
}

impl Default for PpgConfig {
    fn default() -> Self {
        Self {
            n_channels: 16,
            sample_rate: 112.22,
            window_seconds: 5.0,
            flush_seconds: 2.0,
            timestamp_chapter: 19,
        }
    }
}

impl PpgConfig {
    /// Capítulos de datos por ciclo
    pub fn data_chapters(&self) -> usize {
        self.n_channels / CHANNELS_PER_CHAPTER
    }

    /// Canales ópticos + 3 acelerómetro + marca de tiempo
    pub fn total_channels(&self) -> usize {
        self.n_channels + PPG_ACCEL_CHANNELS + 1
    }

    pub fn timestamp_channel(&self) -> usize {
        self.n_channels + PPG_ACCEL_CHANNELS
    }
}

/// Parámetros del IMU por puerto serie
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuConfig {
    pub sample_rate: f64,
    /// Divisor de fondo de escala del giroscopio (64 para ±250 deg/s, 32 para ±500)
    pub gyro_divisor: f64,
    pub samples_per_package: u64,
    pub window_seconds: f64,
    pub flush_seconds: f64,
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            sample_rate: 112.1,
            gyro_divisor: 64.0,
            samples_per_package: 8,
            window_seconds: 5.0,
            flush_seconds: 2.0,
        }
    }
}

impl ImuConfig {
    pub fn total_channels(&self) -> usize {
        IMU_CHANNELS
    }
}

/// Cadencias de los contextos del ChannelBuffer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Frecuencia de la tarea de transferencia (default: 16 Hz)
    pub transfer_hz: f64,
    /// Espera máxima de E/S antes de revisar la señal de parada (ms)
    pub io_wait_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            transfer_hz: 16.0,
            io_wait_ms: 500,
        }
    }
}

impl BufferConfig {
    pub fn transfer_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.transfer_hz.max(1e-3))
    }

    pub fn io_wait(&self) -> Duration {
        Duration::from_millis(self.io_wait_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeliefConfig {
    pub start_rest_prob: f64,
    pub trans_self_prob: f64,
    pub emit_self_prob: f64,
}

impl Default for BeliefConfig {
    fn default() -> Self {
        Self {
            start_rest_prob: 0.5,
            trans_self_prob: 0.9,
            emit_self_prob: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub threshold: f64,
    pub max_duration_secs: f64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            threshold: 0.95,
            max_duration_secs: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrientationConfig {
    /// Ganancia fija del filtro de Madgwick
    pub gain: f64,
    /// Orientaciones pasadas retenidas
    pub history: usize,
    /// Pasa-altas opcional sobre el giroscopio (Hz)
    pub gyro_highpass_hz: Option<f64>,
}

impl Default for OrientationConfig {
    fn default() -> Self {
        Self {
            gain: 0.033,
            history: 600,
            gyro_highpass_hz: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub min_run: usize,
    pub announce_threshold: f64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            min_run: 1,
            announce_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Muestras nuevas entre inferencias
    pub hop: usize,
    /// Longitud de la ventana que recibe el clasificador
    pub window_len: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            hop: 1,
            window_len: 150,
        }
    }
}

/// Capacidad de un ring buffer: (ventana + 1) * fs + 1
pub fn ring_capacity(window_seconds: f64, sample_rate: f64) -> usize {
    ((window_seconds + 1.0) * sample_rate + 1.0) as usize
}

/// Capacidad de una cola de ingestión: (ventana + 2) * fs + 1
pub fn ingest_capacity(window_seconds: f64, sample_rate: f64) -> usize {
    ((window_seconds + 2.0) * sample_rate + 1.0) as usize
}

impl SessionConfig {
    /// Carga la configuración desde un JSON; los campos ausentes toman su default
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("No se pudo leer la configuración {:?}", path))?;
        let config: SessionConfig = serde_json::from_str(&content)
            .with_context(|| format!("Configuración inválida en {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.ppg.n_channels > 0 && self.ppg.n_channels % CHANNELS_PER_CHAPTER == 0,
            "ppg.n_channels debe ser múltiplo de {} (es {})",
            CHANNELS_PER_CHAPTER,
            self.ppg.n_channels
        );
        ensure!(
            self.ppg.timestamp_chapter as usize >= self.ppg.data_chapters(),
            "ppg.timestamp_chapter {} colisiona con un capítulo de datos",
            self.ppg.timestamp_chapter
        );
        ensure!(self.ppg.sample_rate > 0.0, "ppg.sample_rate debe ser > 0");
        ensure!(self.imu.sample_rate > 0.0, "imu.sample_rate debe ser > 0");
        ensure!(self.imu.gyro_divisor > 0.0, "imu.gyro_divisor debe ser > 0");
        ensure!(self.inference.hop > 0, "inference.hop debe ser > 0");
        ensure!(self.inference.window_len > 0, "inference.window_len debe ser > 0");
        ensure!(
            (0.0..=1.0).contains(&self.belief.trans_self_prob)
                && (0.0..=1.0).contains(&self.belief.emit_self_prob),
            "belief.*_self_prob debe estar en [0, 1]"
        );
        Ok(())
    }

    /// Periodo de inferencia: hop / fs
    pub fn inference_period(&self) -> Duration {
        Duration::from_secs_f64(self.inference.hop as f64 / self.ppg.sample_rate)
    }

    /// Ticks máximos de una sesión de rotación
    pub fn max_rotation_ticks(&self) -> u64 {
        (self.rotation.max_duration_secs / self.inference_period().as_secs_f64()).round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let config = SessionConfig::default();
        assert_eq!(config.ppg.data_chapters(), 4);
        assert_eq!(config.ppg.total_channels(), 20);
        assert_eq!(config.ppg.timestamp_channel(), 19);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ring_capacity_formula() {
        assert_eq!(ring_capacity(5.0, 128.0), 769);
        assert_eq!(ring_capacity(2.0, 128.0), 385);
        assert_eq!(ingest_capacity(5.0, 128.0), 897);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"imu": {"gyro_divisor": 32}, "debounce": {"min_run": 3}}"#)
                .unwrap();
        assert_eq!(config.imu.gyro_divisor, 32.0);
        assert_eq!(config.imu.samples_per_package, 8);
        assert_eq!(config.debounce.min_run, 3);
        assert_eq!(config.ppg.n_channels, 16);
    }

    #[test]
    fn test_rejects_odd_channel_count() {
        let mut config = SessionConfig::default();
        config.ppg.n_channels = 18;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_validates() {
        let dir = std::env::temp_dir();
        let good = dir.join(format!("pulsera-config-ok-{}.json", std::process::id()));
        let bad = dir.join(format!("pulsera-config-bad-{}.json", std::process::id()));
        std::fs::write(&good, r#"{"debounce": {"min_run": 2}}"#).unwrap();
        std::fs::write(&bad, r#"{"ppg": {"n_channels": 18}}"#).unwrap();

        assert_eq!(SessionConfig::load(&good).unwrap().debounce.min_run, 2);
        let err = SessionConfig::load(&bad).unwrap_err();
        assert!(err.to_string().contains("n_channels"), "{}", err);

        std::fs::remove_file(good).unwrap();
        std::fs::remove_file(bad).unwrap();
    }

    #[test]
    fn test_max_rotation_ticks() {
        let mut config = SessionConfig::default();
        config.ppg.sample_rate = 100.0;
        config.inference.hop = 10;
        config.rotation.max_duration_secs = 2.0;
        assert_eq!(config.max_rotation_ticks(), 20);
    }
}
