//! Frontera con el clasificador de gestos externo.
//!
//! El clasificador recibe una ventana de longitud fija por sensor y devuelve
//! un vector de probabilidades sobre N clases. Aquí solo vive el contrato y
//! una implementación de reproducción para ejecutar la cadena de filtros
//! sin modelo.

use crate::channel_buffer::Snapshot;
use crate::error::ClassifierError;
use crate::types::{ImuSample, Sample};

/// Ventana multicanal: `channels[c][t]`, NaN donde falta la muestra
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Window {
    pub channels: Vec<Vec<f64>>,
}

impl Window {
    /// Últimas `len` muestras de cada canal de la copia
    pub fn from_snapshot(snapshot: &Snapshot, len: usize) -> Result<Self, ClassifierError> {
        let available = snapshot.len();
        if available < len {
            return Err(ClassifierError::NotEnoughSamples {
                needed: len,
                available,
            });
        }
        let channels = snapshot
            .channels
            .iter()
            .map(|c| c[c.len() - len..].iter().copied().map(Sample::as_f64).collect())
            .collect();
        Ok(Self { channels })
    }

    pub fn len(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Entrada de una inferencia
#[derive(Debug, Clone, Default)]
pub struct ClassifierInput {
    pub ppg: Window,
    pub imu: Option<Window>,
}

pub trait Classifier: Send {
    /// Clases de salida
    fn n_classes(&self) -> usize;

    /// Muestras por canal que necesita cada inferencia (0 = ninguna)
    fn window_len(&self) -> usize;

    fn classify(&mut self, input: &ClassifierInput) -> Result<Vec<f64>, ClassifierError>;
}

/// Una fila de una secuencia grabada
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayRow {
    pub probs: Vec<f64>,
    /// IMU grabado junto a la inferencia; solo lo usa la reproducción
    /// offline, la sesión en vivo integra el del enlace serie
    pub imu: Option<ImuSample>,
}

/// Reproduce probabilidades grabadas, una por inferencia
pub struct ReplayClassifier {
    rows: Vec<ReplayRow>,
    n_classes: usize,
    next: usize,
}

impl ReplayClassifier {
    pub fn new(rows: Vec<ReplayRow>) -> Self {
        let n_classes = rows.first().map(|r| r.probs.len()).unwrap_or(0);
        Self {
            rows,
            n_classes,
            next: 0,
        }
    }

    /// Siguiente fila completa (probabilidades + IMU grabado)
    pub fn next_row(&mut self) -> Option<&ReplayRow> {
        let row = self.rows.get(self.next)?;
        self.next += 1;
        Some(row)
    }

    pub fn remaining(&self) -> usize {
        self.rows.len().saturating_sub(self.next)
    }
}

impl Classifier for ReplayClassifier {
    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn window_len(&self) -> usize {
        0
    }

    fn classify(&mut self, _input: &ClassifierInput) -> Result<Vec<f64>, ClassifierError> {
        self.next_row()
            .map(|row| row.probs.clone())
            .ok_or(ClassifierError::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_takes_latest_samples() {
        let snapshot = Snapshot {
            channels: vec![
                vec![Sample::Value(1.0), Sample::Value(2.0), Sample::Missing],
                vec![Sample::Value(4.0), Sample::Value(5.0), Sample::Value(6.0)],
            ],
            appended: vec![3, 3],
        };
        let window = Window::from_snapshot(&snapshot, 2).unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window.channels[0][0], 2.0);
        assert!(window.channels[0][1].is_nan());
        assert_eq!(window.channels[1], vec![5.0, 6.0]);
    }

    #[test]
    fn test_window_needs_enough_samples() {
        let snapshot = Snapshot {
            channels: vec![vec![Sample::Value(1.0)]],
            appended: vec![1],
        };
        assert!(matches!(
            Window::from_snapshot(&snapshot, 5),
            Err(ClassifierError::NotEnoughSamples { needed: 5, available: 1 })
        ));
    }

    #[test]
    fn test_replay_runs_out() {
        let mut replay = ReplayClassifier::new(vec![ReplayRow {
            probs: vec![0.3, 0.7],
            imu: None,
        }]);
        assert_eq!(replay.n_classes(), 2);
        let input = ClassifierInput::default();
        assert_eq!(replay.classify(&input).unwrap(), vec![0.3, 0.7]);
        assert!(matches!(replay.classify(&input), Err(ClassifierError::Exhausted)));
    }
}
