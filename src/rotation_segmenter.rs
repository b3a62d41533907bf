use crate::config::SessionConfig;
use crate::error::FilterError;
use crate::labels::{ROTATION_END, ROTATION_START};
use crate::orientation::{signed_rotation_angle, wrap_degrees, Quaternion};

/// Peso del valor anterior en el suavizado exponencial
const SMOOTHING_KEEP: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    Idle,
    Rotating,
}

#[derive(Debug, Clone, Copy)]
struct RotationSession {
    reference: Quaternion,
    ticks: u64,
}

/// Máquina de estados que abre una sesión de rotación cuando la
/// probabilidad suavizada de la clase de inicio supera el umbral, y emite
/// por tick el giro incremental respecto a la orientación del tick anterior.
pub struct RotationSegmenter {
    start: usize,
    end: usize,
    threshold: f64,
    max_ticks: u64,
    smoothed: Option<Vec<f64>>,
    session: Option<RotationSession>,
}

impl RotationSegmenter {
    pub fn new(start: usize, end: usize, threshold: f64, max_ticks: u64) -> Self {
        Self {
            start,
            end,
            threshold,
            max_ticks,
            smoothed: None,
            session: None,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            ROTATION_START,
            ROTATION_END,
            config.rotation.threshold,
            config.max_rotation_ticks(),
        )
    }

    pub fn state(&self) -> SegmenterState {
        if self.session.is_some() {
            SegmenterState::Rotating
        } else {
            SegmenterState::Idle
        }
    }

    pub fn is_rotating(&self) -> bool {
        self.session.is_some()
    }

    /// Ticks de la sesión en curso (0 en reposo)
    pub fn ticks(&self) -> u64 {
        self.session.map(|s| s.ticks).unwrap_or(0)
    }

    pub fn smoothed(&self) -> Option<&[f64]> {
        self.smoothed.as_deref()
    }

    /// Avanza un tick. Devuelve el giro (grados, en [-180, 180)) solo
    /// mientras se rota, incluido el tick en que la sesión termina.
    pub fn update(
        &mut self,
        probs: &[f64],
        orientation: Quaternion,
    ) -> Result<Option<f64>, FilterError> {
        let needed = self.start.max(self.end) + 1;
        if probs.len() < needed {
            return Err(FilterError::ClassCountMismatch {
                expected: needed,
                actual: probs.len(),
            });
        }

        let smoothed = match self.smoothed.take() {
            None => probs.to_vec(),
            Some(prev) if prev.len() == probs.len() => prev
                .iter()
                .zip(probs)
                .map(|(old, new)| SMOOTHING_KEEP * old + (1.0 - SMOOTHING_KEEP) * new)
                .collect(),
            Some(prev) => {
                let expected = prev.len();
                self.smoothed = Some(prev);
                return Err(FilterError::ClassCountMismatch {
                    expected,
                    actual: probs.len(),
                });
            }
        };
        let start_prob = smoothed[self.start];
        let end_prob = smoothed[self.end];
        self.smoothed = Some(smoothed);

        let Some(mut session) = self.session else {
            if start_prob > self.threshold {
                self.session = Some(RotationSession {
                    reference: orientation,
                    ticks: 1,
                });
            }
            return Ok(None);
        };

        let delta = wrap_degrees(-signed_rotation_angle(session.reference, orientation));

        session.ticks += 1;
        if end_prob > self.threshold || session.ticks > self.max_ticks {
            self.session = None;
        } else {
            session.reference = orientation;
            self.session = Some(session);
        }

        Ok(Some(delta))
    }

    pub fn reset(&mut self) {
        self.smoothed = None;
        self.session = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: usize = 1;
    const END: usize = 2;

    fn segmenter(max_ticks: u64) -> RotationSegmenter {
        RotationSegmenter::new(START, END, 0.95, max_ticks)
    }

    #[test]
    fn test_start_threshold_and_forced_stop() {
        let mut seg = segmenter(10);
        let q = Quaternion::IDENTITY;
        let mut states = Vec::new();
        let mut outputs = Vec::new();

        for tick in 1..=15 {
            let probs = if tick == 1 { [0.2, 0.8, 0.0] } else { [0.0, 1.0, 0.0] };
            outputs.push(seg.update(&probs, q).unwrap());
            states.push(seg.state());
        }

        // suavizado: 0.8, 0.86, 0.902, 0.9314, 0.95198
        for state in &states[..4] {
            assert_eq!(*state, SegmenterState::Idle);
        }
        assert_eq!(states[4], SegmenterState::Rotating);
        assert!(outputs[..5].iter().all(Option::is_none));
        assert!(outputs[5].is_some());
        // contador: 1 al abrir, 11 en el tick 15
        for state in &states[5..14] {
            assert_eq!(*state, SegmenterState::Rotating);
        }
        assert_eq!(states[14], SegmenterState::Idle);
        assert!(outputs[14].is_some());
    }

    #[test]
    fn test_end_class_stops_rotation() {
        let mut seg = segmenter(100);
        let q = Quaternion::IDENTITY;
        seg.update(&[0.0, 1.0, 0.0], q).unwrap();
        assert!(seg.is_rotating());
        // 0.7 * 0 + 0.3 * 1 no basta; tras varios ticks sí
        let mut ticks = 0;
        while seg.is_rotating() {
            seg.update(&[0.0, 0.0, 1.0], q).unwrap();
            ticks += 1;
            assert!(ticks < 20);
        }
        assert_eq!(ticks, 9);
    }

    #[test]
    fn test_delta_is_incremental_and_negated() {
        let mut seg = segmenter(100);
        seg.update(&[0.0, 1.0, 0.0], Quaternion::IDENTITY).unwrap();

        let q10 = Quaternion::from_axis_angle([0.0, 1.0, 0.0], 10.0);
        let q25 = Quaternion::from_axis_angle([0.0, 1.0, 0.0], 25.0);
        let d1 = seg.update(&[0.0, 1.0, 0.0], q10).unwrap().unwrap();
        let d2 = seg.update(&[0.0, 1.0, 0.0], q25).unwrap().unwrap();
        assert!((d1 + 10.0).abs() < 1e-9, "{}", d1);
        // referencia reiniciada en cada tick: 25 - 10
        assert!((d2 + 15.0).abs() < 1e-9, "{}", d2);
    }

    #[test]
    fn test_short_probability_vector_is_rejected() {
        let mut seg = segmenter(10);
        assert_eq!(
            seg.update(&[1.0, 0.0], Quaternion::IDENTITY),
            Err(FilterError::ClassCountMismatch { expected: 3, actual: 2 })
        );
        seg.update(&[0.0, 0.0, 0.0, 1.0], Quaternion::IDENTITY).unwrap();
        assert!(seg.update(&[0.0, 0.0, 1.0], Quaternion::IDENTITY).is_err());
        assert_eq!(seg.smoothed().map(<[f64]>::len), Some(4));
    }

    #[test]
    fn test_no_output_while_idle() {
        let mut seg = segmenter(10);
        for _ in 0..20 {
            assert_eq!(seg.update(&[1.0, 0.0, 0.0], Quaternion::IDENTITY), Ok(None));
        }
        assert_eq!(seg.ticks(), 0);
    }
}
