use serde::Serialize;
use std::io::{self, Write};
use tracing::info;

use crate::belief_filter::BeliefFilter;
use crate::config::SessionConfig;
use crate::debouncer::{Confirmed, Debouncer};
use crate::error::FilterError;
use crate::orientation::{OrientationIntegrator, Quaternion};
use crate::rotation_segmenter::RotationSegmenter;
use crate::types::ImuSample;

/// Resultado de un tick de inferencia
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutput {
    pub belief: Vec<f64>,
    pub state: usize,
    pub rotation: Option<f64>,
    pub confirmed: Option<Confirmed>,
}

impl TickOutput {
    /// Evento publicable si hubo confirmación o giro
    pub fn event(&self, timestamp: f64) -> Option<PipelineEvent> {
        if self.confirmed.is_none() && self.rotation.is_none() {
            return None;
        }
        Some(PipelineEvent {
            timestamp,
            gesture: self.confirmed.clone(),
            rotation_delta: self.rotation,
        })
    }
}

/// Lo que ve el consumidor externo
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineEvent {
    pub timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gesture: Option<Confirmed>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_delta: Option<f64>,
}

pub trait EventSink: Send {
    fn publish(&mut self, event: &PipelineEvent) -> io::Result<()>;
}

/// Un objeto JSON por línea
pub struct JsonLines<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonLines<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> EventSink for JsonLines<W> {
    fn publish(&mut self, event: &PipelineEvent) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, event)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

/// Cadena de filtros aguas abajo del clasificador:
/// creencia -> segmentador de rotación -> debouncer.
pub struct GesturePipeline {
    belief: BeliefFilter,
    segmenter: RotationSegmenter,
    debouncer: Debouncer,
    orientation: OrientationIntegrator,
}

impl GesturePipeline {
    pub fn new(config: &SessionConfig) -> Result<Self, FilterError> {
        Ok(Self {
            belief: BeliefFilter::for_gestures(&config.belief)?,
            segmenter: RotationSegmenter::from_config(config),
            debouncer: Debouncer::new(&config.debounce),
            orientation: OrientationIntegrator::new(&config.orientation, config.imu.sample_rate),
        })
    }

    /// Integra una muestra del IMU en la orientación
    pub fn feed_imu(&mut self, sample: &ImuSample) -> Quaternion {
        self.orientation.update(sample)
    }

    pub fn orientation(&self) -> Quaternion {
        self.orientation.orientation()
    }

    pub fn is_rotating(&self) -> bool {
        self.segmenter.is_rotating()
    }

    pub fn belief_filter(&self) -> &BeliefFilter {
        &self.belief
    }

    /// Un tick con las probabilidades del clasificador
    pub fn step(&mut self, probs: &[f64]) -> Result<TickOutput, FilterError> {
        let belief = self.belief.update(probs)?.to_vec();
        let state = self.belief.argmax();

        let rotation = self.segmenter.update(&belief, self.orientation.orientation())?;
        let confirmed = self.debouncer.update(&belief);

        if let Some(c) = confirmed.as_ref().filter(|c| c.announce) {
            info!("✋ {} ({:.1}%)", c.label, c.certainty * 100.0);
        }

        Ok(TickOutput {
            belief,
            state,
            rotation,
            confirmed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{NUM_GESTURES, REST, ROTATION_END, ROTATION_START};

    fn one_hot(state: usize) -> Vec<f64> {
        let mut v = vec![0.0; NUM_GESTURES];
        v[state] = 1.0;
        v
    }

    #[test]
    fn test_gesture_is_confirmed_and_announced() {
        let mut pipeline = GesturePipeline::new(&SessionConfig::default()).unwrap();
        let mut confirmed = Vec::new();
        for state in [2; 10].into_iter().chain([REST; 10]) {
            if let Some(c) = pipeline.step(&one_hot(state)).unwrap().confirmed {
                confirmed.push(c);
            }
        }
        let swipe = confirmed.iter().find(|c| c.state == 2).unwrap();
        assert!(swipe.announce);
        assert_eq!(swipe.label, "Swipe Left");
        assert!(swipe.certainty > 0.9);
    }

    #[test]
    fn test_rotation_session_opens_and_closes() {
        let mut pipeline = GesturePipeline::new(&SessionConfig::default()).unwrap();
        for _ in 0..10 {
            pipeline.step(&one_hot(ROTATION_START)).unwrap();
        }
        assert!(pipeline.is_rotating());

        let mut deltas = 0;
        for _ in 0..40 {
            let out = pipeline.step(&one_hot(ROTATION_END)).unwrap();
            if out.rotation.is_some() {
                deltas += 1;
            }
            if !pipeline.is_rotating() {
                break;
            }
        }
        assert!(!pipeline.is_rotating());
        assert!(deltas > 0);
    }

    #[test]
    fn test_wrong_class_count_is_an_error() {
        let mut pipeline = GesturePipeline::new(&SessionConfig::default()).unwrap();
        assert_eq!(
            pipeline.step(&[0.5, 0.5]),
            Err(FilterError::ClassCountMismatch {
                expected: NUM_GESTURES,
                actual: 2
            })
        );
    }

    #[test]
    fn test_json_lines_sink() {
        let mut sink = JsonLines::new(Vec::new());
        sink.publish(&PipelineEvent {
            timestamp: 1.5,
            gesture: None,
            rotation_delta: Some(-3.0),
        })
        .unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(text, "{\"timestamp\":1.5,\"rotation_delta\":-3.0}\n");
    }

    #[test]
    fn test_quiet_tick_has_no_event() {
        let out = TickOutput {
            belief: vec![1.0],
            state: 0,
            rotation: None,
            confirmed: None,
        };
        assert!(out.event(0.0).is_none());
    }
}
