use serde::Serialize;

use crate::belief_filter::argmax;
use crate::config::DebounceConfig;
use crate::labels::{self, REST};

/// Predicción confirmada por el debouncer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Confirmed {
    pub state: usize,
    pub label: &'static str,
    /// Certeza máxima durante la racha
    pub certainty: f64,
    /// Supera el umbral de anuncio y no es reposo
    pub announce: bool,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    state: usize,
    run: usize,
    peak: f64,
}

/// Histéresis sobre el argmax: una predicción se confirma cuando deja de
/// repetirse tras haberse mantenido al menos `min_run` ticks extra.
pub struct Debouncer {
    min_run: usize,
    announce_threshold: f64,
    candidate: Option<Candidate>,
}

impl Debouncer {
    pub fn new(config: &DebounceConfig) -> Self {
        Self {
            min_run: config.min_run,
            announce_threshold: config.announce_threshold,
            candidate: None,
        }
    }

    /// Avanza con un vector de creencia; devuelve la predicción confirmada
    /// si la racha anterior acaba de cerrarse
    pub fn update(&mut self, belief: &[f64]) -> Option<Confirmed> {
        if belief.is_empty() {
            return None;
        }
        let state = argmax(belief);
        self.observe(state, belief[state])
    }

    /// Igual que `update` con argmax y certeza ya calculados
    pub fn observe(&mut self, state: usize, certainty: f64) -> Option<Confirmed> {
        match self.candidate.as_mut() {
            Some(c) if c.state == state => {
                c.run += 1;
                c.peak = c.peak.max(certainty);
                None
            }
            _ => {
                let previous = self.candidate.replace(Candidate {
                    state,
                    run: 0,
                    peak: certainty,
                })?;
                (previous.run >= self.min_run).then(|| self.confirm(previous))
            }
        }
    }

    fn confirm(&self, c: Candidate) -> Confirmed {
        Confirmed {
            state: c.state,
            label: labels::label(c.state).unwrap_or("unknown"),
            certainty: c.peak,
            announce: c.peak > self.announce_threshold && c.state != REST,
        }
    }

    pub fn reset(&mut self) {
        self.candidate = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debouncer(min_run: usize) -> Debouncer {
        Debouncer::new(&DebounceConfig {
            min_run,
            announce_threshold: 0.5,
        })
    }

    #[test]
    fn test_runs_confirm_on_change() {
        const A: usize = 0;
        const B: usize = 1;
        let mut d = debouncer(1);
        let seq = [(A, 0.6), (A, 0.7), (B, 0.9), (B, 0.95), (B, 0.8), (A, 0.6)];
        let confirmed: Vec<(usize, f64)> = seq
            .iter()
            .filter_map(|&(s, c)| d.observe(s, c))
            .map(|c| (c.state, c.certainty))
            .collect();
        assert_eq!(confirmed, vec![(A, 0.7), (B, 0.95)]);
    }

    #[test]
    fn test_single_tick_is_not_confirmed() {
        let mut d = debouncer(1);
        assert!(d.observe(2, 0.9).is_none());
        assert!(d.observe(3, 0.9).is_none());
        assert!(d.observe(3, 0.9).is_none());
        assert!(d.observe(2, 0.9).is_some());
    }

    #[test]
    fn test_min_run_zero_confirms_every_change() {
        let mut d = debouncer(0);
        assert!(d.observe(0, 0.9).is_none());
        assert_eq!(d.observe(1, 0.9).map(|c| c.state), Some(0));
    }

    #[test]
    fn test_announce_flag() {
        let mut d = debouncer(1);
        d.observe(REST, 0.99);
        d.observe(REST, 0.99);
        let rest = d.observe(0, 0.4).unwrap();
        assert!(!rest.announce);
        assert_eq!(rest.label, "Nothing");

        d.observe(0, 0.45);
        let weak = d.observe(1, 0.9).unwrap();
        assert!(!weak.announce);

        d.observe(1, 0.9);
        let strong = d.observe(2, 0.9).unwrap();
        assert!(strong.announce);
        assert_eq!(strong.label, "Swipe Backward");
    }

    #[test]
    fn test_update_uses_argmax() {
        let mut d = debouncer(1);
        d.update(&[0.1, 0.8, 0.1]);
        d.update(&[0.2, 0.7, 0.1]);
        let c = d.update(&[0.9, 0.05, 0.05]).unwrap();
        assert_eq!((c.state, c.certainty), (1, 0.8));
    }
}
