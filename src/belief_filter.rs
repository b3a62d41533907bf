//! Filtro de creencia (HMM, paso forward) sobre la salida del clasificador.
//!
//! `T[i][j]` = P(estado j | estado i) y `E[i][k]` = P(clase k | estado i);
//! ambas matrices son estocásticas por filas. Las restricciones sobre
//! transiciones se declaran en el builder y se aplican con una sola
//! renormalización final.

use std::collections::VecDeque;

use crate::config::BeliefConfig;
use crate::error::FilterError;
use crate::labels::{NUM_GESTURES, REST, ROTATING, ROTATION_END, ROTATION_START};

const DEFAULT_HISTORY: usize = 4096;

/// Restricción declarativa sobre la matriz de transición
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionRule {
    /// `state` solo se alcanza desde `from` (tampoco puede ser estado inicial)
    OnlyReachableFrom { state: usize, from: Vec<usize> },
    /// Desde `state` solo se puede ir a `to`
    OnlyLeadsTo { state: usize, to: Vec<usize> },
    Forbid { from: usize, to: usize },
}

/// Un estado oculto que nunca se observa emite como `proxy`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmissionRemap {
    pub hidden: usize,
    pub proxy: usize,
}

pub struct BeliefFilterBuilder {
    n_states: usize,
    rest: usize,
    start_rest_prob: f64,
    trans_self_prob: f64,
    emit_self_prob: f64,
    rules: Vec<TransitionRule>,
    remaps: Vec<EmissionRemap>,
    history_len: usize,
}

impl BeliefFilterBuilder {
    pub fn new(n_states: usize) -> Self {
        let defaults = BeliefConfig::default();
        Self {
            n_states,
            rest: 0,
            start_rest_prob: defaults.start_rest_prob,
            trans_self_prob: defaults.trans_self_prob,
            emit_self_prob: defaults.emit_self_prob,
            rules: Vec::new(),
            remaps: Vec::new(),
            history_len: DEFAULT_HISTORY,
        }
    }

    /// Builder con las probabilidades de `config`
    pub fn from_config(n_states: usize, rest: usize, config: &BeliefConfig) -> Self {
        Self::new(n_states)
            .rest(rest)
            .start_rest_prob(config.start_rest_prob)
            .trans_self_prob(config.trans_self_prob)
            .emit_self_prob(config.emit_self_prob)
    }

    pub fn rest(mut self, rest: usize) -> Self {
        self.rest = rest;
        self
    }

    pub fn start_rest_prob(mut self, p: f64) -> Self {
        self.start_rest_prob = p;
        self
    }

    pub fn trans_self_prob(mut self, p: f64) -> Self {
        self.trans_self_prob = p;
        self
    }

    pub fn emit_self_prob(mut self, p: f64) -> Self {
        self.emit_self_prob = p;
        self
    }

    pub fn rule(mut self, rule: TransitionRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn remap(mut self, hidden: usize, proxy: usize) -> Self {
        self.remaps.push(EmissionRemap { hidden, proxy });
        self
    }

    pub fn history_len(mut self, len: usize) -> Self {
        self.history_len = len;
        self
    }

    pub fn build(self) -> Result<BeliefFilter, FilterError> {
        let n = self.n_states;
        if n < 2 {
            return Err(FilterError::InvalidMatrix(format!(
                "se necesitan al menos 2 estados (hay {})",
                n
            )));
        }
        self.check_state(self.rest)?;

        let mut start = vec![(1.0 - self.start_rest_prob) / (n - 1) as f64; n];
        start[self.rest] = self.start_rest_prob;

        let mut trans = uniform_off_diagonal(n, self.trans_self_prob);

        for rule in &self.rules {
            match rule {
                TransitionRule::OnlyReachableFrom { state, from } => {
                    self.check_state(*state)?;
                    for s in from {
                        self.check_state(*s)?;
                    }
                    for (i, row) in trans.iter_mut().enumerate() {
                        if !from.contains(&i) {
                            row[*state] = 0.0;
                        }
                    }
                    start[*state] = 0.0;
                }
                TransitionRule::OnlyLeadsTo { state, to } => {
                    self.check_state(*state)?;
                    for s in to {
                        self.check_state(*s)?;
                    }
                    for (j, p) in trans[*state].iter_mut().enumerate() {
                        if !to.contains(&j) {
                            *p = 0.0;
                        }
                    }
                }
                TransitionRule::Forbid { from, to } => {
                    self.check_state(*from)?;
                    self.check_state(*to)?;
                    trans[*from][*to] = 0.0;
                }
            }
        }

        for (i, row) in trans.iter_mut().enumerate() {
            normalize_row(row).map_err(|_| {
                FilterError::InvalidMatrix(format!("el estado {} no tiene salida", i))
            })?;
        }
        normalize_row(&mut start)
            .map_err(|_| FilterError::InvalidMatrix("distribución inicial vacía".into()))?;

        let mut emit = uniform_off_diagonal(n, self.emit_self_prob);
        for remap in &self.remaps {
            self.check_state(remap.hidden)?;
            self.check_state(remap.proxy)?;
            let row = &mut emit[remap.hidden];
            row[remap.proxy] += row[remap.hidden];
            row[remap.hidden] = 0.0;
        }

        Ok(BeliefFilter {
            belief: start.clone(),
            start,
            trans,
            emit,
            history: VecDeque::with_capacity(self.history_len.min(DEFAULT_HISTORY)),
            history_len: self.history_len,
        })
    }

    fn check_state(&self, state: usize) -> Result<(), FilterError> {
        if state < self.n_states {
            Ok(())
        } else {
            Err(FilterError::InvalidState(state))
        }
    }
}

/// Diagonal `p`, resto `(1 - p) / (n - 1)`
fn uniform_off_diagonal(n: usize, p: f64) -> Vec<Vec<f64>> {
    let off = (1.0 - p) / (n - 1) as f64;
    (0..n)
        .map(|i| (0..n).map(|j| if i == j { p } else { off }).collect())
        .collect()
}

fn normalize_row(row: &mut [f64]) -> Result<(), FilterError> {
    let sum: f64 = row.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return Err(FilterError::ZeroMass);
    }
    row.iter_mut().for_each(|p| *p /= sum);
    Ok(())
}

#[derive(Debug, Clone)]
pub struct BeliefFilter {
    start: Vec<f64>,
    trans: Vec<Vec<f64>>,
    emit: Vec<Vec<f64>>,
    belief: Vec<f64>,
    history: VecDeque<usize>,
    history_len: usize,
}

impl BeliefFilter {
    /// Filtro de los 9 gestos de la pulsera: "Pinch Hold" solo se alcanza
    /// desde "Pinch Open" o sí mismo, solo lleva a sí mismo o a "Side Tap",
    /// y emite como reposo.
    pub fn for_gestures(config: &BeliefConfig) -> Result<Self, FilterError> {
        BeliefFilterBuilder::from_config(NUM_GESTURES, REST, config)
            .rule(TransitionRule::OnlyReachableFrom {
                state: ROTATING,
                from: vec![ROTATION_START, ROTATING],
            })
            .rule(TransitionRule::OnlyLeadsTo {
                state: ROTATING,
                to: vec![ROTATING, ROTATION_END],
            })
            .remap(ROTATING, REST)
            .build()
    }

    pub fn n_states(&self) -> usize {
        self.belief.len()
    }

    /// Un paso forward con el vector de probabilidades del clasificador.
    ///
    /// Una observación que no suma 1 se renormaliza; valores negativos o NaN
    /// cuentan como 0. Una observación sin masa deja la creencia intacta.
    pub fn update(&mut self, observation: &[f64]) -> Result<&[f64], FilterError> {
        let n = self.n_states();
        if observation.len() != n {
            return Err(FilterError::ClassCountMismatch {
                expected: n,
                actual: observation.len(),
            });
        }

        let mut obs: Vec<f64> = observation
            .iter()
            .map(|&p| if p.is_finite() && p > 0.0 { p } else { 0.0 })
            .collect();
        normalize_row(&mut obs)?;

        let mut next = vec![0.0; n];
        for (j, slot) in next.iter_mut().enumerate() {
            let predicted: f64 = (0..n).map(|i| self.trans[i][j] * self.belief[i]).sum();
            let likelihood: f64 = self.emit[j].iter().zip(&obs).map(|(e, o)| e * o).sum();
            *slot = predicted * likelihood;
        }
        normalize_row(&mut next)?;
        self.belief = next;

        if self.history_len > 0 {
            if self.history.len() == self.history_len {
                self.history.pop_front();
            }
            self.history.push_back(self.argmax());
        }

        Ok(&self.belief)
    }

    pub fn belief(&self) -> &[f64] {
        &self.belief
    }

    /// Estado más probable ahora mismo
    pub fn argmax(&self) -> usize {
        argmax(&self.belief)
    }

    /// Argmax de cada tick, del más antiguo al más reciente
    pub fn history(&self) -> impl Iterator<Item = usize> + '_ {
        self.history.iter().copied()
    }

    pub fn transition(&self) -> &[Vec<f64>] {
        &self.trans
    }

    pub fn emission(&self) -> &[Vec<f64>] {
        &self.emit
    }

    pub fn reset(&mut self) {
        self.belief = self.start.clone();
        self.history.clear();
    }
}

/// Índice del máximo; empates al primero, NaN nunca gana
pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] || values[best].is_nan() {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    const ROW_TOLERANCE: f64 = 1e-9;

    fn assert_stochastic(m: &[Vec<f64>]) {
        for (i, row) in m.iter().enumerate() {
            let sum: f64 = row.iter().sum();
            assert!((sum - 1.0).abs() < ROW_TOLERANCE, "fila {} suma {}", i, sum);
            assert!(row.iter().all(|p| *p >= 0.0));
        }
    }

    fn two_state() -> BeliefFilter {
        BeliefFilterBuilder::new(2)
            .start_rest_prob(0.5)
            .trans_self_prob(0.9)
            .emit_self_prob(0.9)
            .build()
            .unwrap()
    }

    #[test]
    fn test_repeated_observation_sharpens_belief() {
        let mut filter = two_state();
        let mut previous = 0.5;
        for tick in 1..=5 {
            let belief = filter.update(&[1.0, 0.0]).unwrap();
            assert!(belief[0] > previous, "tick {}: {} <= {}", tick, belief[0], previous);
            previous = belief[0];
        }
        assert!(previous > 0.9);
        assert!((previous - 0.98631).abs() < 1e-4);
        assert_eq!(filter.history().collect::<Vec<_>>(), vec![0; 5]);
    }

    #[test]
    fn test_first_update_values() {
        let mut filter = two_state();
        let belief = filter.update(&[1.0, 0.0]).unwrap();
        assert!((belief[0] - 0.9).abs() < 1e-12);
        let belief = filter.update(&[1.0, 0.0]).unwrap();
        assert!((belief[0] - 0.738 / 0.756).abs() < 1e-12);
    }

    #[test]
    fn test_observation_is_renormalized() {
        let mut a = two_state();
        let mut b = two_state();
        a.update(&[1.0, 0.0]).unwrap();
        b.update(&[4.0, 0.0]).unwrap();
        assert_eq!(a.belief(), b.belief());
    }

    #[test]
    fn test_class_count_mismatch_is_rejected() {
        let mut filter = two_state();
        assert_eq!(
            filter.update(&[1.0]),
            Err(FilterError::ClassCountMismatch { expected: 2, actual: 1 })
        );
        assert_eq!(filter.belief(), &[0.5, 0.5]);
    }

    #[test]
    fn test_zero_observation_keeps_belief() {
        let mut filter = two_state();
        assert_eq!(filter.update(&[0.0, f64::NAN]), Err(FilterError::ZeroMass));
        assert_eq!(filter.belief(), &[0.5, 0.5]);
    }

    #[test]
    fn test_gesture_matrices_stochastic_after_rules() {
        let filter = BeliefFilter::for_gestures(&BeliefConfig::default()).unwrap();
        assert_stochastic(filter.transition());
        assert_stochastic(filter.emission());

        let t = filter.transition();
        for i in 0..NUM_GESTURES {
            if i != ROTATION_START && i != ROTATING {
                assert_eq!(t[i][ROTATING], 0.0, "{} -> rotando", i);
            }
        }
        for j in 0..NUM_GESTURES {
            if j != ROTATING && j != ROTATION_END {
                assert_eq!(t[ROTATING][j], 0.0);
            }
        }

        let e = filter.emission();
        assert_eq!(e[ROTATING][ROTATING], 0.0);
        assert!(e[ROTATING][REST] > 0.9);
        assert_eq!(filter.belief()[ROTATING], 0.0);
    }

    #[test]
    fn test_invalid_rules_are_rejected() {
        let err = BeliefFilterBuilder::new(3)
            .rule(TransitionRule::Forbid { from: 0, to: 5 })
            .build()
            .unwrap_err();
        assert_eq!(err, FilterError::InvalidState(5));

        let err = BeliefFilterBuilder::new(3)
            .rule(TransitionRule::OnlyLeadsTo { state: 1, to: vec![] })
            .build()
            .unwrap_err();
        assert!(matches!(err, FilterError::InvalidMatrix(_)));
    }

    #[test]
    fn test_belief_sums_to_one_under_noise() {
        let mut rng = rand::thread_rng();
        let mut filter = BeliefFilter::for_gestures(&BeliefConfig::default()).unwrap();
        for _ in 0..2000 {
            let obs: Vec<f64> = (0..NUM_GESTURES).map(|_| rng.gen::<f64>()).collect();
            let belief = filter.update(&obs).unwrap();
            let sum: f64 = belief.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
            assert!(belief.iter().all(|p| *p >= 0.0));
        }
    }

    #[test]
    fn test_history_is_bounded() {
        let mut filter = BeliefFilterBuilder::new(2).history_len(3).build().unwrap();
        for _ in 0..10 {
            filter.update(&[0.2, 0.8]).unwrap();
        }
        assert_eq!(filter.history().count(), 3);
    }

    #[test]
    fn test_argmax_ties_and_nan() {
        assert_eq!(argmax(&[0.2, 0.5, 0.5]), 1);
        assert_eq!(argmax(&[f64::NAN, 0.1]), 1);
    }
}
