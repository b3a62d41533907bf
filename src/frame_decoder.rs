//! Decodificador de notificaciones de la pulsera PPG.
//!
//! Cada notificación trae `[seq, capítulo, payload...]`. Los capítulos
//! `0..data_chapters` llevan 4 canales ópticos cada uno como grupos de
//! `(flag, 3 bytes big-endian)`; los bytes sobrantes se arrastran al
//! capítulo siguiente. El último capítulo de datos añade el acelerómetro
//! (3 x i16) y el capítulo de marca de tiempo llega una vez por segundo.
//!
//! Las pérdidas se rellenan con `Sample::Missing` en exactamente los canales
//! que habrían producido los capítulos de datos perdidos, de modo que todos
//! los canales reciben un valor por tick. Qué capítulos faltan lo decide el
//! capítulo que llega, no el hueco de secuencia: el hueco también cuenta
//! notificaciones de marca de tiempo, que no producen muestras.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::config::PpgConfig;
use crate::error::DecodeError;
use crate::types::{
    Sample, SampleSink, CHANNELS_PER_CHAPTER, GROUP_BYTES, OVERFLOW_FLAG, PPG_ACCEL_CHANNELS,
    PPG_ACCEL_SCALE,
};

const HEADER_BYTES: usize = 2;
const CHAPTER_BYTES: usize = CHANNELS_PER_CHAPTER * GROUP_BYTES;

/// Pérdidas acumuladas para un índice de secuencia recibido
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MissedEntry {
    /// Ticks rellenados antes de este índice
    pub ticks: u64,
    /// Segundos desde la recepción anterior
    pub elapsed: f64,
}

/// Estadísticas acumuladas del decodificador
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecoderStats {
    pub received: u64,
    pub missed: u64,
    pub duplicates: u64,
    pub decode_errors: u64,
    pub seconds: u64,
}

impl DecoderStats {
    /// Fracción de ticks perdidos sobre los esperados
    pub fn loss_rate(&self) -> f64 {
        let expected = self.received + self.missed;
        if expected == 0 {
            0.0
        } else {
            self.missed as f64 / expected as f64
        }
    }
}

pub struct FrameDecoder {
    data_chapters: usize,
    n_optical: usize,
    timestamp_chapter: u8,
    timestamp_channel: usize,

    last_seq: Option<u8>,
    /// Último capítulo de datos producido (real o sintético)
    last_chapter: Option<usize>,
    last_reception: Option<f64>,

    /// Bytes arrastrados entre capítulos
    keep: Vec<u8>,
    /// false tras una pérdida hasta el siguiente capítulo 0
    carry_valid: bool,
    /// Notificaciones perdidas aún sin reconciliar con un capítulo de datos
    unreconciled: usize,

    /// Tabla de pérdidas del ciclo de secuencia actual (0-255)
    cycle_missed: BTreeMap<u8, MissedEntry>,
    stats: DecoderStats,
}

impl FrameDecoder {
    pub fn new(config: &PpgConfig) -> Self {
        Self {
            data_chapters: config.data_chapters().max(1),
            n_optical: config.n_channels,
            timestamp_chapter: config.timestamp_chapter,
            timestamp_channel: config.timestamp_channel(),
            last_seq: None,
            last_chapter: None,
            last_reception: None,
            keep: Vec::with_capacity(CHAPTER_BYTES),
            carry_valid: false,
            unreconciled: 0,
            cycle_missed: BTreeMap::new(),
            stats: DecoderStats::default(),
        }
    }

    /// Procesa una notificación recibida en el instante `at` (segundos epoch).
    /// Devuelve cuántos capítulos de datos perdidos se rellenaron antes de ella.
    pub fn decode<S: SampleSink>(
        &mut self,
        frame: &[u8],
        at: f64,
        sink: &mut S,
    ) -> Result<usize, DecodeError> {
        if frame.len() < HEADER_BYTES {
            self.stats.decode_errors += 1;
            warn!("⚠️  Notificación demasiado corta ({} bytes)", frame.len());
            return Err(DecodeError::TooShort { len: frame.len() });
        }

        let seq = frame[0];
        let chapter = frame[1];
        let payload = &frame[HEADER_BYTES..];

        if !self.is_known_chapter(chapter) {
            self.stats.decode_errors += 1;
            warn!("⚠️  Capítulo desconocido {} (seq {})", chapter, seq);
            return Err(DecodeError::UnknownChapter(chapter));
        }

        let missing = match self.last_seq {
            Some(last) => {
                let gap = seq.wrapping_sub(last) as usize;
                if gap == 0 {
                    self.stats.duplicates += 1;
                    debug!("Notificación repetida seq {}", seq);
                    return Err(DecodeError::DuplicateSequence(seq));
                }
                if seq < last {
                    self.report_cycle();
                }
                gap - 1
            }
            None => 0,
        };

        if missing > 0 {
            self.unreconciled += missing;
            let elapsed = self.last_reception.map(|t| at - t).unwrap_or(0.0);
            let entry = self.cycle_missed.entry(seq).or_default();
            entry.ticks += missing as u64;
            entry.elapsed += elapsed;
            self.stats.missed += missing as u64;
            self.carry_valid = false;
        }

        self.last_seq = Some(seq);
        self.last_reception = Some(at);
        self.stats.received += 1;

        if chapter == self.timestamp_chapter {
            self.stats.seconds += 1;
            self.keep.clear();
            return Ok(0);
        }

        let chapter = chapter as usize;
        let filled = self.reconcile(chapter, sink);
        if chapter == 0 {
            sink.push_sample(self.timestamp_channel, Sample::Value(at));
            self.keep.clear();
            self.carry_valid = true;
        }

        let mut data = std::mem::take(&mut self.keep);
        data.extend_from_slice(payload);

        let base = chapter * CHANNELS_PER_CHAPTER;
        let values = if self.carry_valid {
            decode_groups(&data)
        } else {
            [Sample::Missing; CHANNELS_PER_CHAPTER]
        };
        for (i, value) in values.into_iter().enumerate() {
            sink.push_sample(base + i, value);
        }

        self.keep = data.get(CHAPTER_BYTES..).map(<[u8]>::to_vec).unwrap_or_default();

        if chapter == self.data_chapters - 1 {
            let accel = if self.carry_valid {
                decode_accel(&self.keep)
            } else {
                [Sample::Missing; PPG_ACCEL_CHANNELS]
            };
            for (i, value) in accel.into_iter().enumerate() {
                sink.push_sample(self.n_optical + i, value);
            }
        }

        self.last_chapter = Some(chapter);
        Ok(filled)
    }

    /// Rellena los capítulos de datos estrictamente entre el último
    /// producido y `chapter`, más los ciclos completos que quepan en las
    /// pérdidas pendientes. El resto del hueco son marcas de tiempo.
    fn reconcile<S: SampleSink>(&mut self, chapter: usize, sink: &mut S) -> usize {
        let lost = std::mem::take(&mut self.unreconciled);
        let n = self.data_chapters;
        let previous = self.last_chapter.unwrap_or(n - 1);
        let between = (chapter + n - previous - 1) % n;
        let filled = between + lost.saturating_sub(between) / n * n;
        for _ in 0..filled {
            self.fill_missing_tick(sink);
        }
        filled
    }

    fn is_known_chapter(&self, chapter: u8) -> bool {
        (chapter as usize) < self.data_chapters || chapter == self.timestamp_chapter
    }

    /// Avanza el puntero de capítulo y empuja NaN en los canales que le tocan
    fn fill_missing_tick<S: SampleSink>(&mut self, sink: &mut S) {
        let next = self
            .last_chapter
            .map(|c| (c + 1) % self.data_chapters)
            .unwrap_or(0);

        let base = next * CHANNELS_PER_CHAPTER;
        for channel in base..base + CHANNELS_PER_CHAPTER {
            sink.push_sample(channel, Sample::Missing);
        }
        if next == self.data_chapters - 1 {
            for i in 0..PPG_ACCEL_CHANNELS {
                sink.push_sample(self.n_optical + i, Sample::Missing);
            }
        }
        if next == 0 {
            sink.push_sample(self.timestamp_channel, Sample::Missing);
        }

        self.last_chapter = Some(next);
    }

    /// Informa y reinicia la tabla de pérdidas al dar la vuelta el índice
    fn report_cycle(&mut self) {
        if !self.cycle_missed.is_empty() {
            info!("📉 Mensajes perdidos en el ciclo: {:?}", self.cycle_missed);
            self.cycle_missed.clear();
        }
    }

    /// Tabla de pérdidas del ciclo en curso
    pub fn cycle_missed(&self) -> &BTreeMap<u8, MissedEntry> {
        &self.cycle_missed
    }

    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }

    pub fn seconds(&self) -> u64 {
        self.stats.seconds
    }
}

/// Decodifica 4 grupos `(flag, u24 big-endian)`; flag de overflow o bytes
/// insuficientes dan `Missing`
fn decode_groups(bytes: &[u8]) -> [Sample; CHANNELS_PER_CHAPTER] {
    let mut out = [Sample::Missing; CHANNELS_PER_CHAPTER];
    for (i, slot) in out.iter_mut().enumerate() {
        let Some(group) = bytes.get(i * GROUP_BYTES..(i + 1) * GROUP_BYTES) else {
            continue;
        };
        if group[0] == OVERFLOW_FLAG {
            continue;
        }
        let magnitude = u32::from_be_bytes([0, group[1], group[2], group[3]]);
        *slot = Sample::Value(magnitude as f64);
    }
    out
}

/// Acelerómetro de la pulsera: 3 x 16 bits en punto fijo, ±8 g
fn decode_accel(bytes: &[u8]) -> [Sample; PPG_ACCEL_CHANNELS] {
    let mut out = [Sample::Missing; PPG_ACCEL_CHANNELS];
    for (i, slot) in out.iter_mut().enumerate() {
        let Some(raw) = bytes.get(i * 2..i * 2 + 2) else {
            continue;
        };
        let mut d = u16::from_be_bytes([raw[0], raw[1]]) as i32;
        if d > 32768 {
            d -= 65536;
        }
        *slot = Sample::Value(d as f64 / 32768.0 * PPG_ACCEL_SCALE);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    const PAYLOAD: usize = 18;

    fn config() -> PpgConfig {
        PpgConfig::default()
    }

    fn sink() -> Vec<Vec<Sample>> {
        vec![Vec::new(); config().total_channels()]
    }

    fn group(value: u32) -> [u8; 4] {
        let b = value.to_be_bytes();
        [0, b[1], b[2], b[3]]
    }

    /// Construye el flujo de bytes de un ciclo completo y lo trocea en
    /// notificaciones de 18 bytes, como hace el firmware
    fn cycle_payloads(values: &[u32; 16], accel: [i16; 3]) -> Vec<Vec<u8>> {
        let mut stream = Vec::new();
        for v in values {
            stream.extend_from_slice(&group(*v));
        }
        for a in accel {
            stream.extend_from_slice(&(a as u16).to_be_bytes());
        }
        stream.resize(PAYLOAD * 4, 0);
        stream.chunks(PAYLOAD).map(|c| c.to_vec()).collect()
    }

    fn frame(seq: u8, chapter: u8, payload: &[u8]) -> Vec<u8> {
        let mut f = vec![seq, chapter];
        f.extend_from_slice(payload);
        f
    }

    fn lengths(sink: &[Vec<Sample>]) -> Vec<usize> {
        sink.iter().map(Vec::len).collect()
    }

    #[test]
    fn test_full_cycle_decodes_all_channels() {
        let values: [u32; 16] = std::array::from_fn(|i| 1000 + i as u32);
        let payloads = cycle_payloads(&values, [16384, -16384, 0]);
        let mut decoder = FrameDecoder::new(&config());
        let mut out = sink();

        for (chapter, payload) in payloads.iter().enumerate() {
            let filled = decoder
                .decode(&frame(chapter as u8, chapter as u8, payload), 100.0, &mut out)
                .unwrap();
            assert_eq!(filled, 0);
        }

        for (ch, v) in values.iter().enumerate() {
            assert_eq!(out[ch], vec![Sample::Value(*v as f64)], "canal {}", ch);
        }
        assert_eq!(out[16], vec![Sample::Value(0.5 * PPG_ACCEL_SCALE)]);
        assert_eq!(out[17], vec![Sample::Value(-0.5 * PPG_ACCEL_SCALE)]);
        assert_eq!(out[18], vec![Sample::Value(0.0)]);
        assert_eq!(out[19], vec![Sample::Value(100.0)]);
    }

    #[test]
    fn test_overflow_flag_gives_missing() {
        let mut payload = vec![0u8; PAYLOAD];
        payload[..4].copy_from_slice(&[OVERFLOW_FLAG, 0xff, 0xff, 0xff]);
        payload[4..8].copy_from_slice(&group(42));
        let mut decoder = FrameDecoder::new(&config());
        let mut out = sink();
        decoder.decode(&frame(0, 0, &payload), 1.0, &mut out).unwrap();
        assert_eq!(out[0], vec![Sample::Missing]);
        assert_eq!(out[1], vec![Sample::Value(42.0)]);
    }

    #[test]
    fn test_sequence_gap_fills_exact_ticks() {
        let payloads = cycle_payloads(&[7; 16], [0, 0, 0]);
        let mut decoder = FrameDecoder::new(&config());
        let mut out = sink();

        assert_eq!(decoder.decode(&frame(10, 0, &payloads[0]), 1.0, &mut out), Ok(0));
        assert_eq!(
            decoder.decode(&frame(10, 0, &payloads[0]), 1.1, &mut out),
            Err(DecodeError::DuplicateSequence(10))
        );
        assert_eq!(decoder.decode(&frame(13, 3, &payloads[3]), 1.5, &mut out), Ok(2));

        let lens = lengths(&out);
        assert!(lens.iter().all(|&l| l == lens[0]), "{:?}", lens);
        assert_eq!(lens[0], 1);
        // Capítulos 1 y 2 sintéticos
        assert_eq!(out[4], vec![Sample::Missing]);
        assert_eq!(out[11], vec![Sample::Missing]);

        let entry = decoder.cycle_missed()[&13];
        assert_eq!(entry.ticks, 2);
        assert!((entry.elapsed - 0.5).abs() < 1e-9);
        assert_eq!(decoder.stats().missed, 2);
        assert_eq!(decoder.stats().duplicates, 1);
    }

    #[test]
    fn test_gap_across_wraparound() {
        let payloads = cycle_payloads(&[1; 16], [0, 0, 0]);
        let mut decoder = FrameDecoder::new(&config());
        let mut out = sink();
        decoder.decode(&frame(254, 0, &payloads[0]), 0.0, &mut out).unwrap();
        let filled = decoder.decode(&frame(1, 3, &payloads[3]), 0.1, &mut out).unwrap();
        assert_eq!(filled, 2);
        assert!(decoder.cycle_missed().contains_key(&1));
    }

    #[test]
    fn test_unknown_chapter_leaves_state_untouched() {
        let payloads = cycle_payloads(&[1; 16], [0, 0, 0]);
        let mut decoder = FrameDecoder::new(&config());
        let mut out = sink();
        decoder.decode(&frame(0, 0, &payloads[0]), 0.0, &mut out).unwrap();
        let before = out.clone();

        assert_eq!(
            decoder.decode(&frame(1, 7, &payloads[1]), 0.0, &mut out),
            Err(DecodeError::UnknownChapter(7))
        );
        assert_eq!(out, before);
        assert_eq!(decoder.stats().decode_errors, 1);
        assert_eq!(decoder.stats().received, 1);
    }

    #[test]
    fn test_too_short_is_an_error() {
        let mut decoder = FrameDecoder::new(&config());
        let mut out = sink();
        assert_eq!(
            decoder.decode(&[3], 0.0, &mut out),
            Err(DecodeError::TooShort { len: 1 })
        );
    }

    #[test]
    fn test_timestamp_chapter_counts_seconds() {
        let payloads = cycle_payloads(&[5; 16], [0, 0, 0]);
        let mut decoder = FrameDecoder::new(&config());
        let mut out = sink();
        let mut seq = 0u8;
        for _ in 0..3 {
            for (chapter, payload) in payloads.iter().enumerate() {
                decoder.decode(&frame(seq, chapter as u8, payload), 0.0, &mut out).unwrap();
                seq = seq.wrapping_add(1);
            }
            decoder.decode(&frame(seq, 19, &[0; PAYLOAD]), 0.0, &mut out).unwrap();
            seq = seq.wrapping_add(1);
        }
        assert_eq!(decoder.seconds(), 3);
        assert!(lengths(&out).iter().all(|&l| l == 3));
        assert!(out[0].iter().all(|s| *s == Sample::Value(5.0)));
    }

    #[test]
    fn test_chapter_after_loss_is_missing_until_next_cycle() {
        let payloads = cycle_payloads(&[9; 16], [0, 0, 0]);
        let mut decoder = FrameDecoder::new(&config());
        let mut out = sink();
        decoder.decode(&frame(0, 0, &payloads[0]), 0.0, &mut out).unwrap();
        // Se pierde el capítulo 1: el arrastre del 2 ya no es fiable
        decoder.decode(&frame(2, 2, &payloads[2]), 0.0, &mut out).unwrap();
        assert_eq!(out[8], vec![Sample::Missing]);
        decoder.decode(&frame(3, 3, &payloads[3]), 0.0, &mut out).unwrap();
        decoder.decode(&frame(4, 0, &payloads[0]), 0.0, &mut out).unwrap();
        assert_eq!(out[0], vec![Sample::Value(9.0), Sample::Value(9.0)]);
    }

    #[test]
    fn test_random_loss_keeps_channels_aligned() {
        let payloads = cycle_payloads(&[3; 16], [100, 200, 300]);
        let mut rng = rand::thread_rng();

        for _ in 0..20 {
            let mut decoder = FrameDecoder::new(&config());
            let mut out = sink();
            let cycles = rng.gen_range(2..80);
            // 4 capítulos de datos y la marca de tiempo por ciclo
            let total = cycles * 5;
            for n in 0..total {
                let last_data = n == total - 2;
                if !last_data && n > 0 && rng.gen_bool(0.2) {
                    continue;
                }
                let chapter = match n % 5 {
                    4 => 19,
                    c => c,
                };
                let payload = payloads.get(chapter).map(Vec::as_slice).unwrap_or(&[0; PAYLOAD]);
                let _ = decoder.decode(
                    &frame((n % 256) as u8, chapter as u8, payload),
                    n as f64,
                    &mut out,
                );
            }
            let lens = lengths(&out);
            assert!(lens.iter().all(|&l| l == cycles), "{:?}", lens);
        }
    }

    #[test]
    fn test_lost_timestamp_fills_nothing() {
        let payloads = cycle_payloads(&[4; 16], [0, 0, 0]);
        let mut decoder = FrameDecoder::new(&config());
        let mut out = sink();
        for (chapter, payload) in payloads.iter().enumerate() {
            decoder.decode(&frame(chapter as u8, chapter as u8, payload), 0.0, &mut out).unwrap();
        }
        // seq 4 (capítulo 19) perdida
        assert_eq!(decoder.decode(&frame(5, 0, &payloads[0]), 1.0, &mut out), Ok(0));
        assert_eq!(out[0].len(), 2);
        assert_eq!(out[4].len(), 1);
        for (chapter, payload) in payloads.iter().enumerate().skip(1) {
            let seq = 5 + chapter as u8;
            assert_eq!(decoder.decode(&frame(seq, chapter as u8, payload), 1.0, &mut out), Ok(0));
        }

        assert!(lengths(&out).iter().all(|&l| l == 2), "{:?}", lengths(&out));
        assert_eq!(decoder.stats().missed, 1);
    }

    #[test]
    fn test_lost_cycle_and_timestamp() {
        let payloads = cycle_payloads(&[6; 16], [0, 0, 0]);
        let mut decoder = FrameDecoder::new(&config());
        let mut out = sink();
        decoder.decode(&frame(0, 0, &payloads[0]), 0.0, &mut out).unwrap();
        decoder.decode(&frame(1, 1, &payloads[1]), 0.0, &mut out).unwrap();
        // perdidos: 2, 3, 19, 0, 1, 2, 3, 19
        let filled = decoder.decode(&frame(10, 0, &payloads[0]), 2.0, &mut out).unwrap();
        assert_eq!(filled, 6);
        for (chapter, payload) in payloads.iter().enumerate().skip(1) {
            let seq = 10 + chapter as u8;
            decoder.decode(&frame(seq, chapter as u8, payload), 2.0, &mut out).unwrap();
        }
        assert!(lengths(&out).iter().all(|&l| l == 3), "{:?}", lengths(&out));
        assert_eq!(out[0][1], Sample::Missing);
        assert_eq!(out[19][1], Sample::Missing);
    }

    #[test]
    fn test_timestamp_after_loss_defers_fill() {
        let payloads = cycle_payloads(&[8; 16], [0, 0, 0]);
        let mut decoder = FrameDecoder::new(&config());
        let mut out = sink();
        decoder.decode(&frame(0, 0, &payloads[0]), 0.0, &mut out).unwrap();
        decoder.decode(&frame(1, 1, &payloads[1]), 0.0, &mut out).unwrap();
        // se pierden 2 y 3; llega la marca de tiempo
        assert_eq!(decoder.decode(&frame(4, 19, &[0; PAYLOAD]), 0.0, &mut out), Ok(0));
        assert_eq!(out[8].len(), 0);
        assert_eq!(decoder.decode(&frame(5, 0, &payloads[0]), 0.0, &mut out), Ok(2));
        assert_eq!(out[0].len(), 2);
        assert_eq!(out[19].len(), 2);
        assert!(lengths(&out[4..19]).iter().all(|&l| l == 1), "{:?}", lengths(&out));
    }
}
