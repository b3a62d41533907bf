use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::config::{ingest_capacity, ring_capacity};
use crate::recorder::Recorder;
use crate::types::{Sample, SampleSink};

/// Buffer circular acotado: al llenarse descarta la muestra más antigua
#[derive(Debug, Clone)]
pub struct RingBuffer {
    buffer: VecDeque<Sample>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Añade una muestra; devuelve la expulsada si la había
    pub fn push(&mut self, sample: Sample) -> Option<Sample> {
        self.buffer.push_back(sample);
        if self.buffer.len() > self.capacity {
            self.buffer.pop_front()
        } else {
            None
        }
    }

    pub fn extend(&mut self, samples: &[Sample]) {
        for s in samples {
            self.push(*s);
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn to_vec(&self) -> Vec<Sample> {
        self.buffer.iter().copied().collect()
    }

    /// Vacía el buffer devolviendo su contenido
    pub fn take(&mut self) -> Vec<Sample> {
        self.buffer.drain(..).collect()
    }
}

/// Ring buffers de todos los canales: ventana de inferencia + flush
struct Rings {
    window: Vec<RingBuffer>,
    flush: Vec<RingBuffer>,
    /// Muestras añadidas a cada canal desde el inicio
    appended: Vec<u64>,
}

/// Copia de la ventana de inferencia
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub channels: Vec<Vec<Sample>>,
    /// Contador monotónico de muestras añadidas por canal
    pub appended: Vec<u64>,
}

impl Snapshot {
    /// Índice absoluto de la muestra más antigua que sigue en la ventana
    pub fn first_index(&self, channel: usize) -> u64 {
        let total = self.appended.get(channel).copied().unwrap_or(0);
        let len = self.channels.get(channel).map(Vec::len).unwrap_or(0);
        total.saturating_sub(len as u64)
    }

    /// Muestras de `channel` con índice absoluto en `from..to`, recortado a
    /// lo que sigue en la ventana
    pub fn between(&self, channel: usize, from: u64, to: u64) -> &[Sample] {
        let Some(values) = self.channels.get(channel) else {
            return &[];
        };
        let first = self.first_index(channel);
        let total = first + values.len() as u64;
        let from = from.max(first);
        let to = to.min(total);
        if from >= to {
            return &[];
        }
        &values[(from - first) as usize..(to - first) as usize]
    }

    /// Longitud común de la ventana (mínimo sobre canales)
    pub fn len(&self) -> usize {
        self.channels.iter().map(Vec::len).min().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BufferStats {
    pub transferred: u64,
    pub dropped: u64,
    pub persisted: u64,
}

/// Buffer multicanal de un sensor.
///
/// Los productores empujan en colas de ingestión acotadas (una por canal);
/// la tarea de transferencia es la única que escribe en los ring buffers;
/// los lectores obtienen copias con `snapshot`.
pub struct ChannelBuffer {
    name: String,
    senders: Vec<Sender<Sample>>,
    receivers: Vec<Receiver<Sample>>,
    rings: RwLock<Rings>,
    recorder: Mutex<Recorder>,
    transferred: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelBuffer {
    pub fn new(
        name: impl Into<String>,
        n_channels: usize,
        sample_rate: f64,
        window_seconds: f64,
        flush_seconds: f64,
        recorder: Recorder,
    ) -> Self {
        let queue_cap = ingest_capacity(window_seconds, sample_rate);
        let window_cap = ring_capacity(window_seconds, sample_rate);
        let flush_cap = ring_capacity(flush_seconds, sample_rate);

        let (senders, receivers): (Vec<Sender<Sample>>, Vec<Receiver<Sample>>) =
            (0..n_channels).map(|_| bounded(queue_cap)).unzip();

        Self {
            name: name.into(),
            senders,
            receivers,
            rings: RwLock::new(Rings {
                window: vec![RingBuffer::new(window_cap); n_channels],
                flush: vec![RingBuffer::new(flush_cap); n_channels],
                appended: vec![0; n_channels],
            }),
            recorder: Mutex::new(recorder),
            transferred: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_channels(&self) -> usize {
        self.senders.len()
    }

    /// Encola una muestra sin bloquear. Con la cola llena se descarta la
    /// pendiente más antigua del canal.
    pub fn push(&self, channel: usize, sample: Sample) {
        let Some(tx) = self.senders.get(channel) else {
            debug!("[{}] canal {} fuera de rango", self.name, channel);
            return;
        };
        let mut pending = sample;
        loop {
            match tx.try_send(pending) {
                Ok(()) => return,
                Err(TrySendError::Full(s)) => {
                    if self.receivers[channel].try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            "[{}] cola del canal {} llena, descartada la más antigua",
                            self.name, channel
                        );
                    }
                    pending = s;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Longitud de la cola de ingestión de un canal
    pub fn pending(&self, channel: usize) -> usize {
        self.receivers.get(channel).map(Receiver::len).unwrap_or(0)
    }

    /// Drena todas las colas de ingestión hacia ambos ring buffers.
    /// Devuelve las muestras movidas.
    pub fn transfer(&self) -> usize {
        let drained: Vec<Vec<Sample>> = self
            .receivers
            .iter()
            .map(|rx| {
                let n = rx.len();
                rx.try_iter().take(n).collect()
            })
            .collect();

        let moved: usize = drained.iter().map(Vec::len).sum();
        if moved == 0 {
            return 0;
        }

        let mut rings = self.write_rings();
        for (ch, values) in drained.iter().enumerate() {
            rings.window[ch].extend(values);
            rings.flush[ch].extend(values);
            rings.appended[ch] += values.len() as u64;
        }
        drop(rings);

        self.transferred.fetch_add(moved as u64, Ordering::Relaxed);
        moved
    }

    /// Copia de la ventana de inferencia de todos los canales
    pub fn snapshot(&self) -> Snapshot {
        let rings = self.read_rings();
        Snapshot {
            channels: rings.window.iter().map(RingBuffer::to_vec).collect(),
            appended: rings.appended.clone(),
        }
    }

    /// Vacía el buffer de flush y lo persiste si se está grabando.
    /// Devuelve las muestras escritas.
    pub fn flush(&self) -> io::Result<usize> {
        let taken: Vec<Vec<Sample>> = {
            let mut rings = self.write_rings();
            rings.flush.iter_mut().map(RingBuffer::take).collect()
        };
        self.lock_recorder().persist(&taken)
    }

    pub fn set_recording(&self, on: bool, at: f64) -> io::Result<bool> {
        self.lock_recorder().set_recording(on, at)
    }

    pub fn is_recording(&self) -> bool {
        self.lock_recorder().is_recording()
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            transferred: self.transferred.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            persisted: self.lock_recorder().persisted(),
        }
    }

    fn read_rings(&self) -> RwLockReadGuard<'_, Rings> {
        self.rings.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_rings(&self) -> RwLockWriteGuard<'_, Rings> {
        self.rings.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_recorder(&self) -> MutexGuard<'_, Recorder> {
        self.recorder.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Permite que los decodificadores escriban directamente en las colas
impl SampleSink for &ChannelBuffer {
    fn push_sample(&mut self, channel: usize, sample: Sample) {
        ChannelBuffer::push(self, channel, sample);
    }
}
