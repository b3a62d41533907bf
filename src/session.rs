//! Sesión de sensado: contextos de larga duración (ingestión por enlace,
//! transferencia, flush, inferencia) que solo comparten los ChannelBuffer y
//! una señal de parada común.

use crossbeam_channel::{bounded, select, tick, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::channel_buffer::{BufferStats, ChannelBuffer, Snapshot};
use crate::classifier::{Classifier, ClassifierInput, Window};
use crate::config::SessionConfig;
use crate::error::{ClassifierError, SessionError};
use crate::frame_decoder::{DecoderStats, FrameDecoder};
use crate::link::Received;
use crate::pipeline::{EventSink, GesturePipeline};
use crate::recorder::{DumpSink, Recorder};
use crate::serial_parser::{ImuReader, ImuStats};
use crate::types::{now_secs, ImuSample, Sample, IMU_AX, IMU_GX};

/// Señal de parada de toda la sesión. Se dispara soltando el único
/// `Sender`: todos los receptores la ven a la vez, también dentro de
/// `select!`.
#[derive(Clone)]
pub struct StopSignal {
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    observed: Receiver<()>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            trigger: Arc::new(Mutex::new(Some(tx))),
            observed: rx,
        }
    }

    pub fn stop(&self) {
        self.trigger.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.observed.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Espera hasta `timeout`; devuelve true si se pidió parar
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.observed.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    /// Receptor para usar en `select!`
    pub fn receiver(&self) -> &Receiver<()> {
        &self.observed
    }
}

/// Enlaces de entrada de una sesión. Los hilos lectores que no terminan
/// solos al cerrarse su canal pueden vigilar `stop`, que pasa a ser la
/// señal de parada de la sesión.
#[derive(Default)]
pub struct SessionLinks {
    pub ppg: Option<Receiver<Received<Vec<u8>>>>,
    pub imu: Option<Receiver<Received<String>>>,
    pub stop: StopSignal,
}

/// Destinos de salida de una sesión
pub struct SessionSinks {
    pub events: Box<dyn EventSink>,
    pub ppg_dump: Option<Box<dyn DumpSink>>,
    pub imu_dump: Option<Box<dyn DumpSink>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InferenceStats {
    pub ticks: u64,
    pub skipped: u64,
    pub classifier_errors: u64,
    pub events: u64,
    pub announced: u64,
}

/// Estadísticas finales de la sesión
#[derive(Debug, Default)]
pub struct SessionReport {
    pub ppg: Option<DecoderStats>,
    pub imu: Option<ImuStats>,
    pub ppg_buffer: Option<BufferStats>,
    pub imu_buffer: Option<BufferStats>,
    pub inference: InferenceStats,
    pub failure: Option<SessionError>,
}

impl SessionReport {
    pub fn log_summary(&self) {
        info!("📊 Estadísticas finales de la sesión");
        if let Some(ppg) = &self.ppg {
            info!(
                "   [PPG] recibidas={} perdidas={} ({:.2}%) repetidas={} errores={} segundos={}",
                ppg.received,
                ppg.missed,
                ppg.loss_rate() * 100.0,
                ppg.duplicates,
                ppg.decode_errors,
                ppg.seconds
            );
        }
        if let Some(buf) = &self.ppg_buffer {
            info!("   [PPG] descartadas por cola llena={}", buf.dropped);
        }
        if let Some(imu) = &self.imu {
            info!(
                "   [IMU] muestras={} pérdida de paquetes={:.2}% pérdida de datos={:.2}% líneas inválidas={}",
                imu.samples,
                imu.package_loss * 100.0,
                imu.data_loss * 100.0,
                imu.bad_lines
            );
        }
        if let Some(buf) = &self.imu_buffer {
            info!("   [IMU] descartadas por cola llena={}", buf.dropped);
        }
        info!(
            "   [Inferencia] ticks={} omitidos={} errores={} eventos={}",
            self.inference.ticks,
            self.inference.skipped,
            self.inference.classifier_errors,
            self.inference.events
        );
        if let Some(failure) = &self.failure {
            error!("❌ La sesión terminó con error: {}", failure);
        }
    }
}

enum ContextReport {
    Ppg(DecoderStats),
    Imu(ImuStats),
    Inference(InferenceStats),
    Done,
}

/// Primer fallo terminal de cualquier contexto
#[derive(Clone, Default)]
struct FailureSlot(Arc<Mutex<Option<SessionError>>>);

impl FailureSlot {
    fn set(&self, failure: SessionError) {
        let mut slot = self.lock();
        if slot.is_none() {
            *slot = Some(failure);
        }
    }

    fn take(&self) -> Option<SessionError> {
        self.lock().take()
    }

    fn lock(&self) -> MutexGuard<'_, Option<SessionError>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct Session {
    stop: StopSignal,
    failure: FailureSlot,
    ppg_buffer: Option<Arc<ChannelBuffer>>,
    imu_buffer: Option<Arc<ChannelBuffer>>,
    contexts: Vec<(&'static str, JoinHandle<ContextReport>)>,
}

impl Session {
    /// Arranca todos los contextos
    pub fn start(
        config: &SessionConfig,
        links: SessionLinks,
        classifier: Box<dyn Classifier>,
        sinks: SessionSinks,
    ) -> Result<Self, SessionError> {
        let pipeline = GesturePipeline::new(config)?;
        let window_len = classifier.window_len();
        if window_len > 0 && window_len != config.inference.window_len {
            warn!(
                "⚠️  El clasificador pide ventanas de {} muestras (configuradas {})",
                window_len, config.inference.window_len
            );
        }
        let stop = links.stop.clone();
        let failure = FailureSlot::default();

        let ppg_buffer = links.ppg.as_ref().map(|_| {
            Arc::new(ChannelBuffer::new(
                "PPG",
                config.ppg.total_channels(),
                config.ppg.sample_rate,
                config.ppg.window_seconds,
                config.ppg.flush_seconds,
                Recorder::new(sinks.ppg_dump),
            ))
        });
        let imu_buffer = links.imu.as_ref().map(|_| {
            Arc::new(ChannelBuffer::new(
                "IMU",
                config.imu.total_channels(),
                config.imu.sample_rate,
                config.imu.window_seconds,
                config.imu.flush_seconds,
                Recorder::new(sinks.imu_dump),
            ))
        });

        let mut session = Self {
            stop,
            failure,
            ppg_buffer,
            imu_buffer,
            contexts: Vec::new(),
        };

        if let (Some(link), Some(buffer)) = (links.ppg, session.ppg_buffer.clone()) {
            let decoder = FrameDecoder::new(&config.ppg);
            let ctx = IngestContext::new(&session, link, config.buffer.io_wait());
            session.spawn("ppg-ingest", move || ctx.run_ppg(decoder, buffer))?;
        }
        if let (Some(link), Some(buffer)) = (links.imu, session.imu_buffer.clone()) {
            let reader = ImuReader::new(config.imu.gyro_divisor, config.imu.samples_per_package);
            let ctx = IngestContext::new(&session, link, config.buffer.io_wait());
            session.spawn("imu-ingest", move || ctx.run_imu(reader, buffer))?;
        }

        let buffers = session.buffers();
        {
            let stop = session.stop.clone();
            let buffers = buffers.clone();
            let period = config.buffer.transfer_period();
            session.spawn("transfer", move || run_transfer(stop, buffers, period))?;
        }
        if let Some(buffer) = session.ppg_buffer.clone() {
            let stop = session.stop.clone();
            let period = flush_period(config.ppg.flush_seconds);
            session.spawn("ppg-flush", move || run_flush(stop, buffer, period))?;
        }
        if let Some(buffer) = session.imu_buffer.clone() {
            let stop = session.stop.clone();
            let period = flush_period(config.imu.flush_seconds);
            session.spawn("imu-flush", move || run_flush(stop, buffer, period))?;
        }
        {
            let ctx = InferenceContext {
                stop: session.stop.clone(),
                failure: session.failure.clone(),
                ppg: session.ppg_buffer.clone(),
                imu: session.imu_buffer.clone(),
                classifier,
                pipeline,
                events: sinks.events,
                stats: InferenceStats::default(),
            };
            let period = config.inference_period();
            session.spawn("inference", move || ctx.run(period))?;
        }

        info!("🚀 Sesión iniciada con {} contextos", session.contexts.len());
        Ok(session)
    }

    fn spawn<F>(&mut self, name: &'static str, f: F) -> Result<(), SessionError>
    where
        F: FnOnce() -> ContextReport + Send + 'static,
    {
        match thread::Builder::new().name(name.into()).spawn(f) {
            Ok(handle) => {
                self.contexts.push((name, handle));
                Ok(())
            }
            Err(e) => {
                // los contextos ya lanzados no deben quedar huérfanos
                self.stop.stop();
                Err(e.into())
            }
        }
    }

    fn buffers(&self) -> Vec<Arc<ChannelBuffer>> {
        self.ppg_buffer.iter().chain(self.imu_buffer.iter()).cloned().collect()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn ppg_buffer(&self) -> Option<&Arc<ChannelBuffer>> {
        self.ppg_buffer.as_ref()
    }

    pub fn imu_buffer(&self) -> Option<&Arc<ChannelBuffer>> {
        self.imu_buffer.as_ref()
    }

    /// Activa o desactiva la grabación en todos los buffers
    pub fn set_recording(&self, on: bool) {
        let at = now_secs();
        for buffer in self.buffers() {
            if let Err(e) = buffer.set_recording(on, at) {
                warn!("⚠️  [{}] no se pudo escribir el marcador: {}", buffer.name(), e);
            }
        }
    }

    /// Espera a que todos los contextos terminen y reúne las estadísticas
    pub fn wait(mut self) -> SessionReport {
        let mut report = SessionReport::default();
        let mut panicked = None;

        for (name, handle) in std::mem::take(&mut self.contexts) {
            match handle.join() {
                Ok(ContextReport::Ppg(stats)) => report.ppg = Some(stats),
                Ok(ContextReport::Imu(stats)) => report.imu = Some(stats),
                Ok(ContextReport::Inference(stats)) => report.inference = stats,
                Ok(ContextReport::Done) => {}
                Err(_) => {
                    error!("❌ El contexto {} terminó con pánico", name);
                    self.stop.stop();
                    panicked.get_or_insert(SessionError::Thread(name));
                }
            }
        }

        // Con la última transferencia hecha: volcado final y marcador de fin
        let buffers = self.buffers();
        flush_all(&buffers);
        let at = now_secs();
        for buffer in &buffers {
            if let Err(e) = buffer.set_recording(false, at) {
                warn!("⚠️  [{}] no se pudo cerrar la grabación: {}", buffer.name(), e);
            }
        }

        report.ppg_buffer = self.ppg_buffer.as_ref().map(|b| b.stats());
        report.imu_buffer = self.imu_buffer.as_ref().map(|b| b.stats());
        report.failure = self.failure.take().or(panicked);
        report
    }

    /// Pide la parada y espera
    pub fn shutdown(self) -> SessionReport {
        self.stop();
        self.wait()
    }
}

/// Contexto de ingestión de un enlace
struct IngestContext<T> {
    stop: StopSignal,
    failure: FailureSlot,
    link: Receiver<Received<T>>,
    io_wait: Duration,
}

impl<T> IngestContext<T> {
    fn new(session: &Session, link: Receiver<Received<T>>, io_wait: Duration) -> Self {
        Self {
            stop: session.stop.clone(),
            failure: session.failure.clone(),
            link,
            io_wait,
        }
    }

    /// Bucle común: entrega cada dato a `handle` hasta la parada o el
    /// cierre del enlace
    fn run<F: FnMut(Received<T>)>(&self, name: &str, mut handle: F) {
        loop {
            select! {
                recv(self.stop.receiver()) -> _ => break,
                recv(self.link) -> msg => match msg {
                    Ok(received) => handle(received),
                    Err(_) => {
                        warn!("🔌 [{}] enlace cerrado", name);
                        self.failure.set(SessionError::LinkClosed);
                        self.stop.stop();
                        break;
                    }
                },
                default(self.io_wait) => debug!("[{}] enlace sin datos", name),
            }
        }
        debug!("[{}] ingestión terminada", name);
    }
}

impl IngestContext<Vec<u8>> {
    fn run_ppg(self, mut decoder: FrameDecoder, buffer: Arc<ChannelBuffer>) -> ContextReport {
        self.run("PPG", |received| {
            let mut sink = &*buffer;
            if let Err(e) = decoder.decode(&received.data, received.at, &mut sink) {
                debug!("[PPG] notificación descartada: {}", e);
            }
        });
        ContextReport::Ppg(decoder.stats().clone())
    }
}

impl IngestContext<String> {
    fn run_imu(self, mut reader: ImuReader, buffer: Arc<ChannelBuffer>) -> ContextReport {
        self.run("IMU", |received| {
            let mut sink = &*buffer;
            reader.handle_line(&received.data, received.at, &mut sink);
        });
        ContextReport::Imu(reader.stats())
    }
}

fn run_transfer(stop: StopSignal, buffers: Vec<Arc<ChannelBuffer>>, period: Duration) -> ContextReport {
    let ticker = tick(period);
    loop {
        select! {
            recv(stop.receiver()) -> _ => break,
            recv(ticker) -> _ => {
                for buffer in &buffers {
                    buffer.transfer();
                }
            }
        }
    }
    for buffer in &buffers {
        buffer.transfer();
    }
    ContextReport::Done
}

fn flush_period(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds.max(0.1))
}

/// Cada buffer se vacía a su propio ritmo
fn run_flush(stop: StopSignal, buffer: Arc<ChannelBuffer>, period: Duration) -> ContextReport {
    let ticker = tick(period);
    loop {
        select! {
            recv(stop.receiver()) -> _ => break,
            recv(ticker) -> _ => flush_all(std::slice::from_ref(&buffer)),
        }
    }
    ContextReport::Done
}

fn flush_all(buffers: &[Arc<ChannelBuffer>]) {
    for buffer in buffers {
        if let Err(e) = buffer.flush() {
            warn!("⚠️  [{}] fallo al persistir: {}", buffer.name(), e);
        }
    }
}

struct InferenceContext {
    stop: StopSignal,
    failure: FailureSlot,
    ppg: Option<Arc<ChannelBuffer>>,
    imu: Option<Arc<ChannelBuffer>>,
    classifier: Box<dyn Classifier>,
    pipeline: GesturePipeline,
    events: Box<dyn EventSink>,
    stats: InferenceStats,
}

impl InferenceContext {
    fn run(mut self, period: Duration) -> ContextReport {
        let ticker = tick(period);
        let mut imu_seen = 0u64;

        loop {
            select! {
                recv(self.stop.receiver()) -> _ => break,
                recv(ticker) -> _ => {
                    if let Err(failure) = self.tick(&mut imu_seen) {
                        self.failure.set(failure);
                        self.stop.stop();
                        break;
                    }
                }
            }
        }
        ContextReport::Inference(self.stats)
    }

    /// Un periodo: copia, clasifica y filtra
    fn tick(&mut self, imu_seen: &mut u64) -> Result<(), SessionError> {
        let imu_snapshot = self.imu.as_ref().map(|b| b.snapshot());
        if let Some(snapshot) = &imu_snapshot {
            let (fresh, upto) = fresh_imu(snapshot, *imu_seen);
            for sample in &fresh {
                self.pipeline.feed_imu(sample);
            }
            *imu_seen = upto;
        }

        let input = match self.build_input(imu_snapshot.as_ref()) {
            Ok(input) => input,
            Err(ClassifierError::NotEnoughSamples { .. }) => {
                self.stats.skipped += 1;
                return Ok(());
            }
            Err(e) => {
                self.stats.classifier_errors += 1;
                warn!("⚠️  [Inferencia] {}", e);
                return Ok(());
            }
        };

        let probs = match self.classifier.classify(&input) {
            Ok(probs) => probs,
            Err(ClassifierError::Exhausted) => {
                info!("⏹️  Clasificador agotado, fin de la sesión");
                self.stop.stop();
                return Ok(());
            }
            Err(e) => {
                self.stats.classifier_errors += 1;
                warn!("⚠️  [Inferencia] clasificador: {}", e);
                return Ok(());
            }
        };

        let output = self.pipeline.step(&probs)?;
        self.stats.ticks += 1;

        if let Some(event) = output.event(now_secs()) {
            if event.gesture.as_ref().is_some_and(|g| g.announce) {
                self.stats.announced += 1;
            }
            self.stats.events += 1;
            if let Err(e) = self.events.publish(&event) {
                warn!("⚠️  [Inferencia] no se pudo publicar el evento: {}", e);
            }
        }
        Ok(())
    }

    fn build_input(&self, imu: Option<&Snapshot>) -> Result<ClassifierInput, ClassifierError> {
        let len = self.classifier.window_len();
        if len == 0 {
            return Ok(ClassifierInput::default());
        }
        let ppg = match &self.ppg {
            Some(buffer) => Window::from_snapshot(&buffer.snapshot(), len)?,
            None => Window::default(),
        };
        let imu = imu.map(|s| Window::from_snapshot(s, len)).transpose()?;
        Ok(ClassifierInput { ppg, imu })
    }
}

/// Muestras del IMU con índice absoluto en `seen..upto`, donde `upto` es
/// el mínimo de `appended` entre los seis canales de movimiento: un tick a
/// medio transferir se deja para la siguiente inferencia. Devuelve también
/// `upto`.
fn fresh_imu(snapshot: &Snapshot, seen: u64) -> (Vec<ImuSample>, u64) {
    let motion = IMU_AX..IMU_GX + 3;
    let appended = |c: usize| snapshot.appended.get(c).copied().unwrap_or(0);
    let upto = motion.clone().map(appended).min().unwrap_or(0).max(seen);
    // lo que ya salió de alguna ventana no se puede emparejar
    let from = motion
        .clone()
        .map(|c| snapshot.first_index(c))
        .max()
        .unwrap_or(0)
        .max(seen)
        .min(upto);

    let tails: Vec<&[Sample]> = motion.map(|c| snapshot.between(c, from, upto)).collect();
    let n = (upto - from) as usize;
    if tails.iter().any(|t| t.len() != n) {
        return (Vec::new(), upto);
    }

    let samples = (0..n)
        .map(|k| {
            let at = |c: usize| tails[c - IMU_AX][k].as_f64();
            ImuSample {
                acc: [at(IMU_AX), at(IMU_AX + 1), at(IMU_AX + 2)],
                gyro: [at(IMU_GX), at(IMU_GX + 1), at(IMU_GX + 2)],
            }
        })
        .collect();
    (samples, upto)
}
