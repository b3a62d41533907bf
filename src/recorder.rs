//! Frontera de persistencia: volcado de texto del buffer de flush.
//!
//! Formato por ciclo de flush, una línea por canal:
//! `"<canal> v v v ..."`, con `nan` para muestras perdidas. Los cambios de
//! grabación escriben `start time: <t>` / `end time: <t>`.

use std::io::{self, Write};
use tracing::info;

use crate::types::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Start,
    End,
}

/// Destino de los volcados
pub trait DumpSink: Send {
    fn marker(&mut self, marker: Marker, at: f64) -> io::Result<()>;
    fn channels(&mut self, channels: &[Vec<Sample>]) -> io::Result<()>;
}

/// Volcado de texto plano sobre cualquier `Write`
pub struct TextDump<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> TextDump<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> DumpSink for TextDump<W> {
    fn marker(&mut self, marker: Marker, at: f64) -> io::Result<()> {
        match marker {
            Marker::Start => writeln!(self.out, "start time: {}", at)?,
            Marker::End => writeln!(self.out, "end time: {}", at)?,
        }
        self.out.flush()
    }

    fn channels(&mut self, channels: &[Vec<Sample>]) -> io::Result<()> {
        for (idx, values) in channels.iter().enumerate() {
            write!(self.out, "{}", idx)?;
            for v in values {
                write!(self.out, " {}", v)?;
            }
            writeln!(self.out)?;
        }
        self.out.flush()
    }
}

/// Estado de grabación + destino opcional
pub struct Recorder {
    sink: Option<Box<dyn DumpSink>>,
    recording: bool,
    persisted: u64,
}

impl Recorder {
    pub fn new(sink: Option<Box<dyn DumpSink>>) -> Self {
        Self {
            sink,
            recording: false,
            persisted: 0,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Muestras persistidas desde el inicio
    pub fn persisted(&self) -> u64 {
        self.persisted
    }

    /// Cambia el estado de grabación. Solo las transiciones escriben marcador.
    /// Devuelve si hubo transición.
    pub fn set_recording(&mut self, on: bool, at: f64) -> io::Result<bool> {
        if on == self.recording {
            return Ok(false);
        }
        self.recording = on;
        if let Some(sink) = self.sink.as_mut() {
            let marker = if on { Marker::Start } else { Marker::End };
            sink.marker(marker, at)?;
        }
        info!(
            "{} Grabación {}",
            if on { "🔴" } else { "⏹️ " },
            if on { "iniciada" } else { "detenida" }
        );
        Ok(true)
    }

    /// Persiste un ciclo de flush si se está grabando
    pub fn persist(&mut self, channels: &[Vec<Sample>]) -> io::Result<usize> {
        if !self.recording || channels.iter().all(Vec::is_empty) {
            return Ok(0);
        }
        let Some(sink) = self.sink.as_mut() else {
            return Ok(0);
        };
        sink.channels(channels)?;
        let n: usize = channels.iter().map(Vec::len).sum();
        self.persisted += n as u64;
        Ok(n)
    }
}
