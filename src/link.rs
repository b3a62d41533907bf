//! Fuentes de datos de los enlaces. Cada fuente lee en un hilo propio
//! (desacoplado) y entrega lo recibido por un canal; así el contexto de
//! ingestión puede esperar con timeout y atender la señal de parada aunque
//! la lectura del dispositivo esté bloqueada.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::io::{self, BufRead};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::now_secs;

const LINK_QUEUE: usize = 1024;
/// Errores de lectura seguidos antes de dar el enlace por perdido
const MAX_CONSECUTIVE_ERRORS: usize = 10;

/// Dato recibido con su instante de recepción (segundos epoch)
#[derive(Debug, Clone, PartialEq)]
pub struct Received<T> {
    pub data: T,
    pub at: f64,
}

/// Lee líneas de `reader` (p.ej. `/dev/rfcomm0`) en un hilo desacoplado.
/// El canal se cierra al llegar a EOF o cuando el enlace falla de forma
/// persistente.
pub fn spawn_line_reader<R>(name: &str, reader: R) -> io::Result<Receiver<Received<String>>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = bounded(LINK_QUEUE);
    let label = name.to_string();
    thread::Builder::new()
        .name(format!("link-{}", name))
        .spawn(move || read_lines(&label, reader, tx, |line| Some(line)))?;
    Ok(rx)
}

/// Reproduce notificaciones grabadas en hexadecimal, una por línea,
/// opcionalmente al ritmo `pace`
pub fn spawn_hex_replay<R>(
    name: &str,
    reader: R,
    pace: Option<Duration>,
) -> io::Result<Receiver<Received<Vec<u8>>>>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = bounded(LINK_QUEUE);
    let label = name.to_string();
    thread::Builder::new()
        .name(format!("link-{}", name))
        .spawn(move || {
            read_lines(&label, reader, tx, |line| {
                if let Some(pace) = pace {
                    thread::sleep(pace);
                }
                match parse_hex(line.trim()) {
                    Some(bytes) if !bytes.is_empty() => Some(bytes),
                    Some(_) => None,
                    None => {
                        warn!("⚠️  [{}] línea hexadecimal inválida: {:?}", label, line);
                        None
                    }
                }
            })
        })?;
    Ok(rx)
}

fn read_lines<R, T, F>(name: &str, mut reader: R, tx: Sender<Received<T>>, mut convert: F)
where
    R: BufRead,
    F: FnMut(String) -> Option<T>,
{
    let mut line = String::new();
    let mut errors = 0;
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => {
                debug!("[{}] fin del enlace", name);
                return;
            }
            Ok(_) => {
                errors = 0;
                let at = now_secs();
                let text = line.trim_end_matches(['\r', '\n']).to_string();
                let Some(data) = convert(text) else {
                    continue;
                };
                if tx.send(Received { data, at }).is_err() {
                    return;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(e) => {
                errors += 1;
                warn!("⚠️  [{}] error de lectura: {}", name, e);
                if errors >= MAX_CONSECUTIVE_ERRORS {
                    warn!("❌ [{}] enlace perdido tras {} errores", name, errors);
                    return;
                }
            }
        }
    }
}

/// "0a1bff" -> [0x0a, 0x1b, 0xff]; admite separadores de espacio
pub fn parse_hex(text: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}
