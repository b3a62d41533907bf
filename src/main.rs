/*
Pulsera - telemetría PPG + IMU y filtrado de gestos en tiempo real

Reensambla las notificaciones de la pulsera óptica (BLE) y las líneas del
IMU (puerto serie), mantiene las ventanas por canal y pasa cada salida del
clasificador por la cadena creencia -> rotación -> debouncer. Los eventos
salen por stdout, un JSON por línea.

Ejemplos:
     ./target/release/pulsera --serial /dev/rfcomm0 --probabilities probs.csv
     ./target/release/pulsera --ppg-replay sesion.hex --realtime --probabilities probs.csv

Con BlueZ (compilar con --features bluez):
     ./target/release/pulsera --ble-char /org/bluez/hci0/dev_XX_XX_XX_XX_XX_XX/service0010/char0011 \
         --probabilities probs.csv

Nivel de log con RUST_LOG (default: info).
*/

use anyhow::{ensure, Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use pulsera::classifier::{Classifier, ReplayClassifier};
use pulsera::config::SessionConfig;
use pulsera::csv_loader::load_replay_csv;
use pulsera::error::SessionError;
use pulsera::labels::NUM_GESTURES;
use pulsera::link::{spawn_hex_replay, spawn_line_reader};
use pulsera::pipeline::JsonLines;
use pulsera::recorder::{DumpSink, TextDump};
use pulsera::session::{Session, SessionLinks, SessionSinks};

#[derive(Parser, Debug)]
#[command(name = "pulsera")]
#[command(about = "Telemetría PPG/IMU de la pulsera y filtrado de gestos", long_about = None)]
struct Args {
    /// Configuración JSON (los campos ausentes toman su valor por defecto)
    #[arg(long, value_name = "JSON")]
    config: Option<PathBuf>,

    /// Dispositivo serie del IMU (p.ej. /dev/rfcomm0)
    #[arg(long, value_name = "DEV")]
    serial: Option<PathBuf>,

    /// Notificaciones PPG grabadas en hexadecimal, una por línea
    #[arg(long, value_name = "FILE")]
    ppg_replay: Option<PathBuf>,

    /// Reproduce --ppg-replay al ritmo de la pulsera
    #[arg(long, default_value_t = false)]
    realtime: bool,

    /// Característica GATT de la pulsera (ruta D-Bus de BlueZ)
    #[cfg(feature = "bluez")]
    #[arg(long, value_name = "PATH", conflicts_with = "ppg_replay")]
    ble_char: Option<String>,

    /// Probabilidades del clasificador grabadas (CSV con columnas p0..pN;
    /// las columnas ax..gz se ignoran, el IMU sale del puerto serie)
    #[arg(long, value_name = "CSV")]
    probabilities: PathBuf,

    /// Prefijo de los volcados de grabación (<prefijo>_ppg.txt, <prefijo>_imu.txt)
    #[arg(long, value_name = "PREFIX")]
    record: Option<PathBuf>,

    /// Duración máxima en segundos (0 = hasta que termine la entrada)
    #[arg(long, default_value_t = 0.0)]
    duration: f64,
}

fn dump_file(prefix: &Path, sensor: &str) -> Result<Box<dyn DumpSink>> {
    let mut name = prefix.as_os_str().to_owned();
    name.push(format!("_{}.txt", sensor));
    let path = PathBuf::from(name);
    let file = File::create(&path).with_context(|| format!("No se pudo crear {:?}", path))?;
    info!("💾 Volcado {} en {:?}", sensor, path);
    Ok(Box::new(TextDump::new(BufWriter::new(file))))
}

fn open_links(args: &Args, config: &SessionConfig) -> Result<SessionLinks> {
    let mut links = SessionLinks::default();

    if let Some(path) = &args.ppg_replay {
        let file = File::open(path).with_context(|| format!("No se pudo abrir {:?}", path))?;
        let pace = args.realtime.then(|| {
            let per_second = config.ppg.sample_rate * config.ppg.data_chapters() as f64;
            Duration::from_secs_f64(1.0 / per_second)
        });
        links.ppg = Some(spawn_hex_replay("PPG", BufReader::new(file), pace)?);
        info!("🎞️  Reproduciendo notificaciones PPG desde {:?}", path);
    }

    open_ble(args, &mut links)?;

    if let Some(path) = &args.serial {
        let port = File::open(path)
            .with_context(|| format!("No se pudo abrir el puerto {:?}", path))?;
        links.imu = Some(spawn_line_reader("IMU", BufReader::new(port))?);
        info!("🔌 IMU en {:?}", path);
    }

    ensure!(
        links.ppg.is_some() || links.imu.is_some(),
        "Indica al menos una entrada (--serial, --ppg-replay o --ble-char)"
    );
    Ok(links)
}

#[cfg(feature = "bluez")]
fn open_ble(args: &Args, links: &mut SessionLinks) -> Result<()> {
    if let Some(char_path) = &args.ble_char {
        let stop = links.stop.clone();
        links.ppg = Some(pulsera::ble::spawn_gatt_notifications(char_path, stop)?);
    }
    Ok(())
}

#[cfg(not(feature = "bluez"))]
fn open_ble(_args: &Args, _links: &mut SessionLinks) -> Result<()> {
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };

    let classifier = ReplayClassifier::new(load_replay_csv(&args.probabilities)?);
    ensure!(
        classifier.n_classes() == NUM_GESTURES,
        "El CSV tiene {} clases; se esperaban {}",
        classifier.n_classes(),
        NUM_GESTURES
    );
    info!(
        "📈 {} inferencias grabadas desde {:?}",
        classifier.remaining(),
        args.probabilities
    );

    let links = open_links(&args, &config)?;
    let replaying =
        args.ppg_replay.is_some() || args.serial.as_ref().is_some_and(|p| p.is_file());

    let (ppg_dump, imu_dump) = match &args.record {
        Some(prefix) => (
            links.ppg.is_some().then(|| dump_file(prefix, "ppg")).transpose()?,
            links.imu.is_some().then(|| dump_file(prefix, "imu")).transpose()?,
        ),
        None => (None, None),
    };

    let session = Session::start(
        &config,
        links,
        Box::new(classifier),
        SessionSinks {
            events: Box::new(JsonLines::new(io::stdout())),
            ppg_dump,
            imu_dump,
        },
    )?;
    if args.record.is_some() {
        session.set_recording(true);
    }

    if args.duration > 0.0 {
        let stop = session.stop_signal();
        if !stop.wait_timeout(Duration::from_secs_f64(args.duration)) {
            info!("⏱️  Duración alcanzada, deteniendo la sesión");
            session.stop();
        }
    }

    let mut report = session.wait();
    if replaying && matches!(report.failure, Some(SessionError::LinkClosed)) {
        info!("🏁 Fin de la entrada grabada");
        report.failure = None;
    }
    report.log_summary();

    match report.failure {
        Some(failure) => Err(failure.into()),
        None => Ok(()),
    }
}
