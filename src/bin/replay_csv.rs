use std::path::PathBuf;

use anyhow::{ensure, Result};
use clap::Parser;
use pulsera::config::SessionConfig;
use pulsera::csv_loader::load_replay_csv;
use pulsera::labels::{label, NUM_GESTURES};
use pulsera::pipeline::{EventSink, GesturePipeline, JsonLines};

/// Pasa una secuencia grabada de probabilidades por la cadena de filtros,
/// sin enlaces ni hilos
#[derive(Parser, Debug)]
#[command(name = "replay_csv")]
struct Args {
    /// CSV con columnas p0..pN y, opcionalmente, ax,ay,az,gx,gy,gz
    csv: PathBuf,

    /// Configuración JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Imprime la creencia de cada tick
    #[arg(long, default_value_t = false)]
    dump_belief: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    eprintln!("🎞️  Reproduciendo probabilidades desde {:?}", args.csv);

    let config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    let rows = load_replay_csv(&args.csv)?;
    ensure!(
        rows[0].probs.len() == NUM_GESTURES,
        "El CSV tiene {} clases; se esperaban {}",
        rows[0].probs.len(),
        NUM_GESTURES
    );

    let mut pipeline = GesturePipeline::new(&config)?;
    let mut events = JsonLines::new(std::io::stdout());
    let period = config.inference_period().as_secs_f64();
    let mut confirmed = 0;
    let mut rotations = 0;

    for (tick, row) in rows.iter().enumerate() {
        if let Some(imu) = &row.imu {
            pipeline.feed_imu(imu);
        }
        let out = pipeline.step(&row.probs)?;

        if args.dump_belief {
            let belief: Vec<String> = out.belief.iter().map(|p| format!("{:.3}", p)).collect();
            eprintln!(
                "{:>6} {:<15} [{}]",
                tick,
                label(out.state).unwrap_or("?"),
                belief.join(" ")
            );
        }

        if out.confirmed.as_ref().is_some_and(|c| c.announce) {
            confirmed += 1;
        }
        if out.rotation.is_some() {
            rotations += 1;
        }
        if let Some(event) = out.event(tick as f64 * period) {
            events.publish(&event)?;
        }
    }

    eprintln!(
        "\n✅ {} ticks, {} gestos anunciados, {} ticks con giro",
        rows.len(),
        confirmed,
        rotations
    );
    Ok(())
}
