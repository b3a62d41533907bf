use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use csv::ReaderBuilder;

use crate::classifier::ReplayRow;
use crate::types::ImuSample;

const IMU_COLUMNS: [&str; 6] = ["ax", "ay", "az", "gx", "gy", "gz"];

/// Carga una secuencia de probabilidades desde un CSV con columnas
/// `p0,p1,...,pN` y, opcionalmente, `ax,ay,az,gx,gy,gz` (m/s², deg/s).
/// El resto de columnas se ignora.
pub fn load_replay_csv(path: impl AsRef<Path>) -> Result<Vec<ReplayRow>> {
    let path = path.as_ref();
    let reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("No se pudo abrir el CSV {:?}", path))?;
    read_replay(reader).with_context(|| format!("CSV inválido {:?}", path))
}

/// Igual que `load_replay_csv` sobre cualquier lector
pub fn read_replay<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<Vec<ReplayRow>> {
    let headers = reader.headers().context("Cabecera ilegible")?.clone();

    let mut prob_cols: Vec<(usize, usize)> = headers
        .iter()
        .enumerate()
        .filter_map(|(col, name)| {
            let idx = name.trim().strip_prefix('p')?.parse::<usize>().ok()?;
            Some((idx, col))
        })
        .collect();
    prob_cols.sort_unstable();

    if prob_cols.is_empty() {
        bail!("No hay columnas de probabilidad p0..pN");
    }
    for (expected, (idx, _)) in prob_cols.iter().enumerate() {
        ensure!(
            *idx == expected,
            "Columnas de probabilidad no contiguas: falta p{}",
            expected
        );
    }

    let imu_cols: Option<Vec<usize>> = IMU_COLUMNS
        .iter()
        .map(|name| headers.iter().position(|h| h.trim() == *name))
        .collect();

    let mut rows = Vec::new();
    for (row_idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("Fila {} inválida", row_idx + 1))?;

        let probs = prob_cols
            .iter()
            .map(|(idx, col)| parse_cell(&record, *col, row_idx, &format!("p{}", idx)))
            .collect::<Result<Vec<f64>>>()?;

        let imu = match &imu_cols {
            Some(cols) => {
                let mut v = [0.0; 6];
                for (slot, (col, name)) in v.iter_mut().zip(cols.iter().zip(IMU_COLUMNS)) {
                    *slot = parse_cell(&record, *col, row_idx, name)?;
                }
                Some(ImuSample {
                    acc: [v[0], v[1], v[2]],
                    gyro: [v[3], v[4], v[5]],
                })
            }
            None => None,
        };

        rows.push(ReplayRow { probs, imu });
    }

    ensure!(!rows.is_empty(), "El CSV no contiene datos");
    Ok(rows)
}

fn parse_cell(record: &csv::StringRecord, col: usize, row_idx: usize, name: &str) -> Result<f64> {
    let cell = record
        .get(col)
        .with_context(|| format!("Fila {}: falta la columna {}", row_idx + 1, name))?;
    cell.trim()
        .parse::<f64>()
        .with_context(|| format!("Fila {}: {} inválido ({:?})", row_idx + 1, name, cell))
}
