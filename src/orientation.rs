use std::collections::VecDeque;

use crate::config::OrientationConfig;
use crate::types::ImuSample;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quaternion {
    pub const IDENTITY: Self = Self {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    /// Rotación de `angle_deg` grados alrededor de `axis`
    pub fn from_axis_angle(axis: [f64; 3], angle_deg: f64) -> Self {
        let norm = (axis[0] * axis[0] + axis[1] * axis[1] + axis[2] * axis[2])
            .sqrt()
            .max(1e-12);
        let half = angle_deg.to_radians() / 2.0;
        let s = half.sin() / norm;
        Self::new(half.cos(), axis[0] * s, axis[1] * s, axis[2] * s)
    }

    /// Orientación inicial a partir de la gravedad: roll y pitch, yaw = 0
    pub fn from_gravity(acc: [f64; 3]) -> Option<Self> {
        let [ax, ay, az] = acc;
        if (ax * ax + ay * ay + az * az).sqrt() < 1e-9 {
            return None;
        }
        let roll = ay.atan2(az);
        let pitch = (-ax).atan2((ay * ay + az * az).sqrt());
        let (sr, cr) = (roll / 2.0).sin_cos();
        let (sp, cp) = (pitch / 2.0).sin_cos();
        Some(Self::new(cr * cp, sr * cp, cr * sp, -sr * sp).normalized())
    }

    pub fn norm(self) -> f64 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn normalized(self) -> Self {
        let norm = self.norm().max(1e-12);
        Self {
            w: self.w / norm,
            x: self.x / norm,
            y: self.y / norm,
            z: self.z / norm,
        }
    }

    pub fn conjugate(self) -> Self {
        Self {
            w: self.w,
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }

    pub fn mul(self, rhs: Self) -> Self {
        Self {
            w: self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
            x: self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            y: self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            z: self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
        }
    }

    fn is_finite(self) -> bool {
        self.w.is_finite() && self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Eje de referencia para el signo del ángulo de rotación
pub const REFERENCE_AXIS: [f64; 3] = [0.0, 1.0, 0.0];

/// Lleva un ángulo en grados a [-180, 180)
pub fn wrap_degrees(angle: f64) -> f64 {
    (angle + 180.0).rem_euclid(360.0) - 180.0
}

/// Ángulo (grados) de la rotación relativa `to * from⁻¹`, con el signo de
/// la proyección de su eje sobre `REFERENCE_AXIS`
pub fn signed_rotation_angle(from: Quaternion, to: Quaternion) -> f64 {
    let rel = to.normalized().mul(from.normalized().conjugate());
    let angle = (2.0 * rel.w.clamp(-1.0, 1.0).acos()).to_degrees();

    let axis = [rel.x, rel.y, rel.z];
    let axis_norm = (axis[0] * axis[0] + axis[1] * axis[1] + axis[2] * axis[2]).sqrt();
    if axis_norm <= 0.0 {
        return wrap_degrees(angle);
    }
    let projection = axis
        .iter()
        .zip(REFERENCE_AXIS.iter())
        .map(|(a, r)| a * r)
        .sum::<f64>();
    let sign = if projection >= 0.0 { 1.0 } else { -1.0 };
    wrap_degrees(sign * angle)
}

/// Ángulo (grados) entre dos orientaciones, sin signo, en [0, 180]
pub fn rotation_angle(from: Quaternion, to: Quaternion) -> f64 {
    let rel = to.normalized().mul(from.normalized().conjugate());
    (2.0 * rel.w.abs().clamp(0.0, 1.0).acos()).to_degrees()
}

/// Pasa-altas de primer orden por eje: y[n] = a (y[n-1] + x[n] - x[n-1])
#[derive(Debug, Clone)]
struct HighPass {
    alpha: f64,
    prev_x: Option<[f64; 3]>,
    prev_y: [f64; 3],
}

impl HighPass {
    fn new(cutoff_hz: f64, sample_rate: f64) -> Self {
        let rc = 1.0 / (2.0 * std::f64::consts::PI * cutoff_hz);
        let dt = 1.0 / sample_rate;
        Self {
            alpha: rc / (rc + dt),
            prev_x: None,
            prev_y: [0.0; 3],
        }
    }

    fn apply(&mut self, x: [f64; 3]) -> [f64; 3] {
        let Some(prev_x) = self.prev_x else {
            self.prev_x = Some(x);
            return self.prev_y;
        };
        let mut y = [0.0; 3];
        for i in 0..3 {
            y[i] = self.alpha * (self.prev_y[i] + x[i] - prev_x[i]);
        }
        self.prev_x = Some(x);
        self.prev_y = y;
        y
    }
}

/// Integrador de orientación (Madgwick, versión IMU sin magnetómetro)
/// con ganancia fija.
pub struct OrientationIntegrator {
    q: Quaternion,
    seeded: bool,
    gain: f64,
    dt: f64,
    history: VecDeque<Quaternion>,
    history_len: usize,
    highpass: Option<HighPass>,
}

impl OrientationIntegrator {
    pub fn new(config: &OrientationConfig, sample_rate: f64) -> Self {
        Self {
            q: Quaternion::IDENTITY,
            seeded: false,
            gain: config.gain,
            dt: 1.0 / sample_rate,
            history: VecDeque::with_capacity(config.history),
            history_len: config.history,
            highpass: config
                .gyro_highpass_hz
                .filter(|hz| *hz > 0.0)
                .map(|hz| HighPass::new(hz, sample_rate)),
        }
    }

    /// Orientación actual
    pub fn orientation(&self) -> Quaternion {
        self.q
    }

    pub fn history(&self) -> impl Iterator<Item = &Quaternion> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Integra una muestra (aceleración en m/s², giro en deg/s). Muestras
    /// con NaN se ignoran.
    pub fn update(&mut self, sample: &ImuSample) -> Quaternion {
        if sample.acc.iter().chain(sample.gyro.iter()).any(|v| !v.is_finite()) {
            return self.q;
        }

        if !self.seeded {
            if let Some(q) = Quaternion::from_gravity(sample.acc) {
                self.q = q;
                self.seeded = true;
            }
        }

        let gyro = match self.highpass.as_mut() {
            Some(hp) => hp.apply(sample.gyro),
            None => sample.gyro,
        };
        let gyro = gyro.map(f64::to_radians);

        let next = madgwick_imu(self.q, gyro, sample.acc, self.gain, self.dt);
        if next.is_finite() {
            self.q = next;
        }

        if self.history_len > 0 {
            if self.history.len() == self.history_len {
                self.history.pop_front();
            }
            self.history.push_back(self.q);
        }
        self.q
    }
}

/// Un paso de Madgwick: derivada por giróscopo corregida por el gradiente
/// del error de gravedad
fn madgwick_imu(q: Quaternion, gyr: [f64; 3], acc: [f64; 3], gain: f64, dt: f64) -> Quaternion {
    let omega = Quaternion::new(0.0, gyr[0], gyr[1], gyr[2]);
    let mut q_dot = q.mul(omega);
    q_dot = Quaternion::new(q_dot.w * 0.5, q_dot.x * 0.5, q_dot.y * 0.5, q_dot.z * 0.5);

    let a_norm = (acc[0] * acc[0] + acc[1] * acc[1] + acc[2] * acc[2]).sqrt();
    if a_norm > 0.0 {
        let a = [acc[0] / a_norm, acc[1] / a_norm, acc[2] / a_norm];
        let Quaternion { w, x, y, z } = q.normalized();

        let f = [
            2.0 * (x * z - w * y) - a[0],
            2.0 * (w * x + y * z) - a[1],
            2.0 * (0.5 - x * x - y * y) - a[2],
        ];

        // Jᵀ f
        let g = [
            -2.0 * y * f[0] + 2.0 * x * f[1],
            2.0 * z * f[0] + 2.0 * w * f[1] - 4.0 * x * f[2],
            -2.0 * w * f[0] + 2.0 * z * f[1] - 4.0 * y * f[2],
            2.0 * x * f[0] + 2.0 * y * f[1],
        ];
        let g_norm = g.iter().map(|v| v * v).sum::<f64>().sqrt();
        if g_norm > 1e-12 {
            q_dot.w -= gain * g[0] / g_norm;
            q_dot.x -= gain * g[1] / g_norm;
            q_dot.y -= gain * g[2] / g_norm;
            q_dot.z -= gain * g[3] / g_norm;
        }
    }

    Quaternion::new(
        q.w + q_dot.w * dt,
        q.x + q_dot.x * dt,
        q.y + q_dot.y * dt,
        q.z + q_dot.z * dt,
    )
    .normalized()
}
