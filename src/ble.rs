//! Suscripción a notificaciones GATT de la pulsera vía BlueZ (D-Bus).
//!
//! Supone el dispositivo ya emparejado y conectado: aquí no hay
//! descubrimiento ni conexión, solo `StartNotify` sobre la característica
//! y el reenvío de cada valor por un canal.

use crossbeam_channel::{bounded, Receiver};
use dbus::arg::RefArg;
use dbus::blocking::stdintf::org_freedesktop_dbus::PropertiesPropertiesChanged as PropertiesChanged;
use dbus::blocking::Connection;
use dbus::message::SignalArgs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::link::Received;
use crate::session::StopSignal;
use crate::types::now_secs;

const LINK_QUEUE: usize = 1024;
const PROCESS_WAIT: Duration = Duration::from_millis(500);

/// Lanza el hilo lector de notificaciones de `char_path`
/// (p.ej. `/org/bluez/hci0/dev_XX_XX_XX_XX_XX_XX/service0010/char0011`).
/// Los errores de arranque se devuelven aquí; después, el canal se cierra
/// si el bus falla. El hilo termina como mucho `PROCESS_WAIT` después de
/// dispararse `stop`, aunque la pulsera no envíe nada.
pub fn spawn_gatt_notifications(
    char_path: &str,
    stop: StopSignal,
) -> Result<Receiver<Received<Vec<u8>>>, dbus::Error> {
    let (tx, rx) = bounded(LINK_QUEUE);
    let (ready_tx, ready_rx) = bounded::<Result<(), dbus::Error>>(1);
    let path = char_path.to_string();

    let spawned = thread::Builder::new()
        .name("link-ble".into())
        .spawn(move || {
            let conn = match subscribe(&path) {
                Ok(conn) => {
                    let _ = ready_tx.send(Ok(()));
                    conn
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let closed = Arc::new(AtomicBool::new(false));
            let closed_cb = Arc::clone(&closed);
            let watched = path.clone();
            let matched = conn.add_match(
                PropertiesChanged::match_rule(None, None),
                move |pc: PropertiesChanged, _, msg| {
                    if msg.path().map(|p| p.to_string()).as_deref() != Some(watched.as_str()) {
                        return true;
                    }
                    let Some(value) = pc.changed_properties.get("Value") else {
                        return true;
                    };
                    let Some(iter) = value.0.as_iter() else {
                        return true;
                    };
                    let bytes: Vec<u8> = iter.filter_map(|b| b.as_u64().map(|v| v as u8)).collect();
                    if tx.send(Received { data: bytes, at: now_secs() }).is_err() {
                        closed_cb.store(true, Ordering::Relaxed);
                        return false;
                    }
                    true
                },
            );
            if let Err(e) = matched {
                warn!("❌ [BLE] No se pudo registrar el filtro de señales: {}", e);
                return;
            }

            info!("🎯 [BLE] Recibiendo notificaciones de {}", path);
            while !closed.load(Ordering::Relaxed) && !stop.is_stopped() {
                if let Err(e) = conn.process(PROCESS_WAIT) {
                    warn!("❌ [BLE] Error en el bus: {}", e);
                    break;
                }
            }
            debug!("[BLE] hilo lector terminado");
        });

    if spawned.is_err() {
        return Err(dbus::Error::new_failed("no se pudo lanzar el hilo BLE"));
    }

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(rx),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(dbus::Error::new_failed("el hilo BLE terminó antes de suscribirse")),
    }
}

fn subscribe(char_path: &str) -> Result<Connection, dbus::Error> {
    let conn = Connection::new_system()?;
    info!("🔌 Conectado a D-Bus del sistema");

    let proxy = conn.with_proxy("org.bluez", char_path, Duration::from_secs(5));
    proxy.method_call::<(), _, _, _>("org.bluez.GattCharacteristic1", "StartNotify", ())?;
    info!("📡 Notificaciones BLE iniciadas en {}", char_path);
    Ok(conn)
}
