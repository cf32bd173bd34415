//! BLE transport for the Light Master: scanning, connecting, GATT
//! subscription, and the notification dispatch task.
//!
//! Everything protocol-shaped lives elsewhere — this module only moves bytes.
//! Notifications are stamped, written to the raw audit log, run through
//! [`crate::classify::classify`], and forwarded as [`ProbeEvent`]s on an
//! `mpsc` channel.  Commands go the other way through [`ProbeHandle`].

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::classify::classify;
use crate::export::{RawFrameLog, RAW_LOG_FILE};
use crate::protocol::{
    channel_for_uuid, COMMAND_CHARACTERISTIC, DATA_CHARACTERISTIC, DEFAULT_NAME_PREFIX,
    START_MEASUREMENT, STOP_MEASUREMENT,
};
use crate::session::CommandWriter;
use crate::types::{ProbeEvent, RawFrame};

// ── ProbeDevice ───────────────────────────────────────────────────────────────

/// A Light Master discovered during a BLE scan.
///
/// Returned by [`ProbeClient::scan_all`]; pass to [`ProbeClient::connect_to`]
/// to establish a session.
#[derive(Clone, Debug)]
pub struct ProbeDevice {
    /// Advertised device name (e.g. `"LMaster_0d72"`).
    pub name: String,
    /// Platform BLE identifier.
    /// • macOS / Windows — a UUID string
    /// • Linux — a Bluetooth MAC address (`FF:00:16:00:0D:72`)
    pub id: String,
    pub(crate) peripheral: Peripheral,
    /// The adapter that discovered this device, kept so the disconnect
    /// watcher can listen on the right adapter.
    pub(crate) adapter: Adapter,
}

// ── ProbeClientConfig ─────────────────────────────────────────────────────────

/// Configuration for [`ProbeClient`].
#[derive(Debug, Clone)]
pub struct ProbeClientConfig {
    /// Match devices whose advertised name starts with this string.
    /// Default: `"LMaster"`.
    pub name_prefix: String,
    /// When set, match this platform identifier exactly (MAC on Linux)
    /// before falling back to the name prefix.  Default: `None`.
    pub device_id: Option<String>,
    /// BLE scan duration in seconds before giving up. Default: `10`.
    pub scan_timeout_secs: u64,
    /// Where to append the raw-frame audit log; `None` disables it.
    /// Default: `Some("raw_data_full_session_log.txt")`.
    pub raw_log_path: Option<PathBuf>,
}

impl Default for ProbeClientConfig {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_NAME_PREFIX.into(),
            device_id: None,
            scan_timeout_secs: 10,
            raw_log_path: Some(PathBuf::from(RAW_LOG_FILE)),
        }
    }
}

// ── ProbeClient ───────────────────────────────────────────────────────────────

/// BLE client for the Opple Light Master Pro.
///
/// Handles scanning, connecting, and notification dispatch.  Both vendor
/// characteristics are subscribed: the *command* characteristic because it is
/// where all observed measurement data actually arrives, and the nominal
/// *data* characteristic so that anything it ever sends still reaches the
/// audit log.
pub struct ProbeClient {
    config: ProbeClientConfig,
}

impl ProbeClient {
    pub fn new(config: ProbeClientConfig) -> Self {
        Self { config }
    }

    // ── Public: scan ─────────────────────────────────────────────────────────

    /// Scan for all nearby Light Masters and return them.
    ///
    /// The scan runs for the full `scan_timeout_secs` so multiple devices in
    /// range are all discovered before returning.
    pub async fn scan_all(&self) -> Result<Vec<ProbeDevice>> {
        let adapter = first_adapter().await?;
        wait_for_adapter(&adapter).await;

        info!("scanning for {} s …", self.config.scan_timeout_secs);
        adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(Duration::from_secs(self.config.scan_timeout_secs)).await;
        adapter.stop_scan().await.ok();

        let mut found = vec![];
        for p in adapter.peripherals().await? {
            if let Ok(Some(props)) = p.properties().await {
                let id = p.id().to_string();
                // A peripheral advertising no name can still be matched by
                // its platform id.
                let name = props.local_name.unwrap_or_default();
                if self.matches(&name, &id) {
                    let name = if name.is_empty() { "Unknown".into() } else { name };
                    info!("found {name}  id={id}");
                    found.push(ProbeDevice {
                        name,
                        id,
                        peripheral: p,
                        adapter: adapter.clone(),
                    });
                }
            }
        }
        info!("{} device(s) found", found.len());
        Ok(found)
    }

    // ── Public: connect ──────────────────────────────────────────────────────

    /// Scan for the first matching device, connect, and start dispatching.
    ///
    /// Equivalent to [`ProbeClient::scan_all`] followed by
    /// [`ProbeClient::connect_to`] on the first result.
    pub async fn connect(&self) -> Result<(mpsc::Receiver<ProbeEvent>, ProbeHandle)> {
        let adapter = first_adapter().await?;
        wait_for_adapter(&adapter).await;

        info!(
            "Scanning for Light Master (timeout: {} s) …",
            self.config.scan_timeout_secs
        );
        adapter.start_scan(ScanFilter::default()).await?;
        let peripheral = self.find_first(&adapter).await?;
        adapter.stop_scan().await.ok();

        let props = peripheral.properties().await?.unwrap_or_default();
        let device_name = props.local_name.unwrap_or_else(|| "Unknown".into());
        info!("Found device: {device_name}");

        self.setup_peripheral(peripheral, device_name, adapter).await
    }

    /// Connect to a specific device returned by [`ProbeClient::scan_all`].
    pub async fn connect_to(
        &self,
        device: ProbeDevice,
    ) -> Result<(mpsc::Receiver<ProbeEvent>, ProbeHandle)> {
        self.setup_peripheral(device.peripheral, device.name, device.adapter)
            .await
    }

    fn matches(&self, name: &str, id: &str) -> bool {
        if let Some(wanted) = &self.config.device_id {
            if id.eq_ignore_ascii_case(wanted) {
                return true;
            }
        }
        name.starts_with(&self.config.name_prefix)
    }

    // ── Private: find_first ──────────────────────────────────────────────────

    /// Poll until the first matching peripheral appears or the timeout expires.
    async fn find_first(&self, adapter: &Adapter) -> Result<Peripheral> {
        use tokio::time::{sleep, timeout};

        let secs = self.config.scan_timeout_secs;
        let result = timeout(Duration::from_secs(secs), async {
            loop {
                let peripherals = adapter.peripherals().await.unwrap_or_default();
                for p in peripherals {
                    let id = p.id().to_string();
                    if let Ok(Some(props)) = p.properties().await {
                        let name = props.local_name.as_deref().unwrap_or("");
                        if self.matches(name, &id) {
                            return p;
                        }
                    }
                }
                sleep(Duration::from_millis(250)).await;
            }
        })
        .await;

        result.map_err(|_| {
            anyhow!(
                "no device named '{}*' found within {secs} s",
                self.config.name_prefix
            )
        })
    }

    // ── Private: setup_peripheral ────────────────────────────────────────────

    /// Connect, subscribe to both vendor characteristics, spawn the dispatch
    /// and disconnect-watcher tasks, and return the event channel.
    async fn setup_peripheral(
        &self,
        peripheral: Peripheral,
        device_name: String,
        adapter: Adapter,
    ) -> Result<(mpsc::Receiver<ProbeEvent>, ProbeHandle)> {
        // Hard timeout on connect(): BlueZ's org.bluez.Device1.Connect can
        // block forever when the device is out of range or the stack is in a
        // bad state.
        tokio::time::timeout(Duration::from_secs(10), peripheral.connect())
            .await
            .map_err(|_| anyhow!("BLE connect() timed out after 10 s"))??;

        // On Linux the stack signals connection completion before the remote
        // GATT cache is populated; discovering too early returns an empty set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(Duration::from_secs(15), peripheral.discover_services())
            .await
            .map_err(|_| anyhow!("discover_services() timed out after 15 s"))??;
        info!("Connected and services discovered: {device_name}");

        let chars: BTreeSet<Characteristic> = peripheral.characteristics();
        let find_char = |uuid: Uuid| -> Result<Characteristic> {
            chars.iter().find(|c| c.uuid == uuid).cloned().ok_or_else(|| {
                let available: Vec<String> = chars
                    .iter()
                    .map(|c| format!("{} ({:?})", c.uuid, c.properties))
                    .collect();
                anyhow!(
                    "characteristic {uuid} not found; available: [{}]",
                    available.join(", ")
                )
            })
        };

        // The command characteristic is mandatory — without it we can neither
        // poll nor receive measurements.  The data characteristic is nice to
        // have; log and continue if a firmware revision drops it.
        let command_char = find_char(COMMAND_CHARACTERISTIC)?;
        peripheral.subscribe(&command_char).await?;

        let data_char = match find_char(DATA_CHARACTERISTIC) {
            Ok(c) => {
                peripheral.subscribe(&c).await?;
                Some(c)
            }
            Err(e) => {
                warn!("data characteristic missing, continuing without it: {e}");
                None
            }
        };

        // ── Event channel ────────────────────────────────────────────────────
        let (tx, rx) = mpsc::channel::<ProbeEvent>(256);
        let _ = tx.send(ProbeEvent::Connected(device_name.clone())).await;

        // ── Disconnect watcher ───────────────────────────────────────────────
        // The adapter's CentralEvent stream fires reliably when the link
        // drops, often before the notification stream closes.
        let disconnect_tx = tx.clone();
        let peripheral_id = peripheral.id();
        tokio::spawn(async move {
            match adapter.events().await {
                Ok(mut events) => {
                    while let Some(event) = events.next().await {
                        if let CentralEvent::DeviceDisconnected(id) = event {
                            if id == peripheral_id {
                                info!("disconnect watcher: device {id:?} disconnected");
                                let _ = disconnect_tx.send(ProbeEvent::Disconnected).await;
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!("disconnect watcher: could not subscribe to adapter events: {e}"),
            }
        });

        // ── Notification dispatch ────────────────────────────────────────────
        let mut raw_log = match &self.config.raw_log_path {
            Some(path) => match RawFrameLog::open(path) {
                Ok(log) => Some(log),
                Err(e) => {
                    warn!("could not open raw log {}: {e}", path.display());
                    None
                }
            },
            None => None,
        };

        let peripheral_clone = peripheral.clone();
        tokio::spawn(async move {
            let mut notifications = match peripheral_clone.notifications().await {
                Ok(n) => n,
                Err(e) => {
                    warn!("could not get notifications stream: {e}");
                    return;
                }
            };
            info!("notification stream subscribed, waiting for data …");
            let mut notif_count: u64 = 0;

            while let Some(notif) = notifications.next().await {
                notif_count += 1;
                let channel = channel_for_uuid(notif.uuid);
                let frame = RawFrame::new(channel, notif.value);
                if notif_count <= 5 || notif_count % 500 == 0 {
                    debug!(
                        "notif #{notif_count} channel={channel} len={}",
                        frame.bytes.len()
                    );
                }

                if let Some(log) = raw_log.as_mut() {
                    log.log_frame(&frame);
                }

                let record = classify(&frame);
                if tx.send(ProbeEvent::Decoded(record)).await.is_err() {
                    break; // receiver dropped, session over
                }
            }

            info!("notification stream ended – device disconnected");
            let _ = tx.send(ProbeEvent::Disconnected).await;
        });

        let handle = ProbeHandle {
            peripheral,
            command_char,
            data_char,
        };

        Ok((rx, handle))
    }
}

// ── Adapter helpers ───────────────────────────────────────────────────────────

async fn first_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No Bluetooth adapter found"))
}

/// On macOS, CBCentralManager starts in an "unknown" state after launch and
/// scanning before it reaches PoweredOn is a silent no-op.  Poll briefly.
#[cfg(target_os = "macos")]
async fn wait_for_adapter(adapter: &Adapter) {
    use btleplug::api::CentralState;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => break,
            Ok(state) => {
                if tokio::time::Instant::now() >= deadline {
                    warn!("adapter still in state {state:?} after 3 s — proceeding anyway");
                    break;
                }
                debug!("adapter state = {state:?}, waiting …");
            }
            Err(e) => {
                warn!("adapter_state() error: {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    // Let the CoreBluetooth delegate settle.
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[cfg(not(target_os = "macos"))]
async fn wait_for_adapter(_adapter: &Adapter) {}

// ── ProbeHandle ───────────────────────────────────────────────────────────────

/// A handle to an active Light Master connection: command writes, GATT
/// introspection, and orderly teardown.
pub struct ProbeHandle {
    peripheral: Peripheral,
    command_char: Characteristic,
    data_char: Option<Characteristic>,
}

impl ProbeHandle {
    /// Write a raw payload to the command characteristic.
    pub async fn write_raw(&self, payload: &[u8]) -> Result<()> {
        self.peripheral
            .write(&self.command_char, payload, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    /// Tell the device to begin a measurement.
    pub async fn start_measurement(&self) -> Result<()> {
        self.write_raw(&START_MEASUREMENT).await
    }

    /// Tell the device to end the current measurement.
    pub async fn stop_measurement(&self) -> Result<()> {
        self.write_raw(&STOP_MEASUREMENT).await
    }

    /// Print every GATT service and characteristic with its properties.
    ///
    /// Protocol-exploration aid: when a firmware revision moves things
    /// around, this is the first place to look.
    pub async fn dump_gatt(&self) {
        for service in self.peripheral.services() {
            println!("Service: {}", service.uuid);
            for c in &service.characteristics {
                println!("  - {} (Props: {:?})", c.uuid, c.properties);
            }
        }
    }

    /// Unsubscribe from both characteristics and disconnect.
    ///
    /// Called on every exit path so the instrument is not left in a
    /// subscribed/busy state; unsubscribe failures are logged, not fatal,
    /// because the disconnect must still happen.
    pub async fn disconnect(&self) -> Result<()> {
        if let Err(e) = self.peripheral.unsubscribe(&self.command_char).await {
            warn!("could not unsubscribe command characteristic: {e}");
        }
        if let Some(data_char) = &self.data_char {
            if let Err(e) = self.peripheral.unsubscribe(data_char).await {
                warn!("could not unsubscribe data characteristic: {e}");
            }
        }
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

#[async_trait]
impl CommandWriter for ProbeHandle {
    async fn write_command(&self, payload: &[u8]) -> Result<()> {
        self.write_raw(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(device_id: Option<&str>) -> ProbeClient {
        ProbeClient::new(ProbeClientConfig {
            device_id: device_id.map(String::from),
            ..ProbeClientConfig::default()
        })
    }

    #[test]
    fn name_prefix_matches_advertised_name() {
        let c = client(None);
        assert!(c.matches("LMaster_0d72", "FF:00:16:00:0D:72"));
        assert!(!c.matches("SomeOtherDevice", "FF:00:16:00:0D:72"));
    }

    #[test]
    fn device_id_matches_even_without_advertised_name() {
        // Some platforms report no local_name for a cached peripheral; an
        // explicit id must still select it.
        let c = client(Some("ff:00:16:00:0d:72"));
        assert!(c.matches("", "FF:00:16:00:0D:72"));
        assert!(!c.matches("", "AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn device_id_mismatch_falls_back_to_name_prefix() {
        let c = client(Some("AA:BB:CC:DD:EE:FF"));
        assert!(c.matches("LMaster_0d72", "FF:00:16:00:0D:72"));
    }
}
