//! Live view of the block devices visible to the OS.
//!
//! A one-shot `list_devices` scan plus an optional monitor that polls the
//! device source and publishes appear/disappear events in order from a single
//! task. That task is the only writer of the snapshot set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use winstick_core::{BlockDevice, DeviceSource, DeviceSourceError};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("cannot enumerate block devices: {0}")]
    Enumeration(#[source] DeviceSourceError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TopologyEvent {
    Appeared(BlockDevice),
    Disappeared(String),
}

struct Monitor {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct DiskTopologyService<S: DeviceSource> {
    source: Arc<S>,
    snapshot: Arc<RwLock<Vec<BlockDevice>>>,
    events: broadcast::Sender<TopologyEvent>,
    monitor: Mutex<Option<Monitor>>,
    interval: Duration,
}

impl<S: DeviceSource> DiskTopologyService<S> {
    /// Fails when the device source cannot enumerate at all; there is no
    /// degraded mode.
    pub async fn new(source: S, interval: Duration) -> Result<Self, TopologyError> {
        let source = Arc::new(source);
        let devices = scan(source.as_ref()).await?;
        tracing::info!(count = devices.len(), "device topology initialised");
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            source,
            snapshot: Arc::new(RwLock::new(devices)),
            events,
            monitor: Mutex::new(None),
            interval,
        })
    }

    /// Fresh scan of every visible device. Devices that cannot be described
    /// are left out.
    pub async fn list_devices(&self) -> Result<Vec<BlockDevice>, TopologyError> {
        scan(self.source.as_ref()).await
    }

    /// Re-describe a single device by name.
    pub async fn describe(&self, name: &str) -> Result<BlockDevice, DeviceSourceError> {
        self.source.describe(name).await
    }

    /// Current snapshot set as last observed by the monitor.
    pub fn devices(&self) -> Vec<BlockDevice> {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor_slot().is_some()
    }

    /// Start the polling task. Returns `false` if it was already running.
    /// Must be called from inside a tokio runtime.
    pub fn start_monitoring(&self) -> bool {
        let mut slot = self.monitor_slot();
        if slot.is_some() {
            return false;
        }
        let (shutdown, mut stopped) = watch::channel(false);
        let source = Arc::clone(&self.source);
        let snapshot = Arc::clone(&self.snapshot);
        let events = self.events.clone();
        let interval = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped.changed() => break,
                }
                let current = match scan(source.as_ref()).await {
                    Ok(current) => current,
                    Err(err) => {
                        tracing::warn!(error = %err, "device poll failed");
                        continue;
                    }
                };
                let changes = {
                    let mut guard = match snapshot.write() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    let changes = diff(&guard, &current);
                    *guard = current;
                    changes
                };
                for event in changes {
                    match &event {
                        TopologyEvent::Appeared(device) => {
                            tracing::info!(device = %device.name, "device appeared")
                        }
                        TopologyEvent::Disappeared(name) => {
                            tracing::info!(device = %name, "device disappeared")
                        }
                    }
                    // No receivers is fine; events are fire and forget.
                    let _ = events.send(event);
                }
            }
            tracing::debug!("device monitor stopped");
        });

        *slot = Some(Monitor { shutdown, task });
        tracing::debug!(interval_ms = interval.as_millis() as u64, "device monitor started");
        true
    }

    /// Stop the polling task. Returns `false` if it was not running.
    pub fn stop_monitoring(&self) -> bool {
        match self.monitor_slot().take() {
            Some(monitor) => {
                let _ = monitor.shutdown.send(true);
                drop(monitor.task);
                true
            }
            None => false,
        }
    }

    fn monitor_slot(&self) -> std::sync::MutexGuard<'_, Option<Monitor>> {
        match self.monitor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<S: DeviceSource> Drop for DiskTopologyService<S> {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

async fn scan<S: DeviceSource>(source: &S) -> Result<Vec<BlockDevice>, TopologyError> {
    let names = source
        .device_names()
        .await
        .map_err(TopologyError::Enumeration)?;
    let mut devices = Vec::with_capacity(names.len());
    for name in names {
        match source.describe(&name).await {
            Ok(device) => devices.push(device),
            Err(err) => tracing::debug!(device = %name, error = %err, "skipping device"),
        }
    }
    Ok(devices)
}

/// Events turning `old` into `new`. A name whose appearance time changed is
/// a different attachment and is reported as a disappearance followed by an
/// appearance.
fn diff(old: &[BlockDevice], new: &[BlockDevice]) -> Vec<TopologyEvent> {
    let old_by_name: HashMap<&str, &BlockDevice> =
        old.iter().map(|d| (d.name.as_str(), d)).collect();
    let new_by_name: HashMap<&str, &BlockDevice> =
        new.iter().map(|d| (d.name.as_str(), d)).collect();

    let mut events = Vec::new();
    for device in old {
        let still_here = new_by_name
            .get(device.name.as_str())
            .is_some_and(|current| current.same_attachment(device));
        if !still_here {
            events.push(TopologyEvent::Disappeared(device.name.clone()));
        }
    }
    for device in new {
        let known = old_by_name
            .get(device.name.as_str())
            .is_some_and(|previous| previous.same_attachment(device));
        if !known {
            events.push(TopologyEvent::Appeared(device.clone()));
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Clone, Default)]
    struct FakeSource {
        devices: Arc<Mutex<Vec<BlockDevice>>>,
        broken: Arc<AtomicBool>,
        undescribable: Arc<Mutex<Vec<String>>>,
    }

    impl FakeSource {
        fn set(&self, devices: Vec<BlockDevice>) {
            *self.devices.lock().unwrap() = devices;
        }
    }

    impl DeviceSource for FakeSource {
        async fn device_names(&self) -> Result<Vec<String>, DeviceSourceError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(DeviceSourceError::SessionUnavailable("no session".into()));
            }
            Ok(self
                .devices
                .lock()
                .unwrap()
                .iter()
                .map(|d| d.name.clone())
                .collect())
        }

        async fn describe(&self, name: &str) -> Result<BlockDevice, DeviceSourceError> {
            if self.undescribable.lock().unwrap().iter().any(|n| n == name) {
                return Err(DeviceSourceError::MissingProperty {
                    device: name.to_string(),
                    key: "TotalSize",
                });
            }
            self.devices
                .lock()
                .unwrap()
                .iter()
                .find(|d| d.name == name)
                .cloned()
                .ok_or_else(|| DeviceSourceError::NotFound(name.to_string()))
        }
    }

    fn device(name: &str, appearance: f64) -> BlockDevice {
        BlockDevice {
            name: name.to_string(),
            vendor: None,
            model: Some("Flash".to_string()),
            bus_protocol: Some("USB".to_string()),
            whole_disk: true,
            removable: true,
            ejectable: true,
            internal: false,
            writable: true,
            encrypted: false,
            size_bytes: 8 << 30,
            appearance_time: Some(appearance),
            mount_path: None,
            filesystem_kind: None,
            volume_uuid: None,
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<TopologyEvent>) -> TopologyEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn broken_session_is_fatal() {
        let source = FakeSource::default();
        source.broken.store(true, Ordering::SeqCst);
        assert!(matches!(
            DiskTopologyService::new(source, Duration::from_millis(10)).await,
            Err(TopologyError::Enumeration(_))
        ));
    }

    #[tokio::test]
    async fn listing_skips_undescribable_devices() {
        let source = FakeSource::default();
        source.set(vec![device("disk0", 1.0), device("disk4", 2.0)]);
        source.undescribable.lock().unwrap().push("disk0".to_string());
        let service = DiskTopologyService::new(source, Duration::from_millis(10))
            .await
            .unwrap();
        let names: Vec<_> = service
            .list_devices()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["disk4"]);
        assert_eq!(service.devices().len(), 1);
    }

    #[tokio::test]
    async fn monitoring_start_and_stop_are_idempotent() {
        let service = DiskTopologyService::new(FakeSource::default(), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(!service.stop_monitoring());
        assert!(service.start_monitoring());
        assert!(!service.start_monitoring());
        assert!(service.is_monitoring());
        assert!(service.stop_monitoring());
        assert!(!service.stop_monitoring());
    }

    #[tokio::test]
    async fn monitor_reports_appear_and_disappear() {
        let source = FakeSource::default();
        source.set(vec![device("disk0", 1.0)]);
        let service = DiskTopologyService::new(source.clone(), Duration::from_millis(10))
            .await
            .unwrap();
        let mut rx = service.subscribe();
        service.start_monitoring();

        source.set(vec![device("disk0", 1.0), device("disk4", 2.0)]);
        match next_event(&mut rx).await {
            TopologyEvent::Appeared(dev) => assert_eq!(dev.name, "disk4"),
            other => panic!("unexpected {other:?}"),
        }

        source.set(vec![device("disk0", 1.0)]);
        assert_eq!(
            next_event(&mut rx).await,
            TopologyEvent::Disappeared("disk4".to_string())
        );
        assert_eq!(service.devices().len(), 1);
        service.stop_monitoring();
    }

    #[test]
    fn replaced_hardware_is_a_new_attachment() {
        let old = vec![device("disk4", 1.0)];
        let new = vec![device("disk4", 9.0)];
        assert_eq!(
            diff(&old, &new),
            vec![
                TopologyEvent::Disappeared("disk4".to_string()),
                TopologyEvent::Appeared(device("disk4", 9.0)),
            ]
        );
        assert!(diff(&new, &new).is_empty());
    }
}
