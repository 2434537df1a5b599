//! btleplug-backed [`Central`] and [`Transport`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central as _, CentralEvent as BtEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as BtPeripheral};
use futures::stream::{BoxStream, StreamExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::{GattProfile, SdkConfig};
use crate::error::{Error, Result};
use crate::lock;
use crate::transport::{Central, CentralEvent, Peripheral, PeripheralId, Transport};

type Known = Arc<Mutex<HashMap<String, BtPeripheral>>>;

/// The first Bluetooth adapter on the host.
pub struct BleCentral {
    _manager: Manager,
    adapter: Adapter,
    gatt: GattProfile,
    connect_timeout: Duration,
    known: Known,
}

impl BleCentral {
    pub async fn new(config: &SdkConfig) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::NoAdapter)?;
        info!(adapter = %adapter.adapter_info().await.unwrap_or_default(), "using Bluetooth adapter");
        Ok(Self {
            _manager: manager,
            adapter,
            gatt: config.gatt,
            connect_timeout: config.connect_timeout,
            known: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn find(&self, id: &PeripheralId) -> Result<BtPeripheral> {
        let cached = lock(&self.known).get(&id.0).cloned();
        if let Some(p) = cached {
            return Ok(p);
        }
        // not seen through the event stream; ask the adapter directly
        for p in self.adapter.peripherals().await? {
            if p.id().to_string() == id.0 {
                return Ok(p);
            }
        }
        Err(Error::UnknownPeripheral(id.to_string()))
    }

    async fn open(&self, device: &BtPeripheral) -> Result<BleLink> {
        device.discover_services().await?;
        let chars = device.characteristics();
        let find = |uuid: Uuid| {
            chars
                .iter()
                .find(|c| c.uuid == uuid && c.service_uuid == self.gatt.service)
                .cloned()
                .ok_or_else(|| Error::Connection(format!("characteristic {uuid} not found")))
        };
        let control = find(self.gatt.control)?;
        let data = find(self.gatt.data)?;
        let notify = find(self.gatt.notify)?;
        device.subscribe(&notify).await?;
        let notifications = device.notifications().await?;
        Ok(BleLink {
            device: device.clone(),
            control,
            data,
            notify: notify.uuid,
            notifications,
        })
    }
}

#[async_trait]
impl Central for BleCentral {
    type Link = BleLink;

    async fn events(&self) -> Result<BoxStream<'static, CentralEvent>> {
        let raw = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let known = self.known.clone();
        let events = raw.filter_map(move |event| {
            let adapter = adapter.clone();
            let known = known.clone();
            async move {
                match event {
                    BtEvent::DeviceDiscovered(id) => {
                        let device = adapter.peripheral(&id).await.ok()?;
                        let props = device.properties().await.ok().flatten();
                        let key = id.to_string();
                        lock(&known).insert(key.clone(), device);
                        Some(CentralEvent::Discovered(Peripheral {
                            id: PeripheralId(key),
                            name: props.as_ref().and_then(|p| p.local_name.clone()),
                            rssi: props.and_then(|p| p.rssi),
                        }))
                    }
                    BtEvent::DeviceDisconnected(id) => {
                        Some(CentralEvent::Disconnected(PeripheralId(id.to_string())))
                    }
                    _ => None,
                }
            }
        });
        Ok(events.boxed())
    }

    async fn start_scan(&self) -> Result<()> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(id = %peripheral.id))]
    async fn connect(&self, peripheral: &Peripheral) -> Result<BleLink> {
        let device = self.find(&peripheral.id).await?;
        bounded_connect(
            self.connect_timeout,
            async { device.connect().await.map_err(Error::from) },
            async { device.disconnect().await.map_err(Error::from) },
        )
        .await?;
        match self.open(&device).await {
            Ok(link) => {
                debug!("GATT link ready");
                Ok(link)
            }
            Err(e) => {
                if let Err(err) = device.disconnect().await {
                    warn!(error = %err, "disconnect after failed setup");
                }
                Err(e)
            }
        }
    }
}

/// Run `attempt` for at most `limit`. On timeout `hang_up` runs before the
/// error is returned, so the platform does not finish the connection later.
async fn bounded_connect<A, H>(limit: Duration, attempt: A, hang_up: H) -> Result<()>
where
    A: Future<Output = Result<()>>,
    H: Future<Output = Result<()>>,
{
    match timeout(limit, attempt).await {
        Ok(result) => result,
        Err(_) => {
            if let Err(e) = hang_up.await {
                warn!(error = %e, "disconnect after connect timeout");
            }
            Err(Error::Timeout("connection"))
        }
    }
}

/// One connected printer.
pub struct BleLink {
    device: BtPeripheral,
    control: Characteristic,
    data: Characteristic,
    notify: Uuid,
    notifications: BoxStream<'static, ValueNotification>,
}

#[async_trait]
impl Transport for BleLink {
    async fn write_control(&mut self, data: &[u8]) -> Result<()> {
        self.device
            .write(&self.control, data, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.device
            .write(&self.data, data, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn read_notification(&mut self, wait: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.notifications.next()).await {
                Ok(Some(n)) if n.uuid == self.notify => return Ok(n.value),
                Ok(Some(_)) => continue,
                Ok(None) => return Err(Error::Connection("notification stream ended".into())),
                Err(_) => return Err(Error::Timeout("notification")),
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.device.disconnect().await?;
        Ok(())
    }
}
