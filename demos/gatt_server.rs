//! Minimal GATT peripheral: a read-only Device Information service and a Battery service whose
//! level ticks down once a second and notifies any subscribed central.
//!
//! Run with `sudo -E cargo run --example gatt_server` (raw HCI mgmt sockets and BlueZ's
//! `GattManager1` both require elevated privileges).

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc, Mutex,
};

use blegatt::{
    gatt::{
        builder::{application, CharacteristicHandle},
        CharacteristicFlags, DescriptorFlags,
    },
    value::{DataBridge, PropValue},
    ServerBuilder, Uuid, UuidExt,
};

fn manufacturer_name_uuid() -> Uuid {
    Uuid::from_u16(0x2a29)
}
fn device_info_service_uuid() -> Uuid {
    Uuid::from_u16(0x180a)
}
fn battery_service_uuid() -> Uuid {
    Uuid::from_u16(0x180f)
}
fn battery_level_uuid() -> Uuid {
    Uuid::from_u16(0x2a19)
}
fn characteristic_user_description_uuid() -> Uuid {
    Uuid::from_u16(0x2901)
}

/// Backing state shared between the GATT tree's handlers and this example's own ticker task.
struct DemoState {
    battery_level: AtomicU8,
    greeting: Mutex<String>,
}

impl DataBridge for DemoState {
    fn get(&self, name: &str) -> Option<PropValue> {
        match name {
            "battery/level" => Some(PropValue::U8(self.battery_level.load(Ordering::Acquire))),
            "greeting" => Some(PropValue::Str(self.greeting.lock().unwrap().clone())),
            _ => None,
        }
    }

    fn set(&self, name: &str, value: PropValue) -> bool {
        match (name, value) {
            ("greeting", PropValue::Str(s)) => {
                *self.greeting.lock().unwrap() = s;
                true
            }
            _ => false,
        }
    }
}

#[tokio::main]
async fn main() -> blegatt::Result<()> {
    env_logger::init();

    let state = Arc::new(DemoState { battery_level: AtomicU8::new(100), greeting: Mutex::new("hello".to_string()) });

    let mut battery_level_handle = None;
    let tree = application(|app| {
        app.service(device_info_service_uuid(), true, |s| {
            s.characteristic(manufacturer_name_uuid(), CharacteristicFlags { read: true, ..Default::default() }, |c| {
                c.on_read(|| async { Ok(b"Acme Inc.".to_vec()) });
            });
        });

        app.service(battery_service_uuid(), true, |s| {
            let bridge = state.clone();
            let handle = s.characteristic(
                battery_level_uuid(),
                CharacteristicFlags { read: true, notify: true, ..Default::default() },
                |c| {
                    let bridge = bridge.clone();
                    c.on_read(move || {
                        let bridge = bridge.clone();
                        async move {
                            match bridge.get("battery/level") {
                                Some(value) => Ok(value.to_bytes()),
                                None => Ok(vec![0]),
                            }
                        }
                    });
                    c.descriptor(
                        characteristic_user_description_uuid(),
                        DescriptorFlags { read: true, ..Default::default() },
                        |d| {
                            d.on_read(|| async { Ok(b"Battery Level".to_vec()) });
                        },
                    );
                },
            );
            battery_level_handle = Some(handle);
        });
    });
    let battery_level_handle: CharacteristicHandle = battery_level_handle.expect("battery service was declared above");

    let server = ServerBuilder::new("blegatt-demo", "blegatt GATT server demo").start(tree).await?;
    log::info!("GATT server is {:?}, health {:?}", server.get_run_state(), server.get_health());

    let ticker_server = server.clone();
    let ticker_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            interval.tick().await;
            let level = ticker_state.battery_level.fetch_update(Ordering::AcqRel, Ordering::Acquire, |level| {
                Some(if level == 0 { 100 } else { level - 1 })
            });
            if level.is_ok() {
                ticker_server.notify_updated_characteristic(battery_level_handle).await;
            }
        }
    });

    tokio::signal::ctrl_c().await.ok();
    log::info!("shutting down");
    server.trigger_shutdown();
    server.wait().await;

    Ok(())
}
