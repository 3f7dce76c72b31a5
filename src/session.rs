//! D-Bus transport: owns the system-bus connection and the GATT object tree.

use dbus::{message::MatchRule, nonblock::SyncConnection};
use dbus_crossroads::{Crossroads, IfaceToken};
use dbus_tokio::connection;
use futures::{lock::Mutex, StreamExt};
use std::{
    fmt::{Debug, Formatter},
    sync::{Arc, Weak},
};
use tokio::task::{spawn_blocking, JoinHandle};

use crate::gatt;

/// Shared state of a GATT server's D-Bus session.
pub(crate) struct SessionInner {
    pub connection: Arc<SyncConnection>,
    pub crossroads: Mutex<Crossroads>,
    pub gatt_reg_service_token: IfaceToken<Arc<gatt::local::RegisteredService>>,
    pub gatt_reg_characteristic_token: IfaceToken<Arc<gatt::local::RegisteredCharacteristic>>,
    pub gatt_reg_characteristic_descriptor_token: IfaceToken<Arc<gatt::local::RegisteredDescriptor>>,
    dbus_task: JoinHandle<connection::IOResourceError>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.dbus_task.abort();
    }
}

/// A connection to the system D-Bus, with the object tree vtables this crate needs already
/// registered.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Session {{ {} }}", self.inner.connection.unique_name())
    }
}

impl Session {
    /// Establishes a connection to the system D-Bus and registers this crate's GATT interface
    /// vtables with an object-manager-capable `Crossroads` instance.
    pub(crate) async fn new() -> crate::Result<Self> {
        let (resource, connection) = spawn_blocking(connection::new_system_sync).await??;
        let dbus_task = tokio::spawn(resource);
        log::trace!("Connected to D-Bus with unique name {}", &connection.unique_name());

        let mut crossroads = Crossroads::new();
        crossroads.set_async_support(Some((
            connection.clone(),
            Box::new(|x| {
                tokio::spawn(x);
            }),
        )));

        crossroads.set_object_manager_support(Some(connection.clone()));

        let gatt_reg_service_token = gatt::local::RegisteredService::register_interface(&mut crossroads);
        let gatt_reg_characteristic_token =
            gatt::local::RegisteredCharacteristic::register_interface(&mut crossroads);
        let gatt_reg_characteristic_descriptor_token =
            gatt::local::RegisteredDescriptor::register_interface(&mut crossroads);

        let inner = Arc::new(SessionInner {
            connection: connection.clone(),
            crossroads: Mutex::new(crossroads),
            gatt_reg_service_token,
            gatt_reg_characteristic_token,
            gatt_reg_characteristic_descriptor_token,
            dbus_task,
        });

        let mc_callback = connection.add_match(MatchRule::new_method_call()).await?;
        let mc_inner = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let (_mc_callback, mut mc_stream) = mc_callback.msg_stream();
            while let Some(msg) = mc_stream.next().await {
                let mc_inner: Arc<SessionInner> = match Weak::upgrade(&mc_inner) {
                    Some(inner) => inner,
                    None => return,
                };
                let mut crossroads = mc_inner.crossroads.lock().await;
                let _ = crossroads.handle_message(msg, &mc_inner.connection);
            }
        });

        Ok(Self { inner })
    }
}
