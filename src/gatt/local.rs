//! Publish a declared GATT object [`Tree`] to BlueZ over D-Bus.
//!
//! Each node in the tree is registered as its own D-Bus object carrying the BlueZ-required
//! `org.bluez.Gatt{Service,Characteristic,Descriptor}1` interface; `ObjectManager` support comes
//! from `dbus_crossroads`'s own object-manager token, so `GetManagedObjects` needs no hand-rolled
//! walk here.

use dbus::{
    arg::{PropMap, Variant},
    channel::Sender,
    message::SignalArgs,
    nonblock::{stdintf::org_freedesktop_dbus::PropertiesPropertiesChanged, Proxy, SyncConnection},
    Path,
};
use dbus_crossroads::{Crossroads, IfaceBuilder, IfaceToken};
use futures::lock::Mutex as AsyncMutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};
use tokio::sync::mpsc;

use super::{
    builder::{CharacteristicHandle, DescriptorHandle, ReqError, ServiceHandle, Tree},
    CHARACTERISTIC_INTERFACE, DESCRIPTOR_INTERFACE, SERVICE_INTERFACE,
};
use crate::{cr_property, method_call, parent_path, publish_path, session::SessionInner, Error, ErrorKind, Result};

pub(crate) const MANAGER_INTERFACE: &str = "org.bluez.GattManager1";
pub(crate) const GATT_APP_PREFIX: &str = publish_path!("gatt/app/0");
const PROXY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// D-Bus object path of the adapter addressed for `GattManager1` calls.
///
/// Only a single, fixed-index controller is supported (§ non-goals).
pub(crate) fn adapter_path(index: u16) -> Path<'static> {
    Path::new(format!("/org/bluez/hci{index}")).expect("hci index produces a valid object path")
}

// ===========================================================================================
// Service
// ===========================================================================================

pub(crate) struct RegisteredService {
    tree: Arc<Tree>,
    handle: ServiceHandle,
}

impl RegisteredService {
    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(SERVICE_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            cr_property!(ib, "UUID", reg => {
                Some(reg.tree.services[reg.handle.0].uuid.to_string())
            });
            cr_property!(ib, "Primary", reg => {
                Some(reg.tree.services[reg.handle.0].primary)
            });
        })
    }
}

// ===========================================================================================
// Characteristic
// ===========================================================================================

/// Tracks the subset of a characteristic's state that changes at runtime: whether a central is
/// currently subscribed, and the value last emitted in a `PropertiesChanged` signal (used for
/// change detection per § property-change-emission).
struct CharacteristicState {
    notifying: AtomicBool,
    last_emitted: AsyncMutex<Option<Vec<u8>>>,
}

pub(crate) struct RegisteredCharacteristic {
    tree: Arc<Tree>,
    handle: CharacteristicHandle,
    path: Path<'static>,
    state: CharacteristicState,
    connection: Weak<SyncConnection>,
    notify_tx: mpsc::Sender<NotifyToken>,
}

impl RegisteredCharacteristic {
    fn node(&self) -> &super::builder::CharacteristicNode {
        &self.tree.characteristics[self.handle.0]
    }

    /// Re-evaluates this characteristic's value and, if it changed and a central is subscribed,
    /// emits `PropertiesChanged { Value }`. Called from the server's notify-queue drain and from
    /// periodic `onEvent` dispatch; always runs on the single loop task.
    pub(crate) async fn refresh(&self) -> Result<()> {
        let node = self.node();

        let proceed = match &node.on_updated_value {
            Some(handler) => handler().await,
            None => true,
        };
        if !proceed {
            return Ok(());
        }

        let Some(on_read) = &node.on_read else { return Ok(()) };
        let value = match on_read().await {
            Ok(v) => v,
            Err(err) => return Err(Error::new(ErrorKind::ApplicationError(err.to_string()))),
        };

        let mut last_emitted = self.state.last_emitted.lock().await;
        if last_emitted.as_ref() == Some(&value) {
            return Ok(());
        }
        *last_emitted = Some(value.clone());
        drop(last_emitted);

        if self.state.notifying.load(Ordering::Acquire) {
            self.emit_value_changed(value)?;
        }
        Ok(())
    }

    fn emit_value_changed(&self, value: Vec<u8>) -> Result<()> {
        let Some(connection) = self.connection.upgrade() else { return Ok(()) };
        let mut changed_properties = PropMap::new();
        changed_properties.insert("Value".to_string(), Variant(Box::new(value)));
        let ppc = PropertiesPropertiesChanged {
            interface_name: CHARACTERISTIC_INTERFACE.to_string(),
            changed_properties,
            invalidated_properties: Vec::new(),
        };
        let msg = ppc.to_emit_message(&self.path);
        connection
            .send(msg)
            .map_err(|_| Error { kind: ErrorKind::TransportError("lost D-Bus connection".into()), message: String::new() })
    }

    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(CHARACTERISTIC_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            cr_property!(ib, "UUID", reg => {
                Some(reg.node().uuid.to_string())
            });
            cr_property!(ib, "Flags", reg => {
                Some(reg.node().flags.as_vec())
            });
            ib.property("Service").get(|ctx, _| Ok(parent_path(ctx.path())));
            cr_property!(ib, "Notifying", reg => {
                Some(reg.state.notifying.load(Ordering::Acquire))
            });
            cr_property!(ib, "Value", reg => {
                Some(reg.state.last_emitted.try_lock().and_then(|g| g.clone()).unwrap_or_default())
            });

            ib.method_with_cr_async("ReadValue", ("options",), ("value",), |ctx, cr, (_options,): (PropMap,)| {
                method_call(ctx, cr, |reg: Arc<Self>| async move {
                    match &reg.node().on_read {
                        Some(on_read) => {
                            let value = on_read().await?;
                            *reg.state.last_emitted.lock().await = Some(value.clone());
                            Ok((value,))
                        }
                        None => Err(ReqError::NotSupported.into()),
                    }
                })
            });

            ib.method_with_cr_async(
                "WriteValue",
                ("value", "options"),
                (),
                |ctx, cr, (value, _options): (Vec<u8>, PropMap)| {
                    method_call(ctx, cr, |reg: Arc<Self>| async move {
                        let node = reg.node();
                        if !(node.flags.write || node.flags.write_without_response) {
                            return Err(ReqError::NotPermitted.into());
                        }
                        match &node.on_write {
                            Some(on_write) => {
                                on_write(value).await?;
                                if node.flags.notify || node.flags.indicate {
                                    let _ = reg.notify_tx.send(NotifyToken::Characteristic(reg.path.clone())).await;
                                }
                                Ok(())
                            }
                            None => Err(ReqError::NotSupported.into()),
                        }
                    })
                },
            );

            ib.method_with_cr_async("StartNotify", (), (), |ctx, cr, ()| {
                method_call(ctx, cr, |reg: Arc<Self>| async move {
                    let node = reg.node();
                    if node.flags.notify || node.flags.indicate {
                        reg.state.notifying.store(true, Ordering::Release);
                        Ok(())
                    } else {
                        Err(ReqError::NotSupported.into())
                    }
                })
            });

            ib.method_with_cr_async("StopNotify", (), (), |ctx, cr, ()| {
                method_call(ctx, cr, |reg: Arc<Self>| async move {
                    reg.state.notifying.store(false, Ordering::Release);
                    Ok(())
                })
            });

            ib.method_with_cr_async("Confirm", (), (), |ctx, cr, ()| {
                method_call(ctx, cr, |_reg: Arc<Self>| async move { Ok(()) })
            });
        })
    }
}

// ===========================================================================================
// Descriptor
// ===========================================================================================

struct DescriptorState {
    last_emitted: AsyncMutex<Option<Vec<u8>>>,
}

pub(crate) struct RegisteredDescriptor {
    tree: Arc<Tree>,
    handle: DescriptorHandle,
    path: Path<'static>,
    state: DescriptorState,
    connection: Weak<SyncConnection>,
}

impl RegisteredDescriptor {
    fn node(&self) -> &super::builder::DescriptorNode {
        &self.tree.descriptors[self.handle.0]
    }

    pub(crate) async fn refresh(&self) -> Result<()> {
        let Some(on_read) = &self.node().on_read else { return Ok(()) };
        let value = on_read().await.map_err(|err| Error::new(ErrorKind::ApplicationError(err.to_string())))?;

        let mut last_emitted = self.state.last_emitted.lock().await;
        if last_emitted.as_ref() == Some(&value) {
            return Ok(());
        }
        *last_emitted = Some(value.clone());
        drop(last_emitted);

        let Some(connection) = self.connection.upgrade() else { return Ok(()) };
        let mut changed_properties = PropMap::new();
        changed_properties.insert("Value".to_string(), Variant(Box::new(value)));
        let ppc = PropertiesPropertiesChanged {
            interface_name: DESCRIPTOR_INTERFACE.to_string(),
            changed_properties,
            invalidated_properties: Vec::new(),
        };
        let msg = ppc.to_emit_message(&self.path);
        connection
            .send(msg)
            .map_err(|_| Error { kind: ErrorKind::TransportError("lost D-Bus connection".into()), message: String::new() })?;
        Ok(())
    }

    pub(crate) fn register_interface(cr: &mut Crossroads) -> IfaceToken<Arc<Self>> {
        cr.register(DESCRIPTOR_INTERFACE, |ib: &mut IfaceBuilder<Arc<Self>>| {
            cr_property!(ib, "UUID", reg => {
                Some(reg.node().uuid.to_string())
            });
            cr_property!(ib, "Flags", reg => {
                Some(reg.node().flags.as_vec())
            });
            ib.property("Characteristic").get(|ctx, _| Ok(parent_path(ctx.path())));
            cr_property!(ib, "Value", reg => {
                Some(reg.state.last_emitted.try_lock().and_then(|g| g.clone()).unwrap_or_default())
            });

            ib.method_with_cr_async("ReadValue", ("options",), ("value",), |ctx, cr, (_options,): (PropMap,)| {
                method_call(ctx, cr, |reg: Arc<Self>| async move {
                    match &reg.node().on_read {
                        Some(on_read) => {
                            let value = on_read().await?;
                            *reg.state.last_emitted.lock().await = Some(value.clone());
                            Ok((value,))
                        }
                        None => Err(ReqError::NotSupported.into()),
                    }
                })
            });

            ib.method_with_cr_async(
                "WriteValue",
                ("value", "options"),
                (),
                |ctx, cr, (value, _options): (Vec<u8>, PropMap)| {
                    method_call(ctx, cr, |reg: Arc<Self>| async move {
                        match &reg.node().on_write {
                            Some(on_write) => {
                                on_write(value.clone()).await?;
                                *reg.state.last_emitted.lock().await = Some(value);
                                Ok(())
                            }
                            None => Err(ReqError::NotSupported.into()),
                        }
                    })
                },
            );
        })
    }
}

// ===========================================================================================
// Application
// ===========================================================================================

/// A notify-queue token: identifies the node whose value should be re-evaluated.
#[derive(Clone, Debug)]
pub(crate) enum NotifyToken {
    /// Re-evaluate the characteristic at this path.
    Characteristic(Path<'static>),
    /// Re-evaluate the descriptor at this path.
    Descriptor(Path<'static>),
}

/// A published GATT application: the registered D-Bus objects plus the lookup tables the server
/// loop uses to translate notify-queue tokens and periodic ticks into emissions.
pub(crate) struct ApplicationHandle {
    app_path: Path<'static>,
    characteristics_by_path: HashMap<Path<'static>, Arc<RegisteredCharacteristic>>,
    descriptors_by_path: HashMap<Path<'static>, Arc<RegisteredDescriptor>>,
    characteristic_paths: HashMap<CharacteristicHandle, Path<'static>>,
    descriptor_paths: HashMap<DescriptorHandle, Path<'static>>,
    tree: Arc<Tree>,
    notify_tx: mpsc::Sender<NotifyToken>,
}

impl ApplicationHandle {
    pub(crate) fn characteristic_path(&self, handle: CharacteristicHandle) -> Option<Path<'static>> {
        self.characteristic_paths.get(&handle).cloned()
    }

    pub(crate) fn descriptor_path(&self, handle: DescriptorHandle) -> Option<Path<'static>> {
        self.descriptor_paths.get(&handle).cloned()
    }

    /// Enqueues a re-evaluation of `handle` on the notify queue; used by
    /// [`crate::Server::notify_updated_characteristic`].
    pub(crate) async fn notify_characteristic(&self, handle: CharacteristicHandle) {
        if let Some(path) = self.characteristic_path(handle) {
            let _ = self.notify_tx.send(NotifyToken::Characteristic(path)).await;
        }
    }

    /// Enqueues a re-evaluation of `handle` on the notify queue; used by
    /// [`crate::Server::notify_updated_descriptor`].
    pub(crate) async fn notify_descriptor(&self, handle: DescriptorHandle) {
        if let Some(path) = self.descriptor_path(handle) {
            let _ = self.notify_tx.send(NotifyToken::Descriptor(path)).await;
        }
    }

    pub(crate) async fn handle_token(&self, token: &NotifyToken) -> Result<()> {
        match token {
            NotifyToken::Characteristic(path) => {
                if let Some(reg) = self.characteristics_by_path.get(path) {
                    reg.refresh().await?;
                }
            }
            NotifyToken::Descriptor(path) => {
                if let Some(reg) = self.descriptors_by_path.get(path) {
                    reg.refresh().await?;
                }
            }
        }
        Ok(())
    }

    /// Runs every characteristic's periodic `onEvent` handler that is due this tick, then
    /// refreshes its value.
    pub(crate) async fn dispatch_due_events(&self) -> Result<()> {
        for handle in self.tree.characteristic_handles() {
            let node = &self.tree.characteristics[handle.0];
            if node.tick_due() {
                if let Some((_, event)) = &node.event {
                    event().await;
                }
                if let Some(path) = self.characteristic_path(handle) {
                    if let Some(reg) = self.characteristics_by_path.get(&path) {
                        reg.refresh().await?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Publishes `tree` under the session's connection and registers it with BlueZ's `GattManager1`.
///
/// `notify_tx` is the sending half of the server's notify queue; it is cloned into every
/// registered characteristic so `WriteValue` can enqueue a re-evaluation after a write to a
/// notifying/indicating characteristic, and retained on the returned handle for
/// [`ApplicationHandle::notify_characteristic`]/[`ApplicationHandle::notify_descriptor`].
/// Rejects a tree containing a characteristic whose flags advertise `notify`/`indicate` but that
/// has no way to ever produce an update: `refresh` can only emit `PropertiesChanged` if `on_read`
/// is attached, no matter what `on_updated_value` gates on top of it (§ invariant: a notifying
/// characteristic must expose a working update path).
fn validate(tree: &Tree) -> Result<()> {
    for (idx, node) in tree.characteristics.iter().enumerate() {
        if (node.flags.notify || node.flags.indicate) && node.on_read.is_none() {
            return Err(Error::new(ErrorKind::ConfigError(format!(
                "characteristic {idx} ({}) declares notify/indicate but has no on_read to source the update",
                node.uuid
            ))));
        }
    }
    Ok(())
}

pub(crate) async fn register(
    tree: Arc<Tree>, inner: &Arc<SessionInner>, controller_index: u16, notify_tx: mpsc::Sender<NotifyToken>,
) -> Result<ApplicationHandle> {
    validate(&tree)?;

    let app_path = Path::new(GATT_APP_PREFIX).unwrap();
    log::trace!("publishing GATT application at {}", &app_path);

    let mut characteristics_by_path = HashMap::new();
    let mut descriptors_by_path = HashMap::new();
    let mut characteristic_paths = HashMap::new();
    let mut descriptor_paths = HashMap::new();

    {
        let mut cr = inner.crossroads.lock().await;
        let om = cr.object_manager::<()>();
        cr.insert(app_path.clone(), &[om], ());

        for (service_idx, _service) in tree.services.iter().enumerate() {
            let service_handle = ServiceHandle(service_idx);
            let service_path = Path::new(format!("{app_path}/service{service_idx}")).unwrap();
            log::trace!("publishing service at {}", &service_path);
            cr.insert(
                service_path.clone(),
                &[inner.gatt_reg_service_token],
                Arc::new(RegisteredService { tree: tree.clone(), handle: service_handle }),
            );

            let mut char_idx = 0usize;
            for (idx, char_node) in tree.characteristics.iter().enumerate() {
                if char_node.service != service_handle {
                    continue;
                }
                let char_handle = CharacteristicHandle(idx);
                let char_path = Path::new(format!("{service_path}/char{char_idx}")).unwrap();
                char_idx += 1;
                log::trace!("publishing characteristic at {}", &char_path);

                let reg_char = Arc::new(RegisteredCharacteristic {
                    tree: tree.clone(),
                    handle: char_handle,
                    path: char_path.clone(),
                    state: CharacteristicState {
                        notifying: AtomicBool::new(false),
                        last_emitted: AsyncMutex::new(None),
                    },
                    connection: Arc::downgrade(&inner.connection),
                    notify_tx: notify_tx.clone(),
                });
                cr.insert(char_path.clone(), &[inner.gatt_reg_characteristic_token], reg_char.clone());
                characteristics_by_path.insert(char_path.clone(), reg_char);
                characteristic_paths.insert(char_handle, char_path.clone());

                let mut desc_idx = 0usize;
                for (didx, desc_node) in tree.descriptors.iter().enumerate() {
                    if desc_node.characteristic != char_handle {
                        continue;
                    }
                    let desc_handle = DescriptorHandle(didx);
                    let desc_path = Path::new(format!("{char_path}/desc{desc_idx}")).unwrap();
                    desc_idx += 1;
                    log::trace!("publishing descriptor at {}", &desc_path);

                    let reg_desc = Arc::new(RegisteredDescriptor {
                        tree: tree.clone(),
                        handle: desc_handle,
                        path: desc_path.clone(),
                        state: DescriptorState { last_emitted: AsyncMutex::new(None) },
                        connection: Arc::downgrade(&inner.connection),
                    });
                    cr.insert(desc_path.clone(), &[inner.gatt_reg_characteristic_descriptor_token], reg_desc.clone());
                    descriptors_by_path.insert(desc_path.clone(), reg_desc);
                    descriptor_paths.insert(desc_handle, desc_path);
                }
            }
        }
    }

    log::trace!("registering GATT application at {}", &app_path);
    let proxy = Proxy::new(crate::SERVICE_NAME, adapter_path(controller_index), PROXY_TIMEOUT, inner.connection.clone());
    let (): () = proxy.method_call(MANAGER_INTERFACE, "RegisterApplication", (app_path.clone(), PropMap::new())).await?;

    Ok(ApplicationHandle {
        app_path,
        characteristics_by_path,
        descriptors_by_path,
        characteristic_paths,
        descriptor_paths,
        tree,
        notify_tx,
    })
}

/// Best-effort unregistration; used during shutdown.
pub(crate) async fn unregister(app: &ApplicationHandle, inner: &Arc<SessionInner>, controller_index: u16) {
    log::trace!("unregistering GATT application at {}", &app.app_path);
    let proxy = Proxy::new(crate::SERVICE_NAME, adapter_path(controller_index), PROXY_TIMEOUT, inner.connection.clone());
    let _: std::result::Result<(), dbus::Error> =
        proxy.method_call(MANAGER_INTERFACE, "UnregisterApplication", (app.app_path.clone(),)).await;

    let mut cr = inner.crossroads.lock().await;
    for path in app.descriptors_by_path.keys() {
        let _: Option<Arc<RegisteredDescriptor>> = cr.remove(path);
    }
    for path in app.characteristics_by_path.keys() {
        let _: Option<Arc<RegisteredCharacteristic>> = cr.remove(path);
    }
    let service_paths: std::collections::HashSet<Path<'static>> = app
        .characteristics_by_path
        .keys()
        .map(|p| parent_path(p))
        .collect();
    for path in service_paths {
        let _: Option<Arc<RegisteredService>> = cr.remove(&path);
    }
    let _: Option<()> = cr.remove(&app.app_path);
}
