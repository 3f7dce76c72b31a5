//! Declarative construction of a GATT object tree.
//!
//! Application code assembles services, characteristics and descriptors with nested nested-closure
//! builders rather than the begin/end call stack of the system this crate's tree model is ported
//! from: `application(|app| { app.service(uuid, true, |s| { s.characteristic(uuid, flags, |c| {
//! c.on_read(...); }); }); })`. Each closure receives a builder handle scoped to exactly the node
//! it is nested under, so the begin/end stack discipline falls out of ordinary Rust scoping.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use uuid::Uuid;

use super::{CharacteristicFlags, DescriptorFlags};

/// Error response from a GATT handler to a Bluetooth request.
///
/// Mirrors the ATT-domain error names BlueZ expects in the `org.bluez.Error` namespace.
#[derive(Clone, Copy, Debug, displaydoc::Display, Eq, PartialEq, Ord, PartialOrd, Hash, strum::IntoStaticStr)]
#[non_exhaustive]
pub enum ReqError {
    /// request failed
    Failed,
    /// request already in progress
    InProgress,
    /// invalid offset
    InvalidOffset,
    /// invalid value length
    InvalidValueLength,
    /// request not permitted
    NotPermitted,
    /// request not authorized
    NotAuthorized,
    /// request not supported
    NotSupported,
}

impl std::error::Error for ReqError {}

impl Default for ReqError {
    fn default() -> Self {
        Self::Failed
    }
}

impl From<ReqError> for dbus::MethodErr {
    fn from(err: ReqError) -> Self {
        let name: &'static str = err.into();
        Self::from((crate::ERR_PREFIX.to_string() + name, &err.to_string()))
    }
}

/// Result of a GATT handler invocation.
pub type ReqResult<T> = std::result::Result<T, ReqError>;

type ReadFuture = Pin<Box<dyn Future<Output = ReqResult<Vec<u8>>> + Send>>;
type WriteFuture = Pin<Box<dyn Future<Output = ReqResult<()>> + Send>>;
type UpdatedFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
type EventFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) type ReadHandler = Arc<dyn Fn() -> ReadFuture + Send + Sync>;
pub(crate) type WriteHandler = Arc<dyn Fn(Vec<u8>) -> WriteFuture + Send + Sync>;
pub(crate) type UpdatedHandler = Arc<dyn Fn() -> UpdatedFuture + Send + Sync>;
pub(crate) type EventHandler = Arc<dyn Fn() -> EventFuture + Send + Sync>;

/// Stable, non-owning reference to a service published in a [`Tree`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ServiceHandle(pub(crate) usize);

/// Stable, non-owning reference to a characteristic published in a [`Tree`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CharacteristicHandle(pub(crate) usize);

/// Stable, non-owning reference to a descriptor published in a [`Tree`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct DescriptorHandle(pub(crate) usize);

pub(crate) struct ServiceNode {
    pub uuid: Uuid,
    pub primary: bool,
}

pub(crate) struct CharacteristicNode {
    pub service: ServiceHandle,
    pub uuid: Uuid,
    pub flags: CharacteristicFlags,
    pub on_read: Option<ReadHandler>,
    pub on_write: Option<WriteHandler>,
    pub on_updated_value: Option<UpdatedHandler>,
    pub event: Option<(u64, EventHandler)>,
    pub ticks_since_last: AtomicU64,
}

pub(crate) struct DescriptorNode {
    pub characteristic: CharacteristicHandle,
    pub uuid: Uuid,
    pub flags: DescriptorFlags,
    pub on_read: Option<ReadHandler>,
    pub on_write: Option<WriteHandler>,
}

/// A fully declared, immutable GATT object tree.
///
/// Built once via [`application`] during server initialization and never mutated afterward; the
/// server publishes it to D-Bus and BlueZ and dispatches all runtime reads/writes/notifications
/// through the handlers attached at construction time.
#[derive(Default)]
pub struct Tree {
    pub(crate) services: Vec<ServiceNode>,
    pub(crate) characteristics: Vec<CharacteristicNode>,
    pub(crate) descriptors: Vec<DescriptorNode>,
}

impl Tree {
    /// Iterates the handles of every characteristic in declaration order.
    pub(crate) fn characteristic_handles(&self) -> impl Iterator<Item = CharacteristicHandle> {
        (0..self.characteristics.len()).map(CharacteristicHandle)
    }
}

/// Top-level builder handle, scoped to the whole tree.
pub struct ApplicationBuilder<'t> {
    tree: &'t mut Tree,
}

impl<'t> ApplicationBuilder<'t> {
    /// Declares a service with the given UUID, pushes it onto the tree, and runs `build` with a
    /// builder handle scoped to it.
    pub fn service(
        &mut self, uuid: impl Into<Uuid>, primary: bool, build: impl FnOnce(&mut ServiceBuilder),
    ) -> ServiceHandle {
        let handle = ServiceHandle(self.tree.services.len());
        self.tree.services.push(ServiceNode { uuid: uuid.into(), primary });
        let mut builder = ServiceBuilder { tree: self.tree, handle };
        build(&mut builder);
        handle
    }
}

/// Builder handle scoped to one service.
pub struct ServiceBuilder<'t> {
    tree: &'t mut Tree,
    handle: ServiceHandle,
}

impl<'t> ServiceBuilder<'t> {
    /// Declares a characteristic of this service with the given UUID and access flags.
    pub fn characteristic(
        &mut self, uuid: impl Into<Uuid>, flags: CharacteristicFlags, build: impl FnOnce(&mut CharacteristicBuilder),
    ) -> CharacteristicHandle {
        let handle = CharacteristicHandle(self.tree.characteristics.len());
        self.tree.characteristics.push(CharacteristicNode {
            service: self.handle,
            uuid: uuid.into(),
            flags,
            on_read: None,
            on_write: None,
            on_updated_value: None,
            event: None,
            ticks_since_last: AtomicU64::new(0),
        });
        let mut builder = CharacteristicBuilder { tree: self.tree, handle };
        build(&mut builder);
        handle
    }
}

/// Builder handle scoped to one characteristic.
///
/// The `on_*` methods attach handler closures; the handle itself stays valid after the
/// construction closure returns, for application code that wants to keep it (e.g. to pass to
/// [`crate::Server::notify_updated_characteristic`]).
pub struct CharacteristicBuilder<'t> {
    tree: &'t mut Tree,
    handle: CharacteristicHandle,
}

impl<'t> CharacteristicBuilder<'t> {
    fn node(&mut self) -> &mut CharacteristicNode {
        &mut self.tree.characteristics[self.handle.0]
    }

    /// The handle of the characteristic under construction.
    pub fn handle(&self) -> CharacteristicHandle {
        self.handle
    }

    /// Declares a descriptor of this characteristic with the given UUID and access flags.
    pub fn descriptor(
        &mut self, uuid: impl Into<Uuid>, flags: DescriptorFlags, build: impl FnOnce(&mut DescriptorBuilder),
    ) -> DescriptorHandle {
        let handle = DescriptorHandle(self.tree.descriptors.len());
        self.tree.descriptors.push(DescriptorNode {
            characteristic: self.handle,
            uuid: uuid.into(),
            flags,
            on_read: None,
            on_write: None,
        });
        let mut builder = DescriptorBuilder { tree: self.tree, handle };
        build(&mut builder);
        handle
    }

    /// Attaches a read handler. Must return promptly: it must not block on I/O (§ handler
    /// contracts); latency-sensitive application state should be read from memory already
    /// updated by the application's own background work.
    pub fn on_read<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ReqResult<Vec<u8>>> + Send + 'static,
    {
        self.node().on_read = Some(Arc::new(move || Box::pin(f())));
        self
    }

    /// Attaches a write handler. Must commit the value before returning; the server sends the
    /// method reply (if any) only after this future resolves.
    pub fn on_write<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ReqResult<()>> + Send + 'static,
    {
        self.node().on_write = Some(Arc::new(move |bytes| Box::pin(f(bytes))));
        self
    }

    /// Attaches the handler invoked whenever [`crate::Server::notify_updated_characteristic`] is
    /// called for this characteristic. Returning `true` authorizes the server to read the current
    /// value (via [`Self::on_read`]) and emit `PropertiesChanged` if it differs from the last
    /// emission; returning `false` suppresses the emission for this invocation.
    pub fn on_updated_value<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.node().on_updated_value = Some(Arc::new(move || Box::pin(f())));
        self
    }

    /// Attaches a periodic tick: `handler` fires every `period_ticks` iterations of the server's
    /// main loop, and the server emits `PropertiesChanged` for this characteristic afterward.
    pub fn on_event<F, Fut>(&mut self, period_ticks: u64, f: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.node().event = Some((period_ticks.max(1), Arc::new(move || Box::pin(f()))));
        self
    }
}

/// Builder handle scoped to one descriptor.
pub struct DescriptorBuilder<'t> {
    tree: &'t mut Tree,
    handle: DescriptorHandle,
}

impl<'t> DescriptorBuilder<'t> {
    fn node(&mut self) -> &mut DescriptorNode {
        &mut self.tree.descriptors[self.handle.0]
    }

    /// The handle of the descriptor under construction.
    pub fn handle(&self) -> DescriptorHandle {
        self.handle
    }

    /// Attaches a read handler.
    pub fn on_read<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ReqResult<Vec<u8>>> + Send + 'static,
    {
        self.node().on_read = Some(Arc::new(move || Box::pin(f())));
        self
    }

    /// Attaches a write handler.
    pub fn on_write<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ReqResult<()>> + Send + 'static,
    {
        self.node().on_write = Some(Arc::new(move |bytes| Box::pin(f(bytes))));
        self
    }
}

/// Declares a GATT application tree: `application(|app| { app.service(...); })`.
pub fn application(build: impl FnOnce(&mut ApplicationBuilder)) -> Tree {
    let mut tree = Tree::default();
    let mut builder = ApplicationBuilder { tree: &mut tree };
    build(&mut builder);
    tree
}

impl CharacteristicNode {
    /// Whether this tick makes the attached periodic event due to fire, incrementing the
    /// internal counter as a side effect. Only ever called from the single loop thread.
    pub(crate) fn tick_due(&self) -> bool {
        match &self.event {
            None => false,
            Some((period, _)) => {
                let ticks = self.ticks_since_last.fetch_add(1, Ordering::Relaxed) + 1;
                if ticks >= *period {
                    self.ticks_since_last.store(0, Ordering::Relaxed);
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assembles_nested_tree() {
        let tree = application(|app| {
            app.service(Uuid::from_u128(0x180A), true, |s| {
                s.characteristic(Uuid::from_u128(0x2A29), CharacteristicFlags { read: true, ..Default::default() }, |c| {
                    c.on_read(|| async { Ok(b"Acme Inc.".to_vec()) });
                    c.descriptor(Uuid::from_u128(0x2901), DescriptorFlags { read: true, ..Default::default() }, |_d| {});
                });
            });
        });
        assert_eq!(tree.services.len(), 1);
        assert_eq!(tree.characteristics.len(), 1);
        assert_eq!(tree.descriptors.len(), 1);
        assert_eq!(tree.characteristics[0].service, ServiceHandle(0));
        assert_eq!(tree.descriptors[0].characteristic, CharacteristicHandle(0));
    }

    #[test]
    fn tick_due_fires_every_period_ticks() {
        let tree = application(|app| {
            app.service(Uuid::from_u128(0x180F), true, |s| {
                s.characteristic(Uuid::from_u128(0x2A19), CharacteristicFlags::default(), |c| {
                    c.on_event(3, || async {});
                });
            });
        });
        let node = &tree.characteristics[0];
        let fired: Vec<bool> = (0..6).map(|_| node.tick_due()).collect();
        assert_eq!(fired, vec![false, false, true, false, false, true]);
    }
}
