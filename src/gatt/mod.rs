//! GATT object model: the D-Bus-facing interface names and flag sets shared by the service,
//! characteristic and descriptor layers, plus the declarative [`builder`] application code uses
//! to assemble a tree of them.

pub mod builder;
pub mod local;

pub(crate) const SERVICE_INTERFACE: &str = "org.bluez.GattService1";
pub(crate) const CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";
pub(crate) const DESCRIPTOR_INTERFACE: &str = "org.bluez.GattDescriptor1";

define_flags!(pub CharacteristicFlags, "Bluetooth GATT characteristic flags." => {
    /// If set, permits broadcasts of the Characteristic Value using the Server Characteristic
    /// Configuration Descriptor.
    broadcast ("broadcast"),
    /// If set, clients may read this characteristic.
    read ("read"),
    /// If set, clients may use the Write Command ATT operation (no reply expected).
    write_without_response ("write-without-response"),
    /// If set, clients may use the Write Request/Response ATT operation.
    write ("write"),
    /// If set, clients may subscribe to Handle Value Notifications.
    notify ("notify"),
    /// If set, clients may subscribe to Handle Value Indications (acknowledged).
    indicate ("indicate"),
    /// If set, clients may use the Signed Write Without Response procedure.
    authenticated_signed_writes ("authenticated-signed-writes"),
    /// If set, clients may use the Reliable Writes procedure.
    reliable_write ("reliable-write"),
    /// If set, a client may write to this characteristic's User Description Descriptor.
    writable_auxiliaries ("writable-auxiliaries"),
    /// Require encryption for reading.
    encrypt_read ("encrypt-read"),
    /// Require encryption for writing.
    encrypt_write ("encrypt-write"),
    /// Require authentication for reading.
    encrypt_authenticated_read ("encrypt-authenticated-read"),
    /// Require authentication for writing.
    encrypt_authenticated_write ("encrypt-authenticated-write"),
    /// Require security for reading.
    secure_read ("secure-read"),
    /// Require security for writing.
    secure_write ("secure-write"),
});

define_flags!(pub DescriptorFlags, "Bluetooth GATT characteristic descriptor flags." => {
    /// If set, clients may read this descriptor.
    read ("read"),
    /// If set, clients may write this descriptor.
    write ("write"),
    /// Require encryption for reading.
    encrypt_read ("encrypt-read"),
    /// Require encryption for writing.
    encrypt_write ("encrypt-write"),
    /// Require authentication for reading.
    encrypt_authenticated_read ("encrypt-authenticated-read"),
    /// Require authentication for writing.
    encrypt_authenticated_write ("encrypt-authenticated-write"),
    /// Require security for reading.
    secure_read ("secure-read"),
    /// Require security for writing.
    secure_write ("secure-write"),
});
