//! Service discovery: ask a well-known D-Bus service for the path of this
//! VM's private communication socket.
//!
//! The bus name and object path are runtime parameters supplied by the
//! embedding VMM (they name a broker process the VMM itself configures),
//! so the proxy is instantiated with a builder rather than the compile-time
//! `default_service`/`default_path` shown elsewhere in this workspace.

use crate::error::DiscoveryError;

/// Protocol version this library speaks. The broker must list it among its
/// supported versions or registration is refused.
pub const PROTOCOL_VERSION: i32 = 2;

#[zbus::proxy(interface = "org.rdpmux.RDPMux")]
trait RDPMux {
    #[zbus(property)]
    fn supported_protocol_versions(&self) -> zbus::Result<Vec<i32>>;

    fn register(&self, vm_id: i32, protocol_version: i32) -> zbus::Result<String>;
}

/// Register `vm_id` with the broker at `bus_name`/`object_path` and return
/// the path of the socket it should connect its transport to.
pub fn get_socket_path(bus_name: &str, object_path: &str, vm_id: i32) -> Result<String, DiscoveryError> {
    let connection = zbus::blocking::Connection::system().map_err(DiscoveryError::Connection)?;

    let proxy = RDPMuxProxyBlocking::builder(&connection)
        .destination(bus_name.to_string())
        .map_err(DiscoveryError::Connection)?
        .path(object_path.to_string())
        .map_err(DiscoveryError::Connection)?
        .build()
        .map_err(DiscoveryError::Connection)?;

    let versions = proxy.supported_protocol_versions().map_err(DiscoveryError::Call)?;
    if !versions.contains(&PROTOCOL_VERSION) {
        return Err(DiscoveryError::UnsupportedProtocol { got: versions, want: PROTOCOL_VERSION });
    }

    let path = proxy.register(vm_id, PROTOCOL_VERSION).map_err(DiscoveryError::Call)?;
    tracing::info!(vm_id, path = %path, "Registered with broker");
    Ok(path)
}
