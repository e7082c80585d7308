#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("uuid must be exactly 36 characters, got {0}")]
    MalformedUuid(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Transport(#[from] rdpmux_transport::TransportError),
}

#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    #[error(transparent)]
    Shm(#[from] rdpmux_shm::ShmError),

    #[error("surface byte length {got} does not match declared {width}x{height}x{bpp}")]
    SurfaceSizeMismatch { got: usize, width: i32, height: i32, bpp: i32 },
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("D-Bus connection failed: {0}")]
    Connection(#[source] zbus::Error),

    #[error("D-Bus call failed: {0}")]
    Call(#[source] zbus::Error),

    #[error("server reported unsupported protocol versions {got:?}, need {want}")]
    UnsupportedProtocol { got: Vec<i32>, want: i32 },
}
