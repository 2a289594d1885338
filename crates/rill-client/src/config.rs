// Client-side defaults and configuration.
use rill_transport::TransportConfig;

/// Hard safety cap for any single control frame.
///
/// `read_frame` allocates a buffer sized by the advertised length; without a
/// cap a buggy or malicious server could advertise an enormous length.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct ClientConfig {
    /// Credential string in `name:payload` form (see `rill_auth::Credential`).
    pub credential: String,
    pub quinn: quinn::ClientConfig,
    pub transport: TransportConfig,
    pub max_frame_bytes: usize,
}

impl ClientConfig {
    pub fn new(quinn: quinn::ClientConfig, credential: impl Into<String>) -> Self {
        Self {
            credential: credential.into(),
            quinn,
            transport: TransportConfig::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}
