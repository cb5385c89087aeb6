use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Process configuration for the relay. Constructed by the CLI in production
/// and directly by tests, which shorten the timeouts instead of sleeping.
#[derive(Clone, Debug)]
pub struct RelayOptions {
    pub host: IpAddr,
    pub port: u16,
    /// When set, `/cdp` upgrades must carry a matching `?token=` and
    /// privileged HTTP must carry it as bearer or query parameter.
    pub token: Option<String>,
    /// Extension ids accepted as WebSocket origins and as
    /// `chrome-extension://` target URLs.
    pub allowed_extension_ids: Vec<String>,
    /// Create an initial tab on the first driver `Target.setAutoAttach`
    /// when the extension has no attached targets.
    pub auto_create_tab: bool,
    pub extension_request_timeout: Duration,
    pub ping_interval: Duration,
    pub runtime_enable_wait: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 19988,
            token: None,
            allowed_extension_ids: Vec::new(),
            auto_create_tab: false,
            extension_request_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(5),
            runtime_enable_wait: Duration::from_secs(3),
        }
    }
}
