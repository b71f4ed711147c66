use std::net::SocketAddr;
use std::path::PathBuf;

/// Listener endpoint for a protocol server instance.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
    UnixWritable(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Endpoint of the default VRF protocol server.
    pub listen: Endpoint,
    /// Directory for per-VRF protocol server sockets (zserv-vrf<N>.api).
    pub vrf_socket_dir: PathBuf,
    /// Start a dedicated protocol server for each non-default VRF.
    pub per_vrf_listen: bool,
    /// Force every inbound header's VRF id to this value.
    pub force_vrf: Option<u16>,
    /// Equal-cost multipath carve-out for kernel default routes.
    pub add_path_default: bool,
    /// Drop version 3 route updates addressed to the default VRF.
    pub default_vrf_protect: bool,
}

impl Config {
    pub fn new() -> Config {
        Config {
            listen: Endpoint::Unix(PathBuf::from("/var/run/zserv.api")),
            vrf_socket_dir: PathBuf::from("/var/run"),
            per_vrf_listen: true,
            force_vrf: None,
            add_path_default: false,
            default_vrf_protect: false,
        }
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}
