//! Session-id validation and session-id to pod-address resolution.
//!
//! Two routing topologies are supported. In DNS mode the pod hostname is
//! the session id and a headless service provides per-pod DNS, so the
//! upstream address is `<sessionId>.<service>:<port>`. In IP mode the
//! session id is a UUID whose 16 raw bytes are the pod IP, which removes
//! the DNS dependency entirely.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use uuid::Uuid;

/// How session ids are minted and mapped back to pod addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RoutingMode {
    /// Pod-per-session DNS under a headless service.
    #[default]
    Dns,
    /// Pod IP embedded in the session UUID.
    Ip,
}

/// Pack an IP address into a UUID. IPv4 addresses take the
/// `::ffff:a.b.c.d` projection so the round trip preserves the family.
pub fn ip_to_uuid(ip: IpAddr) -> Uuid {
    let octets = match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    };
    Uuid::from_bytes(octets)
}

/// Recover the IP address packed into a UUID by [`ip_to_uuid`].
pub fn uuid_to_ip(id: Uuid) -> IpAddr {
    let v6 = Ipv6Addr::from(*id.as_bytes());
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

/// Check a session id for the given routing mode.
///
/// DNS mode accepts any string whose last 36 characters parse as a UUID,
/// which covers pod names like `chrome-120-0-<uuid>`. IP mode requires
/// the whole id to be a UUID since its bytes carry the pod address.
pub fn valid_session_id(mode: RoutingMode, id: &str) -> bool {
    match mode {
        RoutingMode::Dns => {
            if id.len() < 36 {
                return false;
            }
            Uuid::parse_str(&id[id.len() - 36..]).is_ok()
        }
        RoutingMode::Ip => Uuid::parse_str(id).is_ok(),
    }
}

/// Drop the `/wd/hub` prefix clients may use; the sidecar serves the
/// bare WebDriver paths.
pub fn strip_hub_prefix(path: &str) -> &str {
    match path.strip_prefix("/wd/hub") {
        Some("") => "/",
        Some(rest) => rest,
        None => path,
    }
}

/// `host:port` authority for a pod-DNS name.
pub fn dns_authority(session_id: &str, service: &str, port: u16) -> String {
    format!("{session_id}.{service}:{port}")
}

/// `host:port` authority for a raw pod IP. IPv6 addresses are bracketed.
pub fn ip_authority(ip: IpAddr, port: u16) -> String {
    SocketAddr::new(ip, port).to_string()
}

/// Resolves a validated session id to the upstream authority.
#[derive(Debug, Clone)]
pub struct AddressResolver {
    mode: RoutingMode,
    service: String,
    sidecar_port: u16,
}

#[derive(Debug, thiserror::Error)]
#[error("session id not found")]
pub struct InvalidSessionId;

impl AddressResolver {
    pub fn new(mode: RoutingMode, service: impl Into<String>, sidecar_port: u16) -> Self {
        Self {
            mode,
            service: service.into(),
            sidecar_port,
        }
    }

    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    pub fn sidecar_port(&self) -> u16 {
        self.sidecar_port
    }

    /// Resolve to the sidecar port.
    pub fn resolve(&self, session_id: &str) -> Result<String, InvalidSessionId> {
        self.resolve_port(session_id, self.sidecar_port)
    }

    /// Resolve to an explicit port, used by the VNC relay.
    pub fn resolve_port(&self, session_id: &str, port: u16) -> Result<String, InvalidSessionId> {
        if !valid_session_id(self.mode, session_id) {
            return Err(InvalidSessionId);
        }
        match self.mode {
            RoutingMode::Dns => Ok(dns_authority(session_id, &self.service, port)),
            RoutingMode::Ip => {
                let id = Uuid::parse_str(session_id).map_err(|_| InvalidSessionId)?;
                Ok(ip_authority(uuid_to_ip(id), port))
            }
        }
    }

    /// Upstream request path for a client path, honoring the topology's
    /// prefix handling.
    pub fn upstream_path<'a>(&self, path: &'a str) -> &'a str {
        strip_hub_prefix(path)
    }
}
