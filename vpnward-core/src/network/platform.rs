//! Operating system command table
//!
//! The route, DNS and diagnostics commands differ between macOS and Linux.
//! The table is chosen at compile time.

/// Command templates for the current operating system
#[derive(Debug)]
pub struct PlatformCommands {
    /// Route lookup; the destination IP is appended
    pub route_get: &'static [&'static str],
    /// Pattern capturing the tunnel interface in the route lookup output
    pub tunnel_route_pattern: &'static str,
    /// Routing table dump (diagnostics only)
    pub route_dump: &'static [&'static str],
    /// Proxy configuration dump (diagnostics only)
    pub proxy_dump: &'static [&'static str],
    /// DNS configuration dump (diagnostics only)
    pub dns_dump: &'static [&'static str],
    /// Flush the resolver cache
    pub dns_flush: &'static [&'static str],
    /// Make the DNS responder reload
    pub dns_reload: &'static [&'static str],
    /// Route deletion; the CIDR is appended
    pub route_delete: &'static [&'static str],
}

#[cfg(target_os = "macos")]
pub const CURRENT: PlatformCommands = PlatformCommands {
    route_get: &["route", "-n", "get"],
    tunnel_route_pattern: r"interface:\s+(utun\d+)",
    route_dump: &["netstat", "-rn", "-f", "inet"],
    proxy_dump: &["scutil", "--proxy"],
    dns_dump: &["scutil", "--dns"],
    dns_flush: &["dscacheutil", "-flushcache"],
    dns_reload: &["killall", "-HUP", "mDNSResponder"],
    route_delete: &["route", "-n", "delete", "-inet"],
};

#[cfg(not(target_os = "macos"))]
pub const CURRENT: PlatformCommands = PlatformCommands {
    route_get: &["ip", "route", "get"],
    tunnel_route_pattern: r"dev\s+(u?tun\d+)",
    route_dump: &["ip", "-4", "route", "show"],
    proxy_dump: &["cat", "/etc/environment"],
    dns_dump: &["resolvectl", "status"],
    dns_flush: &["resolvectl", "flush-caches"],
    dns_reload: &["systemctl", "reload-or-restart", "systemd-resolved"],
    route_delete: &["ip", "route", "del"],
};

/// The two /1 routes a tunnel client installs to override the default route
pub const SPLIT_DEFAULT_ROUTES: [&str; 2] = ["0.0.0.0/1", "128.0.0.0/1"];

impl PlatformCommands {
    pub fn route_get_argv(&self, ip: &str) -> Vec<String> {
        with_trailing(self.route_get, ip)
    }

    pub fn route_delete_argv(&self, cidr: &str) -> Vec<String> {
        with_trailing(self.route_delete, cidr)
    }
}

fn with_trailing(template: &[&str], last: &str) -> Vec<String> {
    template
        .iter()
        .map(|part| part.to_string())
        .chain(std::iter::once(last.to_string()))
        .collect()
}
