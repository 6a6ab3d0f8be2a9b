// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Network utility functions

use std::net::{IpAddr, Ipv4Addr};

/// Host used when a local target does not name one
pub const DEFAULT_LOCAL_HOST: &str = "127.0.0.1";

/// Join host and port, bracketing bare IPv6 addresses
pub fn format_host_port(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => format!("[{}]:{}", v6, port),
        _ => format!("{}:{}", host, port),
    }
}

/// Loopback address every local server binds to
pub fn loopback() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
