// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Loophole - Connection Relay
// Splices one publicly accepted connection into the local TLS server

use std::net::SocketAddr;

use loophole_common::RelayError;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tracing::debug;

use crate::ssh::BoxedStream;

/// Dial `target` and copy bytes both ways until each direction has ended.
///
/// Returns the byte counts `(remote -> local, local -> remote)`.
pub async fn relay(mut remote: BoxedStream, target: SocketAddr) -> Result<(u64, u64), RelayError> {
    let mut local = TcpStream::connect(target)
        .await
        .map_err(|source| RelayError::Dial {
            target: target.to_string(),
            source,
        })?;
    // disable nagle for lower latency
    if let Err(e) = local.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY on {}: {}", target, e);
    }

    let (to_local, to_remote) = copy_bidirectional(&mut remote, &mut local).await?;
    debug!(
        "Relay to {} closed: {} bytes in, {} bytes out",
        target, to_local, to_remote
    );
    Ok((to_local, to_remote))
}
