use std::net::Ipv4Addr;

use crate::backend::{GuestInterface, Hypervisor};
use crate::error::ExecutorError;
use crate::poll::{self, PollSpec};

/// First private, non-link-local IPv4 address in agent order.
///
/// Interfaces without a hardware address (loopback, tunnels) or without any
/// address are skipped.
pub fn eligible_address(ifaces: &[GuestInterface]) -> Option<Ipv4Addr> {
    ifaces
        .iter()
        .filter(|i| !i.hwaddr.is_empty() && !i.addrs.is_empty())
        .flat_map(|i| i.addrs.iter())
        .filter_map(|a| a.parse::<Ipv4Addr>().ok())
        .find(|ip| ip.is_private() && !ip.is_link_local())
}

/// Poll the guest agent of `name` until it reports an eligible address.
///
/// Agent errors while the guest is still booting count as a miss.
pub async fn wait_for_address<H: Hypervisor + ?Sized>(
    hv: &H,
    name: &str,
    spec: PollSpec,
) -> Result<Ipv4Addr, ExecutorError> {
    tracing::info!(name, attempts = spec.attempts, "waiting for guest address");
    let started = tokio::time::Instant::now();

    let found = poll::poll_until(spec, |attempt, _| {
        let ip = match hv.guest_interfaces(name) {
            Ok(ifaces) => eligible_address(&ifaces),
            Err(e) => {
                tracing::debug!(name, attempt, error = %e, "guest agent not ready");
                None
            }
        };
        std::future::ready(ip)
    })
    .await;

    match found {
        Some(ip) => {
            tracing::info!(name, %ip, "guest address found");
            Ok(ip)
        }
        None => Err(ExecutorError::Timeout {
            what: format!("a private IPv4 address on {name}"),
            seconds: started.elapsed().as_secs(),
        }),
    }
}
