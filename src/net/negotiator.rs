//! Port negotiation
//!
//! Binds the desired port, or the first free alternate when it is taken.
//! Only address-in-use moves on to the next candidate; permission and
//! other bind errors end the walk.

use serde::Serialize;
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::{ConfigSource, MIN_PORT, suggest_alternatives};

/// Number of ports tried above the desired one
const UPWARD_CANDIDATES: u16 = 10;

/// Number of ports tried below the desired one
const DOWNWARD_CANDIDATES: u16 = 5;

/// Ports below the desired one are only tried above this port
const DOWNWARD_FLOOR: u16 = 5000;

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("Permission denied binding port {port} (requested via {origin})")]
    PermissionDenied { port: u16, origin: ConfigSource },

    #[error(
        "No ports available: tried {tried:?} starting from {desired} (requested via {origin}); ports claimed by sibling services: {claimed:?}"
    )]
    NoPortsAvailable {
        desired: u16,
        origin: ConfigSource,
        tried: Vec<u16>,
        claimed: Vec<u16>,
    },

    #[error("Failed to bind port {port}: {error}")]
    Bind {
        port: u16,
        #[source]
        error: io::Error,
    },
}

impl NegotiationError {
    /// Operator-facing remediation
    pub fn hint(&self) -> Option<String> {
        match self {
            NegotiationError::PermissionDenied { port, .. } if *port < MIN_PORT => Some(format!(
                "Port {port} is privileged. Use a port of {MIN_PORT} or above with --http-port or HTTP_SERVER_PORT"
            )),
            NegotiationError::PermissionDenied { .. } => Some(
                "The port is blocked for this user. Pick another one with --http-port or HTTP_SERVER_PORT"
                    .to_string(),
            ),
            NegotiationError::NoPortsAvailable { claimed, tried, .. } => {
                let self_inflicted: Vec<u16> = tried
                    .iter()
                    .copied()
                    .filter(|port| claimed.contains(port))
                    .collect();
                if self_inflicted.is_empty() {
                    Some(
                        "Stop whatever is holding these ports (see `lsof -i :<port>`) or choose a different range"
                            .to_string(),
                    )
                } else {
                    Some(format!(
                        "Ports {self_inflicted:?} are claimed by this daemon's own services; give each service its own port"
                    ))
                }
            }
            NegotiationError::Bind { .. } => None,
        }
    }
}

/// Outcome of a successful negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortResolution {
    pub desired_port: u16,
    pub source: ConfigSource,
    pub candidates: Vec<u16>,
    pub chosen_port: u16,
}

impl PortResolution {
    /// True when an alternate was bound instead of the desired port
    pub fn is_fallback(&self) -> bool {
        self.chosen_port != self.desired_port
    }
}

/// Binds a TCP listener for one service
#[derive(Debug, Clone)]
pub struct PortNegotiator {
    service: String,
    host: IpAddr,
    source: ConfigSource,
    claimed: Vec<u16>,
}

impl PortNegotiator {
    pub fn new(service: impl Into<String>, source: ConfigSource) -> Self {
        Self {
            service: service.into(),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            source,
            claimed: Vec::new(),
        }
    }

    /// Ports owned by sibling services, reported when nothing binds
    pub fn with_claimed_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.claimed = ports.into_iter().collect();
        self
    }

    /// Bind `desired`, then each of `alternates` in order on address-in-use
    pub async fn resolve_and_bind(
        &self,
        desired: u16,
        alternates: &[u16],
    ) -> Result<(TcpListener, PortResolution), NegotiationError> {
        info!(
            "{} port {} requested via {}",
            self.service, desired, self.source
        );

        let mut candidates = Vec::with_capacity(alternates.len() + 1);
        candidates.push(desired);
        for port in alternates {
            if !candidates.contains(port) {
                candidates.push(*port);
            }
        }

        let mut tried = Vec::with_capacity(candidates.len());
        for port in candidates.iter().copied() {
            tried.push(port);
            match TcpListener::bind(SocketAddr::new(self.host, port)).await {
                Ok(listener) => {
                    let chosen_port = listener
                        .local_addr()
                        .map(|addr| addr.port())
                        .unwrap_or(port);
                    let resolution = PortResolution {
                        desired_port: desired,
                        source: self.source.clone(),
                        candidates: candidates.clone(),
                        chosen_port,
                    };
                    if resolution.is_fallback() {
                        warn!(
                            "{} port {} (from {}) was unavailable, using fallback port {}",
                            self.service, desired, self.source, chosen_port
                        );
                    } else {
                        info!(
                            "{} bound port {} (from {})",
                            self.service, chosen_port, self.source
                        );
                    }
                    return Ok((listener, resolution));
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    debug!("{} port {} is in use, trying next candidate", self.service, port);
                }
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    return Err(NegotiationError::PermissionDenied {
                        port,
                        origin: self.source.clone(),
                    });
                }
                Err(error) => return Err(NegotiationError::Bind { port, error }),
            }
        }

        Err(NegotiationError::NoPortsAvailable {
            desired,
            origin: self.source.clone(),
            tried,
            claimed: self.claimed.clone(),
        })
    }
}

/// Alternates for `base`: suggestions, then the next ports up, then a few
/// below when `base` sits high enough
pub fn default_alternates(base: u16, claimed: &HashSet<u16>) -> Vec<u16> {
    let mut alternates = suggest_alternatives(base, claimed, 3);

    let upward = (1..=UPWARD_CANDIDATES).filter_map(|offset| base.checked_add(offset));
    let downward = (1..=DOWNWARD_CANDIDATES)
        .filter(|_| base > DOWNWARD_FLOOR)
        .filter_map(|offset| base.checked_sub(offset));

    for port in upward.chain(downward) {
        if port >= MIN_PORT && !claimed.contains(&port) && !alternates.contains(&port) {
            alternates.push(port);
        }
    }
    alternates
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn occupied_port() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn free_port() -> u16 {
        let (listener, port) = occupied_port().await;
        drop(listener);
        port
    }

    #[tokio::test]
    async fn test_binds_desired_port_when_free() {
        let port = free_port().await;
        let negotiator = PortNegotiator::new("status", ConfigSource::Default);

        let (listener, resolution) = negotiator.resolve_and_bind(port, &[]).await.unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
        assert_eq!(resolution.chosen_port, port);
        assert!(!resolution.is_fallback());
    }

    #[tokio::test]
    async fn test_falls_back_to_alternate_on_conflict() {
        let (_held, busy) = occupied_port().await;
        let alternate = free_port().await;
        let negotiator = PortNegotiator::new(
            "status",
            ConfigSource::Environment("HTTP_SERVER_PORT".to_string()),
        );

        let (listener, resolution) = negotiator
            .resolve_and_bind(busy, &[alternate])
            .await
            .unwrap();

        assert_eq!(listener.local_addr().unwrap().port(), alternate);
        assert!(resolution.is_fallback());
        assert_eq!(resolution.desired_port, busy);
        assert_eq!(
            resolution.source,
            ConfigSource::Environment("HTTP_SERVER_PORT".to_string())
        );
        assert_eq!(resolution.candidates, vec![busy, alternate]);
    }

    #[tokio::test]
    async fn test_all_candidates_busy() {
        let (_a, busy_a) = occupied_port().await;
        let (_b, busy_b) = occupied_port().await;
        let negotiator = PortNegotiator::new("status", ConfigSource::Cli)
            .with_claimed_ports([busy_b]);

        let error = negotiator
            .resolve_and_bind(busy_a, &[busy_b, busy_a])
            .await
            .unwrap_err();

        match &error {
            NegotiationError::NoPortsAvailable {
                desired,
                tried,
                claimed,
                origin,
            } => {
                assert_eq!(*desired, busy_a);
                assert_eq!(tried, &vec![busy_a, busy_b]);
                assert_eq!(claimed, &vec![busy_b]);
                assert_eq!(*origin, ConfigSource::Cli);
            }
            other => panic!("expected NoPortsAvailable, got {other:?}"),
        }
        assert!(error.hint().unwrap().contains("claimed by this daemon"));
    }

    #[test]
    fn test_permission_denied_hint() {
        let error = NegotiationError::PermissionDenied {
            port: 80,
            origin: ConfigSource::Cli,
        };
        assert!(error.hint().unwrap().contains("privileged"));
        assert!(error.to_string().contains("command line"));
    }

    #[test]
    fn test_default_alternates_low_port() {
        let claimed: HashSet<u16> = [3000, 3002].into_iter().collect();
        let alternates = default_alternates(3002, &claimed);

        assert_eq!(&alternates[..3], &[3003, 3004, 3005]);
        assert!(alternates.contains(&3012));
        assert!(!alternates.contains(&3000));
        // Nothing below the desired port under the floor
        assert!(alternates.iter().all(|p| *p > 3002));
    }

    #[test]
    fn test_default_alternates_go_downward_above_floor() {
        let alternates = default_alternates(8080, &HashSet::new());
        assert!(alternates.contains(&8090));
        assert!(alternates.contains(&8075));
        assert!(!alternates.contains(&8074));

        let mut unique = alternates.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), alternates.len());
    }
}
