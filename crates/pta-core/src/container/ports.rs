// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host port scouting and per-team addressing.

use std::collections::HashMap;

use bollard::models::PortBinding;
use tokio::net::TcpListener;

/// Bind `n` listeners on port 0, record what the kernel handed out, then close them.
///
/// The ports are only free at the moment of return; the caller must handle
/// a bind failure when the container starts.
pub async fn find_free_ports(n: usize) -> std::io::Result<Vec<i32>> {
    // Keep every listener open until all are assigned so the same port
    // cannot come back twice.
    let mut listeners = Vec::with_capacity(n);
    for _ in 0..n {
        listeners.push(TcpListener::bind("0.0.0.0:0").await?);
    }

    listeners
        .iter()
        .map(|l| l.local_addr().map(|a| i32::from(a.port())))
        .collect()
}

/// Deterministic `/24` subnet and gateway for a team network.
pub fn team_subnet(team_id: i32) -> (String, String) {
    let id = team_id.max(0) as u32;
    let second = 128 + ((id >> 8) & 127);
    let third = id & 255;
    (
        format!("10.{}.{}.0/24", second, third),
        format!("10.{}.{}.1", second, third),
    )
}

/// Docker `PortBindings` map for `(container_port, host_port)` pairs.
pub fn port_bindings(ports: &[(i32, i32)]) -> HashMap<String, Option<Vec<PortBinding>>> {
    ports
        .iter()
        .map(|(container, host)| {
            (
                format!("{}/tcp", container),
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(host.to_string()),
                }]),
            )
        })
        .collect()
}

/// Docker `ExposedPorts` map.
pub fn exposed_ports(ports: &[(i32, i32)]) -> HashMap<String, HashMap<(), ()>> {
    ports
        .iter()
        .map(|(container, _)| (format!("{}/tcp", container), HashMap::new()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_find_free_ports_distinct() {
        let ports = find_free_ports(5).await.unwrap();
        assert_eq!(ports.len(), 5);
        let unique: HashSet<_> = ports.iter().collect();
        assert_eq!(unique.len(), 5);
        assert!(ports.iter().all(|p| *p > 0 && *p <= 65535));
    }

    #[tokio::test]
    async fn test_find_zero_ports() {
        assert!(find_free_ports(0).await.unwrap().is_empty());
    }

    #[test]
    fn test_team_subnet() {
        assert_eq!(
            team_subnet(1),
            ("10.128.1.0/24".to_string(), "10.128.1.1".to_string())
        );
        assert_eq!(team_subnet(256).0, "10.129.0.0/24");
        assert_eq!(team_subnet(300).0, "10.129.44.0/24");
    }

    #[test]
    fn test_team_subnets_unique_for_small_ids() {
        let subnets: HashSet<String> = (0..4096).map(|id| team_subnet(id).0).collect();
        assert_eq!(subnets.len(), 4096);
    }

    #[test]
    fn test_port_bindings_shape() {
        let map = port_bindings(&[(80, 31337)]);
        let binding = map["80/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("31337"));
        assert_eq!(binding[0].host_ip.as_deref(), Some("0.0.0.0"));
        assert!(exposed_ports(&[(80, 31337)]).contains_key("80/tcp"));
    }
}
