use bollard::models::PortMap;
use tracing::debug;

/// Derive the ordered list of host ports the probe will exercise.
///
/// `bound_ports` is the running container's port map (container port ->
/// host bindings), `exposed_ports` the image's EXPOSE list in declaration
/// order, `cmd_port`/`evt_port` the inspector's reserved control ports
/// (never probed), and `target_ports` an explicit container-port
/// allow-list.
///
/// With targets given, the plan is exactly the bound host ports of those
/// targets, in the given order; unbound targets are dropped. Otherwise the
/// exposed ports are walked from last to first (the newest EXPOSE is
/// usually the service port), followed by whatever bound ports remain.
pub fn plan(
    bound_ports: &PortMap,
    exposed_ports: &[String],
    cmd_port: &str,
    evt_port: &str,
    target_ports: &[u16],
) -> Vec<String> {
    let is_control = |key: &str| key == cmd_port || key == evt_port;

    let mut available: Vec<String> = bound_ports
        .iter()
        .filter(|(key, _)| !is_control(key))
        .filter_map(|(_, bindings)| first_host_port(bindings.as_deref()))
        .collect();
    available.sort_unstable();
    debug!(ports = ?available, "available host ports");

    let mut plan = Vec::new();

    if !target_ports.is_empty() {
        for port in target_ports {
            let key = format!("{}/tcp", port);
            if is_control(&key) {
                debug!(port = %key, "skipping control port");
                continue;
            }
            match bound_ports.get(&key).and_then(|b| first_host_port(b.as_deref())) {
                Some(host_port) => plan.push(host_port),
                None => debug!(port = %key, "ignoring unbound target port"),
            }
        }
        debug!(ports = ?plan, "filtered port plan");
        return plan;
    }

    for exposed in exposed_ports.iter().rev() {
        let key = if exposed.contains('/') {
            exposed.clone()
        } else {
            format!("{}/tcp", exposed)
        };
        if is_control(&key) {
            debug!(port = %key, "skipping control port");
            continue;
        }
        match bound_ports.get(&key).and_then(|b| first_host_port(b.as_deref())) {
            Some(host_port) => {
                available.retain(|p| *p != host_port);
                plan.push(host_port);
            }
            None => debug!(port = %key, "exposed port is not bound"),
        }
    }

    plan.extend(available);
    debug!(ports = ?plan, "port plan");
    plan
}

fn first_host_port(bindings: Option<&[bollard::models::PortBinding]>) -> Option<String> {
    bindings?.first()?.host_port.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::PortBinding;
    use std::collections::HashMap;

    const CMD: &str = "65501/tcp";
    const EVT: &str = "65502/tcp";

    fn bind(host_port: &str) -> Option<Vec<PortBinding>> {
        Some(vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some(host_port.to_string()),
        }])
    }

    fn bound(entries: &[(&str, &str)]) -> PortMap {
        entries
            .iter()
            .map(|(container, host)| (container.to_string(), bind(host)))
            .collect()
    }

    #[test]
    fn test_control_ports_never_planned() {
        let ports = bound(&[("80/tcp", "32780"), (CMD, "32901"), (EVT, "32902")]);

        let derived = plan(&ports, &["80".to_string()], CMD, EVT, &[]);
        assert_eq!(derived, vec!["32780"]);

        // even when targeted explicitly
        let targeted = plan(&ports, &[], CMD, EVT, &[80, 65501, 65502]);
        assert_eq!(targeted, vec!["32780"]);
    }

    #[test]
    fn test_exposed_ports_reversed() {
        let ports = bound(&[("80/tcp", "32780"), ("443/tcp", "32781"), ("9000/tcp", "32782")]);
        let exposed = vec!["80".to_string(), "443".to_string(), "9000/tcp".to_string()];

        let got = plan(&ports, &exposed, CMD, EVT, &[]);
        assert_eq!(got, vec!["32782", "32781", "32780"]);
    }

    #[test]
    fn test_unexposed_bound_ports_follow() {
        let ports = bound(&[("80/tcp", "32780"), ("6379/tcp", "32790")]);
        let exposed = vec!["80".to_string()];

        let got = plan(&ports, &exposed, CMD, EVT, &[]);
        assert_eq!(got[0], "32780");
        assert!(got.contains(&"32790".to_string()));
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn test_target_ports_keep_given_order_and_drop_unbound() {
        let ports = bound(&[("8080/tcp", "32999"), ("9090/tcp", "33000")]);

        let got = plan(&ports, &["8080".to_string()], CMD, EVT, &[9090, 7000, 8080]);
        assert_eq!(got, vec!["33000", "32999"]);
    }

    #[test]
    fn test_target_ports_do_not_fall_back() {
        let ports = bound(&[("8080/tcp", "32999")]);

        let got = plan(&ports, &["8080".to_string()], CMD, EVT, &[7000]);
        assert!(got.is_empty());
    }

    #[test]
    fn test_empty_everything_gives_empty_plan() {
        let got = plan(&HashMap::new(), &[], CMD, EVT, &[]);
        assert!(got.is_empty());
    }

    #[test]
    fn test_unbound_binding_entries_ignored() {
        let mut ports = bound(&[("80/tcp", "32780")]);
        ports.insert("443/tcp".to_string(), None);
        ports.insert("9000/tcp".to_string(), Some(Vec::new()));

        let got = plan(&ports, &["443".to_string(), "80".to_string()], CMD, EVT, &[]);
        assert_eq!(got, vec!["32780"]);
    }
}
