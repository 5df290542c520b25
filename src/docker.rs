use anyhow::{Context, Result};
use bollard::Docker;
use tracing::debug;

/// Connect to the Docker daemon, honoring `DOCKER_HOST` for TCP daemons and
/// falling back to the platform-local socket.
pub fn connect() -> Result<Docker> {
    let docker = match std::env::var("DOCKER_HOST") {
        Ok(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
            debug!(host = %host, "connecting to Docker over TCP");
            Docker::connect_with_http_defaults()
        }
        _ => Docker::connect_with_local_defaults(),
    }
    .context("connecting to the Docker daemon")?;
    Ok(docker)
}

/// The address probe traffic uses to reach published container ports.
pub fn host_ip() -> String {
    host_ip_from(std::env::var("DOCKER_HOST").ok().as_deref())
}

fn host_ip_from(docker_host: Option<&str>) -> String {
    if let Some(host) = docker_host {
        for scheme in ["tcp://", "http://", "https://"] {
            if let Some(rest) = host.strip_prefix(scheme) {
                let addr = rest.split('/').next().unwrap_or(rest);
                let ip = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
                if !ip.is_empty() {
                    return ip.to_string();
                }
            }
        }
    }
    "127.0.0.1".to_string()
}

/// Whether a daemon error means the referenced object does not exist.
pub fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_ip_from_tcp_host() {
        assert_eq!(host_ip_from(Some("tcp://192.168.99.100:2376")), "192.168.99.100");
        assert_eq!(host_ip_from(Some("http://dockerd.local:2375")), "dockerd.local");
    }

    #[test]
    fn test_host_ip_defaults_to_loopback() {
        assert_eq!(host_ip_from(None), "127.0.0.1");
        assert_eq!(host_ip_from(Some("unix:///var/run/docker.sock")), "127.0.0.1");
    }
}
