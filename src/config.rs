use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// One HTTP request template the probe engine replays against every
/// planned port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpProbeCmd {
    pub method: String,
    pub resource: String,
    /// "" means try both http and https; otherwise exactly one of the two
    #[serde(default)]
    pub protocol: String,
    /// `Name: Value` lines; malformed lines are skipped at request time
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl HttpProbeCmd {
    /// The default exercise pass: GET / over both protocols.
    pub fn default_probe() -> Self {
        Self {
            method: "GET".to_string(),
            resource: "/".to_string(),
            protocol: String::new(),
            headers: Vec::new(),
            body: String::new(),
            username: String::new(),
            password: String::new(),
        }
    }

    /// Parse the inline CLI form: `RESOURCE` or `METHOD:RESOURCE`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut cmd = Self::default_probe();
        match s.split_once(':') {
            Some((method, resource))
                if !method.is_empty()
                    && method.chars().all(|c| c.is_ascii_alphabetic())
                    && resource.starts_with('/') =>
            {
                cmd.method = method.to_ascii_uppercase();
                cmd.resource = resource.to_string();
            }
            _ => {
                if !s.starts_with('/') {
                    bail!("invalid probe command (want RESOURCE or METHOD:RESOURCE): {}", s);
                }
                cmd.resource = s.to_string();
            }
        }
        Ok(cmd)
    }
}

/// Load full probe commands from a JSON file (array of objects).
pub fn load_probe_cmd_file(path: &str) -> Result<Vec<HttpProbeCmd>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading probe command file {}", path))?;
    let cmds: Vec<HttpProbeCmd> =
        serde_json::from_str(&data).context("parsing probe command file")?;
    Ok(cmds)
}

/// Probe tuning knobs taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct HttpProbeOpts {
    /// 0 means the engine default (5 attempts)
    pub retry_count: u32,
    /// 0 means the engine default backoff set
    pub retry_wait: u64,
    /// keep probing every port even after one succeeded
    pub probe_full: bool,
    /// explicit container-port allow-list; empty means derive from the image
    pub target_ports: Vec<u16>,
}

/// When the runtime exercise phase ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinueAfter {
    /// a line on standard input
    Enter,
    /// SIGUSR1 delivered to this process
    Signal,
    /// a fixed number of seconds
    Timeout(u64),
    /// the HTTP probe's done channel (implies probing)
    Probe,
}

impl FromStr for ContinueAfter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "enter" => Ok(Self::Enter),
            "signal" => Ok(Self::Signal),
            "probe" => Ok(Self::Probe),
            other => {
                let secs: u64 = other
                    .parse()
                    .with_context(|| format!("invalid continue-after mode: {}", other))?;
                Ok(Self::Timeout(secs))
            }
        }
    }
}

impl fmt::Display for ContinueAfter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enter => write!(f, "enter"),
            Self::Signal => write!(f, "signal"),
            Self::Probe => write!(f, "probe"),
            Self::Timeout(secs) => write!(f, "{}", secs),
        }
    }
}

/// Overrides applied to the instrumented container and, selectively, to the
/// minified image.
#[derive(Debug, Clone, Default)]
pub struct ContainerOverrides {
    pub entrypoint: Vec<String>,
    pub clear_entrypoint: bool,
    pub cmd: Vec<String>,
    pub clear_cmd: bool,
    pub workdir: String,
    pub env: Vec<String>,
    pub user: String,
    pub network: String,
    pub expose: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Instructions added to the minified image on top of what was observed.
#[derive(Debug, Clone, Default)]
pub struct ImageNewInstructions {
    pub workdir: String,
    pub env: Vec<String>,
    pub expose: Vec<String>,
    pub volumes: Vec<String>,
    pub labels: HashMap<String, String>,
}

impl ImageNewInstructions {
    pub fn is_empty(&self) -> bool {
        self.workdir.is_empty()
            && self.env.is_empty()
            && self.expose.is_empty()
            && self.volumes.is_empty()
            && self.labels.is_empty()
    }
}

/// One bind mount handed to the instrumented container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    pub source: String,
    pub destination: String,
    pub options: String,
}

impl VolumeMount {
    /// Parse the CLI form `SOURCE:DESTINATION[:OPTIONS]`.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [source, destination] => Ok(Self {
                source: source.to_string(),
                destination: destination.to_string(),
                options: String::new(),
            }),
            [source, destination, options] => Ok(Self {
                source: source.to_string(),
                destination: destination.to_string(),
                options: options.to_string(),
            }),
            _ => bail!("invalid mount: {} (want SOURCE:DESTINATION[:OPTIONS])", s),
        }
    }
}

/// Parse an exec-form override: a JSON array (`["sh","-c","app"]`) or a
/// plain command line split on whitespace.
pub fn parse_exec(s: &str) -> Result<Vec<String>> {
    let trimmed = s.trim();
    if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).context("parsing exec-form JSON array")
    } else {
        Ok(trimmed.split_whitespace().map(str::to_string).collect())
    }
}

/// Parse `KEY=VALUE` label flags into a map; later flags win.
pub fn parse_labels(specs: &[String]) -> Result<HashMap<String, String>> {
    let mut labels = HashMap::new();
    for spec in specs {
        let (key, value) = spec
            .split_once('=')
            .with_context(|| format!("invalid label (want KEY=VALUE): {}", spec))?;
        labels.insert(key.to_string(), value.to_string());
    }
    Ok(labels)
}

/// Names accepted by `--image-overrides`.
pub const OVERRIDE_SELECTORS: &[&str] = &[
    "entrypoint", "cmd", "workdir", "env", "expose", "network", "user", "label",
];

/// Parse the `--image-overrides` flag value: "all" or a comma list of
/// selector names.
pub fn parse_override_selectors(spec: &str) -> Result<Vec<String>> {
    if spec.is_empty() {
        return Ok(Vec::new());
    }
    if spec == "all" {
        return Ok(OVERRIDE_SELECTORS.iter().map(|s| s.to_string()).collect());
    }
    let mut selectors = Vec::new();
    for name in spec.split(',') {
        let name = name.trim();
        if !OVERRIDE_SELECTORS.contains(&name) {
            bail!("unknown image override selector: {}", name);
        }
        selectors.push(name.to_string());
    }
    Ok(selectors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_cmd_parse_resource_only() {
        let cmd = HttpProbeCmd::parse("/api/health").unwrap();
        assert_eq!(cmd.method, "GET");
        assert_eq!(cmd.resource, "/api/health");
        assert_eq!(cmd.protocol, "");
    }

    #[test]
    fn test_probe_cmd_parse_method_and_resource() {
        let cmd = HttpProbeCmd::parse("post:/v1/items").unwrap();
        assert_eq!(cmd.method, "POST");
        assert_eq!(cmd.resource, "/v1/items");
    }

    #[test]
    fn test_probe_cmd_parse_rejects_bare_word() {
        assert!(HttpProbeCmd::parse("health").is_err());
    }

    #[test]
    fn test_probe_cmd_parse_colon_in_resource() {
        let cmd = HttpProbeCmd::parse("/files/a:b").unwrap();
        assert_eq!(cmd.method, "GET");
        assert_eq!(cmd.resource, "/files/a:b");
    }

    #[test]
    fn test_continue_after_modes() {
        assert_eq!("enter".parse::<ContinueAfter>().unwrap(), ContinueAfter::Enter);
        assert_eq!("signal".parse::<ContinueAfter>().unwrap(), ContinueAfter::Signal);
        assert_eq!("probe".parse::<ContinueAfter>().unwrap(), ContinueAfter::Probe);
        assert_eq!(
            "30".parse::<ContinueAfter>().unwrap(),
            ContinueAfter::Timeout(30)
        );
        assert!("whenever".parse::<ContinueAfter>().is_err());
    }

    #[test]
    fn test_volume_mount_parse() {
        let mount = VolumeMount::parse("/data:/app/data:ro").unwrap();
        assert_eq!(mount.source, "/data");
        assert_eq!(mount.destination, "/app/data");
        assert_eq!(mount.options, "ro");

        assert!(VolumeMount::parse("/data").is_err());
    }

    #[test]
    fn test_parse_exec_forms() {
        assert_eq!(
            parse_exec(r#"["sh","-c","./run.sh"]"#).unwrap(),
            vec!["sh", "-c", "./run.sh"]
        );
        assert_eq!(parse_exec("nginx -g daemon").unwrap(), vec!["nginx", "-g", "daemon"]);
    }

    #[test]
    fn test_override_selectors() {
        assert_eq!(
            parse_override_selectors("all").unwrap().len(),
            OVERRIDE_SELECTORS.len()
        );
        assert_eq!(
            parse_override_selectors("cmd,env").unwrap(),
            vec!["cmd", "env"]
        );
        assert!(parse_override_selectors("bogus").is_err());
    }

    #[test]
    fn test_probe_cmd_file_round_trip() {
        let json = r#"[
            {"method": "POST", "resource": "/v1/x", "protocol": "http",
             "headers": ["Content-Type: application/json"], "body": "{\"x\":1}"}
        ]"#;
        let cmds: Vec<HttpProbeCmd> = serde_json::from_str(json).unwrap();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].method, "POST");
        assert_eq!(cmds[0].headers.len(), 1);
        assert!(cmds[0].username.is_empty());
    }
}
