use std::error::Error as _;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use reqwest::Method;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{HttpProbeCmd, HttpProbeOpts};

const DEFAULT_RETRY_COUNT: u32 = 5;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_MAX_IDLE: usize = 10;

/// Grace period for the target to start accepting connections.
/// TODO: replace with a port-reachability check instead of a flat sleep.
const WARMUP: Duration = Duration::from_secs(9);

/// Exercises every planned (port, command, protocol) triple against the
/// target container, with bounded retries and failure-class backoff.
///
/// `start` spawns a single worker task and returns immediately; `done`
/// hands out a receiver that resolves once the worker has emitted its
/// summary. The engine is sequential: one request in flight at a time.
pub struct HttpProbe {
    ports: Vec<String>,
    cmds: Vec<HttpProbeCmd>,
    opts: HttpProbeOpts,
    host_ip: String,
    print_prefix: String,
    warmup: Duration,
    done_tx: Option<watch::Sender<bool>>,
    done_rx: watch::Receiver<bool>,
}

impl HttpProbe {
    pub fn new(
        ports: Vec<String>,
        cmds: Vec<HttpProbeCmd>,
        opts: HttpProbeOpts,
        host_ip: String,
        print_prefix: String,
    ) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            ports,
            cmds,
            opts,
            host_ip,
            print_prefix,
            warmup: WARMUP,
            done_tx: Some(done_tx),
            done_rx,
        }
    }

    /// Host ports the worker will visit, in order.
    pub fn ports(&self) -> &[String] {
        &self.ports
    }

    /// Resolves to `true` once the probe pass is over. Receivers obtained
    /// after completion observe the value immediately.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// Spawn the worker task. A second call is a no-op.
    pub fn start(&mut self) {
        let Some(done_tx) = self.done_tx.take() else {
            warn!("http probe already started");
            return;
        };

        println!(
            "{} state=http.probe.starting message='WAIT FOR HTTP PROBE TO FINISH'",
            self.print_prefix
        );

        let worker = ProbeWorker {
            ports: self.ports.clone(),
            cmds: self.cmds.clone(),
            opts: self.opts.clone(),
            host_ip: self.host_ip.clone(),
            print_prefix: self.print_prefix.clone(),
            warmup: self.warmup,
            done_tx,
        };
        tokio::spawn(worker.run());
    }

    #[cfg(test)]
    fn skip_warmup(&mut self) {
        self.warmup = Duration::ZERO;
    }
}

struct ProbeWorker {
    ports: Vec<String>,
    cmds: Vec<HttpProbeCmd>,
    opts: HttpProbeOpts,
    host_ip: String,
    print_prefix: String,
    warmup: Duration,
    done_tx: watch::Sender<bool>,
}

impl ProbeWorker {
    async fn run(self) {
        sleep(self.warmup).await;

        println!("{} state=http.probe.running", self.print_prefix);
        info!("HTTP probe started");

        let mut call_count: u64 = 0;
        let mut fail_count: u64 = 0;
        let mut ok_count: u64 = 0;

        // the target is a freshly started local container, often with a
        // self-signed certificate; verification is off on purpose
        match reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE)
            .danger_accept_invalid_certs(true)
            .build()
        {
            Ok(client) => {
                self.exercise(&client, &mut call_count, &mut fail_count, &mut ok_count)
                    .await;
            }
            Err(err) => {
                warn!(error = %err, "could not build probe HTTP client");
            }
        }

        info!("HTTP probe done");
        println!(
            "{} info=http.probe.summary total={} failures={} successful={}",
            self.print_prefix, call_count, fail_count, ok_count
        );

        let warning = if call_count == 0 {
            " warning=no.calls"
        } else if ok_count == 0 {
            " warning=no.successful.calls"
        } else {
            ""
        };
        println!("{} state=http.probe.done{}", self.print_prefix, warning);

        let _ = self.done_tx.send(true);
    }

    async fn exercise(
        &self,
        client: &reqwest::Client,
        call_count: &mut u64,
        fail_count: &mut u64,
        ok_count: &mut u64,
    ) {
        let max_retries = if self.opts.retry_count > 0 {
            self.opts.retry_count
        } else {
            DEFAULT_RETRY_COUNT
        };

        for port in &self.ports {
            // one good port is enough unless a full pass was requested
            if *ok_count > 0 && !self.opts.probe_full {
                break;
            }

            for cmd in &self.cmds {
                let protocols: Vec<&str> = if cmd.protocol.is_empty() {
                    vec!["http", "https"]
                } else {
                    vec![cmd.protocol.as_str()]
                };

                for proto in protocols {
                    let addr = format!("{}://{}:{}{}", proto, self.host_ip, port, cmd.resource);

                    for attempt in 1..=max_retries {
                        *call_count += 1;

                        match self.call(client, cmd, &addr).await {
                            Ok(status) => {
                                self.print_call(&status.to_string(), cmd, &addr, attempt, None);
                                *ok_count += 1;
                                break;
                            }
                            Err(err) => {
                                *fail_count += 1;
                                self.print_call("error", cmd, &addr, attempt, Some(&err));

                                let kind = FailureKind::classify(&err);
                                debug!(kind = ?kind, target = %addr, "probe attempt failed, backing off");
                                sleep(kind.wait(self.opts.retry_wait)).await;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn call(
        &self,
        client: &reqwest::Client,
        cmd: &HttpProbeCmd,
        addr: &str,
    ) -> Result<u16, reqwest::Error> {
        let method = Method::from_bytes(cmd.method.as_bytes()).unwrap_or_else(|_| {
            debug!(method = %cmd.method, "unknown method, using GET");
            Method::GET
        });

        let mut req = client.request(method, addr);

        for hline in &cmd.headers {
            match hline.split_once(':') {
                Some((name, value)) => req = req.header(name.trim(), value.trim()),
                None => debug!(header = %hline, "ignoring malformed header"),
            }
        }

        if !cmd.username.is_empty() || !cmd.password.is_empty() {
            req = req.basic_auth(&cmd.username, Some(&cmd.password));
        }

        if !cmd.body.is_empty() {
            // a fresh copy per attempt: the body always replays from the start
            req = req.body(cmd.body.clone());
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();

        // drain the body so the pooled connection can be reused
        if let Err(err) = resp.bytes().await {
            debug!(error = %err, "discarding response body failed");
        }

        Ok(status)
    }

    fn print_call(
        &self,
        status: &str,
        cmd: &HttpProbeCmd,
        addr: &str,
        attempt: u32,
        error: Option<&reqwest::Error>,
    ) {
        let error_part = match error {
            Some(err) => format!("error='{}' ", err),
            None => String::new(),
        };
        println!(
            "{} info=http.probe.call status={} method={} target={} attempt={} {}time={}",
            self.print_prefix,
            status,
            cmd.method,
            addr,
            attempt,
            error_part,
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        );
    }
}

/// Failure classes driving the backoff choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    /// the server closed the connection mid-exchange: likely still booting
    NotReady,
    /// any other transport-level failure
    Web,
    /// request never made it onto the wire
    Other,
}

impl FailureKind {
    fn classify(err: &reqwest::Error) -> Self {
        let mut cause: Option<&(dyn std::error::Error + 'static)> = err.source();
        while let Some(inner) = cause {
            if let Some(hyper_err) = inner.downcast_ref::<hyper::Error>() {
                if hyper_err.is_incomplete_message() {
                    return Self::NotReady;
                }
            }
            cause = inner.source();
        }

        if err.is_builder() {
            Self::Other
        } else {
            Self::Web
        }
    }

    fn wait(self, retry_wait: u64) -> Duration {
        let secs = match (self, retry_wait) {
            (Self::Web, 0) => 8,
            (Self::NotReady, 0) => 16,
            (Self::Other, 0) => 4,
            (Self::Web, wait) => wait,
            (Self::NotReady, wait) => wait * 2,
            (Self::Other, wait) => wait / 2,
        };
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_opts() -> HttpProbeOpts {
        HttpProbeOpts {
            retry_count: 1,
            retry_wait: 1,
            probe_full: false,
            target_ports: Vec::new(),
        }
    }

    async fn wait_done(probe: &HttpProbe) {
        let mut rx = probe.done();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Minimal HTTP responder: accepts, reads until the headers end, and
    /// writes an empty 200. Returns the bound port and an accept counter.
    async fn spawn_ok_server() -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_srv = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                hits_srv.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 2048];
                let _ = sock.read(&mut buf).await;
                let _ = sock
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                    .await;
            }
        });

        (port, hits)
    }

    /// Accepts, reads a bit, then closes without responding: produces the
    /// end-of-stream (not-ready) failure on the client side.
    async fn spawn_slam_server() -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_srv = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                hits_srv.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 2048];
                let _ = sock.read(&mut buf).await;
                // drop without writing a response
            }
        });

        (port, hits)
    }

    fn http_get(port_hint: &str) -> HttpProbeCmd {
        let mut cmd = HttpProbeCmd::default_probe();
        cmd.protocol = "http".to_string();
        cmd.resource = format!("/{}", port_hint);
        cmd
    }

    #[test]
    fn test_backoff_defaults() {
        assert_eq!(FailureKind::Web.wait(0), Duration::from_secs(8));
        assert_eq!(FailureKind::NotReady.wait(0), Duration::from_secs(16));
        assert_eq!(FailureKind::Other.wait(0), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_derived_from_retry_wait() {
        assert_eq!(FailureKind::Web.wait(10), Duration::from_secs(10));
        assert_eq!(FailureKind::NotReady.wait(10), Duration::from_secs(20));
        assert_eq!(FailureKind::Other.wait(10), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_classify_connection_refused_as_web() {
        // bind then drop to get a port that refuses connections
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = reqwest::Client::new();
        let err = client
            .get(format!("http://127.0.0.1:{}/", port))
            .send()
            .await
            .unwrap_err();
        assert_eq!(FailureKind::classify(&err), FailureKind::Web);
    }

    #[tokio::test]
    async fn test_classify_closed_mid_exchange_as_not_ready() {
        let (port, _) = spawn_slam_server().await;

        let client = reqwest::Client::new();
        let err = client
            .get(format!("http://127.0.0.1:{}/", port))
            .send()
            .await
            .unwrap_err();
        assert_eq!(FailureKind::classify(&err), FailureKind::NotReady);
    }

    #[tokio::test]
    async fn test_empty_plan_closes_done_without_calls() {
        let mut probe = HttpProbe::new(
            Vec::new(),
            vec![HttpProbeCmd::default_probe()],
            test_opts(),
            "127.0.0.1".to_string(),
            "slimbox[test]:".to_string(),
        );
        probe.skip_warmup();
        probe.start();

        wait_done(&probe).await;
        // late receivers resolve immediately
        let rx = probe.done();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_second_start_is_a_no_op() {
        let mut probe = HttpProbe::new(
            Vec::new(),
            Vec::new(),
            test_opts(),
            "127.0.0.1".to_string(),
            "slimbox[test]:".to_string(),
        );
        probe.skip_warmup();
        probe.start();
        probe.start();

        wait_done(&probe).await;
    }

    #[tokio::test]
    async fn test_success_short_circuits_remaining_ports() {
        let (first_port, first_hits) = spawn_ok_server().await;
        let (second_port, second_hits) = spawn_ok_server().await;

        let mut probe = HttpProbe::new(
            vec![first_port.to_string(), second_port.to_string()],
            vec![http_get("")],
            test_opts(),
            "127.0.0.1".to_string(),
            "slimbox[test]:".to_string(),
        );
        probe.skip_warmup();
        probe.start();
        wait_done(&probe).await;

        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_probe_full_visits_every_port() {
        let (first_port, first_hits) = spawn_ok_server().await;
        let (second_port, second_hits) = spawn_ok_server().await;

        let mut opts = test_opts();
        opts.probe_full = true;

        let mut probe = HttpProbe::new(
            vec![first_port.to_string(), second_port.to_string()],
            vec![http_get("")],
            opts,
            "127.0.0.1".to_string(),
            "slimbox[test]:".to_string(),
        );
        probe.skip_warmup();
        probe.start();
        wait_done(&probe).await;

        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_bounded_by_retry_count() {
        let (port, hits) = spawn_slam_server().await;

        let mut opts = test_opts();
        opts.retry_count = 2;

        let mut probe = HttpProbe::new(
            vec![port.to_string()],
            vec![http_get("")],
            opts,
            "127.0.0.1".to_string(),
            "slimbox[test]:".to_string(),
        );
        probe.skip_warmup();
        probe.start();
        wait_done(&probe).await;

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_body_replayed_from_start_on_retry() {
        const BODY: &str = r#"{"x":1}"#;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let bodies: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let bodies_srv = bodies.clone();

        tokio::spawn(async move {
            let mut first = true;
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = Vec::new();
                let mut tmp = [0u8; 1024];
                loop {
                    let Ok(n) = sock.read(&mut tmp).await else { break };
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&tmp[..n]);
                    if let Some(pos) = find_body_start(&buf) {
                        if buf.len() - pos >= BODY.len() {
                            break;
                        }
                    }
                }
                if let Some(pos) = find_body_start(&buf) {
                    let body = String::from_utf8_lossy(&buf[pos..]).to_string();
                    bodies_srv.lock().unwrap().push(body);
                }
                if first {
                    first = false;
                    // close mid-exchange to force a retry
                } else {
                    let _ = sock
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                        .await;
                }
            }
        });

        let mut cmd = http_get("");
        cmd.method = "POST".to_string();
        cmd.body = BODY.to_string();
        cmd.headers = vec!["Content-Type: application/json".to_string()];

        let mut opts = test_opts();
        opts.retry_count = 2;

        let mut probe = HttpProbe::new(
            vec![port.to_string()],
            vec![cmd],
            opts,
            "127.0.0.1".to_string(),
            "slimbox[test]:".to_string(),
        );
        probe.skip_warmup();
        probe.start();
        wait_done(&probe).await;

        let seen = bodies.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], BODY);
        assert_eq!(seen[1], BODY);
    }

    fn find_body_start(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
    }

    #[tokio::test]
    async fn test_malformed_header_skipped_valid_header_sent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let request: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let request_srv = request.clone();

        tokio::spawn(async move {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            let mut buf = [0u8; 4096];
            let n = sock.read(&mut buf).await.unwrap_or(0);
            *request_srv.lock().unwrap() = String::from_utf8_lossy(&buf[..n]).to_string();
            let _ = sock
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                .await;
        });

        let mut cmd = http_get("");
        cmd.headers = vec![
            "X-No-Colon".to_string(),
            "X-Trace-Id: abc123".to_string(),
        ];

        let mut probe = HttpProbe::new(
            vec![port.to_string()],
            vec![cmd],
            test_opts(),
            "127.0.0.1".to_string(),
            "slimbox[test]:".to_string(),
        );
        probe.skip_warmup();
        probe.start();
        wait_done(&probe).await;

        let seen = request.lock().unwrap();
        assert!(seen.to_lowercase().contains("x-trace-id: abc123"));
        assert!(!seen.to_lowercase().contains("x-no-colon"));
    }
}
