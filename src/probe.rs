//! Probe orchestration
//!
//! Runs the phases in strict order:
//!
//! ```text
//! Init -> TcpConnected -> TunnelConfirmed -> TlsNegotiated(h2)
//!      -> Http2SessionOpen -> StreamOpen -> StreamComplete -> Closed
//! ```
//!
//! Every failure goes straight to `Closed`. The error names the phase that
//! was being attempted; the [`ProbeFailure`] also records the last phase
//! that was reached, so "the proxy accepted CONNECT but the TLS handshake
//! was reset" reads differently from "the proxy refused the connection".

use crate::config::{ConfigError, Endpoint, ProbeConfig};
use crate::http::connect::{establish_tunnel, TunnelRequest, TunnelResponse};
use crate::http::h2::{self, H2Client, H2ClientBuilder, H2Request, StreamId};
use crate::http::tls::{TlsConfig, TlsError, TlsInfo, TlsSessionOps};
use crate::http::{self, Headers, SessionOps};
use crate::net::{self, FailureKind};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io;
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Probe phases, in the order they are reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Init,
    TcpConnected,
    TunnelConfirmed,
    TlsNegotiated,
    Http2SessionOpen,
    StreamOpen,
    StreamComplete,
    Closed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "INIT",
            Phase::TcpConnected => "TCP_CONNECTED",
            Phase::TunnelConfirmed => "TUNNEL_CONFIRMED",
            Phase::TlsNegotiated => "TLS_NEGOTIATED",
            Phase::Http2SessionOpen => "HTTP2_SESSION_OPEN",
            Phase::StreamOpen => "STREAM_OPEN",
            Phase::StreamComplete => "STREAM_COMPLETE",
            Phase::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal probe errors
///
/// `phase` is the phase whose precondition failed.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("[{phase}] tunnel rejected: {reason}")]
    TunnelRejected {
        phase: Phase,
        /// Proxy status code, when the reply parsed
        status: Option<u16>,
        reason: String,
    },

    #[error("[{phase}] transport error ({kind}): {source}")]
    Transport {
        phase: Phase,
        kind: FailureKind,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("[{phase}] TLS handshake failed: {source}")]
    TlsHandshake {
        phase: Phase,
        #[source]
        source: TlsError,
    },

    #[error("[{phase}] h2 not negotiated (server chose {})", .negotiated.as_deref().unwrap_or("no ALPN protocol"))]
    ProtocolNotNegotiated {
        phase: Phase,
        negotiated: Option<String>,
    },

    #[error("[{phase}] HTTP/2 session error: {source}")]
    Http2Session {
        phase: Phase,
        #[source]
        source: h2::Error,
    },

    #[error("[{phase}] stream {stream_id} failed: {source}")]
    Stream {
        phase: Phase,
        stream_id: StreamId,
        #[source]
        source: h2::Error,
    },

    #[error("[{phase}] timed out after {after:?}")]
    Timeout { phase: Phase, after: Duration },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl ProbeError {
    /// Stable label of the error class
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::TunnelRejected { .. } => "TunnelRejected",
            ProbeError::Transport { .. } => "TransportError",
            ProbeError::TlsHandshake { .. } => "TlsHandshakeError",
            ProbeError::ProtocolNotNegotiated { .. } => "ProtocolNotNegotiated",
            ProbeError::Http2Session { .. } => "Http2SessionError",
            ProbeError::Stream { .. } => "StreamError",
            ProbeError::Timeout { .. } => "Timeout",
            ProbeError::Config(_) => "ConfigError",
        }
    }

    /// Phase that was being attempted
    pub fn phase(&self) -> Phase {
        match self {
            ProbeError::TunnelRejected { phase, .. }
            | ProbeError::Transport { phase, .. }
            | ProbeError::TlsHandshake { phase, .. }
            | ProbeError::ProtocolNotNegotiated { phase, .. }
            | ProbeError::Http2Session { phase, .. }
            | ProbeError::Stream { phase, .. }
            | ProbeError::Timeout { phase, .. } => *phase,
            ProbeError::Config(_) => Phase::Init,
        }
    }

    /// Transport-level classification, when the failure came from the socket
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ProbeError::Transport { kind, .. } => Some(*kind),
            ProbeError::Timeout { .. } => Some(FailureKind::TimedOut),
            ProbeError::Http2Session { source, .. } => match source {
                h2::Error::ConnectionClosed => Some(FailureKind::Closed),
                h2::Error::Transport(http::Error::Io(e)) => Some(FailureKind::from_io(e)),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, ProbeError::Config(_))
    }

    fn from_net(phase: Phase, err: net::Error, after: Duration) -> Self {
        match err.failure_kind() {
            FailureKind::TimedOut => ProbeError::Timeout { phase, after },
            kind => ProbeError::Transport {
                phase,
                kind,
                source: Box::new(err),
            },
        }
    }

    fn from_io(phase: Phase, err: io::Error, after: Duration) -> Self {
        match FailureKind::from_io(&err) {
            FailureKind::TimedOut => ProbeError::Timeout { phase, after },
            kind => ProbeError::Transport {
                phase,
                kind,
                source: Box::new(err),
            },
        }
    }

    fn from_tunnel(err: http::Error, after: Duration) -> Self {
        let phase = Phase::TunnelConfirmed;
        match err {
            http::Error::TunnelRejected { status, reason } => ProbeError::TunnelRejected {
                phase,
                status: Some(status),
                reason: format!("{} {}", status, reason).trim_end().to_string(),
            },
            http::Error::TrailingData(n) => ProbeError::TunnelRejected {
                phase,
                status: Some(200),
                reason: format!("{} unexpected bytes after the CONNECT reply", n),
            },
            http::Error::ConnectionClosed => ProbeError::TunnelRejected {
                phase,
                status: None,
                reason: "proxy closed the connection before completing its reply".to_string(),
            },
            http::Error::Parse(_)
            | http::Error::InvalidVersion(_)
            | http::Error::InvalidStatus(_)
            | http::Error::InvalidHeader(_)
            | http::Error::HeadTooLarge(_) => ProbeError::TunnelRejected {
                phase,
                status: None,
                reason: format!("malformed reply: {}", err),
            },
            http::Error::Timeout => ProbeError::Timeout { phase, after },
            http::Error::Io(e) => ProbeError::from_io(phase, e, after),
            http::Error::Network(e) => ProbeError::from_net(phase, e, after),
        }
    }

    fn from_tls(err: TlsError) -> Self {
        let phase = Phase::TlsNegotiated;
        match err {
            TlsError::HandshakeTimeout(after) => ProbeError::Timeout { phase, after },
            TlsError::Io(e) => ProbeError::from_io(phase, e, Duration::ZERO),
            source => ProbeError::TlsHandshake { phase, source },
        }
    }

    fn from_h2(phase: Phase, stream_id: Option<StreamId>, err: h2::Error, after: Duration) -> Self {
        match err {
            h2::Error::Timeout => ProbeError::Timeout { phase, after },
            h2::Error::Transport(http::Error::Io(ref e))
                if FailureKind::from_io(e) == FailureKind::TimedOut =>
            {
                ProbeError::Timeout { phase, after }
            }
            source if source.is_stream_error() => ProbeError::Stream {
                phase,
                stream_id: stream_id.unwrap_or(0),
                source,
            },
            source => ProbeError::Http2Session { phase, source },
        }
    }
}

/// A phase and when it was entered, relative to the start of the probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub phase: Phase,
    pub elapsed: Duration,
}

/// Load metrics of a successful probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeMetrics {
    /// Start to `Closed`
    pub total: Duration,
    /// Start to response head
    pub time_to_first_byte: Duration,
    pub body_bytes: usize,
}

/// Outcome of a successful probe
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub target: Endpoint,
    /// `None` in direct mode
    pub proxy: Option<Endpoint>,
    pub transitions: Vec<Transition>,
    pub tunnel: Option<TunnelResponse>,
    pub tls: TlsInfo,
    pub status: u16,
    pub headers: Headers,
    pub trailers: Option<Headers>,
    pub body: Bytes,
    pub metrics: ProbeMetrics,
}

impl ProbeReport {
    /// Phases in the order they were reached
    pub fn phases(&self) -> Vec<Phase> {
        self.transitions.iter().map(|t| t.phase).collect()
    }

    /// Body as text, replacing invalid UTF-8
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// First `max_chars` characters of the body
    pub fn body_preview(&self, max_chars: usize) -> String {
        self.body_text().chars().take(max_chars).collect()
    }
}

/// Outcome of a failed probe
#[derive(Debug)]
pub struct ProbeFailure {
    pub error: ProbeError,
    /// Last phase reached before the failure
    pub last_phase: Phase,
    pub transitions: Vec<Transition>,
}

impl ProbeFailure {
    pub fn phases(&self) -> Vec<Phase> {
        self.transitions.iter().map(|t| t.phase).collect()
    }
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (last phase reached: {})", self.error, self.last_phase)
    }
}

impl std::error::Error for ProbeFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Records phase transitions and reports each one as it happens
struct PhaseLog<'a> {
    started: Instant,
    transitions: Vec<Transition>,
    on_phase: &'a mut dyn FnMut(Transition),
}

impl<'a> PhaseLog<'a> {
    fn new(on_phase: &'a mut dyn FnMut(Transition)) -> Self {
        let init = Transition {
            phase: Phase::Init,
            elapsed: Duration::ZERO,
        };
        on_phase(init);
        PhaseLog {
            started: Instant::now(),
            transitions: vec![init],
            on_phase,
        }
    }

    fn enter(&mut self, phase: Phase) {
        let elapsed = self.started.elapsed();
        info!(phase = %phase, elapsed_ms = elapsed.as_millis() as u64, "phase reached");
        let transition = Transition { phase, elapsed };
        (self.on_phase)(transition);
        self.transitions.push(transition);
    }

    fn last(&self) -> Phase {
        self.transitions.last().map_or(Phase::Init, |t| t.phase)
    }
}

/// Everything the HTTP/2 phases produce
struct Exchange {
    status: u16,
    headers: Headers,
    trailers: Option<Headers>,
    body: Bytes,
    time_to_first_byte: Duration,
}

/// One-shot tunneled HTTP/2 probe
#[derive(Debug, Clone)]
pub struct TunnelProbe {
    config: ProbeConfig,
}

impl TunnelProbe {
    pub fn new(config: ProbeConfig) -> Self {
        TunnelProbe { config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Run the probe, collecting the whole body
    pub fn run(&self) -> Result<ProbeReport, ProbeFailure> {
        self.run_with(|_| {})
    }

    /// Run the probe, handing each body chunk to `on_chunk` in arrival order
    pub fn run_with<F: FnMut(&[u8])>(&self, on_chunk: F) -> Result<ProbeReport, ProbeFailure> {
        self.run_observed(|_| {}, on_chunk)
    }

    /// Run the probe, calling `on_phase` the moment each phase is entered
    /// (`Init` first, `Closed` last) and `on_chunk` for each body chunk
    pub fn run_observed<P, F>(
        &self,
        mut on_phase: P,
        mut on_chunk: F,
    ) -> Result<ProbeReport, ProbeFailure>
    where
        P: FnMut(Transition),
        F: FnMut(&[u8]),
    {
        let mut log = PhaseLog::new(&mut on_phase);

        match self.execute(&mut log, &mut on_chunk) {
            Ok(mut report) => {
                log.enter(Phase::Closed);
                report.metrics.total = log.started.elapsed();
                report.transitions = log.transitions;
                Ok(report)
            }
            Err(error) => {
                let last_phase = log.last();
                warn!(
                    kind = error.kind(),
                    phase = %error.phase(),
                    last_phase = %last_phase,
                    "probe failed: {}",
                    error
                );
                log.enter(Phase::Closed);
                Err(ProbeFailure {
                    error,
                    last_phase,
                    transitions: log.transitions,
                })
            }
        }
    }

    fn execute(
        &self,
        log: &mut PhaseLog<'_>,
        on_chunk: &mut dyn FnMut(&[u8]),
    ) -> Result<ProbeReport, ProbeError> {
        let config = &self.config;
        config.validate()?;
        let timeouts = config.timeouts;

        let dial = if config.use_proxy {
            &config.proxy
        } else {
            &config.target
        };
        info!(endpoint = %dial, proxy = config.use_proxy, "connecting");
        let stream = net::connect(&dial.host, dial.port, timeouts.connect)
            .map_err(|e| ProbeError::from_net(Phase::TcpConnected, e, timeouts.connect))?;
        log.enter(Phase::TcpConnected);

        let (stream, tunnel) = if config.use_proxy {
            let (stream, response) = self.open_tunnel(stream)?;
            info!(status_line = response.status_line(), "tunnel established");
            log.enter(Phase::TunnelConfirmed);
            (stream, Some(response))
        } else {
            (stream, None)
        };

        let mut tls = self.upgrade(stream)?;
        let tls_info = tls.info().clone();
        if !tls_info.is_h2() {
            let _ = tls.close();
            return Err(ProbeError::ProtocolNotNegotiated {
                phase: Phase::TlsNegotiated,
                negotiated: tls_info.alpn,
            });
        }
        info!(version = %tls_info.version, cipher = %tls_info.cipher, "negotiated h2");
        log.enter(Phase::TlsNegotiated);

        let exchange = self.request(tls, log, on_chunk)?;
        let body_bytes = exchange.body.len();

        Ok(ProbeReport {
            target: config.target.clone(),
            proxy: config.use_proxy.then(|| config.proxy.clone()),
            transitions: Vec::new(),
            tunnel,
            tls: tls_info,
            status: exchange.status,
            headers: exchange.headers,
            trailers: exchange.trailers,
            body: exchange.body,
            metrics: ProbeMetrics {
                total: Duration::ZERO,
                time_to_first_byte: exchange.time_to_first_byte,
                body_bytes,
            },
        })
    }

    fn open_tunnel(&self, stream: TcpStream) -> Result<(TcpStream, TunnelResponse), ProbeError> {
        let config = &self.config;
        let request = TunnelRequest::new(
            config.proxy.host.as_str(),
            config.proxy.port,
            config.target.host.as_str(),
            config.target.port,
        );
        establish_tunnel(stream, &request, config.timeouts.tunnel)
            .map_err(|e| ProbeError::from_tunnel(e, config.timeouts.tunnel))
    }

    fn upgrade(&self, stream: TcpStream) -> Result<TlsSessionOps, ProbeError> {
        let config = &self.config;

        let mut builder = TlsConfig::client()
            .servername(config.target.host.as_str())
            .alpn(&config.alpn_protocols())
            .map_err(ProbeError::from_tls)?
            .verify_peer(config.tls_verify)
            .handshake_timeout(Some(config.timeouts.handshake));
        if let Some(ca_file) = &config.ca_file {
            builder = builder.ca_file(ca_file);
        }

        let tls_config = builder.build().map_err(ProbeError::from_tls)?;
        tls_config.connect(stream).map_err(ProbeError::from_tls)
    }

    /// `:authority` is the bare host on the default port
    fn authority(&self) -> String {
        let target = &self.config.target;
        if target.port == 443 {
            target.host.clone()
        } else {
            target.authority()
        }
    }

    fn request(
        &self,
        tls: TlsSessionOps,
        log: &mut PhaseLog<'_>,
        on_chunk: &mut dyn FnMut(&[u8]),
    ) -> Result<Exchange, ProbeError> {
        let after = self.config.timeouts.request;
        let deadline = Instant::now() + after;

        // Keeps a truncated TLS record from blocking past the deadline
        tls.set_read_timeout(Some(after))
            .map_err(|e| ProbeError::from_io(Phase::Http2SessionOpen, e, after))?;

        let mut client = H2ClientBuilder::new()
            .authority(self.authority())
            .timeout(after)
            .build(tls)
            .map_err(|e| ProbeError::from_h2(Phase::Http2SessionOpen, None, e, after))?;
        client.set_deadline(Some(deadline));

        let result = self.exchange(&mut client, log, on_chunk);
        match &result {
            Ok(_) => {
                if let Err(e) = client.close() {
                    debug!("close after completed stream: {}", e);
                }
            }
            Err(_) => {
                let _ = client.close();
            }
        }
        result
    }

    fn exchange(
        &self,
        client: &mut H2Client<TlsSessionOps>,
        log: &mut PhaseLog<'_>,
        on_chunk: &mut dyn FnMut(&[u8]),
    ) -> Result<Exchange, ProbeError> {
        let after = self.config.timeouts.request;

        client
            .connect()
            .map_err(|e| ProbeError::from_h2(Phase::Http2SessionOpen, None, e, after))?;
        log.enter(Phase::Http2SessionOpen);

        let request = H2Request::get(self.config.path.as_str())
            .header("user-agent", self.config.user_agent.as_str());
        let stream_id = client
            .send_request(&request)
            .map_err(|e| ProbeError::from_h2(Phase::StreamOpen, None, e, after))?;
        log.enter(Phase::StreamOpen);

        let complete = |e| ProbeError::from_h2(Phase::StreamComplete, Some(stream_id), e, after);

        let head = client.recv_response_head(stream_id).map_err(complete)?;
        let time_to_first_byte = log.started.elapsed();
        info!(stream_id, status = head.status, "response head received");

        let mut body = BytesMut::new();
        while let Some(chunk) = client.recv_data(stream_id).map_err(complete)? {
            debug!(stream_id, bytes = chunk.len(), "body chunk");
            on_chunk(&chunk);
            body.extend_from_slice(&chunk);
        }
        let trailers = client.trailers(stream_id).cloned();
        log.enter(Phase::StreamComplete);

        Ok(Exchange {
            status: head.status,
            headers: head.headers,
            trailers,
            body: body.freeze(),
            time_to_first_byte,
        })
    }
}
