//! Transport configuration.
//!
//! Built once from defaults plus overrides and validated before a
//! `WsTransport` is constructed. Nothing here can change after that.

use peer_core::RetryPolicy;
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;
use tracing::Span;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:0";
pub const DEFAULT_SERVICE_NAME: &str = "peer-transport";
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_BACKOFF_FACTOR: f64 = 2.0;

/// Validated transport configuration.
#[derive(Debug)]
pub struct TransportConfig {
    /// Address the listener binds to
    pub listen_addr: SocketAddr,
    /// Service name exchanged in handshakes
    pub service_name: String,
    /// Dial and handshake timing for connection maintainers
    pub retry: RetryPolicy,
    /// Parent span for every task the transport spawns
    pub tracer: Span,
    /// Listener adopted at start instead of binding `listen_addr`
    pub(crate) listener: Option<TcpListener>,
}

impl TransportConfig {
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::default()
    }

    pub fn connection_timeout(&self) -> Duration {
        self.retry.connection_timeout
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            retry: RetryPolicy::default(),
            tracer: Span::none(),
            listener: None,
        }
    }
}

/// Overrides applied on top of the defaults.
#[derive(Debug, Default)]
pub struct TransportConfigBuilder {
    listen_addr: Option<String>,
    service_name: Option<String>,
    connection_timeout: Option<Duration>,
    initial_retry_delay: Option<Duration>,
    retry_backoff_factor: Option<f64>,
    tracer: Option<Span>,
    listener: Option<TcpListener>,
}

impl TransportConfigBuilder {
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    pub fn initial_retry_delay(mut self, delay: Duration) -> Self {
        self.initial_retry_delay = Some(delay);
        self
    }

    pub fn retry_backoff_factor(mut self, factor: f64) -> Self {
        self.retry_backoff_factor = Some(factor);
        self
    }

    pub fn tracer(mut self, span: Span) -> Self {
        self.tracer = Some(span);
        self
    }

    /// Adopt an already-bound listener.
    ///
    /// The listen address and service name overrides are ignored when a
    /// listener is supplied.
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn build(self) -> Result<TransportConfig, ConfigError> {
        let connection_timeout = self
            .connection_timeout
            .unwrap_or(DEFAULT_CONNECTION_TIMEOUT);
        if connection_timeout.is_zero() {
            return Err(ConfigError::ZeroConnectionTimeout);
        }

        let factor = self
            .retry_backoff_factor
            .unwrap_or(DEFAULT_RETRY_BACKOFF_FACTOR);
        if !factor.is_finite() || factor < 1.0 {
            return Err(ConfigError::InvalidBackoffFactor(factor));
        }

        let initial_delay = self
            .initial_retry_delay
            .unwrap_or(DEFAULT_INITIAL_RETRY_DELAY);
        if initial_delay.is_zero() {
            return Err(ConfigError::ZeroRetryDelay);
        }

        let retry = RetryPolicy {
            connection_timeout,
            initial_delay,
            backoff_factor: factor,
        };

        let (listen_addr, service_name) = match &self.listener {
            Some(listener) => (
                listener.local_addr().map_err(ConfigError::Listener)?,
                DEFAULT_SERVICE_NAME.to_string(),
            ),
            None => {
                let raw = self.listen_addr.as_deref().unwrap_or(DEFAULT_LISTEN_ADDR);
                let addr = raw
                    .parse()
                    .map_err(|_| ConfigError::InvalidListenAddr(raw.to_string()))?;
                let name = self
                    .service_name
                    .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());
                if name.trim().is_empty() {
                    return Err(ConfigError::EmptyServiceName);
                }
                (addr, name)
            }
        };

        Ok(TransportConfig {
            listen_addr,
            service_name,
            retry,
            tracer: self.tracer.unwrap_or_else(Span::none),
            listener: self.listener,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid listen address: {0}")]
    InvalidListenAddr(String),

    #[error("Service name must not be empty")]
    EmptyServiceName,

    #[error("Connection timeout must be greater than zero")]
    ZeroConnectionTimeout,

    #[error("Initial retry delay must be greater than zero")]
    ZeroRetryDelay,

    #[error("Retry backoff factor must be a finite number >= 1, got {0}")]
    InvalidBackoffFactor(f64),

    #[error("Supplied listener has no local address: {0}")]
    Listener(#[source] std::io::Error),
}
