//! Distribution configuration: timeouts, keep-alive, TLS, auth.

use std::{path::PathBuf, time::Duration};

use bon::Builder;
use clients::Token;

/// Channel keep-alive settings.
///
/// The defaults match what the servers accept: pings no more frequent
/// than every 60 seconds without data, so the client pings at 300.
#[derive(Clone, Debug, Builder)]
pub struct KeepAliveConfig {
    /// Interval between pings on an otherwise idle channel.
    #[builder(default = Duration::from_secs(300))]
    pub ping_interval: Duration,

    /// How long to wait for a ping acknowledgement.
    #[builder(default = Duration::from_secs(60))]
    pub ack_timeout: Duration,

    /// Allow pings while no calls are in flight, without limit.
    #[builder(default = true)]
    pub permit_without_calls: bool,

    /// The most frequent ping the server side accepts without data.
    #[builder(default = Duration::from_secs(60))]
    pub server_minimum_interval: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// TLS identity and validation settings.
///
/// The certificate is located by subject name in the machine store. The
/// target-name override bypasses hostname verification in closed-network
/// deployments where addresses never match certificate names.
#[derive(Clone, Debug, Builder)]
pub struct TlsConfig {
    #[builder(into)]
    pub certificate_subject: String,

    /// Root certificate chain to validate peers against, when chain
    /// validation is on.
    pub root_chain_path: Option<PathBuf>,

    /// Overrides the expected server name during the handshake.
    #[builder(into)]
    pub target_name_override: Option<String>,
}

/// Everything the distribution layer needs to know about this build's
/// topology and patience.
#[derive(Clone, Debug, Builder)]
pub struct DistributionConfig {
    /// Remote worker slots the orchestrator owns.
    #[builder(default = 0)]
    pub remote_worker_count: usize,

    /// Per-attempt call deadline.
    #[builder(default = Duration::from_secs(5 * 60))]
    pub call_timeout: Duration,

    /// Attempts per call, including the first.
    #[builder(default = 3)]
    pub max_attempts: u32,

    /// Budget for a worker's initial connection, tracked separately from
    /// per-call deadlines.
    #[builder(default = Duration::from_secs(10 * 60))]
    pub worker_attach_timeout: Duration,

    /// How long a channel may sit in `Connecting`/`TransientFailure`
    /// after attachment before the worker is declared lost.
    #[builder(default = Duration::from_secs(5 * 60))]
    pub connect_timeout: Duration,

    /// Reconnection attempts after a post-attach disconnect.
    #[builder(default = 10)]
    pub reconnect_attempts: u32,

    /// Base delay of the reconnection backoff.
    #[builder(default = Duration::from_millis(250))]
    pub reconnect_backoff: Duration,

    pub keep_alive: Option<KeepAliveConfig>,

    pub tls: Option<TlsConfig>,

    /// Bearer token attached to every call when present.
    pub auth_token: Option<Token>,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
