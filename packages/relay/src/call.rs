//! The RPC call policy: deadlines, bounded retries, trailer
//! short-circuits, and the optional wait-for-connection budget.

use std::time::Duration;

use derive_more::{Display, Error};
use tokio::time::{Instant, timeout};
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use clients::Token;

use crate::{
    config::DistributionConfig,
    protocol::{Request, Response},
    transport::{CallMeta, Channel, ConnectivityState, RpcCode, RpcReply},
};

/// How calls are retried and bounded.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CallPolicy {
    /// Attempts per call, including the first.
    pub max_attempts: u32,

    /// Per-attempt deadline.
    pub call_timeout: Duration,

    /// Hold attempts until the channel is ready instead of failing fast.
    pub wait_for_ready: bool,
}

impl CallPolicy {
    pub fn from_config(config: &DistributionConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            call_timeout: config.call_timeout,
            wait_for_ready: true,
        }
    }
}

/// Why a call (or a worker) failed, after the policy gave up.
#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
pub enum RpcFailure {
    /// A retryable code persisted through every attempt.
    #[display("transient failure ({code}) after {attempts} attempts")]
    Transient { code: RpcCode, attempts: u32 },

    /// Every attempt exceeded its deadline.
    #[display("every attempt exceeded its deadline")]
    CallDeadlineExceeded,

    /// The peer flagged the error unrecoverable; retry is pointless.
    #[display("unrecoverable failure reported by peer")]
    UnrecoverableFailure,

    /// The peer belongs to a different build session.
    #[display("invocation id mismatch")]
    InvocationMismatch,

    /// A non-retryable code.
    #[display("call failed with {code}")]
    Failed { code: RpcCode },

    /// The channel never became ready within the attach budget.
    #[display("worker did not connect within the attach budget")]
    AttachmentTimeout,

    /// Reconnection after a disconnect exhausted its budget.
    #[display("reconnection budget exhausted")]
    ReconnectionTimeout,
}

/// Terminal state of an invocation.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum CallState {
    Succeeded,
    Failed(RpcFailure),
}

/// The result of driving one call through the policy.
#[derive(Clone, Debug)]
pub struct CallResult {
    pub state: CallState,
    pub attempts: u32,

    /// The code observed before each retry, in order. One entry per
    /// retry trace emitted.
    pub retried: Vec<RpcCode>,

    pub response: Option<Response>,
}

impl CallResult {
    pub fn succeeded(&self) -> bool {
        self.state == CallState::Succeeded
    }
}

/// Drive a call against a channel under the policy.
///
/// `wait_for_connection` blocks (up to the given budget) for the channel
/// to become ready before the first attempt; the wait is tracked apart
/// from per-attempt deadlines.
#[instrument(skip_all, fields(invocation = %invocation_id))]
pub async fn invoke<C: Channel>(
    channel: &C,
    policy: CallPolicy,
    invocation_id: Uuid,
    authorization: Option<Token>,
    request: Request,
    wait_for_connection: Option<Duration>,
) -> CallResult {
    if let Some(budget) = wait_for_connection
        && !wait_until_ready(channel, budget).await
    {
        warn!("channel not ready within the connection budget");
        return CallResult {
            state: CallState::Failed(RpcFailure::AttachmentTimeout),
            attempts: 0,
            retried: Vec::new(),
            response: None,
        };
    }

    let mut attempts = 0;
    let mut retried = Vec::new();
    let mut every_attempt_deadlined = true;

    loop {
        attempts += 1;
        let meta = CallMeta {
            invocation_id,
            trace_id: Uuid::new_v4(),
            deadline: policy.call_timeout,
            wait_for_ready: policy.wait_for_ready,
            authorization: authorization.clone(),
        };
        trace!(attempt = attempts, trace = %meta.trace_id, "issuing call");

        let reply = match timeout(policy.call_timeout, channel.call(request.clone(), &meta)).await
        {
            Ok(reply) => reply,
            Err(_) => RpcReply::status(RpcCode::DeadlineExceeded),
        };

        if reply.trailers.invocation_id_mismatch {
            // Doomed to mismatch on every attempt; fail now.
            return CallResult {
                state: CallState::Failed(RpcFailure::InvocationMismatch),
                attempts,
                retried,
                response: None,
            };
        }
        if reply.trailers.is_unrecoverable_error {
            return CallResult {
                state: CallState::Failed(RpcFailure::UnrecoverableFailure),
                attempts,
                retried,
                response: None,
            };
        }

        match reply.code {
            RpcCode::Ok => {
                return CallResult {
                    state: CallState::Succeeded,
                    attempts,
                    retried,
                    response: reply.response,
                };
            }
            code if code != RpcCode::DeadlineExceeded => {
                every_attempt_deadlined = false;
                if code.is_transient() && attempts < policy.max_attempts {
                    debug!(attempt = attempts, %code, "retrying call");
                    retried.push(code);
                    continue;
                }
                let failure = if code.is_transient() {
                    RpcFailure::Transient { code, attempts }
                } else {
                    RpcFailure::Failed { code }
                };
                return CallResult {
                    state: CallState::Failed(failure),
                    attempts,
                    retried,
                    response: None,
                };
            }
            code => {
                if attempts < policy.max_attempts {
                    debug!(attempt = attempts, %code, "retrying call after deadline");
                    retried.push(code);
                    continue;
                }
                let failure = if every_attempt_deadlined {
                    RpcFailure::CallDeadlineExceeded
                } else {
                    RpcFailure::Failed { code }
                };
                return CallResult {
                    state: CallState::Failed(failure),
                    attempts,
                    retried,
                    response: None,
                };
            }
        }
    }
}

async fn wait_until_ready<C: Channel>(channel: &C, budget: Duration) -> bool {
    let started = Instant::now();
    loop {
        let state = channel.connectivity();
        if state == ConnectivityState::Ready {
            return true;
        }
        let Some(remaining) = budget.checked_sub(started.elapsed()) else {
            return false;
        };
        channel.wait_for_state_change(state, remaining).await;
        if started.elapsed() >= budget && channel.connectivity() != ConnectivityState::Ready {
            return false;
        }
    }
}
