//! The abstract channel contract.
//!
//! Production builds bind these traits to a gRPC channel; tests script
//! them. Only the contract matters to this crate: status codes, the two
//! recognized trailers, connectivity states, and per-call metadata.

use std::{collections::HashMap, future::Future, time::Duration};

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use clients::Token;

use crate::protocol::{Request, Response};

/// Status code of a finished call.
#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Serialize, Deserialize, strum::EnumIter,
)]
pub enum RpcCode {
    Ok,
    Cancelled,
    Unknown,
    DeadlineExceeded,
    Internal,
    Unavailable,
    FailedPrecondition,
}

impl RpcCode {
    /// Whether the call policy may retry this code.
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Unavailable | Self::Internal | Self::Unknown)
    }
}

/// The trailers this layer recognizes.
///
/// The wire form is string metadata with `True`/`False` values; the keys
/// are part of the protocol and must not change.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct Trailers {
    /// Short-circuits retry and fails the worker.
    pub is_unrecoverable_error: bool,

    /// The peer belongs to a different build session; retrying is doomed.
    pub invocation_id_mismatch: bool,
}

impl Trailers {
    pub const IS_UNRECOVERABLE_ERROR: &str = "IsUnrecoverableError";
    pub const INVOCATION_ID_MISMATCH: &str = "InvocationIdMismatch";

    /// Parse from wire metadata. Missing keys mean `false`.
    pub fn from_metadata(metadata: &HashMap<String, String>) -> Self {
        let flag = |key: &str| {
            metadata
                .get(key)
                .is_some_and(|value| value.eq_ignore_ascii_case("true"))
        };
        Self {
            is_unrecoverable_error: flag(Self::IS_UNRECOVERABLE_ERROR),
            invocation_id_mismatch: flag(Self::INVOCATION_ID_MISMATCH),
        }
    }

    /// Render to wire metadata.
    pub fn to_metadata(self) -> HashMap<String, String> {
        let render = |value: bool| if value { "True" } else { "False" }.to_owned();
        HashMap::from([
            (
                Self::IS_UNRECOVERABLE_ERROR.to_owned(),
                render(self.is_unrecoverable_error),
            ),
            (
                Self::INVOCATION_ID_MISMATCH.to_owned(),
                render(self.invocation_id_mismatch),
            ),
        ])
    }
}

/// Abstract connectivity of the underlying channel.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, strum::EnumIter)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

/// Metadata attached to every call.
#[derive(Clone, Debug)]
pub struct CallMeta {
    /// Identifies the build session; peers reject mismatches.
    pub invocation_id: Uuid,

    /// Identifies this call in logs on both ends.
    pub trace_id: Uuid,

    /// Per-attempt deadline.
    pub deadline: Duration,

    /// Whether the transport should hold the call until the channel is
    /// ready rather than failing fast.
    pub wait_for_ready: bool,

    /// Bearer token added as `authorization` metadata when auth is on.
    pub authorization: Option<Token>,
}

/// What one call attempt came back with.
#[derive(Clone, Debug)]
pub struct RpcReply {
    pub code: RpcCode,
    pub trailers: Trailers,
    pub response: Option<Response>,
}

impl RpcReply {
    pub fn ok(response: Response) -> Self {
        Self {
            code: RpcCode::Ok,
            trailers: Trailers::default(),
            response: Some(response),
        }
    }

    pub fn status(code: RpcCode) -> Self {
        Self {
            code,
            trailers: Trailers::default(),
            response: None,
        }
    }
}

/// The long-lived bidirectional channel to one peer.
pub trait Channel: Send + Sync + 'static {
    /// Issue one call attempt. Transport-level failures surface as
    /// non-`Ok` codes, never as panics.
    fn call(&self, request: Request, meta: &CallMeta) -> impl Future<Output = RpcReply> + Send;

    /// The channel's current connectivity.
    fn connectivity(&self) -> ConnectivityState;

    /// Wait until the state differs from `current`, or `timeout` elapses;
    /// returns the state observed at wake-up.
    fn wait_for_state_change(
        &self,
        current: ConnectivityState,
        timeout: Duration,
    ) -> impl Future<Output = ConnectivityState> + Send;

    /// Kick off a reconnection attempt.
    fn connect(&self) -> impl Future<Output = color_eyre::Result<()>> + Send;

    /// Tear the channel down; connectivity becomes `Shutdown`.
    fn shutdown(&self) -> impl Future<Output = ()> + Send;
}
