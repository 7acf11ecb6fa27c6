//! Outbound channel to dnodes.

use thiserror::Error;

use crate::fanout::OpId;
use crate::messages::{DnodeRequest, IpSet};

/// Errors raised while handing a request to the network.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no address to send to")]
    NoAddress,

    #[error("send failed: {0}")]
    Send(String),
}

/// Fire-and-forget delivery of controller requests.
///
/// A tracked request carries the [`OpId`] of its fan-out; the dnode's
/// response is fed back through the manager's `on_*_rsp` entry points with
/// that id.
pub trait DnodeTransport: Send + Sync {
    fn send(
        &self,
        target: &IpSet,
        request: DnodeRequest,
        op: Option<OpId>,
    ) -> Result<(), TransportError>;
}
