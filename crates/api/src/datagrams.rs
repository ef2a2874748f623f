//! The framed-datagram transport seam.
//!
//! The controller assumes a connection-oriented reliable-datagram layer
//! that delivers whole typed packets and reports the sender address.
//! That layer is an external collaborator; these traits are its
//! interface to the core, and torii_core ships an in-memory
//! implementation for tests.

use crate::*;
use std::net::SocketAddr;
use std::sync::Arc;

/// Receives every inbound frame from the transport. In a running
/// controller this is the packet dispatch.
pub trait FrameHandler: 'static + Send + Sync {
    /// Called with the sender address and the whole frame.
    fn recv_frame(&self, from: SocketAddr, data: bytes::Bytes);
}

/// Trait-object [FrameHandler].
pub type DynFrameHandler = Arc<dyn FrameHandler>;

/// A framed datagram endpoint.
pub trait Datagrams: 'static + Send + Sync + std::fmt::Debug {
    /// Register the single inbound frame handler.
    ///
    /// Panics if a handler was already registered.
    fn register_handler(&self, handler: DynFrameHandler);

    /// Send one frame to a peer address. Send failures are reported to
    /// the caller; callers on the fan-out path log and drop them.
    fn send(
        &self,
        to: SocketAddr,
        data: bytes::Bytes,
    ) -> BoxFut<'_, ToriiResult<()>>;

    /// The local address this endpoint is bound to.
    fn local_addr(&self) -> ToriiResult<SocketAddr>;
}

/// Trait-object [Datagrams].
pub type DynDatagrams = Arc<dyn Datagrams>;

/// A factory for constructing [Datagrams] instances.
pub trait DatagramsFactory: 'static + Send + Sync + std::fmt::Debug {
    /// Help the builder seed default settings for this module.
    fn default_config(&self, settings: &SettingsStore) -> ToriiResult<()>;

    /// Validate settings for this module.
    fn validate_config(&self, settings: &SettingsStore) -> ToriiResult<()>;

    /// Construct a datagram endpoint.
    fn create(
        &self,
        builder: Arc<Builder>,
    ) -> BoxFut<'static, ToriiResult<DynDatagrams>>;
}

/// Trait-object [DatagramsFactory].
pub type DynDatagramsFactory = Arc<dyn DatagramsFactory>;
