//! The UDP binding of the datagram seam.
//!
//! The controller assumes a framed, connection-oriented datagram layer;
//! this adapter is its minimal binding (one UDP datagram per frame),
//! which is what every worker and client in the fleet speaks today.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use torii_api::*;

/// Factory for [UdpDatagrams] bound at a configured address.
#[derive(Debug)]
pub struct UdpDatagramsFactory {
    bind_addr: SocketAddr,
}

impl UdpDatagramsFactory {
    /// Construct a factory binding at `bind_addr`.
    pub fn create(bind_addr: SocketAddr) -> DynDatagramsFactory {
        let out: DynDatagramsFactory = Arc::new(Self { bind_addr });
        out
    }
}

impl DatagramsFactory for UdpDatagramsFactory {
    fn default_config(&self, _settings: &SettingsStore) -> ToriiResult<()> {
        Ok(())
    }

    fn validate_config(&self, _settings: &SettingsStore) -> ToriiResult<()> {
        Ok(())
    }

    fn create(
        &self,
        _builder: Arc<Builder>,
    ) -> BoxFut<'static, ToriiResult<DynDatagrams>> {
        let bind_addr = self.bind_addr;
        Box::pin(async move {
            let out: DynDatagrams = UdpDatagrams::bind(bind_addr).await?;
            Ok(out)
        })
    }
}

/// A UDP datagram endpoint.
pub struct UdpDatagrams {
    socket: Arc<tokio::net::UdpSocket>,
    handler: Arc<Mutex<Option<DynFrameHandler>>>,
    recv_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for UdpDatagrams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpDatagrams")
            .field("local_addr", &self.socket.local_addr())
            .finish()
    }
}

impl Drop for UdpDatagrams {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl UdpDatagrams {
    /// Bind a UDP endpoint and start its receive loop.
    pub async fn bind(addr: SocketAddr) -> ToriiResult<Arc<Self>> {
        let socket =
            Arc::new(tokio::net::UdpSocket::bind(addr).await.map_err(
                |e| ToriiError::other_src("bind udp socket", e),
            )?);

        let handler: Arc<Mutex<Option<DynFrameHandler>>> =
            Arc::new(Mutex::new(None));

        let recv_socket = socket.clone();
        let recv_handler = handler.clone();
        let recv_task = tokio::task::spawn(async move {
            // max udp payload; frames are far smaller in practice
            let mut buf = vec![0_u8; 65536];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        let handler =
                            recv_handler.lock().unwrap().clone();
                        if let Some(handler) = handler {
                            handler.recv_frame(
                                from,
                                bytes::Bytes::copy_from_slice(
                                    &buf[..len],
                                ),
                            );
                        }
                    }
                    Err(err) => {
                        tracing::debug!(?err, "udp recv error");
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            socket,
            handler,
            recv_task: Mutex::new(Some(recv_task)),
        }))
    }
}

impl Datagrams for UdpDatagrams {
    fn register_handler(&self, handler: DynFrameHandler) {
        let mut guard = self.handler.lock().unwrap();
        if guard.is_some() {
            panic!("frame handler already registered");
        }
        *guard = Some(handler);
    }

    fn send(
        &self,
        to: SocketAddr,
        data: bytes::Bytes,
    ) -> BoxFut<'_, ToriiResult<()>> {
        Box::pin(async move {
            self.socket
                .send_to(&data, to)
                .await
                .map_err(|e| ToriiError::other_src("udp send", e))?;
            Ok(())
        })
    }

    fn local_addr(&self) -> ToriiResult<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| ToriiError::other_src("udp local addr", e))
    }
}
