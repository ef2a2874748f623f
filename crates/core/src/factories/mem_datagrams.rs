//! The core stub datagram transport provided by torii_core.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use torii_api::*;

/// The core stub datagram transport provided by torii_core.
/// This is NOT a production module. It is for testing only.
/// It will only deliver frames within the same process.
#[derive(Debug)]
pub struct MemDatagramsFactory {}

impl MemDatagramsFactory {
    /// Construct a new MemDatagramsFactory.
    pub fn create() -> DynDatagramsFactory {
        let out: DynDatagramsFactory = Arc::new(MemDatagramsFactory {});
        out
    }
}

impl DatagramsFactory for MemDatagramsFactory {
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
        Box::pin(async move {
            let out: DynDatagrams = MemDatagrams::create();
            Ok(out)
        })
    }
}

fn hub() -> &'static Mutex<HashMap<SocketAddr, Weak<MemDatagrams>>> {
    static HUB: OnceLock<Mutex<HashMap<SocketAddr, Weak<MemDatagrams>>>> =
        OnceLock::new();
    HUB.get_or_init(Default::default)
}

/// An in-process datagram endpoint with a synthetic loopback address.
pub struct MemDatagrams {
    addr: SocketAddr,
    handler: Mutex<Option<DynFrameHandler>>,
}

impl std::fmt::Debug for MemDatagrams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDatagrams")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl Drop for MemDatagrams {
    fn drop(&mut self) {
        hub().lock().unwrap().remove(&self.addr);
    }
}

impl MemDatagrams {
    /// Construct an endpoint on the next synthetic address.
    pub fn create() -> Arc<Self> {
        static NEXT_PORT: AtomicU16 = AtomicU16::new(1);
        let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        Self::create_at(SocketAddr::from(([127, 99, 0, 1], port)))
    }

    /// Construct an endpoint at an explicit synthetic address, so tests
    /// can exercise address-based dispatch rules.
    pub fn create_at(addr: SocketAddr) -> Arc<Self> {
        let out = Arc::new(Self {
            addr,
            handler: Mutex::new(None),
        });
        hub().lock().unwrap().insert(addr, Arc::downgrade(&out));
        out
    }
}

impl Datagrams for MemDatagrams {
    fn register_handler(&self, handler: DynFrameHandler) {
        let mut guard = self.handler.lock().unwrap();
        if guard.is_some() {
            panic!("frame handler already registered for {}", self.addr);
        }
        *guard = Some(handler);
    }

    fn send(
        &self,
        to: SocketAddr,
        data: bytes::Bytes,
    ) -> BoxFut<'_, ToriiResult<()>> {
        Box::pin(async move {
            let target = hub()
                .lock()
                .unwrap()
                .get(&to)
                .and_then(Weak::upgrade)
                .ok_or_else(|| {
                    ToriiError::other(format!("no endpoint at {to}"))
                })?;
            let handler = target.handler.lock().unwrap().clone();
            if let Some(handler) = handler {
                handler.recv_frame(self.addr, data);
            }
            Ok(())
        })
    }

    fn local_addr(&self) -> ToriiResult<SocketAddr> {
        Ok(self.addr)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Collect(Mutex<Vec<(SocketAddr, bytes::Bytes)>>);

    impl FrameHandler for Collect {
        fn recv_frame(&self, from: SocketAddr, data: bytes::Bytes) {
            self.0.lock().unwrap().push((from, data));
        }
    }

    #[tokio::test]
    async fn frames_route_between_endpoints() {
        let a = MemDatagrams::create();
        let b = MemDatagrams::create();

        let seen = Arc::new(Collect(Mutex::new(Vec::new())));
        b.register_handler(seen.clone());

        a.send(
            b.local_addr().unwrap(),
            bytes::Bytes::from_static(b"hi"),
        )
        .await
        .unwrap();

        let seen = seen.0.lock().unwrap();
        assert_eq!(1, seen.len());
        assert_eq!(a.local_addr().unwrap(), seen[0].0);
        assert_eq!(&b"hi"[..], &seen[0].1[..]);
    }

    #[tokio::test]
    async fn send_to_unknown_address_errors() {
        let a = MemDatagrams::create();
        assert!(a
            .send(
                "127.99.255.255:9".parse().unwrap(),
                bytes::Bytes::new()
            )
            .await
            .is_err());
    }
}
