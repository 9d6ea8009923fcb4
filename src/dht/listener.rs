use super::error::DhtError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Largest datagram the receive loop accepts.
const MAX_DATAGRAM: usize = 65535;

/// Callback invoked for every inbound datagram.
pub type InboundHandler = Arc<dyn Fn(Bytes, SocketAddr) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStatus {
    NotListening,
    Listening,
    Error,
}

/// Datagram transport the engine sends and receives KRPC messages through.
pub trait Listener: Send + Sync {
    /// Begins delivering inbound datagrams to `handler`.
    fn start(&self, handler: InboundHandler) -> Result<(), DhtError>;

    fn stop(&self);

    /// Sends without waiting; called from the scheduler thread.
    fn send(&self, data: &[u8], addr: SocketAddr) -> Result<(), DhtError>;

    fn status(&self) -> ListenerStatus {
        *self.subscribe_status().borrow()
    }

    fn subscribe_status(&self) -> watch::Receiver<ListenerStatus>;

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// [`Listener`] over a tokio UDP socket.
pub struct UdpListener {
    socket: Arc<UdpSocket>,
    handle: Handle,
    status: watch::Sender<ListenerStatus>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, DhtError> {
        let socket = UdpSocket::bind(addr).await?;
        info!("DHT listener bound to {}", socket.local_addr()?);

        let (status, _) = watch::channel(ListenerStatus::NotListening);
        Ok(Self {
            socket: Arc::new(socket),
            handle: Handle::current(),
            status,
            task: Mutex::new(None),
        })
    }
}

impl Listener for UdpListener {
    fn start(&self, handler: InboundHandler) -> Result<(), DhtError> {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        let socket = self.socket.clone();
        let status = self.status.clone();
        *task = Some(self.handle.spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        trace!("received {} bytes from {}", n, from);
                        handler(Bytes::copy_from_slice(&buf[..n]), from);
                    }
                    Err(e) => {
                        warn!("DHT receive failed: {}", e);
                        status.send_replace(ListenerStatus::Error);
                        break;
                    }
                }
            }
        }));

        self.status.send_replace(ListenerStatus::Listening);
        Ok(())
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.status.send_replace(ListenerStatus::NotListening);
        debug!("DHT listener stopped");
    }

    fn send(&self, data: &[u8], addr: SocketAddr) -> Result<(), DhtError> {
        self.socket.try_send_to(data, addr)?;
        Ok(())
    }

    fn subscribe_status(&self) -> watch::Receiver<ListenerStatus> {
        self.status.subscribe()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

impl Drop for UdpListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
