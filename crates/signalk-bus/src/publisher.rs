//! Publishing side of the bus.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::endpoint::{self, Endpoint};
use crate::queue::MessageQueue;
use crate::subscriber::Subscriber;
use crate::BusError;

struct Shared {
    queues: Mutex<Vec<Arc<MessageQueue>>>,
    capacity: usize,
    closed: AtomicBool,
}

/// Fan-out publisher. Every attached subscriber, local or remote, gets its
/// own drop-oldest queue, so a slow consumer only loses its own messages.
#[derive(Clone)]
pub struct Publisher {
    shared: Arc<Shared>,
    local_addr: Option<SocketAddr>,
}

impl Publisher {
    /// A publisher with in-process subscribers only.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(Vec::new()),
                capacity,
                closed: AtomicBool::new(false),
            }),
            local_addr: None,
        }
    }

    /// Bind `url` and accept remote subscribers in the background.
    pub async fn bind(url: &str, capacity: usize) -> Result<Self, BusError> {
        let mut publisher = Self::new(capacity);
        match Endpoint::parse(url)? {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(&addr).await?;
                let local = listener.local_addr()?;
                info!(url = %url, addr = %local, "bus publisher bound");
                publisher.local_addr = Some(local);
                let shared = publisher.shared.clone();
                tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, peer)) => {
                                let _ = stream.set_nodelay(true);
                                debug!(peer = %peer, "bus subscriber connected");
                                attach_stream(&shared, stream, peer.to_string());
                            }
                            Err(e) => {
                                warn!(error = %e, "bus accept failed");
                            }
                        }
                        if shared.closed.load(Ordering::Acquire) {
                            break;
                        }
                    }
                });
            }
            #[cfg(unix)]
            Endpoint::Ipc(path) => {
                let _ = std::fs::remove_file(&path);
                let listener = tokio::net::UnixListener::bind(&path)?;
                info!(url = %url, "bus publisher bound");
                let shared = publisher.shared.clone();
                tokio::spawn(async move {
                    loop {
                        match listener.accept().await {
                            Ok((stream, _)) => {
                                debug!(path = %path.display(), "bus subscriber connected");
                                attach_stream(&shared, stream, path.display().to_string());
                            }
                            Err(e) => {
                                warn!(error = %e, "bus accept failed");
                            }
                        }
                        if shared.closed.load(Ordering::Acquire) {
                            break;
                        }
                    }
                });
            }
            #[cfg(not(unix))]
            Endpoint::Ipc(_) => {
                return Err(BusError::InvalidUrl(format!(
                    "{url}: ipc transport needs a Unix platform"
                )));
            }
        }
        Ok(publisher)
    }

    /// Address the TCP listener bound to, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Attach an in-process subscriber.
    pub fn subscribe(&self) -> Subscriber {
        let queue = Arc::new(MessageQueue::new(self.shared.capacity));
        if self.shared.closed.load(Ordering::Acquire) {
            queue.close();
        } else {
            self.shared.queues.lock().push(queue.clone());
        }
        Subscriber::from_queue(queue)
    }

    /// Send one message to every attached subscriber.
    pub fn publish(&self, msg: Bytes) -> Result<(), BusError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        if msg.is_empty() {
            return Err(BusError::EmptyMessage);
        }
        let mut queues = self.shared.queues.lock();
        queues.retain(|q| q.push(msg.clone()));
        Ok(())
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.queues.lock().len()
    }

    /// Messages discarded across all subscriber queues.
    pub fn dropped(&self) -> u64 {
        self.shared.queues.lock().iter().map(|q| q.dropped()).sum()
    }

    /// Close the publisher. Queued messages still drain; remote subscribers
    /// then receive the end-of-stream marker.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        for q in self.shared.queues.lock().drain(..) {
            q.close();
        }
    }
}

fn attach_stream<S>(shared: &Arc<Shared>, mut stream: S, peer: String)
where
    S: AsyncWrite + Unpin + Send + 'static,
{
    let queue = Arc::new(MessageQueue::new(shared.capacity));
    if shared.closed.load(Ordering::Acquire) {
        queue.close();
    } else {
        shared.queues.lock().push(queue.clone());
    }

    tokio::spawn(async move {
        let result: Result<(), BusError> = async {
            endpoint::write_greeting(&mut stream).await?;
            while let Some(msg) = queue.pop().await {
                endpoint::write_frame(&mut stream, &msg).await?;
            }
            endpoint::write_end(&mut stream).await
        }
        .await;

        queue.close();
        match result {
            Ok(()) => debug!(peer = %peer, "bus stream ended"),
            Err(e) => debug!(peer = %peer, error = %e, "bus subscriber dropped"),
        }
    });
}
