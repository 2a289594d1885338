// Server shell: listener, accept loop, and graceful shutdown.
use crate::connection;
use anyhow::Result;
use quinn::ServerConfig;
use rill_auth::AuthRegistry;
use rill_broker::Broker;
use rill_transport::{QuicServer, TransportConfig};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// Closing the endpoint discards unsent data, so give the transport a beat to
// flush the last spliced bytes first.
const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

type ShutdownHook = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct ServerOptions {
    pub max_frame_bytes: usize,
    pub id_generator: IdGenerator,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_frame_bytes: crate::config::DEFAULT_MAX_FRAME_BYTES,
            id_generator: Arc::new(|| uuid::Uuid::new_v4().to_string()),
        }
    }
}

/// The broker daemon: QUIC listener plus the matching engine.
pub struct Server {
    listener: QuicServer,
    broker: Broker,
    registry: AuthRegistry,
    options: ServerOptions,
    // Wait-group over per-connection tasks: each task holds a sender clone;
    // close() drops ours and waits for the channel to drain.
    task_tx: Mutex<Option<mpsc::Sender<()>>>,
    task_rx: Mutex<Option<mpsc::Receiver<()>>>,
    hooks: Mutex<Vec<ShutdownHook>>,
}

impl Server {
    pub fn bind(
        addr: SocketAddr,
        tls: ServerConfig,
        transport: TransportConfig,
        registry: AuthRegistry,
        options: ServerOptions,
    ) -> Result<Self> {
        let listener = QuicServer::bind(addr, tls, transport)?;
        let (task_tx, task_rx) = mpsc::channel(1);
        Ok(Self {
            listener,
            broker: Broker::start(),
            registry,
            options,
            task_tx: Mutex::new(Some(task_tx)),
            task_rx: Mutex::new(Some(task_rx)),
            hooks: Mutex::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Register work to run when the server closes. Hooks run concurrently
    /// with each other and with the wait for in-flight connections.
    pub fn on_shutdown(&self, hook: impl Future<Output = ()> + Send + 'static) {
        let mut hooks = self.hooks.lock().expect("hooks lock");
        hooks.push(Box::pin(hook));
    }

    /// Accept connections until the endpoint closes.
    pub async fn serve(&self) -> Result<()> {
        loop {
            let conn = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::info!(error = %err, "accept loop ended");
                    return Ok(());
                }
            };
            let Some(guard) = self
                .task_tx
                .lock()
                .expect("tasks lock")
                .as_ref()
                .cloned()
            else {
                // close() already ran; stop accepting.
                return Ok(());
            };
            let broker = self.broker.clone();
            let registry = self.registry.clone();
            let conn_id = (self.options.id_generator)();
            let max_frame_bytes = self.options.max_frame_bytes;
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(err) =
                    connection::handle_connection(broker, conn, registry, conn_id, max_frame_bytes)
                        .await
                {
                    tracing::warn!(error = %err, "connection handler failed");
                }
            });
        }
    }

    /// Graceful shutdown: stop matching, wait for in-flight per-stream
    /// splice tasks (running shutdown hooks concurrently with that wait),
    /// and only then close the listener, which tears down the remaining
    /// peer connections and their handler tasks.
    pub async fn close(&self) {
        // Stop accepting new work into the matcher; splices already copying
        // bytes run to completion while the transport stays up.
        self.broker.close();

        let hooks = std::mem::take(&mut *self.hooks.lock().expect("hooks lock"));
        tokio::join!(futures::future::join_all(hooks), self.broker.wait_idle());
        tokio::time::sleep(STREAM_DRAIN_TIMEOUT).await;

        self.listener.close(0, b"server closing");
        let tx = self.task_tx.lock().expect("tasks lock").take();
        let rx = self.task_rx.lock().expect("tasks lock").take();
        drop(tx);
        if let Some(mut rx) = rx {
            while rx.recv().await.is_some() {}
        }
        self.listener.wait_idle().await;
        tracing::info!("server closed");
    }
}
