// Tag-addressed matching engine.
//
// The matcher is a single task owning two maps: observers waiting for a
// producer, and producer readers waiting for an observer, both keyed by tag.
// All mutations happen inside that task; everything else talks to it over
// channels. At any instant a tag has pending observers or pending readers,
// never both.
//
// Matching is one-to-one at the stream level: a producer stream is spliced
// into exactly one stream opened toward exactly one observer connection.
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("broker is closed")]
    Closed,
}

/// Producer payload source, preamble already drained.
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;
/// Send half of a stream opened toward an observer.
pub type ByteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The one capability the matcher holds toward an observer's connection:
/// opening a unidirectional stream back to it. Keeping the connection itself
/// out of the matcher breaks the broker/connection reference cycle.
///
/// Implementations box the future by hand so the trait stays object-safe.
pub trait ObserverLink: Send + Sync {
    fn open_uni(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<ByteWriter>> + Send + '_>>;
}

/// A producer stream admitted by the connection manager.
pub struct TaggedReader {
    pub stream_id: String,
    pub tag: String,
    pub reader: ByteReader,
}

/// An observe registration from a server-side control stream.
pub struct TaggedObserver {
    pub tag: String,
    pub conn_id: String,
    pub link: Arc<dyn ObserverLink>,
}

/// Handle to a running matcher task.
///
/// Cloning shares the same matcher. Submission channels rendezvous with the
/// matcher, so a busy matcher backpressures its callers directly.
#[derive(Clone)]
pub struct Broker {
    reader_tx: mpsc::Sender<TaggedReader>,
    observer_tx: mpsc::Sender<TaggedObserver>,
    cancel_tx: watch::Sender<bool>,
    // Receiver side of the splice wait-group; taken by the first wait_idle
    // caller.
    work_rx: Arc<Mutex<Option<mpsc::Receiver<()>>>>,
}

impl Broker {
    /// Spawn the matcher task and return a handle to it.
    pub fn start() -> Self {
        let (reader_tx, reader_rx) = mpsc::channel(1);
        let (observer_tx, observer_rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (eof_tx, eof_rx) = mpsc::unbounded_channel();
        // Wait-group over per-stream work: the matcher and every splice task
        // hold a sender clone, so the receiver drains only when all of them
        // have finished.
        let (work_tx, work_rx) = mpsc::channel(1);
        let matcher = Matcher {
            observers: HashMap::new(),
            readers: HashMap::new(),
            eof_tx,
            work_tx,
        };
        tokio::spawn(matcher.run(reader_rx, observer_rx, eof_rx, cancel_rx));
        Self {
            reader_tx,
            observer_tx,
            cancel_tx,
            work_rx: Arc::new(Mutex::new(Some(work_rx))),
        }
    }

    pub async fn submit_reader(&self, reader: TaggedReader) -> Result<()> {
        self.reader_tx
            .send(reader)
            .await
            .map_err(|_| BrokerError::Closed)
    }

    pub async fn submit_observer(&self, observer: TaggedObserver) -> Result<()> {
        self.observer_tx
            .send(observer)
            .await
            .map_err(|_| BrokerError::Closed)
    }

    /// Signal the matcher to exit and return. Queued observers and readers
    /// are dropped; their underlying streams close with the transport.
    /// In-flight splice tasks keep copying; wait for them with [`wait_idle`].
    ///
    /// [`wait_idle`]: Broker::wait_idle
    pub fn close(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Resolve once the matcher and every in-flight splice task have
    /// finished. Call after [`close`]; a splice ends when its producer
    /// reaches EOF, errors, or its streams are torn down.
    ///
    /// Only the first caller across all clones actually waits; later calls
    /// return immediately.
    ///
    /// [`close`]: Broker::close
    pub async fn wait_idle(&self) {
        let rx = self.work_rx.lock().expect("work lock").take();
        if let Some(mut rx) = rx {
            while rx.recv().await.is_some() {}
        }
    }
}

struct ObserverEntry {
    conn_id: String,
    link: Arc<dyn ObserverLink>,
}

struct ReaderEntry {
    stream_id: String,
    reader: ByteReader,
}

struct Matcher {
    // tag -> observers not yet paired, in registration order.
    observers: HashMap<String, Vec<ObserverEntry>>,
    // tag -> producer streams that arrived before any observer.
    readers: HashMap<String, Vec<ReaderEntry>>,
    // Splice tasks report producer EOF here; unbounded so they never block.
    eof_tx: mpsc::UnboundedSender<String>,
    // Wait-group guard; a clone rides along in every splice task.
    work_tx: mpsc::Sender<()>,
}

impl Matcher {
    async fn run(
        mut self,
        mut reader_rx: mpsc::Receiver<TaggedReader>,
        mut observer_rx: mpsc::Receiver<TaggedObserver>,
        mut eof_rx: mpsc::UnboundedReceiver<String>,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        break;
                    }
                }
                observer = observer_rx.recv() => {
                    let Some(observer) = observer else { break };
                    self.handle_observer(observer).await;
                }
                reader = reader_rx.recv() => {
                    let Some(reader) = reader else { break };
                    self.handle_reader(reader).await;
                }
                Some(tag) = eof_rx.recv() => {
                    self.handle_reader_eof(&tag);
                }
            }
        }
        tracing::debug!(
            pending_observer_tags = self.observers.len(),
            pending_reader_tags = self.readers.len(),
            "matcher stopped"
        );
    }

    async fn handle_observer(&mut self, observer: TaggedObserver) {
        let TaggedObserver { tag, conn_id, link } = observer;
        metrics::counter!("rill_broker_observers_total").increment(1);
        if let Some(queued) = self.readers.remove(&tag) {
            // Producers got here first: drain every queued reader into a
            // fresh stream toward this observer. A reader whose stream fails
            // to open stays queued.
            let mut remaining = Vec::new();
            for entry in queued {
                match link.open_uni().await {
                    Ok(writer) => {
                        self.spawn_splice(&tag, entry.stream_id, entry.reader, writer);
                    }
                    Err(err) => {
                        tracing::warn!(
                            tag,
                            conn_id,
                            stream_id = entry.stream_id,
                            error = %err,
                            "open stream toward observer failed"
                        );
                        remaining.push(entry);
                    }
                }
            }
            if !remaining.is_empty() {
                self.readers.insert(tag.clone(), remaining);
            }
        } else {
            let bucket = self.observers.entry(tag.clone()).or_default();
            match bucket.iter_mut().find(|entry| entry.conn_id == conn_id) {
                // Re-observing the same tag replaces the prior registration.
                Some(entry) => entry.link = link,
                None => bucket.push(ObserverEntry { conn_id, link }),
            }
        }
        self.check_disjoint(&tag);
    }

    async fn handle_reader(&mut self, reader: TaggedReader) {
        let TaggedReader {
            stream_id,
            tag,
            reader,
        } = reader;
        metrics::counter!("rill_broker_readers_total").increment(1);
        if let Some(mut bucket) = self.observers.remove(&tag) {
            // Earliest registered observer wins; an observer whose stream
            // fails to open is discarded and the next one is tried.
            while !bucket.is_empty() {
                let entry = bucket.remove(0);
                match entry.link.open_uni().await {
                    Ok(writer) => {
                        if !bucket.is_empty() {
                            self.observers.insert(tag.clone(), bucket);
                        }
                        self.spawn_splice(&tag, stream_id, reader, writer);
                        self.check_disjoint(&tag);
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(
                            tag,
                            conn_id = entry.conn_id,
                            error = %err,
                            "open stream toward observer failed; dropping observer"
                        );
                    }
                }
            }
        }
        let bucket = self.readers.entry(tag.clone()).or_default();
        match bucket
            .iter()
            .position(|entry| entry.stream_id == stream_id)
        {
            // A producer reusing a stream id replaces its stale entry.
            Some(index) => bucket[index] = ReaderEntry { stream_id, reader },
            None => bucket.push(ReaderEntry { stream_id, reader }),
        }
        self.check_disjoint(&tag);
    }

    // Producer EOF: reclaim the whole tag bucket. The spliced entry was
    // already removed when it matched, so this only drops leftovers.
    fn handle_reader_eof(&mut self, tag: &str) {
        self.readers.remove(tag);
    }

    fn spawn_splice(&self, tag: &str, stream_id: String, reader: ByteReader, writer: ByteWriter) {
        metrics::counter!("rill_broker_splices_total").increment(1);
        let tag = tag.to_string();
        let eof_tx = self.eof_tx.clone();
        let guard = self.work_tx.clone();
        tokio::spawn(async move {
            // Dropped when the splice ends, releasing the wait-group.
            let _guard = guard;
            splice(tag, stream_id, reader, writer, eof_tx).await;
        });
    }

    // Inconsistent matcher state is a programmer error: panic under debug
    // assertions, log and keep serving in release builds.
    fn check_disjoint(&self, tag: &str) {
        let observers = self.observers.get(tag).map_or(0, Vec::len);
        let readers = self.readers.get(tag).map_or(0, Vec::len);
        if observers > 0 && readers > 0 {
            debug_assert!(false, "tag {tag} holds both observers and readers");
            tracing::error!(tag, observers, readers, "matcher state inconsistent");
        }
    }
}

// Copy producer bytes into the observer stream until EOF or error, then
// close the write side so the observer sees a finished stream.
async fn splice(
    tag: String,
    stream_id: String,
    mut reader: ByteReader,
    mut writer: ByteWriter,
    eof_tx: mpsc::UnboundedSender<String>,
) {
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => {
            tracing::debug!(tag, stream_id, bytes, "producer stream finished");
            let _ = eof_tx.send(tag);
        }
        Err(err) => {
            tracing::warn!(tag, stream_id, error = %err, "splice failed");
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    // Observer link backed by in-memory pipes; each opened stream's read half
    // is handed to the test over a channel.
    struct PipeLink {
        streams: mpsc::UnboundedSender<DuplexStream>,
        fail: bool,
    }

    impl PipeLink {
        fn new(fail: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<DuplexStream>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Arc::new(Self { streams: tx, fail }), rx)
        }
    }

    impl ObserverLink for PipeLink {
        fn open_uni(
            &self,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<ByteWriter>> + Send + '_>> {
            Box::pin(async move {
                if self.fail {
                    anyhow::bail!("link down");
                }
                let (local, remote) = tokio::io::duplex(4096);
                self.streams
                    .send(remote)
                    .map_err(|_| anyhow::anyhow!("test receiver gone"))?;
                Ok(Box::new(local) as ByteWriter)
            })
        }
    }

    fn reader_from(payload: &[u8]) -> TaggedReader {
        let (mut write, read) = tokio::io::duplex(4096);
        let payload = payload.to_vec();
        tokio::spawn(async move {
            // Errors only happen when the matcher dropped this reader, which
            // some tests do on purpose.
            let _ = write.write_all(&payload).await;
            let _ = write.shutdown().await;
        });
        TaggedReader {
            stream_id: "p1".to_string(),
            tag: "t".to_string(),
            reader: Box::new(read),
        }
    }

    // Reader and observer submissions travel on separate channels, so give
    // the matcher a beat to drain one before racing it with the other.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn recv_all(rx: &mut mpsc::UnboundedReceiver<DuplexStream>) -> Vec<u8> {
        let mut stream = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("stream within deadline")
            .expect("stream delivered");
        let mut buf = Vec::new();
        timeout(Duration::from_secs(2), stream.read_to_end(&mut buf))
            .await
            .expect("read within deadline")
            .expect("read spliced bytes");
        buf
    }

    #[tokio::test]
    async fn producer_before_observer() {
        let broker = Broker::start();
        broker.submit_reader(reader_from(b"hello")).await.expect("reader");

        let (link, mut rx) = PipeLink::new(false);
        broker
            .submit_observer(TaggedObserver {
                tag: "t".to_string(),
                conn_id: "c1".to_string(),
                link,
            })
            .await
            .expect("observer");

        assert_eq!(recv_all(&mut rx).await, b"hello");
    }

    #[tokio::test]
    async fn observer_before_producer() {
        let broker = Broker::start();
        let (link, mut rx) = PipeLink::new(false);
        broker
            .submit_observer(TaggedObserver {
                tag: "t".to_string(),
                conn_id: "c1".to_string(),
                link,
            })
            .await
            .expect("observer");

        broker.submit_reader(reader_from(b"world")).await.expect("reader");
        assert_eq!(recv_all(&mut rx).await, b"world");
    }

    #[tokio::test]
    async fn matching_is_one_to_one() {
        let broker = Broker::start();
        let (link_a, mut rx_a) = PipeLink::new(false);
        let (link_b, mut rx_b) = PipeLink::new(false);
        for (conn_id, link) in [("a", link_a), ("b", link_b)] {
            broker
                .submit_observer(TaggedObserver {
                    tag: "t".to_string(),
                    conn_id: conn_id.to_string(),
                    link,
                })
                .await
                .expect("observer");
        }

        settle().await;

        // First producer goes to the earliest observer only.
        broker.submit_reader(reader_from(b"one")).await.expect("reader");
        assert_eq!(recv_all(&mut rx_a).await, b"one");
        assert!(rx_b.try_recv().is_err());

        // Second producer reaches the remaining observer.
        let mut second = reader_from(b"two");
        second.stream_id = "p2".to_string();
        broker.submit_reader(second).await.expect("reader");
        assert_eq!(recv_all(&mut rx_b).await, b"two");
    }

    #[tokio::test]
    async fn duplicate_observer_replaces_prior() {
        let broker = Broker::start();
        let (stale, mut stale_rx) = PipeLink::new(false);
        let (fresh, mut fresh_rx) = PipeLink::new(false);
        for link in [stale, fresh] {
            broker
                .submit_observer(TaggedObserver {
                    tag: "t".to_string(),
                    conn_id: "c1".to_string(),
                    link,
                })
                .await
                .expect("observer");
        }

        settle().await;
        broker.submit_reader(reader_from(b"data")).await.expect("reader");
        assert_eq!(recv_all(&mut fresh_rx).await, b"data");
        assert!(stale_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_open_falls_through_to_next_observer() {
        let broker = Broker::start();
        let (broken, _broken_rx) = PipeLink::new(true);
        let (working, mut rx) = PipeLink::new(false);
        broker
            .submit_observer(TaggedObserver {
                tag: "t".to_string(),
                conn_id: "broken".to_string(),
                link: broken,
            })
            .await
            .expect("observer");
        broker
            .submit_observer(TaggedObserver {
                tag: "t".to_string(),
                conn_id: "working".to_string(),
                link: working,
            })
            .await
            .expect("observer");

        settle().await;
        broker.submit_reader(reader_from(b"data")).await.expect("reader");
        assert_eq!(recv_all(&mut rx).await, b"data");
    }

    #[tokio::test]
    async fn late_observer_drains_all_queued_readers() {
        let broker = Broker::start();
        broker.submit_reader(reader_from(b"first")).await.expect("reader");
        let mut second = reader_from(b"second");
        second.stream_id = "p2".to_string();
        broker.submit_reader(second).await.expect("reader");
        settle().await;

        let (link, mut rx) = PipeLink::new(false);
        broker
            .submit_observer(TaggedObserver {
                tag: "t".to_string(),
                conn_id: "c1".to_string(),
                link,
            })
            .await
            .expect("observer");

        let mut received = vec![recv_all(&mut rx).await, recv_all(&mut rx).await];
        received.sort();
        assert_eq!(received, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[tokio::test]
    async fn duplicate_reader_id_replaces_prior() {
        let broker = Broker::start();
        broker.submit_reader(reader_from(b"stale")).await.expect("reader");
        broker.submit_reader(reader_from(b"fresh")).await.expect("reader");
        settle().await;

        let (link, mut rx) = PipeLink::new(false);
        broker
            .submit_observer(TaggedObserver {
                tag: "t".to_string(),
                conn_id: "c1".to_string(),
                link,
            })
            .await
            .expect("observer");

        assert_eq!(recv_all(&mut rx).await, b"fresh");
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn wait_idle_blocks_on_active_splice() {
        let broker = Broker::start();
        let (link, mut rx) = PipeLink::new(false);
        broker
            .submit_observer(TaggedObserver {
                tag: "t".to_string(),
                conn_id: "c1".to_string(),
                link,
            })
            .await
            .expect("observer");
        settle().await;

        // Producer whose write half stays open across the shutdown.
        let (mut write, read) = tokio::io::duplex(4096);
        broker
            .submit_reader(TaggedReader {
                stream_id: "p1".to_string(),
                tag: "t".to_string(),
                reader: Box::new(read),
            })
            .await
            .expect("reader");
        write.write_all(b"first").await.expect("write first");

        let mut stream = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("stream within deadline")
            .expect("stream delivered");
        let mut head = [0u8; 5];
        timeout(Duration::from_secs(2), stream.read_exact(&mut head))
            .await
            .expect("head within deadline")
            .expect("read head");
        assert_eq!(&head, b"first");

        broker.close();
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished(), "wait_idle returned mid-splice");

        write.write_all(b"rest").await.expect("write rest");
        write.shutdown().await.expect("finish producer");
        timeout(Duration::from_secs(2), waiter)
            .await
            .expect("wait_idle within deadline")
            .expect("wait_idle task");

        let mut tail = Vec::new();
        timeout(Duration::from_secs(2), stream.read_to_end(&mut tail))
            .await
            .expect("tail within deadline")
            .expect("read tail");
        assert_eq!(tail, b"rest");
    }

    #[tokio::test]
    async fn close_rejects_new_submissions() {
        let broker = Broker::start();
        broker.close();
        // The matcher drops its receivers once the cancel flag lands.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = broker
            .submit_reader(reader_from(b"late"))
            .await
            .expect_err("closed");
        assert!(matches!(err, BrokerError::Closed));
    }
}
