use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use esb_ota_common::{config::TransportConfig, Transport};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::events::{SocketEvent, TaggedEvent};

const READ_CHUNK_SIZE: usize = 1460;

pub struct TcpTransport {
    attempt: u64,
    config: TransportConfig,
    events: mpsc::UnboundedSender<TaggedEvent>,
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    queued: Arc<AtomicUsize>,
    task: Option<JoinHandle<()>>,
}

impl TcpTransport {
    pub fn new(
        attempt: u64,
        config: TransportConfig,
        events: mpsc::UnboundedSender<TaggedEvent>,
    ) -> Self {
        Self {
            attempt,
            config,
            events,
            outgoing: None,
            queued: Arc::new(AtomicUsize::new(0)),
            task: None,
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, host: &str, port: u16) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("tcp: no async runtime available for connect");
            return false;
        };
        self.stop();

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        self.outgoing = Some(outgoing_tx);
        self.queued.store(0, Ordering::Relaxed);

        let socket = SocketTask {
            attempt: self.attempt,
            events: self.events.clone(),
            queued: self.queued.clone(),
            read_timeout: Duration::from_millis(self.config.read_timeout_ms),
        };
        let host = host.to_string();
        self.task = Some(runtime.spawn(socket.run(host, port, outgoing_rx)));
        true
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        let Some(outgoing) = &self.outgoing else {
            return 0;
        };
        let len = bytes.len().min(self.space());
        if len == 0 {
            return 0;
        }
        self.queued.fetch_add(len, Ordering::Relaxed);
        if outgoing.send(bytes[..len].to_vec()).is_err() {
            self.queued.fetch_sub(len, Ordering::Relaxed);
            return 0;
        }
        len
    }

    fn space(&self) -> usize {
        self.config
            .send_buffer_size
            .saturating_sub(self.queued.load(Ordering::Relaxed))
    }

    fn stop(&mut self) {
        self.outgoing = None;
        if let Some(task) = self.task.take() {
            debug!("tcp: closing attempt {}", self.attempt);
            task.abort();
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SocketTask {
    attempt: u64,
    events: mpsc::UnboundedSender<TaggedEvent>,
    queued: Arc<AtomicUsize>,
    read_timeout: Duration,
}

impl SocketTask {
    fn emit(&self, event: SocketEvent) {
        let _ = self.events.send(TaggedEvent {
            attempt: self.attempt,
            event,
        });
    }

    async fn run(self, host: String, port: u16, mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>) {
        let stream = match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => stream,
            Err(err) => {
                self.emit(SocketEvent::Error(format!("connect to {host}:{port} failed: {err}")));
                return;
            }
        };
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();
        self.emit(SocketEvent::Connected);

        let mut chunk = [0_u8; READ_CHUNK_SIZE];
        loop {
            tokio::select! {
                Some(bytes) = outgoing.recv() => {
                    let result = writer.write_all(&bytes).await;
                    self.queued.fetch_sub(bytes.len(), Ordering::Relaxed);
                    if let Err(err) = result {
                        self.emit(SocketEvent::Error(err.to_string()));
                        return;
                    }
                }
                read = tokio::time::timeout(self.read_timeout, reader.read(&mut chunk)) => {
                    match read {
                        Err(_) => {
                            self.emit(SocketEvent::Timeout);
                            return;
                        }
                        Ok(Ok(0)) => {
                            self.emit(SocketEvent::Disconnected);
                            return;
                        }
                        Ok(Ok(read)) => self.emit(SocketEvent::Data(chunk[..read].to_vec())),
                        Ok(Err(err)) => {
                            self.emit(SocketEvent::Error(err.to_string()));
                            return;
                        }
                    }
                }
            }
        }
    }
}
