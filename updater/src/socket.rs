use std::{
    io::{ErrorKind, Read, Write},
    net::{Shutdown, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
    time::Duration,
};

use esb_ota_common::{config::TransportConfig, Transport};
use log::{debug, warn};

use crate::events::{SocketEvent, TaggedEvent};

const READ_CHUNK_SIZE: usize = 1460;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Blocking-socket transport: a reader thread turns the stream into events.
pub struct ThreadTransport<M> {
    attempt: u64,
    config: TransportConfig,
    events: mpsc::Sender<M>,
    stream: Arc<Mutex<Option<TcpStream>>>,
    closed: Arc<AtomicBool>,
}

impl<M: From<TaggedEvent> + Send + 'static> ThreadTransport<M> {
    pub fn new(attempt: u64, config: TransportConfig, events: mpsc::Sender<M>) -> Self {
        Self {
            attempt,
            config,
            events,
            stream: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<M: From<TaggedEvent> + Send + 'static> Transport for ThreadTransport<M> {
    fn connect(&mut self, host: &str, port: u16) -> bool {
        let reader = SocketReader {
            attempt: self.attempt,
            events: self.events.clone(),
            stream: self.stream.clone(),
            closed: self.closed.clone(),
            read_timeout: Duration::from_millis(self.config.read_timeout_ms),
        };
        let host = host.to_string();
        let spawned = thread::Builder::new()
            .name("ota-socket".into())
            .stack_size(8 * 1024)
            .spawn(move || reader.run(&host, port));

        match spawned {
            Ok(_) => true,
            Err(err) => {
                warn!("failed to spawn socket thread: {err}");
                false
            }
        }
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        let Ok(mut guard) = self.stream.lock() else {
            return 0;
        };
        let Some(stream) = guard.as_mut() else {
            return 0;
        };
        match stream.write_all(bytes) {
            Ok(()) => bytes.len(),
            Err(err) => {
                warn!("socket write failed: {err}");
                0
            }
        }
    }

    fn space(&self) -> usize {
        let connected = self
            .stream
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false);
        if connected {
            self.config.send_buffer_size
        } else {
            0
        }
    }

    fn stop(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
        if let Ok(mut guard) = self.stream.lock() {
            if let Some(stream) = guard.take() {
                debug!("socket: closing attempt {}", self.attempt);
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

impl<M> Drop for ThreadTransport<M> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
        if let Ok(mut guard) = self.stream.lock() {
            if let Some(stream) = guard.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

struct SocketReader<M> {
    attempt: u64,
    events: mpsc::Sender<M>,
    stream: Arc<Mutex<Option<TcpStream>>>,
    closed: Arc<AtomicBool>,
    read_timeout: Duration,
}

impl<M: From<TaggedEvent>> SocketReader<M> {
    fn emit(&self, event: SocketEvent) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let _ = self.events.send(M::from(TaggedEvent {
            attempt: self.attempt,
            event,
        }));
    }

    fn run(self, host: &str, port: u16) {
        let mut reader = match self.open(host, port) {
            Ok(reader) => reader,
            Err(err) => {
                self.emit(SocketEvent::Error(format!(
                    "connect to {host}:{port} failed: {err}"
                )));
                return;
            }
        };
        self.emit(SocketEvent::Connected);

        let mut chunk = [0_u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => {
                    self.emit(SocketEvent::Disconnected);
                    return;
                }
                Ok(read) => self.emit(SocketEvent::Data(chunk[..read].to_vec())),
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    self.emit(SocketEvent::Timeout);
                    return;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    self.emit(SocketEvent::Error(err.to_string()));
                    return;
                }
            }
        }
    }

    fn open(&self, host: &str, port: u16) -> std::io::Result<TcpStream> {
        let address = std::net::ToSocketAddrs::to_socket_addrs(&(host, port))?
            .next()
            .ok_or_else(|| std::io::Error::new(ErrorKind::NotFound, "host did not resolve"))?;
        let stream = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT)?;
        stream.set_read_timeout(Some(self.read_timeout))?;
        let _ = stream.set_nodelay(true);

        let writer = stream.try_clone()?;
        let mut guard = self
            .stream
            .lock()
            .map_err(|_| std::io::Error::other("socket state poisoned"))?;
        if self.closed.load(Ordering::Relaxed) {
            return Err(std::io::Error::other("transport stopped"));
        }
        *guard = Some(writer);
        Ok(stream)
    }
}
