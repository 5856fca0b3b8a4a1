use log::{debug, info, warn};

use crate::{
    body::{BodyProgress, BodyStreamer},
    checksum::Checksum,
    config::OtaConfig,
    error::{BeginError, UpdateError},
    headers::{Feed, HeaderAccumulator},
    sink::UpdateSink,
    target::UpdateTarget,
    transport::{Transport, TransportEvent},
    types::{UpdatePhase, UpdateStatus},
    validator::ResponseValidator,
};

/// Side effects the caller must carry out, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineAction {
    Delay(u64),
    Restart,
}

enum Step {
    Continue,
    BodyComplete,
}

struct Session<T, S> {
    target: UpdateTarget,
    checksum: Checksum,
    source_url: String,
    phase: UpdatePhase,
    started_at_ms: u64,
    last_progress_ms: u64,

    transport: T,
    sink: S,

    accumulator: HeaderAccumulator,
    validator: ResponseValidator,
    body: Option<BodyStreamer>,
}

/// Single-flight HTTP firmware fetcher.
///
/// At most one session exists at a time. All methods are driven from one control task: the
/// caller feeds transport events in and executes the returned [`EngineAction`]s.
pub struct UpdateEngine<T, S> {
    pub config: OtaConfig,
    session: Option<Session<T, S>>,
    last: UpdateStatus,
}

impl<T: Transport, S: UpdateSink> UpdateEngine<T, S> {
    pub fn new(mut config: OtaConfig) -> Self {
        config.sanitize();
        Self {
            config,
            session: None,
            last: UpdateStatus::default(),
        }
    }

    pub fn phase(&self) -> UpdatePhase {
        self.session
            .as_ref()
            .map_or(UpdatePhase::Idle, |session| session.phase)
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn status(&self) -> UpdateStatus {
        let mut status = self.last.clone();
        if let Some(session) = &self.session {
            status.state = session.phase;
            status.in_progress = session.phase != UpdatePhase::Rebooting;
            status.last_source_url = Some(session.source_url.clone());
            status.last_checksum = Some(session.checksum.to_string());
            status.last_error = None;
            match &session.body {
                Some(body) => status.set_progress(body.written(), Some(body.expected())),
                None => status.set_progress(0, None),
            }
        }
        status
    }

    /// Validates the request and starts connecting. Rejections leave the engine untouched.
    pub fn begin_update(
        &mut self,
        url: &str,
        checksum: &str,
        mut transport: T,
        sink: S,
        now_ms: u64,
    ) -> Result<(), BeginError> {
        self.expire_stale_session(now_ms);
        if let Some(session) = &self.session {
            warn!(
                "ota: fetch in progress ({}), not starting new one",
                session.phase
            );
            return Err(BeginError::Busy);
        }

        let target = UpdateTarget::parse(url, self.config.max_url_len).inspect_err(|err| {
            warn!("ota: rejecting url `{url}`: {err}");
        })?;
        let checksum = Checksum::parse(checksum.as_bytes()).inspect_err(|err| {
            warn!("ota: rejecting update for `{url}`: {err}");
        })?;

        info!(
            "ota: connecting to {} port {} (md5={checksum})",
            target.host, target.port
        );
        if !transport.connect(&target.host, target.port) {
            warn!("ota: failed to initiate connection");
            return Err(BeginError::ConnectFailed {
                host: target.host,
                port: target.port,
            });
        }

        self.session = Some(Session {
            target,
            checksum,
            source_url: url.to_string(),
            phase: UpdatePhase::Connecting,
            started_at_ms: now_ms,
            last_progress_ms: now_ms,
            transport,
            sink,
            accumulator: HeaderAccumulator::new(),
            validator: ResponseValidator::new(&self.config),
            body: None,
        });
        Ok(())
    }

    pub fn handle_event(&mut self, event: TransportEvent<'_>, now_ms: u64) -> Vec<EngineAction> {
        if self.expire_stale_session(now_ms) {
            return Vec::new();
        }
        let Some(session) = self.session.as_mut() else {
            debug!("ota: ignoring {} event, no update in progress", event.name());
            return Vec::new();
        };
        if session.phase == UpdatePhase::Rebooting {
            return Vec::new();
        }
        if matches!(event, TransportEvent::Connected | TransportEvent::Data(_)) {
            session.last_progress_ms = now_ms;
        }

        let result = match event {
            TransportEvent::Connected => session.on_connected(&self.config),
            TransportEvent::Data(bytes) => session.on_data(bytes),
            TransportEvent::Error(reason) => Err(UpdateError::Transport(reason.to_string())),
            TransportEvent::Timeout => Err(UpdateError::TransportTimeout),
            TransportEvent::Disconnected => Err(UpdateError::Disconnected),
        };

        match result {
            Ok(Step::Continue) => Vec::new(),
            Ok(Step::BodyComplete) => self.finalize(now_ms),
            Err(err) => {
                self.fail(err, now_ms);
                Vec::new()
            }
        }
    }

    /// Periodic check so a session whose transport went silent still frees the slot.
    ///
    /// Staleness counts from the last connect or data event, so a slow download that keeps
    /// delivering bytes is never cut off.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        self.expire_stale_session(now_ms)
    }

    fn expire_stale_session(&mut self, now_ms: u64) -> bool {
        let timeout_ms = self.config.attempt_timeout_ms;
        let stale = self.session.as_ref().is_some_and(|session| {
            session.phase != UpdatePhase::Rebooting
                && now_ms.saturating_sub(session.last_progress_ms) > timeout_ms
        });
        if stale {
            self.fail(UpdateError::AttemptTimeout { timeout_ms }, now_ms);
        }
        stale
    }

    fn finalize(&mut self, now_ms: u64) -> Vec<EngineAction> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        session.transition(UpdatePhase::Finalizing);

        if !session.sink.finish() {
            self.fail(UpdateError::Integrity, now_ms);
            return Vec::new();
        }

        let elapsed_ms = now_ms.saturating_sub(session.started_at_ms);
        info!(
            "ota: successful! Took {:.1}s. Rebooting.",
            elapsed_ms as f64 / 1000.0
        );
        session.transport.stop();
        session.transition(UpdatePhase::Rebooting);
        self.last.last_elapsed_ms = Some(elapsed_ms);

        vec![
            EngineAction::Delay(self.config.restart_delay_ms),
            EngineAction::Restart,
        ]
    }

    fn fail(&mut self, err: UpdateError, now_ms: u64) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        warn!(
            "ota: {} error during {}: {err}",
            err.class(),
            session.phase
        );
        session.transition(UpdatePhase::Failed);

        session.transport.stop();
        let written = session.body.as_ref().map_or(0, BodyStreamer::written);
        let total = session.body.as_ref().map(BodyStreamer::expected);
        if session.body.as_ref().is_some_and(BodyStreamer::is_begun) {
            session.sink.abort();
        }

        self.last = UpdateStatus {
            state: UpdatePhase::Idle,
            in_progress: false,
            last_error: Some(err.to_string()),
            last_source_url: Some(session.source_url),
            last_checksum: Some(session.checksum.to_string()),
            last_elapsed_ms: Some(now_ms.saturating_sub(session.started_at_ms)),
            ..UpdateStatus::default()
        };
        self.last.set_progress(written, total);
        info!("ota: session released");
    }
}

impl<T: Transport, S: UpdateSink> Session<T, S> {
    fn transition(&mut self, next: UpdatePhase) {
        info!("ota: {} -> {}", self.phase, next);
        self.phase = next;
    }

    fn on_connected(&mut self, config: &OtaConfig) -> Result<Step, UpdateError> {
        if self.phase != UpdatePhase::Connecting {
            warn!("ota: unexpected connect event during {}", self.phase);
            return Ok(Step::Continue);
        }
        info!("ota: connected, fetching {}", self.target.path);

        let available = self.transport.space();
        if available < config.min_send_space {
            return Err(UpdateError::SendBufferFull {
                available,
                required: config.min_send_space,
            });
        }

        let request = self.target.request();
        let written = self.transport.write(request.as_bytes());
        if written != request.len() {
            return Err(UpdateError::ShortRequestWrite {
                written,
                expected: request.len(),
            });
        }

        self.transition(UpdatePhase::AwaitingHeaders);
        Ok(Step::Continue)
    }

    fn on_data(&mut self, bytes: &[u8]) -> Result<Step, UpdateError> {
        match self.phase {
            UpdatePhase::AwaitingHeaders => self.on_header_data(bytes),
            UpdatePhase::StreamingBody => self.stream_body(bytes),
            phase => {
                warn!("ota: dropping {} bytes received during {phase}", bytes.len());
                Ok(Step::Continue)
            }
        }
    }

    fn on_header_data(&mut self, bytes: &[u8]) -> Result<Step, UpdateError> {
        let validator = &mut self.validator;
        let feed = self
            .accumulator
            .feed(bytes, |line| validator.on_header_line(line))?;

        let Feed::Complete { body_start } = feed else {
            return Ok(Step::Continue);
        };

        let expected = self.validator.finish()?;
        let mut body = BodyStreamer::new(expected);
        body.start(&mut self.sink, &self.checksum)?;
        info!(
            "ota: started flashing, length={expected} md5={}",
            self.checksum
        );
        self.body = Some(body);
        self.transition(UpdatePhase::StreamingBody);

        self.stream_body(&bytes[body_start..])
    }

    fn stream_body(&mut self, bytes: &[u8]) -> Result<Step, UpdateError> {
        let Some(body) = self.body.as_mut() else {
            return Ok(Step::Continue);
        };
        match body.stream(&mut self.sink, bytes)? {
            BodyProgress::Streaming => Ok(Step::Continue),
            BodyProgress::Complete => Ok(Step::BodyComplete),
        }
    }
}
