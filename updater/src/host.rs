use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use esb_ota_common::{
    ota_status_topic, ota_topic, target::MAX_TRIGGER_PAYLOAD, BeginError, EngineAction,
    RuntimeConfig, TriggerRequest, UpdateEngine, UpdateStatus,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, watch},
};
use tracing::{info, warn};

use crate::{events::TaggedEvent, file_sink::FileSink, tcp::TcpTransport};

type Engine = UpdateEngine<TcpTransport, FileSink>;

#[derive(Clone)]
struct AppState {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<UpdateStatus>,
}

#[derive(Debug)]
enum Command {
    Begin {
        request: TriggerRequest,
        reply: oneshot::Sender<Result<(), BeginError>>,
    },
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct OtaApplyRequest {
    url: String,
    md5: String,
}

#[derive(Debug, Serialize)]
struct OtaApplyResponse {
    accepted: bool,
}

struct AppStore {
    data_dir: PathBuf,
    runtime_path: PathBuf,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    let staging_dir = runtime
        .flash
        .staging_dir
        .as_ref()
        .map_or_else(|| store.data_dir.clone(), PathBuf::from);
    tokio::fs::create_dir_all(&staging_dir)
        .await
        .with_context(|| format!("failed to create staging dir {}", staging_dir.display()))?;

    let mut mqtt_options = MqttOptions::new(
        "esb-ota-updater",
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    if !runtime.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let (commands_tx, commands_rx) = mpsc::channel(8);
    let (status_tx, status_rx) = watch::channel(UpdateStatus::default());

    let device_topic = runtime.network.device_topic.clone();
    mqtt.subscribe(ota_topic(&device_topic), QoS::AtLeastOnce)
        .await
        .context("failed to subscribe to the update topic")?;
    spawn_mqtt_loop(commands_tx.clone(), eventloop, ota_topic(&device_topic));
    spawn_status_publish_loop(mqtt, status_rx.clone(), ota_status_topic(&device_topic));

    let control = ControlLoop {
        engine: UpdateEngine::new(runtime.ota.clone()),
        runtime: runtime.clone(),
        staging_dir,
        status: status_tx,
        attempt: 0,
    };
    tokio::spawn(control.run(commands_rx));

    let app_state = AppState {
        commands: commands_tx,
        status: status_rx,
    };
    let app = Router::new()
        .route("/api/ota/status", get(handle_get_ota_status))
        .route("/api/ota/apply", post(handle_post_ota_apply))
        .with_state(app_state);

    let port = std::env::var("ESB_OTA_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind updater server at {addr}"))?;

    info!("updater listening on http://{addr}, device topic {device_topic}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    let network = &mut runtime.network;
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
}

/// Sole owner of the engine. Triggers and socket I/O only reach it through channels.
struct ControlLoop {
    engine: Engine,
    runtime: RuntimeConfig,
    staging_dir: PathBuf,
    status: watch::Sender<UpdateStatus>,
    attempt: u64,
}

impl ControlLoop {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<TaggedEvent>();
        let mut interval = tokio::time::interval(Duration::from_secs(1));

        loop {
            let actions = tokio::select! {
                Some(command) = commands.recv() => {
                    self.handle_command(command, &events_tx);
                    Vec::new()
                }
                Some(tagged) = events_rx.recv() => {
                    if tagged.attempt == self.attempt {
                        self.engine.handle_event(tagged.event.as_event(), monotonic_ms())
                    } else {
                        Vec::new()
                    }
                }
                _ = interval.tick() => {
                    self.engine.tick(monotonic_ms());
                    Vec::new()
                }
            };

            self.publish_status();
            if !actions.is_empty() {
                execute_engine_actions(actions).await;
            }
        }
    }

    fn handle_command(&mut self, command: Command, events: &mpsc::UnboundedSender<TaggedEvent>) {
        match command {
            Command::Begin { request, reply } => {
                let attempt = self.attempt + 1;
                let transport =
                    TcpTransport::new(attempt, self.runtime.transport.clone(), events.clone());
                let sink = FileSink::new(&self.staging_dir, self.runtime.flash.partition_size);

                let result = self.engine.begin_update(
                    &request.url,
                    request.checksum.as_str(),
                    transport,
                    sink,
                    monotonic_ms(),
                );
                if result.is_ok() {
                    self.attempt = attempt;
                }
                let _ = reply.send(result);
            }
        }
    }

    fn publish_status(&self) {
        let status = self.engine.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }
}

async fn execute_engine_actions(actions: Vec<EngineAction>) {
    for action in actions {
        match action {
            EngineAction::Delay(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            EngineAction::Restart => {
                info!("restarting into the new image");
                std::process::exit(0);
            }
        }
    }
}

fn spawn_mqtt_loop(
    commands: mpsc::Sender<Command>,
    mut eventloop: rumqttc::EventLoop,
    trigger_topic: String,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if message.topic != trigger_topic {
                        continue;
                    }
                    if let Err(err) = handle_trigger_payload(&commands, &message.payload).await {
                        warn!("update trigger rejected: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

async fn handle_trigger_payload(
    commands: &mpsc::Sender<Command>,
    payload: &[u8],
) -> anyhow::Result<()> {
    if payload.len() > MAX_TRIGGER_PAYLOAD {
        warn!(
            "dropping oversized update trigger ({} bytes)",
            payload.len()
        );
        return Ok(());
    }
    let request = TriggerRequest::parse(payload)?;
    info!("update requested over mqtt: {}", request.url);
    submit(commands, request).await??;
    Ok(())
}

async fn submit(
    commands: &mpsc::Sender<Command>,
    request: TriggerRequest,
) -> anyhow::Result<Result<(), BeginError>> {
    let (reply, response) = oneshot::channel();
    commands
        .send(Command::Begin { request, reply })
        .await
        .context("control loop is gone")?;
    response.await.context("control loop dropped the request")
}

fn spawn_status_publish_loop(
    mqtt: AsyncClient,
    mut status: watch::Receiver<UpdateStatus>,
    topic: String,
) {
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let payload = serde_json::to_vec(&*status.borrow_and_update());
            match payload {
                Ok(body) => {
                    if let Err(err) = mqtt.publish(&topic, QoS::AtLeastOnce, true, body).await {
                        warn!("update status publish failed: {err}");
                    }
                }
                Err(err) => warn!("update status serialization failed: {err}"),
            }
        }
    });
}

async fn handle_get_ota_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.status.borrow().clone())
}

async fn handle_post_ota_apply(
    State(state): State<AppState>,
    Json(request): Json<OtaApplyRequest>,
) -> axum::response::Response {
    let request = match TriggerRequest::new(request.url.trim(), request.md5.trim()) {
        Ok(request) => request,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    match submit(&state.commands, request).await {
        Ok(Ok(())) => (
            StatusCode::ACCEPTED,
            Json(OtaApplyResponse { accepted: true }),
        )
            .into_response(),
        Ok(Err(err)) => error_response(begin_error_status(&err), &err.to_string()),
        Err(err) => error_response(StatusCode::SERVICE_UNAVAILABLE, &format!("{err:#}")),
    }
}

fn begin_error_status(err: &BeginError) -> StatusCode {
    match err {
        BeginError::Busy => StatusCode::CONFLICT,
        BeginError::Input(_) => StatusCode::BAD_REQUEST,
        BeginError::ConnectFailed { .. } => StatusCode::BAD_GATEWAY,
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("ESB_OTA_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.esb-ota"));
        Self::at(&data_dir)
    }

    fn at(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            runtime_path: data_dir.join("runtime.json"),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(&self.runtime_path).await {
            Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
                .with_context(|| format!("invalid {}", self.runtime_path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
