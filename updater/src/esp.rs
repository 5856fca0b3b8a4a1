use core::convert::TryInto;
use std::{
    sync::{mpsc, Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{modem::Modem, prelude::Peripherals};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use esb_ota_common::{
    config::NetworkConfig, ota_status_topic, ota_topic, target::MAX_TRIGGER_PAYLOAD,
    EngineAction, RuntimeConfig, TriggerRequest, UpdateEngine, UpdateStatus,
};

use crate::{events::TaggedEvent, partition::PartitionSink, socket::ThreadTransport};

const NVS_NAMESPACE: &str = "esb_ota";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 2_000;

type Engine = UpdateEngine<ThreadTransport<ControlMessage>, PartitionSink>;

/// Everything the control thread reacts to arrives as one of these.
#[derive(Debug)]
enum ControlMessage {
    Trigger(TriggerRequest),
    Socket(TaggedEvent),
}

impl From<TaggedEvent> for ControlMessage {
    fn from(event: TaggedEvent) -> Self {
        Self::Socket(event)
    }
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`, device topic `{}`",
        runtime.network.wifi_ssid,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
        runtime.network.device_topic,
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime.network)?;
    let mqtt_client = Arc::new(Mutex::new(mqtt_client));
    let trigger_topic = ota_topic(&runtime.network.device_topic);
    subscribe_trigger(&mqtt_client, &trigger_topic)?;

    let (control_tx, control_rx) = mpsc::channel();
    spawn_mqtt_receiver(
        control_tx.clone(),
        mqtt_conn,
        mqtt_client.clone(),
        trigger_topic,
    )?;
    spawn_control_loop(runtime, control_tx, control_rx, mqtt_client)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.trim().is_empty() {
        return Err(anyhow!("wifi ssid is not configured"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(esp_wifi),
        Some(err) => Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}"
        )),
    }
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some("esb-ota-updater"),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_trigger(mqtt: &Arc<Mutex<EspMqttClient<'static>>>, topic: &str) -> anyhow::Result<()> {
    let mut mqtt = mqtt
        .lock()
        .map_err(|_| anyhow!("mqtt client lock poisoned"))?;
    mqtt.subscribe(topic, QoS::AtLeastOnce)?;
    Ok(())
}

fn spawn_mqtt_receiver(
    control: mpsc::Sender<ControlMessage>,
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    trigger_topic: String,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => {
                    let EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } = event.payload()
                    else {
                        continue;
                    };
                    // Only complete payloads carry a usable trigger.
                    if topic != trigger_topic || !matches!(details, Details::Complete) {
                        continue;
                    }
                    if data.len() > MAX_TRIGGER_PAYLOAD {
                        warn!("dropping oversized update trigger ({} bytes)", data.len());
                        continue;
                    }
                    match TriggerRequest::parse(data) {
                        Ok(request) => {
                            info!("update requested over mqtt: {}", request.url);
                            if control.send(ControlMessage::Trigger(request)).is_err() {
                                warn!("control loop is gone, stopping mqtt receiver");
                                return;
                            }
                        }
                        Err(err) => warn!("update trigger rejected: {err}"),
                    }
                }
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    if let Err(sub_err) = subscribe_trigger(&mqtt, &trigger_topic) {
                        warn!("mqtt re-subscribe failed: {sub_err:#}");
                    }
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

fn spawn_control_loop(
    runtime: RuntimeConfig,
    control_tx: mpsc::Sender<ControlMessage>,
    control_rx: mpsc::Receiver<ControlMessage>,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("ota-control".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            let status_topic = ota_status_topic(&runtime.network.device_topic);
            let mut engine: Engine = UpdateEngine::new(runtime.ota.clone());
            let mut attempt = 0_u64;
            let mut published = None;

            loop {
                let actions = match control_rx.recv_timeout(Duration::from_secs(1)) {
                    Ok(ControlMessage::Trigger(request)) => {
                        let next = attempt + 1;
                        let transport =
                            ThreadTransport::new(next, runtime.transport.clone(), control_tx.clone());
                        let started = engine.begin_update(
                            &request.url,
                            request.checksum.as_str(),
                            transport,
                            PartitionSink::new(),
                            monotonic_ms(),
                        );
                        match started {
                            Ok(()) => attempt = next,
                            Err(err) => warn!("update not started: {err}"),
                        }
                        Vec::new()
                    }
                    Ok(ControlMessage::Socket(tagged)) if tagged.attempt == attempt => {
                        engine.handle_event(tagged.event.as_event(), monotonic_ms())
                    }
                    Ok(ControlMessage::Socket(_)) => Vec::new(),
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        engine.tick(monotonic_ms());
                        Vec::new()
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => return,
                };

                let status = engine.status();
                if published.as_ref() != Some(&status) {
                    publish_status(&mqtt, &status_topic, &status);
                    published = Some(status);
                }
                execute_engine_actions(actions);
            }
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

fn publish_status(mqtt: &Arc<Mutex<EspMqttClient<'static>>>, topic: &str, status: &UpdateStatus) {
    let body = match serde_json::to_vec(status) {
        Ok(body) => body,
        Err(err) => {
            warn!("update status serialization failed: {err}");
            return;
        }
    };
    let Ok(mut mqtt) = mqtt.lock() else {
        return;
    };
    if let Err(err) = mqtt.publish(topic, QoS::AtLeastOnce, true, &body) {
        warn!("update status publish failed: {err:?}");
    }
}

fn execute_engine_actions(actions: Vec<EngineAction>) {
    for action in actions {
        match action {
            EngineAction::Delay(ms) => thread::sleep(Duration::from_millis(ms)),
            EngineAction::Restart => {
                info!("restarting into the new image");
                unsafe { esp_idf_svc::sys::esp_restart() };
            }
        }
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("nvs lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
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
