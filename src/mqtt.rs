//! MQTT side of the daemon.
//!
//! Measurements go to `<topic root>/<name>`, the link state to the retained
//! `<topic root>/availability`, and parameter changes arrive on
//! `<topic root>/set/<parameter>`.
use anyhow::{Context, Result};
use diematic_lib::{
    gateway::{DeviceGateway, GatewayConfig, LinkState, MeasurementSink, WriteHandle},
    registers::Measurement,
    Error,
};
use log::*;
use paho_mqtt as mqtt;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MQTT_APPENDIX_AVAILABILITY: &str = "availability";
const MQTT_APPENDIX_SET: &str = "set";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MqttConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    #[serde(default = "default_topic_root")]
    pub topic_root: String,
    /// Quality of service code to use
    #[serde(default = "default_qos")]
    qos: u8,
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub reconnect_delay: Duration,
}

fn default_topic_root() -> String {
    String::from("home/heating")
}

fn default_qos() -> u8 {
    0
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(1)
}

impl MqttConfig {
    pub const DEFAULT_CONFIG_FILE: &'static str = "mqtt.yml";

    pub fn load(path: &str) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Cannot open MQTT config file '{path}'"))?;
        let config: Self = serde_yaml::from_reader(file)
            .with_context(|| format!("Cannot parse MQTT config file '{path}'"))?;
        if config.qos > 2 {
            anyhow::bail!("Invalid MQTT qos {} in '{path}'", config.qos);
        }
        Ok(config)
    }

    pub fn qos(&self) -> i32 {
        i32::from(self.qos)
    }

    pub fn topic(&self, appendix: &str) -> String {
        format!("{}/{}", self.topic_root, appendix)
    }

    fn set_prefix(&self) -> String {
        format!("{}/", self.topic(MQTT_APPENDIX_SET))
    }

    /// Parameter name of a `<topic root>/set/<parameter>` topic.
    pub fn parameter_of<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(&self.set_prefix())
            .filter(|parameter| !parameter.is_empty() && !parameter.contains('/'))
    }

    fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("diematic-{:08x}", rand::random::<u32>()))
    }
}

/// Publishes gateway output through a paho client.
struct MqttSink {
    client: mqtt::AsyncClient,
    config: MqttConfig,
}

impl MqttSink {
    fn publish_availability(&self, online: bool) -> mqtt::DeliveryToken {
        let msg = mqtt::Message::new_retained(
            self.config.topic(MQTT_APPENDIX_AVAILABILITY),
            if online { "online" } else { "offline" },
            self.config.qos(),
        );
        self.client.publish(msg)
    }
}

impl MeasurementSink for MqttSink {
    fn publish(&self, measurement: &Measurement) {
        let topic = self.config.topic(measurement.name);
        trace!("Publish {topic} {}", measurement.value);
        let msg = mqtt::Message::new(topic, measurement.value.to_string(), self.config.qos());
        // Delivery is tracked by the client; nothing to wait for here.
        drop(self.client.publish(msg));
    }

    fn link_state_changed(&self, state: LinkState) {
        match state {
            LinkState::Polling => drop(self.publish_availability(true)),
            LinkState::Disconnected => drop(self.publish_availability(false)),
            LinkState::Connecting => {}
        }
    }
}

fn handle_message(config: &MqttConfig, writes: &WriteHandle, msg: &mqtt::Message) {
    let Some(parameter) = config.parameter_of(msg.topic()) else {
        debug!("Ignoring message on {}", msg.topic());
        return;
    };
    let payload = msg.payload_str();
    info!("{} {}", msg.topic(), payload);
    match writes.submit(parameter, &payload) {
        Ok(()) => {}
        Err(Error::WriteSlotFull) => {
            info!("Write queue is full, dropping {parameter}={payload}; send again later")
        }
        Err(err) => warn!("Rejected {parameter}={payload}: {err}"),
    }
}

async fn subscribe(client: &mqtt::AsyncClient, config: &MqttConfig) -> Result<()> {
    let filter = format!("{}#", config.set_prefix());
    client
        .subscribe(filter.as_str(), config.qos())
        .await
        .with_context(|| format!("Cannot subscribe to {filter}"))?;
    info!("Subscribed to {filter}");
    Ok(())
}

/// Feeds `set` messages into the write slot until cancelled.
async fn receive_commands(
    client: &mqtt::AsyncClient,
    stream: mqtt::AsyncReceiver<Option<mqtt::Message>>,
    config: &MqttConfig,
    writes: WriteHandle,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let msg_opt = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            msg_opt = stream.recv() => msg_opt.ok(),
        };
        match msg_opt {
            Some(Some(msg)) => handle_message(config, &writes, &msg),
            Some(None) => {
                // A "None" means we were disconnected. Try to reconnect...
                warn!("Lost connection to MQTT broker. Attempting reconnect.");
                loop {
                    match client.reconnect().await {
                        Ok(_) => break,
                        Err(err) => warn!("Error reconnecting: {err}"),
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(config.reconnect_delay) => {}
                    }
                }
                info!("Reconnected to MQTT broker");
                subscribe(client, config).await?;
            }
            None => anyhow::bail!("MQTT message stream closed"),
        }
    }
}

/// Drives the gateway and the command receiver side by side.
///
/// The gateway ending or the receiver failing cancels the other side.
async fn run_together<G, C>(
    cancel: &CancellationToken,
    gateway: G,
    commands: C,
) -> (diematic_lib::Result<()>, Result<()>)
where
    G: Future<Output = diematic_lib::Result<()>>,
    C: Future<Output = Result<()>>,
{
    tokio::join!(
        async {
            let result = gateway.await;
            cancel.cancel();
            result
        },
        async {
            let result = commands.await;
            if let Err(err) = &result {
                error!("Command receiver failed, stopping: {err:#}");
                cancel.cancel();
            }
            result
        }
    )
}

/// Bridges the gateway to MQTT until `cancel` fires.
pub async fn run_daemon(
    gateway_config: GatewayConfig,
    config_file: &str,
    cancel: CancellationToken,
) -> Result<()> {
    let config = MqttConfig::load(config_file)?;
    trace!("MQTT config: {config:?}");

    let create_opts = mqtt::CreateOptionsBuilder::new()
        .server_uri(&config.url)
        .client_id(config.client_id())
        .finalize();
    let mut client =
        mqtt::AsyncClient::new(create_opts).with_context(|| "Error creating mqtt client")?;

    let will = mqtt::Message::new_retained(
        config.topic(MQTT_APPENDIX_AVAILABILITY),
        "offline",
        config.qos(),
    );
    let mut conn_builder = mqtt::ConnectOptionsBuilder::new();
    let mut conn_builder = conn_builder
        .keep_alive_interval(config.keep_alive)
        .clean_session(true)
        .will_message(will);
    if let Some(user_name) = &config.username {
        conn_builder = conn_builder.user_name(user_name)
    }
    if let Some(password) = &config.password {
        conn_builder = conn_builder.password(password)
    }
    let conn_opts = conn_builder.finalize();

    // Get message stream before connecting.
    let stream = client.get_stream(25);

    info!("Connecting to MQTT broker {}", config.url);
    client
        .connect(conn_opts)
        .await
        .with_context(|| "Mqtt client unable to connect")?;
    subscribe(&client, &config).await?;

    let gateway = DeviceGateway::new(
        gateway_config,
        MqttSink {
            client: client.clone(),
            config: config.clone(),
        },
    );

    info!(
        "Bridging {} to {}",
        gateway.config().address,
        config.topic(MQTT_APPENDIX_SET)
    );
    let (gateway_result, commands_result) = run_together(
        &cancel,
        gateway.run(&cancel),
        receive_commands(&client, stream, &config, gateway.write_handle(), &cancel),
    )
    .await;

    info!("Stopping...");
    let offline = gateway.sink().publish_availability(false).await;
    if let Err(err) = offline {
        warn!("Cannot publish availability: {err}");
    }
    client
        .disconnect(None)
        .await
        .with_context(|| "Error disconnect mqtt client")?;

    gateway_result.with_context(|| "Gateway failed")?;
    commands_result
}
