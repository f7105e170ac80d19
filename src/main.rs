use clap::Parser;
use fieldgate::actions::{Action, ActionDispatcher};
use fieldgate::agent::Agent;
use fieldgate::channel::mqtt;
use fieldgate::config::Config;
use fieldgate::error::AgentError;
use log::{error, info, warn};
use rumqttc::{Event, Incoming};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::{task, time};

#[derive(Parser)]
#[command(name = "fieldgate", version, about = "Edge telemetry agent")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "fieldgate.toml")]
    config: PathBuf,
    /// Log filter, e.g. `info` or `fieldgate=debug`.
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<(), AgentError> {
    let cli = Cli::parse();
    env_logger::Builder::new().parse_filters(&cli.log).init();

    let config = Config::load(&cli.config)?;
    let mqtt_config = config
        .mqtt
        .clone()
        .ok_or_else(|| AgentError::fatal("config has no [mqtt] section"))?;
    let actions_topic = mqtt_config.actions_topic.clone();

    let (channel, bridge, mut eventloop) = mqtt::connect(&mqtt_config);
    let (agent, router) = Agent::new(&config, channel)?;
    let dispatcher = config
        .actions
        .as_ref()
        .map(|actions| ActionDispatcher::new(actions, router.clone()));

    info!(
        "connecting to {}:{} as {}",
        mqtt_config.host, mqtt_config.port, mqtt_config.client_id
    );

    let (event_tx, event_rx) = mpsc::channel(64);
    task::spawn(async move {
        loop {
            let event = eventloop.poll().await;
            if let Ok(Event::Incoming(Incoming::Publish(publish))) = &event {
                if actions_topic.as_deref() == Some(publish.topic.as_str()) {
                    handle_action(dispatcher.as_ref(), &publish.payload).await;
                    continue;
                }
            }
            let failed = event.is_err();
            if let Some(channel_event) = bridge.translate(&event) {
                if event_tx.send(channel_event).await.is_err() {
                    return;
                }
            }
            if failed {
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    agent.run(event_rx).await
}

async fn handle_action(dispatcher: Option<&ActionDispatcher>, payload: &[u8]) {
    let Some(dispatcher) = dispatcher else {
        warn!("received an action but no [actions] section is configured");
        return;
    };
    let action: Action = match serde_json::from_slice(payload) {
        Ok(action) => action,
        Err(err) => {
            error!("malformed action payload: {err}");
            return;
        }
    };
    if let Err(err) = dispatcher.dispatch(action).await {
        warn!("action rejected: {err}");
    }
}
