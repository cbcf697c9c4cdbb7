//! Hub sink: streams asset events to a WebSocket hub and accepts control
//! commands back from it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, trace, warn};

use crate::actions::{Action, ActionRequest};
use crate::config::types::StoreSettings;
use crate::error::StoreError;

use super::{AssetEvent, StateStore};

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    Message,
>;

const CONNECTION_HEALTH_TIMEOUT_SECS: u64 = 30;

/// Scheduler-facing half: serializes events into the link's queue.
pub struct HubStore {
    tx: UnboundedSender<String>,
}

impl HubStore {
    pub fn channel() -> (Self, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StateStore for HubStore {
    fn push(&self, event: &AssetEvent) -> Result<(), StoreError> {
        let line = serde_json::to_string(event)?;
        self.tx.send(line).map_err(|_| StoreError::Closed)
    }
}

/// Events waiting for a connection. Full means the oldest entry goes.
struct Backlog {
    queue: VecDeque<String>,
    limit: usize,
    dropped: u64,
}

impl Backlog {
    fn new(limit: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            limit: limit.max(1),
            dropped: 0,
        }
    }

    fn push(&mut self, line: String) {
        if self.queue.len() >= self.limit {
            self.queue.pop_front();
            self.dropped += 1;
        }
        self.queue.push_back(line);
    }

    fn push_front(&mut self, line: String) {
        if self.queue.len() >= self.limit {
            self.dropped += 1;
            return;
        }
        self.queue.push_front(line);
    }

    /// Take and reset the drop counter.
    fn take_dropped(&mut self) -> u64 {
        std::mem::take(&mut self.dropped)
    }
}

/// Connection-side half: owns the socket, reconnects, forwards commands.
pub struct HubLink {
    settings: StoreSettings,
    agent_name: String,
    chassis: Vec<u8>,
    events: UnboundedReceiver<String>,
    actions: UnboundedSender<ActionRequest>,
    backlog: Backlog,
}

impl HubLink {
    pub fn new(
        settings: StoreSettings,
        agent_name: String,
        chassis: Vec<u8>,
        events: UnboundedReceiver<String>,
        actions: UnboundedSender<ActionRequest>,
    ) -> Self {
        let backlog = Backlog::new(settings.backlog);
        Self {
            settings,
            agent_name,
            chassis,
            events,
            actions,
            backlog,
        }
    }

    /// Serve until the event channel closes.
    pub async fn run(mut self) -> Result<()> {
        let mut retry_count = 0;

        loop {
            match self.connect_and_serve().await {
                Ok(true) => {
                    info!("Event channel closed, hub link stopping");
                    return Ok(());
                }
                Ok(false) => {
                    info!("Hub connection closed normally");
                    retry_count = 0;
                }
                Err(e) => error!("Hub connection error: {:#}", e),
            }

            let base_interval = self.settings.reconnect_interval;
            let wait_time = match retry_count {
                0 => base_interval,
                1 => base_interval * 1.4,
                2 => base_interval * 2.0,
                _ => base_interval * 3.0,
            };
            retry_count = (retry_count + 1).min(3);
            info!("Reconnecting to hub in {:.1}s... (attempt {})", wait_time, retry_count);

            // Keep draining events while disconnected so the backlog bound holds
            let deadline = time::Instant::now() + Duration::from_secs_f64(wait_time);
            loop {
                tokio::select! {
                    event = self.events.recv() => match event {
                        Some(line) => self.backlog.push(line),
                        None => return Ok(()),
                    },
                    _ = time::sleep_until(deadline) => break,
                }
            }

            let dropped = self.backlog.take_dropped();
            if dropped > 0 {
                warn!("Hub backlog full, dropped {} oldest event(s)", dropped);
            }
        }
    }

    /// Returns `Ok(true)` once the event channel has closed.
    async fn connect_and_serve(&mut self) -> Result<bool> {
        let url = self
            .settings
            .server_url
            .clone()
            .ok_or_else(|| anyhow!("hub sink has no server_url"))?;
        info!("Connecting to hub: {}", url);

        let timeout_duration = Duration::from_secs_f64(self.settings.connection_timeout);
        let (ws_stream, _) = time::timeout(timeout_duration, connect_async(url.as_str()))
            .await
            .context("Connection timeout")??;
        info!("Hub connected");

        let (mut write, mut read) = ws_stream.split();
        self.send_registration(&mut write).await?;
        self.flush_backlog(&mut write).await?;

        let mut last_message_received = Instant::now();
        let mut tick = time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(line) = event else {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(true);
                    };
                    if let Err(e) = write.send(Message::Text(line.clone().into())).await {
                        self.backlog.push_front(line);
                        return Err(e.into());
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_message_received = Instant::now();
                        if let Err(e) = self.handle_message(text.as_str(), &mut write).await {
                            error!("Failed to handle hub message: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Hub closed connection");
                        return Ok(false);
                    }
                    Some(Ok(_)) => {
                        last_message_received = Instant::now();
                        debug!("Received keepalive ping/pong");
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        info!("Hub stream ended");
                        return Ok(false);
                    }
                },
                _ = tick.tick() => {
                    let idle = last_message_received.elapsed();
                    if idle.as_secs() > CONNECTION_HEALTH_TIMEOUT_SECS {
                        warn!(
                            "Hub health check failed: no message received for {}s, reconnecting",
                            idle.as_secs()
                        );
                        return Ok(false);
                    }
                }
            }
        }
    }

    async fn send_registration(&self, write: &mut WsSink) -> Result<()> {
        let registration = serde_json::json!({
            "type": "register",
            "data": {
                "agentId": format!("rack-assetd-{}", self.agent_name),
                "name": self.agent_name,
                "agent_version": env!("CARGO_PKG_VERSION"),
                "chassis": self.chassis,
            }
        });
        write.send(Message::Text(registration.to_string().into())).await?;
        debug!("Registration sent");
        Ok(())
    }

    async fn flush_backlog(&mut self, write: &mut WsSink) -> Result<()> {
        let dropped = self.backlog.take_dropped();
        if dropped > 0 {
            warn!("Hub backlog full, dropped {} oldest event(s)", dropped);
        }
        if !self.backlog.queue.is_empty() {
            info!("Sending {} queued event(s)", self.backlog.queue.len());
        }

        while let Some(line) = self.backlog.queue.pop_front() {
            if let Err(e) = write.send(Message::Text(line.clone().into())).await {
                self.backlog.push_front(line);
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn handle_message(&self, text: &str, write: &mut WsSink) -> Result<()> {
        trace!("Received hub message: {} bytes", text.len());
        let message: Value = serde_json::from_str(text)?;

        match message.get("type").and_then(|v| v.as_str()) {
            Some("command") => {
                if let Some(data) = message.get("data") {
                    self.handle_command(data, write).await?;
                }
            }
            Some("ping") => {
                let pong = serde_json::json!({
                    "type": "pong",
                    "timestamp": chrono::Utc::now().timestamp_millis()
                });
                write.send(Message::Text(pong.to_string().into())).await?;
            }
            Some("registered") => info!("Agent registered with hub"),
            other => debug!("Ignoring hub message type {:?}", other),
        }
        Ok(())
    }

    async fn handle_command(&self, data: &Value, write: &mut WsSink) -> Result<()> {
        let command_type = data
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Missing or invalid command type"))?;
        let command_id = data
            .get("commandId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Missing command ID"))?;
        let payload = data
            .get("payload")
            .ok_or_else(|| anyhow!("Missing command payload"))?;

        debug!("Processing command: {} with payload: {:?}", command_type, payload);

        let outcome = parse_command(command_type, payload).and_then(|request| {
            self.actions
                .send(request)
                .map(|_| request)
                .map_err(|_| "Scheduler is not accepting actions".to_string())
        });

        let response = match outcome {
            Ok(request) => {
                info!(cm = request.cm, "Queued {:?}", request.action);
                serde_json::json!({
                    "type": "commandResponse",
                    "commandId": command_id,
                    "success": true,
                    "data": payload,
                    "timestamp": chrono::Utc::now().timestamp_millis()
                })
            }
            Err(reason) => {
                warn!("Rejected command {}: {}", command_type, reason);
                serde_json::json!({
                    "type": "commandResponse",
                    "commandId": command_id,
                    "success": false,
                    "error": reason,
                    "data": {},
                    "timestamp": chrono::Utc::now().timestamp_millis()
                })
            }
        };

        write.send(Message::Text(response.to_string().into())).await?;
        Ok(())
    }
}

fn field_u8(payload: &Value, name: &str) -> Result<u8, String> {
    payload
        .get(name)
        .and_then(|v| v.as_u64())
        .and_then(|v| u8::try_from(v).ok())
        .ok_or_else(|| format!("Missing or invalid {}", name))
}

fn optional_u8(payload: &Value, name: &str) -> Result<Option<u8>, String> {
    match payload.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => field_u8(payload, name).map(Some),
    }
}

/// Translate a hub command into an action for one CM. `setRackPuid` is
/// rack-wide, so its `cm` may be left out.
pub fn parse_command(command_type: &str, payload: &Value) -> Result<ActionRequest, String> {
    let cm = match command_type {
        "setRackPuid" => optional_u8(payload, "cm")?.unwrap_or(0),
        _ => field_u8(payload, "cm")?,
    };
    let action = match command_type {
        "setPsuState" => {
            let enabled = payload
                .get("enabled")
                .and_then(|v| v.as_bool())
                .ok_or_else(|| "Missing or invalid enabled".to_string())?;
            Action::SetPsuState {
                slot: field_u8(payload, "slot")?,
                enabled,
            }
        }
        "resetPeripheral" => Action::ResetPeripheral {
            peripheral: field_u8(payload, "peripheral")?,
        },
        "setZonePwm" => Action::SetZonePwm {
            pwm: field_u8(payload, "pwm")?,
        },
        "softResetDrawer" => Action::SoftResetDrawer {
            drawer: field_u8(payload, "drawer")?,
        },
        "uartSwitch" => Action::UartSwitch {
            target: field_u8(payload, "target")?,
            tray: optional_u8(payload, "tray")?,
        },
        "setRackPuid" => Action::SetRackPuid {
            puid: payload
                .get("puid")
                .and_then(|v| v.as_u64())
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| "Missing or invalid puid".to_string())?,
        },
        other => return Err(format!("Unknown command type: {}", other)),
    };
    action.validate()?;
    Ok(ActionRequest { cm, action })
}
