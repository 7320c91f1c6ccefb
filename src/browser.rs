//! Thin adapter over a remote-control protocol to a headful browser instance
//! (one per tuner, identified by a TCP endpoint). The wire shape is a
//! Chrome-DevTools-Protocol-style JSON-RPC framing over WebSocket:
//! `{id, method, params}` requests, `{id, result}` / `{id, error}`
//! responses, and unsolicited `{method, params}` events.

use anyhow::{anyhow, bail, Context, Result};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    DomReady,
    NetworkIdle,
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

struct Pending {
    responses: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
}

/// A connected control endpoint. `Disconnected` is reported once when the
/// transport drops; after that every operation fails until `connect` is
/// called again (reconnection is the Tuner's responsibility, not this
/// client's).
pub struct BrowserControl {
    endpoint: String,
    next_id: AtomicU64,
    connected: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Arc<Pending>,
    disconnect_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    disconnect_tx: mpsc::UnboundedSender<()>,
}

impl BrowserControl {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        Self {
            endpoint: endpoint.into(),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            outbound: Mutex::new(None),
            pending: Arc::new(Pending {
                responses: Mutex::new(HashMap::new()),
            }),
            disconnect_rx: Mutex::new(Some(disconnect_rx)),
            disconnect_tx,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub async fn connect(&self) -> Result<()> {
        let (ws, _) = tokio_tungstenite::connect_async(&self.endpoint)
            .await
            .with_context(|| format!("connecting to control endpoint {}", self.endpoint))?;
        let (mut write, mut read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let pending = self.pending.clone();
        let disconnect_tx = self.disconnect_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Ok(value) = serde_json::from_str::<Value>(&text) {
                            if let Some(id) = value.get("id").and_then(|v| v.as_u64()) {
                                let mut responses = pending.responses.lock().await;
                                if let Some(sender) = responses.remove(&id) {
                                    let result = if let Some(err) = value.get("error") {
                                        Err(anyhow!("control plane error: {}", err))
                                    } else {
                                        Ok(value.get("result").cloned().unwrap_or(Value::Null))
                                    };
                                    let _ = sender.send(result);
                                }
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        warn!("control plane transport error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            let _ = disconnect_tx.send(());
        });

        *self.outbound.lock().await = Some(tx);
        self.connected.store(true, Ordering::Release);
        info!("control plane connected: {}", self.endpoint);
        Ok(())
    }

    /// Resolves once when the transport drops. Call `connect` again to
    /// resume; each call reuses this same channel, so only one waiter should
    /// hold it at a time (the owning Tuner's reconnect loop).
    pub async fn wait_disconnected(&self) {
        let mut guard = self.disconnect_rx.lock().await;
        if let Some(rx) = guard.as_mut() {
            let _ = rx.recv().await;
        }
        self.connected.store(false, Ordering::Release);
    }

    async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        if !self.is_connected() {
            bail!("control plane disconnected");
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.responses.lock().await.insert(id, tx);

        let request = Request { id, method, params };
        let payload = serde_json::to_string(&request)?;

        let outbound = self.outbound.lock().await;
        let Some(sender) = outbound.as_ref() else {
            bail!("control plane disconnected");
        };
        sender
            .send(Message::Text(payload))
            .map_err(|_| anyhow!("control plane send failed"))?;
        drop(outbound);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => bail!("control plane response channel closed"),
            Err(_) => {
                self.pending.responses.lock().await.remove(&id);
                bail!("control plane call timed out: {}", method)
            }
        }
    }

    pub async fn current_url(&self) -> Result<String> {
        let result = self
            .call(
                "Runtime.evaluate",
                serde_json::json!({"expression": "window.location.href", "returnByValue": true}),
                Duration::from_secs(2),
            )
            .await?;
        result
            .get("result")
            .and_then(|r| r.get("value"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("current_url: unexpected response shape"))
    }

    pub async fn navigate(&self, url: &str, wait_mode: WaitMode, timeout: Duration) -> Result<()> {
        self.call(
            "Page.navigate",
            serde_json::json!({"url": url}),
            Duration::from_secs(30),
        )
        .await?;

        let event = match wait_mode {
            WaitMode::DomReady => "Page.domContentEventFired",
            WaitMode::NetworkIdle => "Page.loadEventFired",
        };
        tokio::time::timeout(
            timeout,
            self.call(
                "Target.awaitEvent",
                serde_json::json!({"event": event}),
                timeout,
            ),
        )
        .await
        .map_err(|_| anyhow!("navigate: timed out waiting for {}", event))??;
        Ok(())
    }

    pub async fn evaluate(&self, script: &str, args: Value) -> Result<Value> {
        let result = self
            .call(
                "Runtime.evaluate",
                serde_json::json!({"expression": script, "args": args, "returnByValue": true}),
                Duration::from_secs(8),
            )
            .await?;
        Ok(result.get("result").and_then(|r| r.get("value")).cloned().unwrap_or(Value::Null))
    }

    pub async fn press_key(&self, key: &str) -> Result<()> {
        self.call(
            "Input.dispatchKeyEvent",
            serde_json::json!({"type": "keyDown", "key": key}),
            Duration::from_secs(2),
        )
        .await?;
        Ok(())
    }

    /// Clicks the element located either by a CSS `selector` or a
    /// JS `script_predicate` expression that returns an element handle.
    pub async fn query_and_click(&self, locator: Locator<'_>) -> Result<()> {
        let script = match locator {
            Locator::Selector(selector) => {
                format!(
                    "(() => {{ const el = document.querySelector({:?}); if (el) el.click(); return !!el; }})()",
                    selector
                )
            }
            Locator::Script(predicate) => {
                format!(
                    "(() => {{ const el = ({predicate}); if (el) el.click(); return !!el; }})()",
                )
            }
        };
        let clicked = self.evaluate(&script, Value::Null).await?;
        if clicked.as_bool() != Some(true) {
            bail!("query_and_click: no element matched");
        }
        Ok(())
    }

    /// Ok iff a trivial scripted expression returns within 2s.
    pub async fn health_probe(&self) -> bool {
        tokio::time::timeout(Duration::from_secs(2), self.evaluate("1+1", Value::Null))
            .await
            .map(|r| r.ok().map(|v| v == serde_json::json!(2)).unwrap_or(false))
            .unwrap_or(false)
    }
}

pub enum Locator<'a> {
    Selector(&'a str),
    Script(&'a str),
}
