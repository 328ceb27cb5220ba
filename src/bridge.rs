//! Line-delimited JSON bridge for an external frontend.
//!
//! A webview host (or any other process) drives dbdeck over stdin/stdout:
//! one JSON request per input line, one JSON response or event per output
//! line. All output goes through a single writer task so lines never
//! interleave.

use std::io::BufRead;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{ConfigStore, ServingOverrides};
use crate::error::ServeError;
use crate::events::{envelope, DatabaseEvent, Event};
use crate::output::{ConsoleBuffer, ConsoleLine};
use crate::runner::Supervisor;
use crate::serve::{plan_from_settings, LaunchPlan};

/// A request read from the frontend.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Option<u64>,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    StartDatabase(ServingOverrides),
    StopDatabase,
    IsServing,
    LoadConfig,
    /// `config` may be JSON text or an object.
    SaveConfig {
        config: Value,
    },
    BackupConfig,
    HasConfigBackup,
    RestoreConfigBackup,
    TogglePinned,
    ConsoleHistory,
    Shutdown,
}

impl Request {
    /// Parses one input line. On failure returns the request id, if one could
    /// be read, together with the error text.
    pub fn parse(line: &str) -> Result<Self, (Option<u64>, String)> {
        let value: Value =
            serde_json::from_str(line).map_err(|err| (None, format!("invalid JSON: {err}")))?;
        let id = value.get("id").and_then(Value::as_u64);
        let command = serde_json::from_value(value).map_err(|err| (id, err.to_string()))?;
        Ok(Self { id, command })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: Option<u64>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: Option<u64>, result: impl Into<Value>) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn err(id: Option<u64>, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// A line written to the frontend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outgoing {
    Response(Response),
    Event(Value),
}

/// Whether the bridge loop should keep running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Spawns the task that serializes outgoing lines onto `writer`.
pub fn spawn_writer<W>(mut writer: W) -> (mpsc::Sender<Outgoing>, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Outgoing>(256);
    let handle = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let mut line = match serde_json::to_string(&message) {
                Ok(line) => line,
                Err(err) => {
                    tracing::error!("failed to encode bridge message: {err}");
                    continue;
                }
            };
            line.push('\n');
            if let Err(err) = writer.write_all(line.as_bytes()).await {
                tracing::warn!("bridge output closed: {err}");
                break;
            }
            let _ = writer.flush().await;
        }
    });
    (tx, handle)
}

/// Reads requests until EOF, then asks the app to shut down.
///
/// Blocking; run it on its own thread. Parse errors are answered through `out_tx`; it is weak so the writer can
/// finish while this thread is still blocked on input.
pub fn pump_requests<R: BufRead>(
    reader: R,
    event_tx: mpsc::Sender<Event>,
    out_tx: mpsc::WeakSender<Outgoing>,
) {
    for line in reader.lines() {
        let Ok(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        match Request::parse(&line) {
            Ok(request) => {
                if event_tx.blocking_send(Event::Request(request)).is_err() {
                    return;
                }
            }
            Err((id, error)) => {
                tracing::warn!("rejected bridge request: {error}");
                if let Some(out_tx) = out_tx.upgrade() {
                    let _ = out_tx.blocking_send(Outgoing::Response(Response::err(id, error)));
                }
            }
        }
    }
    tracing::info!("bridge input closed");
    let _ = event_tx.blocking_send(Event::Shutdown { signal: None });
}

/// Executes bridge commands against the config store and supervisor.
pub struct Bridge {
    store: ConfigStore,
    supervisor: Supervisor,
    out_tx: mpsc::Sender<Outgoing>,
    overrides: ServingOverrides,
    console: ConsoleBuffer,
}

impl Bridge {
    /// `overrides` come from the command line and apply to every start.
    pub fn new(
        store: ConfigStore,
        supervisor: Supervisor,
        out_tx: mpsc::Sender<Outgoing>,
        overrides: ServingOverrides,
    ) -> Self {
        let history_size = store.load().serving.history_size;
        Self {
            store,
            supervisor,
            out_tx,
            overrides,
            console: ConsoleBuffer::new(history_size),
        }
    }

    /// Forwards a database event to the frontend and records console output.
    pub async fn on_database_event(&mut self, event: DatabaseEvent) {
        if let DatabaseEvent::Output { line, stream } = &event {
            self.console.push(ConsoleLine::new(line.clone(), *stream));
        }
        self.send(Outgoing::Event(event.envelope())).await;
    }

    pub async fn handle(&mut self, request: Request) -> Flow {
        let id = request.id;
        tracing::debug!(?id, "bridge request");
        let response = match request.command {
            Command::StartDatabase(overrides) => {
                self.start_database(id, overrides).await;
                return Flow::Continue;
            }
            Command::StopDatabase => {
                let supervisor = self.supervisor.clone();
                let out_tx = self.out_tx.clone();
                tokio::spawn(async move {
                    let stopped = supervisor.stop().await;
                    let _ = out_tx
                        .send(Outgoing::Response(Response::ok(id, stopped)))
                        .await;
                });
                return Flow::Continue;
            }
            Command::IsServing => Response::ok(id, self.supervisor.is_running().await),
            Command::LoadConfig => match self.store.load_raw() {
                Ok(raw) => Response::ok(id, raw),
                Err(err) => Response::err(id, format!("{err:#}")),
            },
            Command::SaveConfig { config } => {
                let raw = match config {
                    Value::String(raw) => raw,
                    other => other.to_string(),
                };
                match self.store.save_raw(&raw) {
                    Ok(()) => Response::ok(id, Value::Null),
                    Err(err) => Response::err(id, format!("{err:#}")),
                }
            }
            Command::BackupConfig => match self.store.backup() {
                Ok(()) => Response::ok(id, Value::Null),
                Err(err) => Response::err(id, format!("{err:#}")),
            },
            Command::HasConfigBackup => Response::ok(id, self.store.has_backup()),
            Command::RestoreConfigBackup => match self
                .store
                .restore_backup()
                .and_then(|_| self.store.load_raw())
            {
                Ok(raw) => Response::ok(id, raw),
                Err(err) => Response::err(id, format!("{err:#}")),
            },
            Command::TogglePinned => match self.store.toggle_pinned() {
                Ok(pinned) => {
                    tracing::info!(pinned, "window pin toggled");
                    self.send(Outgoing::Event(envelope("window:pinned", Value::Bool(pinned))))
                        .await;
                    Response::ok(id, pinned)
                }
                Err(err) => Response::err(id, format!("{err:#}")),
            },
            Command::ConsoleHistory => {
                let lines: Vec<Value> = self
                    .console
                    .iter()
                    .map(|line| Value::from(line.text.as_str()))
                    .collect();
                Response::ok(id, lines)
            }
            Command::Shutdown => {
                self.send(Outgoing::Response(Response::ok(id, Value::Null)))
                    .await;
                return Flow::Exit;
            }
        };
        self.send(Outgoing::Response(response)).await;
        Flow::Continue
    }

    /// Builds the launch plan from stored settings plus both override layers.
    pub fn plan_for(&self, request: &ServingOverrides) -> Result<LaunchPlan, ServeError> {
        let mut settings = self.store.load().serving;
        self.overrides.apply(&mut settings);
        request.apply(&mut settings);
        plan_from_settings(&settings)
    }

    async fn start_database(&mut self, id: Option<u64>, overrides: ServingOverrides) {
        let plan = match self.plan_for(&overrides) {
            Ok(plan) => plan,
            Err(err) => {
                tracing::warn!("refusing to start database: {err}");
                self.send(Outgoing::Event(
                    DatabaseEvent::Error {
                        message: err.to_string(),
                    }
                    .envelope(),
                ))
                .await;
                self.send(Outgoing::Response(Response::err(
                    id,
                    format!("Failed to start database: {err}"),
                )))
                .await;
                return;
            }
        };
        let supervisor = self.supervisor.clone();
        let out_tx = self.out_tx.clone();
        tokio::spawn(async move {
            let response = match supervisor.start(plan).await {
                Ok(_) => Response::ok(id, Value::Null),
                Err(err) => Response::err(id, format!("Failed to start database: {err}")),
            };
            let _ = out_tx.send(Outgoing::Response(response)).await;
        });
    }

    async fn send(&self, message: Outgoing) {
        let _ = self.out_tx.send(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::LineSource;
    use crate::runner::ShutdownConfig;
    use serde_json::json;

    struct Harness {
        bridge: Bridge,
        out_rx: mpsc::Receiver<Outgoing>,
        _events: mpsc::Receiver<Event>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        let (event_tx, events) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(64);
        let supervisor = Supervisor::new(event_tx, ShutdownConfig::default());
        Harness {
            bridge: Bridge::new(store, supervisor, out_tx, ServingOverrides::default()),
            out_rx,
            _events: events,
            _dir: dir,
        }
    }

    async fn call(h: &mut Harness, line: &str) -> Response {
        let request = Request::parse(line).unwrap();
        assert_eq!(h.bridge.handle(request).await, Flow::Continue);
        next_response(h).await
    }

    async fn next_response(h: &mut Harness) -> Response {
        loop {
            let message = tokio::time::timeout(std::time::Duration::from_secs(5), h.out_rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let Outgoing::Response(response) = message {
                return response;
            }
        }
    }

    #[test]
    fn parses_commands_with_fields() {
        let request =
            Request::parse(r#"{"id":3,"command":"start_database","port":9000,"driver":"file"}"#)
                .unwrap();
        assert_eq!(request.id, Some(3));
        let Command::StartDatabase(overrides) = request.command else {
            panic!("expected start_database");
        };
        assert_eq!(overrides.port, Some(9000));
        assert_eq!(overrides.driver.as_deref(), Some("file"));

        let bare = Request::parse(r#"{"command":"is_serving"}"#).unwrap();
        assert_eq!(bare.id, None);
        assert_eq!(bare.command, Command::IsServing);
    }

    #[test]
    fn parse_errors_keep_id_when_possible() {
        assert!(matches!(Request::parse("not json"), Err((None, _))));
        assert!(matches!(
            Request::parse(r#"{"id":9,"command":"fly"}"#),
            Err((Some(9), _))
        ));
    }

    #[test]
    fn responses_serialize_compactly() {
        let ok = serde_json::to_value(Outgoing::Response(Response::ok(Some(1), true))).unwrap();
        assert_eq!(ok, json!({"id": 1, "ok": true, "result": true}));
        let err = serde_json::to_value(Outgoing::Response(Response::err(None, "bad"))).unwrap();
        assert_eq!(err, json!({"id": null, "ok": false, "error": "bad"}));
    }

    #[test]
    fn pump_forwards_requests_and_signals_eof() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let input = "{\"id\":1,\"command\":\"is_serving\"}\n\ngarbage\n";
        pump_requests(std::io::Cursor::new(input), event_tx, out_tx.downgrade());

        assert!(matches!(
            event_rx.try_recv(),
            Ok(Event::Request(Request { id: Some(1), command: Command::IsServing }))
        ));
        assert!(matches!(
            event_rx.try_recv(),
            Ok(Event::Shutdown { signal: None })
        ));
        assert!(matches!(
            out_rx.try_recv(),
            Ok(Outgoing::Response(Response { ok: false, id: None, .. }))
        ));
    }

    #[tokio::test]
    async fn config_commands_round_trip_through_store() {
        let mut h = harness();
        let loaded = call(&mut h, r#"{"id":1,"command":"load_config"}"#).await;
        let raw = loaded.result.unwrap();
        let parsed: Value = serde_json::from_str(raw.as_str().unwrap()).unwrap();
        assert_eq!(parsed["serving"]["port"], 8000);

        let saved = call(
            &mut h,
            r#"{"id":2,"command":"save_config","config":{"serving":{"port":8100}}}"#,
        )
        .await;
        assert!(saved.ok);
        assert_eq!(call(&mut h, r#"{"id":3,"command":"has_config_backup"}"#).await.result, Some(json!(false)));
        assert!(call(&mut h, r#"{"id":4,"command":"backup_config"}"#).await.ok);

        let saved = call(
            &mut h,
            r#"{"id":5,"command":"save_config","config":"{\"serving\":{\"port\":8200}}"}"#,
        )
        .await;
        assert!(saved.ok);
        let restored = call(&mut h, r#"{"id":6,"command":"restore_config_backup"}"#).await;
        let parsed: Value = serde_json::from_str(restored.result.unwrap().as_str().unwrap()).unwrap();
        assert_eq!(parsed["serving"]["port"], 8100);
    }

    #[tokio::test]
    async fn save_config_rejects_arrays() {
        let mut h = harness();
        let response = call(&mut h, r#"{"id":1,"command":"save_config","config":[1]}"#).await;
        assert!(!response.ok);
        assert_eq!(response.id, Some(1));
    }

    #[tokio::test]
    async fn toggle_pinned_emits_window_event() {
        let mut h = harness();
        let request = Request::parse(r#"{"id":1,"command":"toggle_pinned"}"#).unwrap();
        h.bridge.handle(request).await;
        assert_eq!(
            h.out_rx.recv().await,
            Some(Outgoing::Event(json!({"event": "window:pinned", "payload": true})))
        );
        assert_eq!(
            h.out_rx.recv().await,
            Some(Outgoing::Response(Response::ok(Some(1), true)))
        );
    }

    #[tokio::test]
    async fn stop_and_is_serving_when_idle() {
        let mut h = harness();
        assert_eq!(call(&mut h, r#"{"id":1,"command":"is_serving"}"#).await.result, Some(json!(false)));
        assert_eq!(call(&mut h, r#"{"id":2,"command":"stop_database"}"#).await.result, Some(json!(false)));
    }

    #[tokio::test]
    async fn invalid_driver_emits_error_and_fails_request() {
        let mut h = harness();
        let request =
            Request::parse(r#"{"id":7,"command":"start_database","driver":"leveldb"}"#).unwrap();
        h.bridge.handle(request).await;
        assert_eq!(
            h.out_rx.recv().await,
            Some(Outgoing::Event(json!({
                "event": "database:error",
                "payload": "Invalid database driver: leveldb"
            })))
        );
        let response = next_response(&mut h).await;
        assert_eq!(response.id, Some(7));
        assert!(!response.ok);
    }

    #[tokio::test]
    async fn console_history_collects_output() {
        let mut h = harness();
        h.bridge
            .on_database_event(DatabaseEvent::Output {
                line: "Started web server".into(),
                stream: LineSource::Stderr,
            })
            .await;
        let forwarded = h.out_rx.recv().await;
        assert_eq!(
            forwarded,
            Some(Outgoing::Event(json!({"event": "database:output", "payload": "Started web server"})))
        );
        let history = call(&mut h, r#"{"id":1,"command":"console_history"}"#).await;
        assert_eq!(history.result, Some(json!(["Started web server"])));
    }

    #[tokio::test]
    async fn shutdown_answers_then_exits() {
        let mut h = harness();
        let request = Request::parse(r#"{"id":4,"command":"shutdown"}"#).unwrap();
        assert_eq!(h.bridge.handle(request).await, Flow::Exit);
        assert_eq!(next_response(&mut h).await, Response::ok(Some(4), Value::Null));
    }

    #[test]
    fn plan_applies_cli_then_request_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        let (event_tx, _events) = mpsc::channel(4);
        let (out_tx, _out) = mpsc::channel(4);
        let cli = ServingOverrides {
            port: Some(9100),
            executable: Some("/opt/surreal".into()),
            ..ServingOverrides::default()
        };
        let bridge = Bridge::new(
            store,
            Supervisor::new(event_tx, ShutdownConfig::default()),
            out_tx,
            cli,
        );
        let request = ServingOverrides {
            username: Some("admin".into()),
            ..ServingOverrides::default()
        };
        let plan = bridge.plan_for(&request).unwrap();
        let command = plan.args.last().unwrap();
        assert!(command.contains("0.0.0.0:9100"));
        assert!(command.contains("--user admin"));
        assert!(command.contains("/opt/surreal"));
    }
}
