//! Agent side: connect to the broker, execute its commands, reply.
//!
//! A session is one WebSocket connection. Within a session the agent reads a
//! command, runs it as a bounded HTTP call and writes back exactly one
//! result, whether or not the call succeeded. Any connection failure ends the
//! session; [`AgentRuntime::run`] starts a new one on a later timer tick.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::{Method, Url};
use tokio::{
    task::{JoinError, JoinHandle},
    time::MissedTickBehavior,
};
use tokio_tungstenite::tungstenite::Message;

use crate::{
    duration::format_duration,
    error::ExecError,
    identity::AgentIdentity,
    protocol::{CommandDefinition, DispatchEnvelope, EndpointData, ResultEnvelope},
};

const SUBSCRIBE_PATH: &str = "/subscribe";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReconnectState {
    #[default]
    Idle,
    Connecting,
    Connected,
}

/// Shared session state. Only one session may be connecting or connected at
/// a time; the reconnect timer can start a new one only from `Idle`.
#[derive(Debug, Clone, Default)]
pub struct ReconnectMachine {
    state: Arc<Mutex<ReconnectState>>,
}

impl ReconnectMachine {
    pub fn current(&self) -> ReconnectState {
        *self.state.lock()
    }

    /// `Idle -> Connecting`. Returns false, leaving the state untouched,
    /// when a session is already in progress.
    pub fn try_begin(&self) -> bool {
        let mut state = self.state.lock();
        if *state != ReconnectState::Idle {
            return false;
        }
        *state = ReconnectState::Connecting;
        true
    }

    pub fn mark_connected(&self) {
        let mut state = self.state.lock();
        if *state == ReconnectState::Connecting {
            *state = ReconnectState::Connected;
        }
    }

    pub fn finish(&self) {
        *self.state.lock() = ReconnectState::Idle;
    }
}

/// Returns the machine to `Idle` when dropped, so a session task that panics
/// or is aborted cannot leave the reconnect timer locked out.
struct SessionGuard(ReconnectMachine);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// The running session task, if any. Dropping it aborts the session.
#[derive(Default)]
struct SessionTask {
    handle: Option<JoinHandle<Result<()>>>,
}

impl SessionTask {
    fn start(&mut self, handle: JoinHandle<Result<()>>) {
        if let Some(previous) = self.handle.replace(handle) {
            previous.abort();
        }
    }

    /// Waits for the running session. Resolves to `None` straight away when
    /// there is none.
    async fn join(&mut self) -> Option<Result<Result<()>, JoinError>> {
        let handle = self.handle.as_mut()?;
        let joined = handle.await;
        self.handle = None;
        Some(joined)
    }
}

impl Drop for SessionTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentRuntime {
    identity: AgentIdentity,
    subscribe_url: Url,
    interval: Duration,
    http: reqwest::Client,
}

impl AgentRuntime {
    pub fn new(identity: AgentIdentity, dispatcher_host: &str, interval: Duration) -> Result<Self> {
        let hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok());
        let subscribe_url = build_subscribe_url(dispatcher_host, &identity, hostname.as_deref())?;
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;

        tracing::info!(
            target = "agent_dispatch::agent",
            agent_id = %identity,
            hostname = hostname.as_deref().unwrap_or("unknown"),
            broker = %subscribe_url,
            "agent configured"
        );

        Ok(Self {
            identity,
            subscribe_url,
            interval,
            http,
        })
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn subscribe_url(&self) -> &Url {
        &self.subscribe_url
    }

    /// Runs sessions forever. The first session starts immediately; after a
    /// session ends, the next timer tick starts another.
    pub async fn run(&self) {
        self.run_with(ReconnectMachine::default()).await
    }

    pub async fn run_with(&self, machine: ReconnectMachine) {
        let mut session = SessionTask::default();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !machine.try_begin() {
                        tracing::debug!(
                            target = "agent_dispatch::agent",
                            state = ?machine.current(),
                            "session active, skipping reconnect"
                        );
                        continue;
                    }
                    tracing::info!(target = "agent_dispatch::agent", "starting session");
                    let runtime = self.clone();
                    let guard = SessionGuard(machine.clone());
                    session.start(tokio::spawn(async move {
                        runtime.serve_session(&guard.0).await
                    }));
                }
                Some(joined) = session.join() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        tracing::warn!(
                            target = "agent_dispatch::agent",
                            error = %format!("{error:#}"),
                            retry_in_ms = self.interval.as_millis() as u64,
                            "session ended"
                        );
                    }
                    Err(error) => {
                        tracing::error!(
                            target = "agent_dispatch::agent",
                            error = %error,
                            retry_in_ms = self.interval.as_millis() as u64,
                            "session task failed"
                        );
                    }
                },
            }
        }
    }

    /// One connection to the broker. Returns when the connection fails.
    pub async fn serve_session(&self, machine: &ReconnectMachine) -> Result<()> {
        let (ws, _) = tokio_tungstenite::connect_async(self.subscribe_url.as_str())
            .await
            .with_context(|| format!("failed to connect to {}", self.subscribe_url))?;
        machine.mark_connected();
        tracing::info!(target = "agent_dispatch::agent", "subscribed");

        let (mut write, mut read) = ws.split();
        let mut handled = 0u64;
        while let Some(frame) = read.next().await {
            let text = match frame.context("failed to read command")? {
                Message::Text(text) => text,
                Message::Close(_) => bail!("broker closed the connection"),
                _ => continue,
            };
            let envelope: DispatchEnvelope =
                serde_json::from_str(&text).context("failed to decode command")?;

            handled += 1;
            tracing::info!(
                target = "agent_dispatch::agent",
                request_id = %envelope.request_id,
                count = handled,
                "got command"
            );

            let result = execute_command(&self.http, self.identity.as_str(), &envelope).await;
            let frame = serde_json::to_string(&result).context("failed to encode result")?;
            write
                .send(Message::Text(frame))
                .await
                .context("failed to send result")?;
            tracing::debug!(
                target = "agent_dispatch::agent",
                request_id = %result.request_id,
                status_code = result.status_code,
                "sent result"
            );
        }
        bail!("broker connection ended")
    }
}

/// Executes one command. Always produces exactly one result; failures are
/// reported in its `err` field.
pub async fn execute_command(
    http: &reqwest::Client,
    bot_id: &str,
    envelope: &DispatchEnvelope,
) -> ResultEnvelope {
    let mut result = ResultEnvelope::for_request(bot_id, envelope);
    match perform(http, &envelope.definition, &mut result).await {
        Ok(data) => result.endpoint_data = Some(data),
        Err(error) => {
            tracing::warn!(
                target = "agent_dispatch::agent",
                request_id = %envelope.request_id,
                error = %error,
                "command failed"
            );
            result = result.failed(error);
        }
    }
    result
}

async fn perform(
    http: &reqwest::Client,
    definition: &CommandDefinition,
    result: &mut ResultEnvelope,
) -> Result<EndpointData, ExecError> {
    let timeout = definition.timeout_duration()?;
    let method = Method::from_bytes(definition.method().as_bytes())
        .map_err(|_| ExecError::InvalidMethod(definition.http_method.clone()))?;
    let url = Url::parse(&definition.endpoint)?;

    let mut request = http.request(method, url).timeout(timeout);
    for (name, value) in &definition.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if !definition.body.is_empty() {
        request = request.body(definition.body.clone());
    }

    let started = Instant::now();
    let response = request.send().await.map_err(|error| {
        if error.is_builder() {
            ExecError::Build(error)
        } else {
            ExecError::Transport(error)
        }
    })?;
    result.request_time = format_duration(started.elapsed());
    result.status_code = response.status().as_u16();

    let body = response.bytes().await.map_err(ExecError::BodyRead)?;
    Ok(EndpointData::decode(&body)?)
}

/// Normalizes a broker address into the agent's subscribe URL.
pub fn build_subscribe_url(
    dispatcher_host: &str,
    identity: &AgentIdentity,
    hostname: Option<&str>,
) -> Result<Url> {
    let raw = dispatcher_host.trim();
    let normalized = if raw.starts_with("wss://") || raw.starts_with("ws://") {
        raw.to_string()
    } else if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("wss://{raw}")
    };

    let mut url = Url::parse(&normalized)
        .with_context(|| format!("invalid dispatcher address {dispatcher_host:?}"))?;
    let path = url.path().trim_end_matches('/').to_string();
    if !path.ends_with(SUBSCRIBE_PATH) {
        url.set_path(&format!("{path}{SUBSCRIBE_PATH}"));
    }

    let preserved: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "agent_id" && key != "host")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (key, value) in preserved {
            pairs.append_pair(&key, &value);
        }
        pairs.append_pair("agent_id", identity.as_str());
        if let Some(host) = hostname {
            pairs.append_pair("host", host);
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;

    use super::{
        build_subscribe_url, execute_command, ReconnectMachine, ReconnectState, SessionGuard,
    };
    use crate::{
        identity::AgentIdentity,
        protocol::{CommandDefinition, DispatchEnvelope},
    };

    fn envelope(definition: CommandDefinition) -> DispatchEnvelope {
        DispatchEnvelope {
            request_id: "req-42".into(),
            definition,
        }
    }

    #[tokio::test]
    async fn successful_call_reports_status_payload_and_time() {
        let server = MockServer::start();
        let target = server.mock(|when, then| {
            when.method(GET).path("/ok").header("accept", "application/json");
            then.status(200)
                .header("content-type", "application/json")
                .delay(Duration::from_millis(50))
                .body(r#"{"word":"tinnitus","score":51691,"tags":["syn","n"]}"#);
        });

        let env = envelope(
            CommandDefinition::get(server.url("/ok"), "3s").with_header("Accept", "application/json"),
        );
        let result = execute_command(&reqwest::Client::new(), "bot-1", &env).await;

        target.assert_hits(1);
        assert!(result.is_success(), "unexpected err: {}", result.err);
        assert_eq!(result.status_code, 200);
        assert_eq!(result.bot_id, "bot-1");
        assert_eq!(result.request_id, "req-42");
        assert_eq!(result.definition, env.definition);
        let data = result.endpoint_data.as_ref().unwrap();
        assert_eq!(data.word, "tinnitus");
        assert_eq!(data.score, 51691);
        assert!(result.elapsed().unwrap() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn malformed_timeout_skips_the_http_call() {
        let server = MockServer::start();
        let target = server.mock(|when, then| {
            when.path("/ok");
            then.status(200).body("{}");
        });

        let env = envelope(CommandDefinition::get(server.url("/ok"), "abc"));
        let result = execute_command(&reqwest::Client::new(), "bot-1", &env).await;

        target.assert_hits(0);
        assert!(result.err.contains("failed to parse timeout"), "{}", result.err);
        assert!(result.endpoint_data.is_none());
        assert_eq!(result.request_id, "req-42");
    }

    #[tokio::test]
    async fn undecodable_body_is_reported_with_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/html");
            then.status(200).body("<html>nope</html>");
        });

        let env = envelope(CommandDefinition::get(server.url("/html"), "2s"));
        let result = execute_command(&reqwest::Client::new(), "bot-1", &env).await;

        assert!(result.err.contains("failed to decode"), "{}", result.err);
        assert_eq!(result.status_code, 200);
        assert!(result.endpoint_data.is_none());
    }

    #[tokio::test]
    async fn slow_target_hits_the_command_timeout() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/slow");
            then.status(200)
                .delay(Duration::from_millis(500))
                .body(r#"{"word":"late"}"#);
        });

        let env = envelope(CommandDefinition::get(server.url("/slow"), "50ms"));
        let result = execute_command(&reqwest::Client::new(), "bot-1", &env).await;

        assert!(result.err.contains("failed to do request"), "{}", result.err);
        assert_eq!(result.status_code, 0);
    }

    #[tokio::test]
    async fn invalid_endpoint_and_method_fail_before_sending() {
        let client = reqwest::Client::new();

        let bad_url = envelope(CommandDefinition::get("not a url", "1s"));
        let result = execute_command(&client, "bot", &bad_url).await;
        assert!(result.err.starts_with("failed to create request"), "{}", result.err);

        let mut def = CommandDefinition::get("http://127.0.0.1:9/", "1s");
        def.http_method = "BAD METHOD".into();
        let result = execute_command(&client, "bot", &envelope(def)).await;
        assert!(result.err.starts_with("failed to create request"), "{}", result.err);
    }

    #[tokio::test]
    async fn method_headers_and_body_are_forwarded() {
        let server = MockServer::start();
        let target = server.mock(|when, then| {
            when.method(POST)
                .path("/submit")
                .header("x-trace", "abc")
                .body("payload");
            then.status(201).body(r#"[{"word":"first"},{"word":"second"}]"#);
        });

        let mut def = CommandDefinition::get(server.url("/submit"), "2s").with_header("X-Trace", "abc");
        def.http_method = "POST".into();
        def.body = b"payload".to_vec();
        let result = execute_command(&reqwest::Client::new(), "bot", &envelope(def)).await;

        target.assert_hits(1);
        assert_eq!(result.status_code, 201);
        assert_eq!(result.endpoint_data.unwrap().word, "first");
    }

    #[test]
    fn reconnect_machine_only_starts_from_idle() {
        let machine = ReconnectMachine::default();
        assert_eq!(machine.current(), ReconnectState::Idle);

        assert!(machine.try_begin());
        assert_eq!(machine.current(), ReconnectState::Connecting);
        assert!(!machine.try_begin());

        machine.mark_connected();
        assert_eq!(machine.current(), ReconnectState::Connected);
        assert!(!machine.try_begin());

        machine.finish();
        assert_eq!(machine.current(), ReconnectState::Idle);
        assert!(machine.try_begin());
    }

    #[tokio::test]
    async fn panicking_session_returns_machine_to_idle() {
        let machine = ReconnectMachine::default();
        assert!(machine.try_begin());
        machine.mark_connected();

        let guard = SessionGuard(machine.clone());
        let task = tokio::spawn(async move {
            let _guard = guard;
            let timeout: u64 = "not a number".parse().unwrap_or_else(|_| panic!("session blew up"));
            timeout
        });

        assert!(task.await.unwrap_err().is_panic());
        assert_eq!(machine.current(), ReconnectState::Idle);
        assert!(machine.try_begin());
    }

    #[test]
    fn mark_connected_requires_connecting() {
        let machine = ReconnectMachine::default();
        machine.mark_connected();
        assert_eq!(machine.current(), ReconnectState::Idle);
    }

    #[test]
    fn subscribe_url_normalizes_schemes() {
        let id = AgentIdentity::generate();

        let url = build_subscribe_url("localhost:8080", &id, None).unwrap();
        assert_eq!(
            url.as_str(),
            format!("wss://localhost:8080/subscribe?agent_id={id}")
        );

        let url = build_subscribe_url("http://10.0.0.5:9000/", &id, Some("box")).unwrap();
        assert_eq!(
            url.as_str(),
            format!("ws://10.0.0.5:9000/subscribe?agent_id={id}&host=box")
        );

        let url = build_subscribe_url("https://gw.example/api?region=eu", &id, None).unwrap();
        assert_eq!(
            url.as_str(),
            format!("wss://gw.example/api/subscribe?region=eu&agent_id={id}")
        );

        let url = build_subscribe_url("ws://b:1/subscribe?agent_id=stale", &id, None).unwrap();
        assert_eq!(url.as_str(), format!("ws://b:1/subscribe?agent_id={id}"));
    }
}
