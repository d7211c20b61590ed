//! Environment client
//!
//! An [`Environment`] ties one connection, one request dispatcher, one
//! notification router and the configured backend adapter together, and
//! exposes the environment operations a management console needs.
//!
//! ```no_run
//! use std::sync::Arc;
//! use juju_env::env::{Environment, EnvironmentConfig, Dialect, WebSocketConnector};
//!
//! # async fn run() -> juju_env::env::Result<()> {
//! let config = EnvironmentConfig::new("wss://localhost:17070/", Dialect::Go)
//!     .with_credentials("user-admin", "secret");
//! let env = Environment::new(config, Arc::new(WebSocketConnector::new()))?;
//! env.connect().await?;
//! env.login().await?;
//! let status = env.status().await?;
//! println!("{status}");
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub mod adapter;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod notifications;
pub mod transport;

pub use adapter::{BackendAdapter, Dialect, Endpoint, Operation, Relation, RelationEndpoint};
pub use config::{Credentials, EnvironmentConfig, load_config, write_config};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use dispatcher::{PendingRequest, RequestDispatcher, ResponseCallback};
pub use envelope::{Envelope, EnvelopeCodec, RequestId};
pub use error::{
    BackendError, BackendErrorKind, ConfigError, EnvError, ProtocolError, Result, TransportError,
};
pub use notifications::{
    DELTA_KIND, LOGIN_KIND, Notification, NotificationRouter, PERMISSION_DENIED_KIND, READY_KIND,
    SubscriptionToken,
};
pub use transport::{Connector, MemoryBackend, MemoryConnector, WebSocketConnector};

/// Facts the backend announces about itself
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    /// Cloud provider, e.g. `ec2` or `local`
    pub provider_type: Option<String>,
    /// Series used when a charm URL names none
    pub default_series: Option<String>,
}

/// Client for one backend environment
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvInner>,
}

struct EnvInner {
    config: EnvironmentConfig,
    adapter: BackendAdapter,
    connection: ConnectionManager,
    router: NotificationRouter,
    dispatcher: RequestDispatcher,
    session: Mutex<Session>,
}

type LoginWaiter = oneshot::Sender<Result<()>>;

#[derive(Default)]
struct Session {
    credentials: Option<Credentials>,
    authenticated: bool,
    /// `Some` while a login request is in flight
    login_waiters: Option<Vec<LoginWaiter>>,
    info: Option<EnvironmentInfo>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        for task in self.session.get_mut().tasks.drain(..) {
            task.abort();
        }
    }
}

/// Hands the outcome of an in-flight login to callers that joined it, or
/// `Cancelled` if the login future is dropped first.
struct LoginInFlight<'a> {
    session: &'a Mutex<Session>,
    outcome: Option<Result<()>>,
}

impl Drop for LoginInFlight<'_> {
    fn drop(&mut self) {
        let waiters = self.session.lock().login_waiters.take().unwrap_or_default();
        let outcome = self.outcome.take().unwrap_or(Err(EnvError::Cancelled));
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

enum LoginStep {
    AlreadyAuthenticated,
    Join(oneshot::Receiver<Result<()>>),
    Send(Option<Credentials>),
}

impl Environment {
    /// Build an environment for `config`, opening channels with `connector`.
    ///
    /// Nothing is connected until [`connect`](Environment::connect).
    pub fn new(config: EnvironmentConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;

        let adapter = BackendAdapter::for_dialect(config.dialect);
        let connection = ConnectionManager::new(connector, adapter.codec());
        let router = NotificationRouter::new();
        let dispatcher = RequestDispatcher::new(connection.clone(), router.clone());

        let inner = Arc::new(EnvInner {
            session: Mutex::new(Session {
                credentials: config.credentials.clone(),
                ..Session::default()
            }),
            config,
            adapter,
            connection,
            router,
            dispatcher,
        });

        let weak = Arc::downgrade(&inner);
        inner.router.subscribe(READY_KIND, move |notification| {
            if let Some(inner) = weak.upgrade() {
                let field = |key: &str| {
                    notification
                        .payload
                        .get(key)
                        .and_then(Value::as_str)
                        .map(String::from)
                };
                let info = EnvironmentInfo {
                    provider_type: field("provider_type"),
                    default_series: field("default_series"),
                };
                tracing::info!(
                    "backend ready (provider {:?}, series {:?})",
                    info.provider_type,
                    info.default_series
                );
                inner.session.lock().info = Some(info);
            }
        });

        let weak = Arc::downgrade(&inner);
        inner.connection.on_state(move |event| {
            if let (ConnectionEvent::Closed { .. }, Some(inner)) = (event, weak.upgrade()) {
                inner.session.lock().authenticated = false;
            }
        });

        Ok(Self { inner })
    }

    /// Open the connection and wait until it is usable.
    pub async fn connect(&self) -> Result<()> {
        let connection = &self.inner.connection;
        connection.connect(&self.inner.config.socket_url)?;

        match connection.wait_for_settled().await {
            ConnectionState::Connected => {}
            _ => {
                let reason = connection
                    .close_reason()
                    .unwrap_or_else(|| "connection failed".to_string());
                return Err(EnvError::connection_lost(reason));
            }
        }

        if let Some(interval) = self.inner.config.ping_interval() {
            if self.inner.adapter.supports(&Operation::Ping) {
                let handle = tokio::spawn(keep_alive(Arc::downgrade(&self.inner), interval));
                self.inner.session.lock().tasks.push(handle);
            }
        }
        Ok(())
    }

    /// Close the connection and stop background tasks. Idempotent.
    ///
    /// Outstanding requests fail with [`EnvError::ConnectionLost`].
    pub fn close(&self) {
        let tasks = {
            let mut session = self.inner.session.lock();
            session.authenticated = false;
            std::mem::take(&mut session.tasks)
        };
        for task in tasks {
            task.abort();
        }
        self.inner.connection.close();
    }

    /// Whether requests can be sent.
    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Subscribe to notifications of `kind`.
    pub fn on<F>(&self, kind: impl Into<String>, handler: F) -> SubscriptionToken
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.inner.router.subscribe(kind, handler)
    }

    /// Drop a subscription made with [`on`](Environment::on).
    pub fn off(&self, token: SubscriptionToken) -> bool {
        self.inner.router.unsubscribe(token)
    }

    /// The configuration this environment was built with.
    pub fn config(&self) -> &EnvironmentConfig {
        &self.inner.config
    }

    /// Dialect of the backend.
    pub fn dialect(&self) -> Dialect {
        self.inner.adapter.dialect()
    }

    /// What the backend announced in its greeting, if anything.
    pub fn info(&self) -> Option<EnvironmentInfo> {
        self.inner.session.lock().info.clone()
    }

    /// Whether the last login on this connection succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.inner.session.lock().authenticated
    }

    /// Replace the stored login credentials.
    pub fn set_credentials(&self, user: impl Into<String>, password: impl Into<String>) {
        let mut session = self.inner.session.lock();
        session.credentials = Some(Credentials {
            user: user.into(),
            password: password.into(),
        });
    }

    /// Currently stored credentials.
    pub fn credentials(&self) -> Option<Credentials> {
        self.inner.session.lock().credentials.clone()
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.dispatcher.pending_count()
    }

    /// Send `operation` and wait for its normalized result.
    pub async fn call(&self, operation: Operation) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.submit(operation, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.map_err(|_| EnvError::Cancelled)?
    }

    /// Send `operation`; `callback` receives the normalized result exactly once.
    ///
    /// Operations refused locally (read-only mode, unsupported by the
    /// dialect) return the error and also hand it to the callback.
    pub fn submit<F>(&self, operation: Operation, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let encoded = self
            .check_writable(&operation)
            .and_then(|()| self.inner.adapter.encode(&operation));
        let payload = match encoded {
            Ok(payload) => payload,
            Err(err) => {
                callback(Err(err.clone()));
                return Err(err);
            }
        };

        let adapter = self.inner.adapter.clone();
        let decode = move |result: Result<Value>| {
            callback(result.and_then(|reply| adapter.decode(&operation, reply)));
        };

        let dispatcher = &self.inner.dispatcher;
        let request_id = match self.inner.config.request_timeout() {
            Some(timeout) => dispatcher.request_with_timeout(payload, timeout, decode),
            None => dispatcher.request(payload, decode),
        };
        Ok(request_id)
    }

    /// Cancel an outstanding request; its callback receives [`EnvError::Cancelled`].
    pub fn cancel(&self, request_id: RequestId) -> bool {
        self.inner.dispatcher.cancel(request_id)
    }

    fn check_writable(&self, operation: &Operation) -> Result<()> {
        if !self.inner.config.read_only || !operation.is_write() {
            return Ok(());
        }
        let name = operation.name();
        if self.inner.config.is_silent_failure(name) {
            tracing::debug!("read-only: quietly refusing {}", name);
        } else {
            tracing::warn!("read-only: refusing {}", name);
            self.inner.router.publish(
                PERMISSION_DENIED_KIND,
                json!({"op": PERMISSION_DENIED_KIND, "action": name}),
            );
        }
        Err(EnvError::PermissionDenied { operation: name })
    }

    /// Authenticate with the stored credentials.
    ///
    /// Every attempt publishes a `login` notification with its outcome,
    /// including calls made while already authenticated. Calls made while a
    /// login is in flight wait for that login instead of sending another.
    /// Rejected credentials are forgotten.
    pub async fn login(&self) -> Result<()> {
        let step = {
            let mut session = self.inner.session.lock();
            if session.authenticated {
                LoginStep::AlreadyAuthenticated
            } else if let Some(waiters) = session.login_waiters.as_mut() {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                LoginStep::Join(rx)
            } else {
                session.login_waiters = Some(Vec::new());
                LoginStep::Send(session.credentials.clone())
            }
        };

        let credentials = match step {
            LoginStep::AlreadyAuthenticated => {
                self.publish_login(true);
                return Ok(());
            }
            LoginStep::Join(rx) => return rx.await.unwrap_or(Err(EnvError::Cancelled)),
            LoginStep::Send(credentials) => credentials,
        };

        let mut in_flight = LoginInFlight {
            session: &self.inner.session,
            outcome: None,
        };
        let result = self.authenticate(credentials).await;
        in_flight.outcome = Some(result.clone());
        result
    }

    async fn authenticate(&self, credentials: Option<Credentials>) -> Result<()> {
        let Some(Credentials { user, password }) = credentials else {
            tracing::warn!("attempted login without credentials");
            self.publish_login(false);
            return Err(EnvError::MissingCredentials);
        };

        match self.call(Operation::Login { user, password }).await {
            Ok(_) => {
                self.inner.session.lock().authenticated = true;
                self.publish_login(true);
                self.refresh_info();
                Ok(())
            }
            Err(err) => {
                if err.backend_kind() == Some(BackendErrorKind::Unauthorized) {
                    tracing::warn!("login rejected, forgetting credentials");
                    self.inner.session.lock().credentials = None;
                }
                self.publish_login(false);
                Err(err)
            }
        }
    }

    /// Ask a backend that does not announce itself for its environment info.
    fn refresh_info(&self) {
        if !self.inner.adapter.supports(&Operation::EnvironmentInfo) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let submitted = self.submit(Operation::EnvironmentInfo, move |result| {
            match result.and_then(parse_info) {
                Ok(info) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.session.lock().info = Some(info);
                    }
                }
                Err(err) => tracing::warn!("error retrieving environment info: {}", err),
            }
        });
        if let Err(err) = submitted {
            tracing::debug!("environment info not requested: {}", err);
        }
    }

    fn publish_login(&self, result: bool) {
        self.inner
            .router
            .publish(LOGIN_KIND, json!({"op": LOGIN_KIND, "result": result}));
    }

    /// Deploy `charm_url` as `service_name`.
    pub async fn deploy(
        &self,
        charm_url: impl Into<String>,
        service_name: impl Into<String>,
        config: Map<String, Value>,
        config_raw: Option<String>,
        num_units: u32,
    ) -> Result<Value> {
        self.call(Operation::Deploy {
            charm_url: charm_url.into(),
            service_name: service_name.into(),
            config,
            config_raw,
            num_units,
        })
        .await
    }

    /// Relate two endpoints.
    pub async fn add_relation(&self, endpoint_a: Endpoint, endpoint_b: Endpoint) -> Result<Relation> {
        let result = self
            .call(Operation::AddRelation {
                endpoint_a,
                endpoint_b,
            })
            .await?;
        serde_json::from_value(result).map_err(|err| adapter::malformed(err.to_string()))
    }

    /// Remove the relation between two endpoints.
    pub async fn remove_relation(&self, endpoint_a: Endpoint, endpoint_b: Endpoint) -> Result<Value> {
        self.call(Operation::RemoveRelation {
            endpoint_a,
            endpoint_b,
        })
        .await
    }

    /// Change service options.
    pub async fn set_config(
        &self,
        service_name: impl Into<String>,
        config: Map<String, Value>,
        config_raw: Option<String>,
    ) -> Result<Value> {
        self.call(Operation::SetConfig {
            service_name: service_name.into(),
            config,
            config_raw,
        })
        .await
    }

    /// Full environment status.
    pub async fn status(&self) -> Result<Value> {
        self.call(Operation::Status).await
    }

    /// Add `num_units` units to a service.
    pub async fn add_unit(&self, service_name: impl Into<String>, num_units: u32) -> Result<Value> {
        self.call(Operation::AddUnit {
            service_name: service_name.into(),
            num_units,
        })
        .await
    }

    /// Remove units by name.
    pub async fn remove_units(&self, unit_names: Vec<String>) -> Result<Value> {
        self.call(Operation::RemoveUnits { unit_names }).await
    }

    /// Expose a service.
    pub async fn expose(&self, service_name: impl Into<String>) -> Result<Value> {
        self.call(Operation::Expose {
            service_name: service_name.into(),
        })
        .await
    }

    /// Unexpose a service.
    pub async fn unexpose(&self, service_name: impl Into<String>) -> Result<Value> {
        self.call(Operation::Unexpose {
            service_name: service_name.into(),
        })
        .await
    }

    /// Destroy a service.
    pub async fn destroy_service(&self, service_name: impl Into<String>) -> Result<Value> {
        self.call(Operation::DestroyService {
            service_name: service_name.into(),
        })
        .await
    }

    /// Charm metadata.
    pub async fn get_charm(&self, charm_url: impl Into<String>) -> Result<Value> {
        self.call(Operation::GetCharm {
            charm_url: charm_url.into(),
        })
        .await
    }

    /// Service details.
    pub async fn get_service(&self, service_name: impl Into<String>) -> Result<Value> {
        self.call(Operation::GetService {
            service_name: service_name.into(),
        })
        .await
    }

    /// Mark a unit error as resolved, optionally re-running the hook.
    pub async fn resolved(
        &self,
        unit_name: impl Into<String>,
        relation_name: Option<String>,
        retry: bool,
    ) -> Result<Value> {
        self.call(Operation::Resolved {
            unit_name: unit_name.into(),
            relation_name,
            retry,
        })
        .await
    }

    /// Change service constraints.
    pub async fn set_constraints(
        &self,
        service_name: impl Into<String>,
        constraints: Map<String, Value>,
    ) -> Result<Value> {
        self.call(Operation::SetConstraints {
            service_name: service_name.into(),
            constraints,
        })
        .await
    }

    /// Merge annotations into an entity.
    pub async fn update_annotations(
        &self,
        entity: impl Into<String>,
        data: Map<String, Value>,
    ) -> Result<Value> {
        self.call(Operation::UpdateAnnotations {
            entity: entity.into(),
            data,
        })
        .await
    }

    /// Remove annotation keys from an entity.
    pub async fn remove_annotations(
        &self,
        entity: impl Into<String>,
        keys: Vec<String>,
    ) -> Result<Value> {
        self.call(Operation::RemoveAnnotations {
            entity: entity.into(),
            keys,
        })
        .await
    }

    /// Relation endpoints of `service_names` (all services when empty).
    pub async fn get_endpoints(&self, service_names: Vec<String>) -> Result<Value> {
        self.call(Operation::GetEndpoints { service_names }).await
    }

    /// Provider type and default series.
    ///
    /// Backends that announce themselves answer from the greeting.
    pub async fn environment_info(&self) -> Result<EnvironmentInfo> {
        if !self.inner.adapter.supports(&Operation::EnvironmentInfo) {
            return self.info().ok_or(EnvError::Unsupported {
                operation: "environment_info",
                dialect: self.dialect(),
            });
        }
        let info = parse_info(self.call(Operation::EnvironmentInfo).await?)?;
        self.inner.session.lock().info = Some(info.clone());
        Ok(info)
    }

    /// An entity's annotations.
    pub async fn get_annotations(&self, entity: impl Into<String>) -> Result<Value> {
        self.call(Operation::GetAnnotations {
            entity: entity.into(),
        })
        .await
    }

    /// Keep-alive round trip.
    pub async fn ping(&self) -> Result<()> {
        self.call(Operation::Ping).await.map(|_| ())
    }

    /// Start receiving `delta` notifications.
    ///
    /// Backends that push deltas need nothing. On the go backend this starts
    /// an all-watcher and a background task that re-publishes each batch,
    /// sorted so parents come first, until the connection closes or a
    /// request fails.
    pub async fn watch_all(&self) -> Result<()> {
        if !self.inner.adapter.pulls_deltas() {
            tracing::debug!("{} backend pushes deltas", self.dialect());
            return Ok(());
        }

        let response = self.call(Operation::WatchAll).await?;
        let watcher_id = match response.get("AllWatcherId") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => return Err(adapter::malformed("WatchAll response missing AllWatcherId")),
        };
        tracing::info!("started all-watcher {}", watcher_id);

        let handle = tokio::spawn(pull_deltas(Arc::downgrade(&self.inner), watcher_id));
        self.inner.session.lock().tasks.push(handle);
        Ok(())
    }
}

fn parse_info(result: Value) -> Result<EnvironmentInfo> {
    serde_json::from_value(result).map_err(|err| adapter::malformed(err.to_string()))
}

/// Await a reply on behalf of a background task without keeping the
/// environment alive in the meantime.
async fn call_detached(inner: &Weak<EnvInner>, operation: Operation) -> Result<Value> {
    let reply = {
        let inner = inner
            .upgrade()
            .ok_or_else(|| EnvError::connection_lost("client dropped"))?;
        let (tx, rx) = oneshot::channel();
        Environment { inner }.submit(operation, move |result| {
            let _ = tx.send(result);
        })?;
        rx
    };
    reply.await.map_err(|_| EnvError::Cancelled)?
}

async fn pull_deltas(inner: Weak<EnvInner>, watcher_id: String) {
    loop {
        let next = Operation::WatcherNext {
            watcher_id: watcher_id.clone(),
        };
        match call_detached(&inner, next).await {
            Ok(deltas) => {
                let Some(strong) = inner.upgrade() else { break };
                strong
                    .router
                    .publish(DELTA_KIND, json!({"op": DELTA_KIND, "result": deltas}));
            }
            Err(err) => {
                tracing::info!("all-watcher {} stopped: {}", watcher_id, err);
                break;
            }
        }
    }
}

async fn keep_alive(inner: Weak<EnvInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let connected = inner
            .upgrade()
            .is_some_and(|strong| strong.connection.is_connected());
        if !connected {
            break;
        }
        match call_detached(&inner, Operation::Ping).await {
            Ok(_) => tracing::trace!("ping"),
            Err(err @ (EnvError::ConnectionLost { .. } | EnvError::NotConnected)) => {
                tracing::debug!("pinger stopping: {}", err);
                break;
            }
            Err(err) => tracing::warn!("ping failed: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected(config: EnvironmentConfig) -> (Environment, MemoryBackend) {
        let (connector, backend) = MemoryConnector::pair();
        let env = Environment::new(config, Arc::new(connector)).unwrap();
        env.connect().await.unwrap();
        (env, backend)
    }

    fn python_config() -> EnvironmentConfig {
        EnvironmentConfig::new("memory://backend", Dialect::Python)
    }

    #[tokio::test]
    async fn call_resolves_with_decoded_result() {
        let (env, mut backend) = connected(python_config()).await;

        let caller = env.clone();
        let call = tokio::spawn(async move { caller.status().await });

        let request = backend.recv_json().await.unwrap();
        assert_eq!(request["op"], "status");
        assert_eq!(request["request_id"], 1);
        backend.push(json!({"request_id": 1, "op": "status", "result": {"services": []}}));

        assert_eq!(call.await.unwrap().unwrap(), json!({"services": []}));
        assert_eq!(env.pending_requests(), 0);
    }

    #[tokio::test]
    async fn read_only_refuses_writes_locally() {
        let mut config = python_config();
        config.read_only = true;
        let (env, mut backend) = connected(config).await;

        let denied = Arc::new(Mutex::new(Vec::new()));
        let sink = denied.clone();
        env.on(PERMISSION_DENIED_KIND, move |notification| {
            sink.lock().push(notification.payload["action"].clone());
        });

        let err = env.expose("mysql").await.unwrap_err();
        assert!(matches!(err, EnvError::PermissionDenied { operation: "expose" }));

        let err = env.update_annotations("mysql", Map::new()).await.unwrap_err();
        assert!(matches!(err, EnvError::PermissionDenied { .. }));

        assert_eq!(*denied.lock(), vec![json!("expose")]);
        assert!(backend.try_recv_json().is_none());
    }

    #[tokio::test]
    async fn login_without_credentials_publishes_failure() {
        let (env, _backend) = connected(python_config()).await;

        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        env.on(LOGIN_KIND, move |notification| {
            sink.lock().push(notification.payload["result"].clone());
        });

        assert!(matches!(env.login().await, Err(EnvError::MissingCredentials)));
        assert_eq!(*outcomes.lock(), vec![json!(false)]);
    }

    #[tokio::test]
    async fn refused_submit_still_reaches_the_callback() {
        let mut config = python_config();
        config.read_only = true;
        let (env, _backend) = connected(config).await;

        let (tx, rx) = oneshot::channel();
        let err = env
            .submit(Operation::Expose { service_name: "mysql".into() }, move |result| {
                let _ = tx.send(result);
            })
            .unwrap_err();
        assert!(matches!(err, EnvError::PermissionDenied { operation: "expose" }));
        assert!(matches!(
            rx.await.unwrap(),
            Err(EnvError::PermissionDenied { operation: "expose" })
        ));
    }

    #[tokio::test]
    async fn concurrent_logins_share_one_request() {
        let config = python_config().with_credentials("admin", "secret");
        let (env, mut backend) = connected(config).await;

        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        env.on(LOGIN_KIND, move |notification| {
            sink.lock().push(notification.payload["result"].clone());
        });

        let first = env.clone();
        let first = tokio::spawn(async move { first.login().await });
        let request = backend.recv_json().await.unwrap();
        assert_eq!(request["op"], "login");

        let second = env.clone();
        let second = tokio::spawn(async move { second.login().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(backend.try_recv_json().is_none());

        backend.push(json!({"request_id": request["request_id"], "op": "login", "result": true}));
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(*outcomes.lock(), vec![json!(true)]);

        // Already authenticated: success is announced again, nothing is sent.
        env.login().await.unwrap();
        assert_eq!(*outcomes.lock(), vec![json!(true), json!(true)]);
        assert!(backend.try_recv_json().is_none());
    }

    #[tokio::test]
    async fn python_environment_info_comes_from_the_greeting() {
        let (env, mut backend) = connected(python_config()).await;
        assert!(matches!(
            env.environment_info().await,
            Err(EnvError::Unsupported { operation: "environment_info", .. })
        ));

        backend.push(json!({"ready": true, "provider_type": "local"}));
        for _ in 0..100 {
            if env.info().is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let info = env.environment_info().await.unwrap();
        assert_eq!(info.provider_type.as_deref(), Some("local"));
        assert!(backend.try_recv_json().is_none());
    }

    #[tokio::test]
    async fn greeting_records_environment_info() {
        let (env, backend) = connected(python_config()).await;
        assert_eq!(env.info(), None);

        backend.push(json!({"ready": true, "provider_type": "ec2", "default_series": "precise"}));
        for _ in 0..100 {
            if env.info().is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(
            env.info(),
            Some(EnvironmentInfo {
                provider_type: Some("ec2".to_string()),
                default_series: Some("precise".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn refused_connection_surfaces_reason() {
        let connector = MemoryConnector::refusing("no route to host");
        let env = Environment::new(python_config(), Arc::new(connector)).unwrap();

        let err = env.connect().await.unwrap_err();
        assert!(matches!(err, EnvError::ConnectionLost { .. }));
        assert_eq!(env.connection_state(), ConnectionState::Closed);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let (connector, _backend) = MemoryConnector::pair();
        let config = EnvironmentConfig::new("http://localhost", Dialect::Go);
        assert!(matches!(
            Environment::new(config, Arc::new(connector)),
            Err(EnvError::Config(ConfigError::UnsupportedScheme(_)))
        ));
    }
}
