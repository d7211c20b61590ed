use juju_env::env::{
    BackendErrorKind, ConnectionState, DELTA_KIND, Dialect, EnvError, Endpoint, Environment,
    EnvironmentConfig, LOGIN_KIND, MemoryBackend, MemoryConnector,
};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;

fn go_config() -> EnvironmentConfig {
    let mut config = EnvironmentConfig::new("memory://go", Dialect::Go);
    config.ping_interval_secs = None;
    config
}

async fn connected(config: EnvironmentConfig) -> (Environment, MemoryBackend) {
    let (connector, backend) = MemoryConnector::pair();
    let env = Environment::new(config, Arc::new(connector)).expect("environment");
    env.connect().await.expect("connect");
    (env, backend)
}

async fn until(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn deploy_uses_go_wire_format() {
    let (env, mut backend) = connected(go_config()).await;

    let mut options = Map::new();
    options.insert("port".to_string(), json!(3306));
    options.insert("debug".to_string(), json!(true));

    let caller = env.clone();
    let call = tokio::spawn(async move {
        caller
            .deploy("cs:precise/mysql-1", "mysql", options, None, 2)
            .await
    });

    let request = backend.recv_json().await.expect("request");
    assert_eq!(request["Type"], "Client");
    assert_eq!(request["Request"], "ServiceDeploy");
    assert_eq!(request["RequestId"], 1);
    assert_eq!(request["Params"]["ServiceName"], "mysql");
    assert_eq!(request["Params"]["CharmUrl"], "cs:precise/mysql-1");
    assert_eq!(request["Params"]["NumUnits"], 2);
    assert_eq!(request["Params"]["Config"]["port"], "3306");
    assert_eq!(request["Params"]["Config"]["debug"], "true");

    backend.push(json!({"RequestId": 1, "Response": {}}));
    assert_eq!(call.await.unwrap().unwrap(), json!({}));
}

#[tokio::test]
async fn backend_errors_are_normalized() {
    let (env, mut backend) = connected(go_config()).await;

    let caller = env.clone();
    let call = tokio::spawn(async move { caller.get_service("wordpress").await });

    let request = backend.recv_json().await.expect("request");
    assert_eq!(request["Request"], "ServiceGet");
    backend.push(json!({
        "RequestId": request["RequestId"],
        "Error": "service \"wordpress\" not found",
        "ErrorCode": "not found",
    }));

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.backend_kind(), Some(BackendErrorKind::NotFound));
    assert!(err.to_string().contains("wordpress"));
}

#[tokio::test]
async fn add_relation_builds_relation_key() {
    let (env, mut backend) = connected(go_config()).await;

    let caller = env.clone();
    let call = tokio::spawn(async move {
        caller
            .add_relation(Endpoint::new("wordpress", "db"), Endpoint::service("mysql"))
            .await
    });

    let request = backend.recv_json().await.expect("request");
    assert_eq!(request["Params"]["Endpoints"], json!(["wordpress:db", "mysql"]));
    backend.push(json!({
        "RequestId": request["RequestId"],
        "Response": {"Endpoints": {
            "wordpress": {"Name": "db", "Role": "requirer", "Interface": "mysql", "Scope": "global"},
            "mysql": {"Name": "server", "Role": "provider", "Interface": "mysql", "Scope": "global"},
        }},
    }));

    let relation = call.await.unwrap().unwrap();
    assert_eq!(relation.id, "wordpress:db mysql:server");
    assert_eq!(relation.interface.as_deref(), Some("mysql"));
    assert_eq!(relation.endpoints.len(), 2);
}

#[tokio::test]
async fn login_rejection_forgets_credentials() {
    let config = go_config().with_credentials("user-admin", "wrong");
    let (env, mut backend) = connected(config).await;

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = outcomes.clone();
    env.on(LOGIN_KIND, move |notification| {
        sink.lock().push(notification.payload["result"].clone());
    });

    let caller = env.clone();
    let login = tokio::spawn(async move { caller.login().await });

    let request = backend.recv_json().await.expect("request");
    assert_eq!(request["Type"], "Admin");
    assert_eq!(request["Params"], json!({"AuthTag": "user-admin", "Password": "wrong"}));
    backend.push(json!({
        "RequestId": request["RequestId"],
        "Error": "invalid entity name or password",
        "ErrorCode": "unauthorized access",
    }));

    let err = login.await.unwrap().unwrap_err();
    assert_eq!(err.backend_kind(), Some(BackendErrorKind::Unauthorized));
    assert!(env.credentials().is_none());
    assert!(!env.is_authenticated());
    assert_eq!(*outcomes.lock(), vec![json!(false)]);

    assert!(matches!(env.login().await, Err(EnvError::MissingCredentials)));
}

#[tokio::test]
async fn successful_login_is_remembered() {
    let config = go_config().with_credentials("user-admin", "secret");
    let (env, mut backend) = connected(config).await;

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = outcomes.clone();
    env.on(LOGIN_KIND, move |notification| {
        sink.lock().push(notification.payload["result"].clone());
    });

    let caller = env.clone();
    let login = tokio::spawn(async move { caller.login().await });
    let request = backend.recv_json().await.expect("request");
    backend.push(json!({"RequestId": request["RequestId"], "Response": {}}));
    login.await.unwrap().unwrap();
    assert!(env.is_authenticated());

    let info = backend.recv_json().await.expect("environment info request");
    assert_eq!(info["Request"], "EnvironmentInfo");

    // Already authenticated: success is announced, nothing goes on the wire.
    env.login().await.unwrap();
    assert!(backend.try_recv_json().is_none());
    assert_eq!(*outcomes.lock(), vec![json!(true), json!(true)]);
}

#[tokio::test]
async fn login_records_facades_and_fetches_environment_info() {
    let config = go_config().with_credentials("user-admin", "secret");
    let (env, mut backend) = connected(config).await;

    let caller = env.clone();
    let login = tokio::spawn(async move { caller.login().await });
    let request = backend.recv_json().await.expect("login request");
    assert_eq!(request["Type"], "Admin");
    assert_eq!(request["Version"], 0);
    backend.push(json!({
        "RequestId": request["RequestId"],
        "Response": {"Facades": [
            {"Name": "Client", "Versions": [0]},
            {"Name": "AllWatcher", "Versions": [0]},
            {"Name": "Pinger", "Versions": []},
        ]},
    }));
    login.await.unwrap().unwrap();

    let info = backend.recv_json().await.expect("environment info request");
    assert_eq!(info["Type"], "Client");
    assert_eq!(info["Request"], "EnvironmentInfo");
    assert_eq!(info["Version"], 0);
    backend.push(json!({
        "RequestId": info["RequestId"],
        "Response": {"ProviderType": "ec2", "DefaultSeries": "trusty", "Name": "sandbox"},
    }));
    until(|| env.info().is_some()).await;
    let info = env.info().unwrap();
    assert_eq!(info.provider_type.as_deref(), Some("ec2"));
    assert_eq!(info.default_series.as_deref(), Some("trusty"));

    // This server serves no Pinger version.
    let err = env.ping().await.unwrap_err();
    assert!(matches!(
        err,
        EnvError::Unsupported {
            operation: "ping",
            dialect: Dialect::Go
        }
    ));
    assert!(backend.try_recv_json().is_none());
}

#[tokio::test]
async fn watch_all_publishes_sorted_deltas() {
    let (env, mut backend) = connected(go_config()).await;

    let batches = Arc::new(Mutex::new(Vec::<Value>::new()));
    let sink = batches.clone();
    env.on(DELTA_KIND, move |notification| {
        sink.lock().push(notification.payload["result"].clone());
    });

    let caller = env.clone();
    let watch = tokio::spawn(async move { caller.watch_all().await });

    let request = backend.recv_json().await.expect("watch request");
    assert_eq!(request["Request"], "WatchAll");
    backend.push(json!({"RequestId": request["RequestId"], "Response": {"AllWatcherId": "1"}}));
    watch.await.unwrap().unwrap();

    let next = backend.recv_json().await.expect("next request");
    assert_eq!(next["Type"], "AllWatcher");
    assert_eq!(next["Request"], "Next");
    assert_eq!(next["Id"], "1");
    backend.push(json!({
        "RequestId": next["RequestId"],
        "Response": {"Deltas": [
            ["unit", "change", {"Name": "mysql/0"}],
            ["service", "change", {"Name": "mysql"}],
        ]},
    }));

    until(|| batches.lock().len() == 1).await;
    let batch = batches.lock()[0].clone();
    assert_eq!(batch[0][0], "serviceInfo");
    assert_eq!(batch[1][0], "unitInfo");

    // The loop asks for the next batch straight away.
    let again = backend.recv_json().await.expect("second next request");
    assert_eq!(again["Request"], "Next");

    env.close();
    assert_eq!(env.pending_requests(), 0);
}

#[tokio::test]
async fn dropping_the_client_stops_the_watcher() {
    let (env, mut backend) = connected(go_config()).await;

    let caller = env.clone();
    let watch = tokio::spawn(async move { caller.watch_all().await });
    let request = backend.recv_json().await.expect("watch request");
    backend.push(json!({"RequestId": request["RequestId"], "Response": {"AllWatcherId": "1"}}));
    watch.await.unwrap().unwrap();

    let next = backend.recv_json().await.expect("next request");
    assert_eq!(next["Request"], "Next");

    // The running watcher does not keep the client or its socket alive.
    drop(env);
    let closed = tokio::time::timeout(Duration::from_secs(2), backend.recv())
        .await
        .expect("socket released");
    assert!(closed.is_none());
}

#[tokio::test]
async fn pinger_runs_while_connected() {
    let mut config = go_config();
    config.ping_interval_secs = Some(1);
    let (env, mut backend) = connected(config).await;

    let ping = tokio::time::timeout(Duration::from_secs(3), backend.recv_json())
        .await
        .expect("ping within interval")
        .expect("frame");
    assert_eq!(ping["Type"], "Pinger");
    assert_eq!(ping["Request"], "Ping");
    backend.push(json!({"RequestId": ping["RequestId"], "Response": {}}));

    env.close();
}

#[tokio::test]
async fn peer_close_fails_pending_requests() {
    let (env, mut backend) = connected(go_config()).await;

    let caller = env.clone();
    let status = tokio::spawn(async move { caller.status().await });
    backend.recv_json().await.expect("request");

    backend.close(Some("server going away"));
    let err = status.await.unwrap().unwrap_err();
    assert!(matches!(err, EnvError::ConnectionLost { .. }));
    assert_eq!(env.connection_state(), ConnectionState::Closed);
    assert!(matches!(env.status().await, Err(EnvError::NotConnected)));
}
