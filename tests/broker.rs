//! End-to-end scenarios: a Manager, Services and Clients over
//! loopback sockets, TLS disabled.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use hermod::{
    args, connect, init, kwargs, run_manager, Client, ClientConfig, InitConfig, ManagerConfig,
    ManagerHandle, Service, ServiceBuilder, ServiceConfig, ServiceError, UsersTable,
};

fn setup() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let conf = InitConfig {
            async_threads: num_cpus::get(),
        };
        let guard = unsafe { init(conf).unwrap() };
        // the runtime lives for the whole test binary
        std::mem::forget(guard);
    });
}

fn start_manager(cfg: ManagerConfig) -> ManagerHandle {
    hermod::rt::block_on(run_manager(cfg)).unwrap()
}

fn local_manager() -> ManagerHandle {
    start_manager(ManagerConfig {
        port: 0,
        disable_tls: true,
        ..Default::default()
    })
}

fn local_client(name: &str, port: u16) -> Client {
    connect(ClientConfig {
        name: name.into(),
        port,
        timeout: Some(Duration::from_secs(30)),
        disable_tls: true,
        ..Default::default()
    })
    .unwrap()
}

fn echo_service() -> Service {
    ServiceBuilder::new("Echo")
        .method("echo", "(*args, **kwargs) -> [args, kwargs]", |args, kwargs| {
            Ok(json!([args, kwargs]))
        })
        .build()
}

fn start_service(service: &Service, port: u16) {
    service
        .start(ServiceConfig {
            port,
            disable_tls: true,
            ..Default::default()
        })
        .unwrap();
}

fn wait_until<F: FnMut() -> bool>(mut cond: F, timeout: Duration) -> bool {
    let t0 = Instant::now();
    while t0.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

// a Service's start() returns once it has sent its identity; poll the
// Manager snapshot until the registration has landed
fn await_registered(cxn: &Client, service: &str) {
    assert!(wait_until(
        || {
            cxn.manager_identity()
                .map(|id| id["services"].as_object().unwrap().contains_key(service))
                .unwrap_or(false)
        },
        Duration::from_secs(10),
    ));
}

fn temp_db(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("hermod-test-{}-{}.db", tag, std::process::id()))
}

#[test]
fn test_echo_synchronous() {
    setup();
    let manager = local_manager();
    let service = echo_service();
    start_service(&service, manager.port());

    let cxn = local_client("echo-cli", manager.port());
    await_registered(&cxn, "Echo");
    let link = cxn.link("Echo").unwrap();

    let reply = link.call("echo", args![1, 2, 3], kwargs! {}).unwrap();
    assert_eq!(reply, json!([[1, 2, 3], {}]));

    let reply = link.call("echo", args![], kwargs! {x = 4, y = 5}).unwrap();
    assert_eq!(reply, json!([[], {"x": 4, "y": 5}]));

    cxn.disconnect();
    hermod::rt::block_on(async { manager.shutdown_and_wait().await });
}

#[test]
fn test_large_request_and_reply() {
    setup();
    let manager = local_manager();
    let service = echo_service();
    start_service(&service, manager.port());

    let cxn = local_client("large", manager.port());
    await_registered(&cxn, "Echo");
    let link = cxn.link("Echo").unwrap();

    // far bigger than any single TCP segment
    let blob: String = std::iter::repeat('x').take(2 * 1024 * 1024).collect();
    let reply = link.call("echo", args![blob.clone()], kwargs! {}).unwrap();
    assert_eq!(reply, json!([[blob], {}]));

    cxn.disconnect();
    hermod::rt::block_on(async { manager.shutdown_and_wait().await });
}

#[test]
fn test_unknown_service_and_unknown_attribute() {
    setup();
    let manager = local_manager();
    let service = echo_service();
    start_service(&service, manager.port());

    let cxn = local_client("missing", manager.port());
    await_registered(&cxn, "Echo");

    let err = cxn.link("Ghost").unwrap_err();
    assert!(err.to_string().contains("does not exist"));

    let link = cxn.link("Echo").unwrap();
    let err = link.call("does_not_exist", args![], kwargs! {}).unwrap_err();
    assert!(err.to_string().contains("has no attribute"));

    // the connection survived both errors
    let reply = link.call("echo", args!["still here"], kwargs! {}).unwrap();
    assert_eq!(reply, json!([["still here"], {}]));

    cxn.disconnect();
    hermod::rt::block_on(async { manager.shutdown_and_wait().await });
}

#[test]
fn test_link_saturation_and_unlink() {
    setup();
    let manager = local_manager();
    let service = ServiceBuilder::new("Solo")
        .max_clients(1)
        .method("ping", "() -> bool", |_args, _kwargs| Ok(json!(true)))
        .build();
    start_service(&service, manager.port());

    let first = local_client("first", manager.port());
    let second = local_client("second", manager.port());
    await_registered(&first, "Solo");

    let link = first.link("Solo").unwrap();

    // re-linking is idempotent, not a second slot
    let relink = first.link("Solo").unwrap();
    assert_eq!(relink.identity()["max_clients"], json!(1));

    let err = second.link("Solo").unwrap_err();
    assert!(err
        .to_string()
        .contains("The maximum number of Clients are already linked"));

    drop(relink);
    link.unlink().unwrap();
    let link = second.link("Solo").unwrap();
    assert_eq!(link.call("ping", args![], kwargs! {}).unwrap(), json!(true));

    first.disconnect();
    second.disconnect();
    hermod::rt::block_on(async { manager.shutdown_and_wait().await });
}

#[test]
fn test_service_death_fans_out() {
    setup();
    let manager = local_manager();
    let service = ServiceBuilder::new("Hb")
        .max_clients(10)
        .method("noop", "() -> null", |_args, _kwargs| Ok(Value::Null))
        .build();
    start_service(&service, manager.port());

    let clients: Vec<Client> = (0..10)
        .map(|i| local_client(&format!("c{}", i), manager.port()))
        .collect();
    await_registered(&clients[0], "Hb");
    let _links: Vec<_> = clients.iter().map(|c| c.link("Hb").unwrap()).collect();

    service.disconnect();

    for client in &clients {
        assert!(wait_until(
            || client
                .latest_error()
                .map(|e| e.contains("has been disconnected"))
                .unwrap_or(false),
            Duration::from_secs(10),
        ));
    }

    // the identity snapshot no longer names the service
    let observer = local_client("observer", manager.port());
    let identity = observer.manager_identity().unwrap();
    assert!(identity["services"].as_object().unwrap().get("Hb").is_none());

    observer.disconnect();
    hermod::rt::block_on(async { manager.shutdown_and_wait().await });
}

#[test]
fn test_asynchronous_batch() {
    setup();
    let manager = local_manager();

    fn slow(result: Value, millis: u64) -> impl Fn(Vec<Value>, Map<String, Value>) -> std::result::Result<Value, ServiceError> {
        move |_args, _kwargs| {
            thread::sleep(Duration::from_millis(millis));
            Ok(result.clone())
        }
    }

    let service = ServiceBuilder::new("SlowMath")
        .workers(8)
        .method("add", "() -> int", slow(json!(3), 100))
        .method("subtract", "() -> int", slow(json!(6), 200))
        .method("multiply", "() -> int", slow(json!(10), 300))
        .method("divide", "() -> int", slow(json!(3), 400))
        .method("ensure_positive", "() -> bool", slow(json!(true), 500))
        .method("power", "() -> float", slow(json!(1881365.963625), 600))
        .build();
    start_service(&service, manager.port());

    let cxn = local_client("batch", manager.port());
    await_registered(&cxn, "SlowMath");
    let link = cxn.link("SlowMath").unwrap();

    let t0 = Instant::now();
    let futures = vec![
        link.call_async("add", args![], kwargs! {}),
        link.call_async("subtract", args![], kwargs! {}),
        link.call_async("multiply", args![], kwargs! {}),
        link.call_async("divide", args![], kwargs! {}),
        link.call_async("ensure_positive", args![], kwargs! {}),
        link.call_async("power", args![], kwargs! {}),
    ];
    cxn.send_pending_requests().unwrap();
    // concurrent execution: bounded by the slowest handler (600ms),
    // not the 2100ms sum
    assert!(t0.elapsed() < Duration::from_millis(1500));

    let expected = vec![
        json!(3),
        json!(6),
        json!(10),
        json!(3),
        json!(true),
        json!(1881365.963625),
    ];
    for (future, expected) in futures.into_iter().zip(expected) {
        assert_eq!(future.result().unwrap(), expected);
    }

    cxn.disconnect();
    hermod::rt::block_on(async { manager.shutdown_and_wait().await });
}

#[test]
fn test_sync_call_with_pending_async_fails() {
    setup();
    let manager = local_manager();
    let service = echo_service();
    start_service(&service, manager.port());

    let cxn = local_client("mixed", manager.port());
    await_registered(&cxn, "Echo");
    let link = cxn.link("Echo").unwrap();

    let future = link.call_async("echo", args![1], kwargs! {});
    let err = link.call("echo", args![2], kwargs! {}).unwrap_err();
    assert!(err.to_string().contains("Asynchronous requests are pending"));

    cxn.send_pending_requests().unwrap();
    assert_eq!(future.result().unwrap(), json!([[1], {}]));

    cxn.disconnect();
    hermod::rt::block_on(async { manager.shutdown_and_wait().await });
}

#[test]
fn test_notifications_reach_only_linked_clients() {
    setup();
    let manager = local_manager();

    let echo = echo_service();
    start_service(&echo, manager.port());

    let heartbeat = ServiceBuilder::new("Heartbeat")
        .method("noop", "() -> null", |_args, _kwargs| Ok(Value::Null))
        .build();
    let notifier = heartbeat.notifier();
    start_service(&heartbeat, manager.port());

    let listener1 = local_client("l1", manager.port());
    let listener2 = local_client("l2", manager.port());
    let bystander = local_client("bystander", manager.port());

    let seen1 = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::new(Mutex::new(Vec::new()));
    let seen_echo = Arc::new(Mutex::new(Vec::new()));

    await_registered(&listener1, "Heartbeat");
    await_registered(&listener1, "Echo");
    let hb1 = listener1.link("Heartbeat").unwrap();
    let sink = seen1.clone();
    hb1.set_notification_handler(move |args, _kwargs| sink.lock().push(args[0].clone()));

    let hb2 = listener2.link("Heartbeat").unwrap();
    let sink = seen2.clone();
    hb2.set_notification_handler(move |args, _kwargs| sink.lock().push(args[0].clone()));

    // linked with Echo, not Heartbeat; must see nothing
    let echo_link = bystander.link("Echo").unwrap();
    let sink = seen_echo.clone();
    echo_link.set_notification_handler(move |args, _kwargs| sink.lock().push(args[0].clone()));

    let running = Arc::new(AtomicBool::new(true));
    let beat = {
        let running = running.clone();
        thread::spawn(move || {
            let mut counter = 0i64;
            while running.load(Ordering::SeqCst) {
                notifier
                    .emit_notification(vec![json!(counter)], kwargs! {})
                    .unwrap_or(());
                counter += 1;
                thread::sleep(Duration::from_millis(50));
            }
        })
    };

    assert!(wait_until(
        || seen1.lock().len() >= 3 && seen2.lock().len() >= 3,
        Duration::from_secs(10),
    ));
    running.store(false, Ordering::SeqCst);
    beat.join().unwrap();

    // both listeners observed the same monotonic stream
    let seen1 = seen1.lock().clone();
    let seen2 = seen2.lock().clone();
    assert!(seen1.windows(2).all(|w| w[0].as_i64() < w[1].as_i64()));
    assert!(seen2.windows(2).all(|w| w[0].as_i64() < w[1].as_i64()));
    assert!(seen_echo.lock().is_empty());

    listener1.disconnect();
    listener2.disconnect();
    bystander.disconnect();
    hermod::rt::block_on(async { manager.shutdown_and_wait().await });
}

#[test]
fn test_admin_bootstrap_and_reauth() {
    setup();
    let db = temp_db("admin");
    let _ = std::fs::remove_file(&db);
    {
        let users = UsersTable::open(Some(db.as_path())).unwrap();
        users.insert_user("admin", "whatever", true).unwrap();
        users.insert_user("basic", "pw", false).unwrap();
    }

    let manager = start_manager(ManagerConfig {
        port: 0,
        login: true,
        database: Some(db.clone()),
        disable_tls: true,
        ..Default::default()
    });

    // a wrong password never completes the handshake
    let err = connect(ClientConfig {
        name: "intruder".into(),
        port: manager.port(),
        username: Some("admin".into()),
        password: Some("wrong".into()),
        disable_tls: true,
        ..Default::default()
    })
    .unwrap_err();
    assert!(err.to_string().contains("Wrong login password"));

    let cxn = connect(ClientConfig {
        name: "boss".into(),
        port: manager.port(),
        timeout: Some(Duration::from_secs(30)),
        username: Some("admin".into()),
        password: Some("whatever".into()),
        disable_tls: true,
        ..Default::default()
    })
    .unwrap();

    let port = cxn.admin_request("port", args![], kwargs! {}).unwrap();
    assert_eq!(port, json!(manager.port()));
    let is_admin = cxn
        .admin_request("users_table.is_admin", args!["admin"], kwargs! {})
        .unwrap();
    assert_eq!(is_admin, json!(true));
    let registered = cxn
        .admin_request("users_table.is_user_registered", args!["ghost"], kwargs! {})
        .unwrap();
    assert_eq!(registered, json!(false));

    // a non-admin connection re-authenticates inline, per request
    let limited = connect(ClientConfig {
        name: "limited".into(),
        port: manager.port(),
        timeout: Some(Duration::from_secs(30)),
        username: Some("basic".into()),
        password: Some("pw".into()),
        disable_tls: true,
        ..Default::default()
    })
    .unwrap();

    let err = limited
        .admin_request("port", args![], kwargs! {})
        .unwrap_err();
    assert!(err.to_string().contains("must be an administrator"));

    let port = limited
        .admin_request_with("port", args![], kwargs! {}, Some("admin"), Some("whatever"))
        .unwrap();
    assert_eq!(port, json!(manager.port()));

    cxn.disconnect();
    limited.disconnect();
    hermod::rt::block_on(async { manager.shutdown_and_wait().await });
    let _ = std::fs::remove_file(&db);
}

#[test]
fn test_identity_snapshot_tracks_peers() {
    setup();
    let manager = local_manager();
    let service = echo_service();
    start_service(&service, manager.port());

    let cxn = local_client("watcher", manager.port());
    await_registered(&cxn, "Echo");
    let identity = cxn.manager_identity().unwrap();

    assert_eq!(identity["port"], json!(manager.port()));
    assert!(identity["attributes"]["identity"].is_string());
    let services = identity["services"].as_object().unwrap();
    assert!(services.contains_key("Echo"));
    let clients = identity["clients"].as_object().unwrap();
    assert!(clients.keys().any(|k| k.starts_with("watcher[")));

    cxn.disconnect();
    hermod::rt::block_on(async { manager.shutdown_and_wait().await });
}

#[test]
fn test_shutdown_manager_closes_everything() {
    setup();
    let manager = local_manager();
    let service = echo_service();
    start_service(&service, manager.port());
    let cxn = local_client("doomed", manager.port());
    let port = manager.port();

    hermod::rt::block_on(async { manager.shutdown_and_wait().await });

    // the client socket was closed; new calls fail
    assert!(wait_until(
        || cxn.link("Echo").is_err(),
        Duration::from_secs(10),
    ));

    // nothing is listening anymore
    assert!(wait_until(
        || std::net::TcpStream::connect(("127.0.0.1", port)).is_err(),
        Duration::from_secs(10),
    ));
}
