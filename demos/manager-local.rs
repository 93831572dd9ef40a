//! Starts a Manager on localhost without TLS, so the other demos
//! can connect to it. Run `basic-math`, `echo-service`, `heartbeat`
//! and `client-local` against it.

use hermod::{init, run_manager, InitConfig, ManagerConfig};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let conf = InitConfig {
        async_threads: num_cpus::get(),
    };
    let _guard = unsafe { init(conf).unwrap() };

    hermod::rt::block_on(async_main());
}

async fn async_main() {
    let cfg = ManagerConfig {
        disable_tls: true,
        ..Default::default()
    };
    let handle = run_manager(cfg).await.unwrap();
    println!("Manager listening on port {}", handle.port());
    handle.wait().await;
}
