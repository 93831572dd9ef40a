//! An Echo service: replies with the positional and keyword
//! arguments it was called with.

use serde_json::json;

use hermod::{init, InitConfig, ServiceBuilder, ServiceConfig};

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

    let service = ServiceBuilder::new("Echo")
        .method("echo", "(*args, **kwargs) -> [args, kwargs]", |args, kwargs| {
            Ok(json!([args, kwargs]))
        })
        .build();

    let cfg = ServiceConfig {
        disable_tls: true,
        ..Default::default()
    };
    let handle = service.start(cfg).unwrap();
    handle.wait();
}
