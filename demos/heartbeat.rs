//! A heartbeat service that emits a monotonically increasing counter
//! to every linked Client. Linked Clients install a notification
//! handler; `reset` restarts the counter and `set_heart_rate`
//! changes the emission frequency.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use hermod::{init, kwargs, InitConfig, ServiceBuilder, ServiceConfig};

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

    let counter = Arc::new(AtomicI64::new(0));
    let alive = Arc::new(AtomicBool::new(true));
    let period_ms = Arc::new(AtomicU64::new(1000));

    let service = {
        let kill_alive = alive.clone();
        let shutdown_alive = alive.clone();
        let reset_counter = counter.clone();
        let rate_period = period_ms.clone();
        ServiceBuilder::new("Heartbeat")
            .method("kill", "() -> null", move |_args, _kwargs| {
                kill_alive.store(false, Ordering::SeqCst);
                Ok(Value::Null)
            })
            .method("reset", "() -> null", move |_args, _kwargs| {
                reset_counter.store(0, Ordering::SeqCst);
                Ok(Value::Null)
            })
            .method(
                "set_heart_rate",
                "(beats_per_second: int) -> null",
                move |args, kwargs| {
                    let bps = args
                        .first()
                        .or_else(|| kwargs.get("beats_per_second"))
                        .and_then(Value::as_f64)
                        .unwrap_or(1.0);
                    rate_period.store((1000.0 / bps) as u64, Ordering::SeqCst);
                    Ok(Value::Null)
                },
            )
            .on_shutdown(move || shutdown_alive.store(false, Ordering::SeqCst))
            .build()
    };

    let notifier = service.notifier();
    {
        let alive = alive.clone();
        thread::spawn(move || {
            while alive.load(Ordering::SeqCst) {
                let beat = counter.fetch_add(1, Ordering::SeqCst);
                notifier
                    .emit_notification(vec![json!(beat)], kwargs! {})
                    .unwrap_or(());
                thread::sleep(Duration::from_millis(period_ms.load(Ordering::SeqCst)));
            }
        });
    }

    let cfg = ServiceConfig {
        disable_tls: true,
        ..Default::default()
    };
    let handle = service.start(cfg).unwrap();
    handle.wait();
    alive.store(false, Ordering::SeqCst);
}
