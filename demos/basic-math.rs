//! A service offering basic arithmetic, with deliberately slow
//! handlers; useful for demonstrating asynchronous batched requests.

use std::thread;
use std::time::Duration;

use serde_json::{json, Map, Value};

use hermod::{init, InitConfig, ServiceBuilder, ServiceConfig, ServiceError};

fn number(args: &[Value], kwargs: &Map<String, Value>, index: usize, name: &str) -> Result<f64, ServiceError> {
    args.get(index)
        .or_else(|| kwargs.get(name))
        .and_then(Value::as_f64)
        .ok_or_else(|| ServiceError::new("TypeError", &format!("missing numeric argument {:?}", name)))
}

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

    let service = ServiceBuilder::new("BasicMath")
        .workers(8)
        .value("seven", json!(7))
        .method("add", "(x: float, y: float) -> float", |args, kwargs| {
            thread::sleep(Duration::from_secs(1));
            Ok(json!(number(&args, &kwargs, 0, "x")? + number(&args, &kwargs, 1, "y")?))
        })
        .method("subtract", "(x: float, y: float) -> float", |args, kwargs| {
            thread::sleep(Duration::from_secs(2));
            Ok(json!(number(&args, &kwargs, 0, "x")? - number(&args, &kwargs, 1, "y")?))
        })
        .method("multiply", "(x: float, y: float) -> float", |args, kwargs| {
            thread::sleep(Duration::from_secs(3));
            Ok(json!(number(&args, &kwargs, 0, "x")? * number(&args, &kwargs, 1, "y")?))
        })
        .method("divide", "(x: float, y: float) -> float", |args, kwargs| {
            thread::sleep(Duration::from_secs(4));
            let x = number(&args, &kwargs, 0, "x")?;
            let y = number(&args, &kwargs, 1, "y")?;
            if y == 0.0 {
                return Err(ServiceError::new("ZeroDivisionError", "division by zero"));
            }
            Ok(json!(x / y))
        })
        .method("ensure_positive", "(x: float) -> bool", |args, kwargs| {
            thread::sleep(Duration::from_secs(5));
            let x = number(&args, &kwargs, 0, "x")?;
            if x < 0.0 {
                return Err(ServiceError::new("ValueError", "The value is < 0"));
            }
            Ok(json!(true))
        })
        .method("power", "(x: float, n: float) -> float", |args, kwargs| {
            thread::sleep(Duration::from_secs(6));
            let x = number(&args, &kwargs, 0, "x")?;
            let n = number(&args, &kwargs, 1, "n").unwrap_or(2.0);
            Ok(json!(x.powf(n)))
        })
        .build();

    let cfg = ServiceConfig {
        disable_tls: true,
        ..Default::default()
    };
    let handle = service.start(cfg).unwrap();
    handle.wait();
}
