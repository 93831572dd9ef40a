//! Connects a Client to a local Manager, links with the demo
//! services, and exercises the synchronous and asynchronous call
//! modes. Start `manager-local`, `echo-service` and `basic-math`
//! first.

use std::time::Instant;

use hermod::{args, connect, init, kwargs, ClientConfig, InitConfig};

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

    let cxn = connect(ClientConfig {
        name: "demo".into(),
        disable_tls: true,
        ..Default::default()
    })
    .unwrap();

    println!("manager identity:");
    println!("{:#}", cxn.manager_identity().unwrap());

    let echo = cxn.link("Echo").unwrap();
    let reply = echo.call("echo", args![1, 2, 3], kwargs! {}).unwrap();
    println!("Echo.echo(1, 2, 3) -> {}", reply);
    let reply = echo.call("echo", args![], kwargs! {x = 4, y = 5}).unwrap();
    println!("Echo.echo(x=4, y=5) -> {}", reply);

    // six slow requests, answered concurrently by the worker pool
    let math = cxn.link("BasicMath").unwrap();
    let t0 = Instant::now();
    let add = math.call_async("add", args![1, 2], kwargs! {});
    let subtract = math.call_async("subtract", args![10, 4], kwargs! {});
    let multiply = math.call_async("multiply", args![2.5, 4.0], kwargs! {});
    let divide = math.call_async("divide", args![9.0, 3.0], kwargs! {});
    let ensure = math.call_async("ensure_positive", args![10], kwargs! {});
    let power = math.call_async("power", args![123.45, 3], kwargs! {});
    cxn.send_pending_requests().unwrap();
    println!("batch finished in {:.1?}", t0.elapsed());
    println!("  add -> {}", add.result().unwrap());
    println!("  subtract -> {}", subtract.result().unwrap());
    println!("  multiply -> {}", multiply.result().unwrap());
    println!("  divide -> {}", divide.result().unwrap());
    println!("  ensure_positive -> {}", ensure.result().unwrap());
    println!("  power -> {}", power.result().unwrap());

    cxn.disconnect();
}
