//! Demo server binary: registers a couple of example parameters and serves
//! the standard protocol on a configurable port.
use std::net::IpAddr;

use clap::Parser;
use color_eyre::Result;
use log::info;

use paramserve::app::Handler;
use paramserve::param::Constraints;
use paramserve::value::Value;
use paramserve::{Application, Server, ServerConfig};

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    #[clap(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    #[clap(short, long, default_value_t = 9931)]
    port: u16,

    #[clap(long, default_value = "demo")]
    name: String,

    #[clap(long, default_value_t = 256)]
    max_connections: i32,
}

struct DemoHandler;

impl Handler for DemoHandler {
    fn on_run(&mut self) {
        info!(target: "paramserve::demo", "application is now running");
    }

    fn on_pause(&mut self) {
        info!(target: "paramserve::demo", "application is now paused");
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();

    let mut app = Application::new(args.name, DemoHandler);
    app.registry.register_parameter(
        3_000_001,
        "Gain",
        Value::F64(1.0),
        Constraints::range(Value::F64(0.0), Value::F64(10.0)),
    );

    let mut server = Server::new(
        app,
        ServerConfig {
            max_connections: args.max_connections,
            ..ServerConfig::default()
        },
    );
    server.start(args.bind, args.port)?;

    info!(target: "paramserve::demo", "server running, press Ctrl+C to stop");
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}
