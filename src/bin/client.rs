//! Demo manager binary: connects out to a running server as the manager
//! connection (id 0), fetches its metadata and parameters, and prints
//! them.
use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use log::info;

use paramserve::app::{Handler, MANAGER_CONNECTION_ID};
use paramserve::frame::Frame;
use paramserve::{Application, Server, ServerConfig};

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    #[clap(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[clap(short, long, default_value_t = 9931)]
    port: u16,
}

struct PrintingHandler;

impl Handler for PrintingHandler {
    fn on_metadata(&mut self, frame: &Frame) {
        if let Some(value) = frame.get(1) {
            println!("metadata: {value}");
        }
    }

    fn on_parameters(&mut self, frame: &Frame) {
        for (key, (_, value)) in frame.iter() {
            println!("parameter {key}: {value}");
        }
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();

    let server = Server::new(
        Application::new("manager", PrintingHandler),
        ServerConfig::default(),
    );
    server.open_connect(MANAGER_CONNECTION_ID, args.host, args.port, false)?;

    info!(target: "paramserve::demo", "requesting metadata and parameters from {}:{}", args.host, args.port);
    server.send_metadata_request(MANAGER_CONNECTION_ID)?;
    server.send_parameters_request(MANAGER_CONNECTION_ID)?;

    std::thread::sleep(Duration::from_millis(500));
    Ok(())
}
