use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use log::info;

use tether::{ChannelKind, MessageKind, NetworkConfig, NetworkManager};

const ECHO: MessageKind = MessageKind(1);

#[derive(Parser)]
#[command(name = "tether-server")]
#[command(about = "Headless tether session server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = tether::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = 60)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 4)]
    max_clients: usize,

    #[arg(long, default_value_t = 10.0, help = "Idle timeout in seconds")]
    timeout: f64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = NetworkConfig {
        max_clients: args.max_clients,
        server_port: args.port,
        timeout: args.timeout,
        ..NetworkConfig::default()
    };

    let mut net: NetworkManager<u64> = NetworkManager::new(config)?;

    net.register_server_callback(ECHO, |outbox, index, msg| {
        outbox.send_to_client(index, ECHO, ChannelKind::ReliableOrdered, &msg.payload);
    });

    let joined = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&joined);
    net.on_client_connected(move |index| seen.borrow_mut().push(index));

    let left = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&left);
    net.on_client_disconnected(move |index| seen.borrow_mut().push(index));

    net.start_server(&args.bind)?;
    if let Some(addr) = net.server_addr() {
        info!("listening on {addr}, up to {} clients", net.max_clients());
    }

    let tick = Duration::from_secs_f64(1.0 / args.tick_rate as f64);
    let dt = tick.as_secs_f64();

    loop {
        let start = Instant::now();
        net.update(dt);

        // Each connected client gets a replicated id for the session.
        for index in joined.borrow_mut().drain(..) {
            let id = net.create_network_id(index as u64)?;
            info!("client {index} joined, assigned network id {id}");
        }
        for index in left.borrow_mut().drain(..) {
            if let Ok(id) = net.remove_network_id(index as u64) {
                info!("client {index} left, recycled network id {id}");
            }
        }

        let elapsed = start.elapsed();
        if elapsed < tick {
            thread::sleep(tick - elapsed);
        }
    }
}
