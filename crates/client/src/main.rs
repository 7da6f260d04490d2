use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use clap::Parser;
use log::info;

use tether::{ChannelKind, ConnectionState, MessageKind, NetworkConfig, NetworkManager};

const ECHO: MessageKind = MessageKind(1);

#[derive(Parser)]
#[command(name = "tether-client")]
#[command(about = "Headless tether echo client")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1")]
    server: String,

    #[arg(short, long, default_value_t = tether::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = 60)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 5, help = "Echoes to exchange before exiting")]
    count: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = NetworkConfig {
        server_port: args.port,
        ..NetworkConfig::default()
    };

    let mut net: NetworkManager<u64> = NetworkManager::new(config)?;

    let replies = Rc::new(RefCell::new(0u32));
    let seen = Rc::clone(&replies);
    net.register_client_callback(ECHO, move |_, msg| {
        info!("echo reply: {}", String::from_utf8_lossy(&msg.payload));
        *seen.borrow_mut() += 1;
    });

    let started = Rc::new(RefCell::new(None));
    let flag = Rc::clone(&started);
    net.start_client_with(&args.server, move |ok| *flag.borrow_mut() = Some(ok))?;

    let tick = Duration::from_secs_f64(1.0 / args.tick_rate as f64);
    let dt = tick.as_secs_f64();
    let mut clock = 0.0f64;
    let mut next_send = 0.0f64;
    let mut sent = 0u32;

    while *replies.borrow() < args.count {
        let start = Instant::now();
        net.update(dt);
        clock += dt;

        if *started.borrow() == Some(false) {
            bail!("could not connect to {}", args.server);
        }
        if *started.borrow() == Some(true) && net.client_state() == ConnectionState::Disconnected {
            bail!("disconnected before all echoes arrived");
        }

        if net.local_client_is_connected() && sent < args.count && clock >= next_send {
            if let Some(mut msg) = net.create_client_message(ECHO) {
                msg.channel = ChannelKind::ReliableOrdered;
                msg.payload
                    .extend_from_slice(format!("ping {sent}").as_bytes());
                net.send_from_client(msg);
                sent += 1;
                next_send = clock + 1.0;
            }
        }

        let elapsed = start.elapsed();
        if elapsed < tick {
            thread::sleep(tick - elapsed);
        }
    }

    net.stop_client()?;
    info!("done, {} echoes", args.count);
    Ok(())
}
