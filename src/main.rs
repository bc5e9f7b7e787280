use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::info;

use rtp_midi_bridge::{Config, Event, EventBus};

fn main() {
    env_logger::init();

    let config = match Config::load_from_file("config.toml") {
        Ok(config) => config,
        Err(error) => {
            eprintln!("Failed to load config: {}", error);
            std::process::exit(1);
        }
    };
    info!("Loaded config: {:?}", config);

    let bus = EventBus::new();
    let mut backend = match config.build(bus.sender.clone()) {
        Ok(backend) => backend,
        Err(error) => {
            eprintln!("Failed to configure backend: {}", error);
            std::process::exit(1);
        }
    };
    if let Err(error) = backend.start() {
        eprintln!("Failed to start backend: {}", error);
        std::process::exit(1);
    }

    let running = Arc::new(AtomicBool::new(true));
    let running_flag = running.clone();
    ctrlc::set_handler(move || {
        running_flag.store(false, Ordering::SeqCst);
    })
    .expect("Failed to set Ctrl-C handler");

    // All backend sockets are non-blocking, so a simple sleep-and-drain host
    // loop suffices; a real host would poll the descriptors instead.
    info!("Bridge running, Ctrl-C to stop");
    while running.load(Ordering::SeqCst) {
        let descriptors = backend.descriptors();
        backend.process(&descriptors);

        while let Ok(event) = bus.receiver.try_recv() {
            match event {
                Event::ChannelUpdate { instance, ident, value } => {
                    println!("instance {} {} = {:.4}", instance, ident, value);
                }
                Event::PeerConnected { instance, peer } => {
                    println!("instance {} connected peer {}", instance, peer);
                }
                Event::PeerLost { instance, peer } => {
                    println!("instance {} lost peer {}", instance, peer);
                }
            }
        }

        thread::sleep(Duration::from_millis(backend.interval().clamp(5, 50)));
    }

    backend.shutdown();
}
