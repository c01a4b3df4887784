//! Entry point for `udp-session`.
//!
//! Parses CLI arguments and dispatches into either **serve** or **connect**
//! mode.  All protocol work is delegated to the library; `main.rs` owns only
//! process setup (logging, argument parsing) and a small echo demo.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use udp_session::host::{slot_bit, SERVER_ONLY, SERVER_SLOT};
use udp_session::{Endpoint, EndpointConfig, EngineConfig, Event, Payload};

/// Reliable, ordered sessions over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept peers and echo every payload back to its sender.
    Serve {
        /// Local address to bind.
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
        /// Number of connection slots.
        #[arg(long, default_value_t = 8)]
        slots: usize,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Connect to a server, send messages, and wait for their echoes.
    Connect {
        /// Remote server address.
        #[arg(short, long)]
        server: SocketAddr,
        /// Local address to bind.
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,
        /// Slot id the server assigned to this client.
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..16))]
        slot: u8,
        /// Messages to send.
        #[arg(default_value = "hello")]
        messages: Vec<String>,
        /// Give up after this many seconds.
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
        #[command(flatten)]
        tuning: Tuning,
    },
}

#[derive(Args)]
struct Tuning {
    /// Driver tick period in milliseconds.
    #[arg(long, default_value_t = 4)]
    tick_ms: u64,
    /// Minimum retransmit timeout in ticks.
    #[arg(long, default_value_t = 12)]
    resend_floor: i64,
    /// Pacing allowance in ticks.
    #[arg(long, default_value_t = 0)]
    pace: i64,
    /// Scheduling advantage of urgent payloads in ticks.
    #[arg(long, default_value_t = 0)]
    urgency_bonus: i64,
}

impl Tuning {
    fn endpoint_config(&self, bind: SocketAddr) -> EndpointConfig {
        EndpointConfig {
            bind,
            tick_interval: Duration::from_millis(self.tick_ms),
            urgent_resend_floor: self.resend_floor,
            engine: EngineConfig::default().with_pacing(self.pace, self.urgency_bonus),
            ..EndpointConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Serve { bind, slots, tuning } => serve(bind, slots, &tuning).await,
        Mode::Connect {
            server,
            bind,
            slot,
            messages,
            wait_secs,
            tuning,
        } => connect(server, bind, slot, messages, wait_secs, &tuning).await,
    }
}

async fn serve(bind: SocketAddr, slots: usize, tuning: &Tuning) -> anyhow::Result<()> {
    let config = EndpointConfig {
        slots,
        local_slot: SERVER_SLOT,
        accept_unknown: true,
        ..tuning.endpoint_config(bind)
    };
    let endpoint = Endpoint::bind(config).await.context("binding server")?;
    log::info!("Serving on {}", endpoint.local_addr());
    let mut handle = endpoint.run();

    while let Some(event) = handle.recv().await {
        match event {
            Event::Delivered(delivery) => {
                let Some(from) = delivery.from else { continue };
                let mut reply = delivery.payload;
                reply.distribution = slot_bit(from);
                handle.send(reply).await?;
            }
            Event::Opened { slot, peer } => log::info!("slot {slot} ← {peer}"),
            Event::Closed { slot } => log::info!("slot {slot} closed"),
            Event::Control(_) => {}
        }
    }
    handle.shutdown().await?;
    Ok(())
}

async fn connect(
    server: SocketAddr,
    bind: SocketAddr,
    slot: u8,
    messages: Vec<String>,
    wait_secs: u64,
    tuning: &Tuning,
) -> anyhow::Result<()> {
    let config = EndpointConfig {
        slots: 1,
        local_slot: slot,
        ..tuning.endpoint_config(bind)
    };
    let mut endpoint = Endpoint::bind(config).await.context("binding client")?;
    endpoint.connect(SERVER_SLOT, server)?;
    log::info!("Connecting {} → {server}", endpoint.local_addr());
    let mut handle = endpoint.run();

    for message in &messages {
        let mut payload = Payload::new(1, message.as_bytes().to_vec());
        payload.distribution = SERVER_ONLY;
        handle.send(payload).await?;
    }

    let mut remaining = messages.len();
    let deadline = tokio::time::sleep(Duration::from_secs(wait_secs));
    tokio::pin!(deadline);
    while remaining > 0 {
        tokio::select! {
            event = handle.recv() => match event {
                Some(Event::Delivered(delivery)) => {
                    println!("{}", String::from_utf8_lossy(&delivery.payload.data));
                    remaining -= 1;
                }
                Some(Event::Closed { .. }) => bail!("server connection lost"),
                Some(_) => {}
                None => bail!("endpoint stopped"),
            },
            _ = &mut deadline => bail!("timed out with {remaining} echoes outstanding"),
        }
    }

    if let Some(status) = handle.status(SERVER_SLOT).await? {
        log::info!(
            "rtt estimated={}ms average={}ms optimist={}ms pessimist={}ms",
            status.estimated_round_trip,
            status.average_round_trip,
            status.optimist_round_trip,
            status.pessimist_round_trip
        );
    }
    handle.shutdown().await?;
    Ok(())
}
