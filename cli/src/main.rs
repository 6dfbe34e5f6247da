// blemesh — packet tools and an in-memory mesh simulator
//
// Offline companion to the mesh core: inspect frames captured off the radio,
// build test frames, and watch a line of simulated nodes talk to each other.

mod config;

use anyhow::{Context, Result};
use blemesh_core::message::{decode_payload, encode_payload};
use blemesh_core::transport::pump_until_idle;
use blemesh_core::wire::{self, FragmentHeader, Packet, PacketType, PeerId};
use blemesh_core::{
    ChannelSink, DeliveryAck, DeliveryStatus, LocalHub, LocalKeys, LocalNode, MeshConfig,
    MeshEvent, MeshService, Message, ReadReceipt,
};
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "blemesh")]
#[command(about = "BLE mesh messaging: packet tools and simulator", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level (RUST_LOG still wins when set)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a hex-encoded wire packet
    Decode { hex: String },
    /// Build a message packet and print it as hex
    Encode {
        /// Sender peer ID (16 hex digits, or any string)
        #[arg(long)]
        sender: String,
        /// Recipient peer ID; omitted means broadcast
        #[arg(long)]
        recipient: Option<String>,
        #[arg(long)]
        ttl: Option<u8>,
        text: String,
    },
    /// Run a line of in-memory nodes and exchange messages
    Simulate {
        #[arg(short, long, default_value = "4")]
        nodes: usize,
        #[arg(long)]
        ttl: Option<u8>,
    },
    /// Show or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Path,
    Reset,
    Get { key: String },
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Decode { hex } => cmd_decode(&hex),
        Commands::Encode {
            sender,
            recipient,
            ttl,
            text,
        } => cmd_encode(&sender, recipient.as_deref(), ttl, &text),
        Commands::Simulate { nodes, ttl } => cmd_simulate(nodes, ttl),
        Commands::Config { action } => cmd_config(action),
    }
}

/// Hex peer IDs are taken literally; anything else goes through the lossy
/// string mapping.
fn parse_peer(s: &str) -> PeerId {
    s.parse().unwrap_or_else(|_| PeerId::from_str_lossy(s))
}

fn type_name(raw: u8) -> String {
    match PacketType::from_u8(raw) {
        Some(kind) => format!("{:?} (0x{:02x})", kind, raw),
        None => format!("unknown (0x{:02x})", raw),
    }
}

fn cmd_decode(input: &str) -> Result<()> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&cleaned).context("Input is not valid hex")?;
    let packet = wire::decode(&bytes).context("Malformed packet")?;

    println!("{}", "Packet".bold());
    println!("  Version:   {}", packet.version);
    println!("  Type:      {}", type_name(packet.packet_type).bright_cyan());
    println!("  TTL:       {}", packet.ttl);
    println!("  Timestamp: {}", packet.timestamp);
    println!("  Flags:     0x{:02x}", packet.flags());
    println!("  Sender:    {}", packet.sender_id.to_string().bright_yellow());
    match packet.recipient_id {
        Some(r) if r.is_broadcast() => println!("  Recipient: {}", "broadcast".dimmed()),
        Some(r) => println!("  Recipient: {}", r.to_string().bright_yellow()),
        None => println!("  Recipient: {}", "(none)".dimmed()),
    }
    println!("  Payload:   {} bytes", packet.payload.len());
    println!(
        "  Signature: {}",
        if packet.signature.is_some() { "present" } else { "none" }
    );
    println!();

    print_payload(&packet)
}

fn print_payload(packet: &Packet) -> Result<()> {
    match packet.packet_type() {
        Some(PacketType::Message) => {
            let msg = decode_payload(&packet.payload).context("Malformed message payload")?;
            print_message(&msg);
        }
        Some(PacketType::Announce) | Some(PacketType::Leave) => {
            println!("  Nickname: {}", String::from_utf8_lossy(&packet.payload).bright_cyan());
        }
        Some(PacketType::KeyExchange) => {
            println!("  Key bundle: {}", hex::encode(&packet.payload).dimmed());
        }
        Some(PacketType::DeliveryAck) => {
            let ack = DeliveryAck::from_bytes(&packet.payload).context("Malformed ack")?;
            println!("{}", serde_json::to_string_pretty(&ack)?);
        }
        Some(PacketType::ReadReceipt) => {
            let receipt = ReadReceipt::from_bytes(&packet.payload).context("Malformed receipt")?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        Some(kind) if kind.is_fragment() => {
            let (header, data) = FragmentHeader::parse(&packet.payload)?;
            println!("{}", "Fragment".bold());
            println!("  ID:       {}", hex::encode(header.fragment_id));
            println!("  Piece:    {} of {}", header.index + 1, header.total);
            println!("  Carries:  {}", type_name(header.original_type));
            println!("  Data:     {} bytes", data.len());
        }
        _ => println!("  Raw: {}", hex::encode(&packet.payload).dimmed()),
    }
    Ok(())
}

fn print_message(msg: &Message) {
    println!("{}", "Message".bold());
    println!("  ID:        {}", msg.id);
    println!("  Sender:    {}", msg.sender.bright_cyan());
    println!("  Timestamp: {}", msg.timestamp);
    if msg.is_encrypted {
        let len = msg.encrypted_content.as_ref().map_or(0, Vec::len);
        println!("  Content:   {}", format!("<{} encrypted bytes>", len).dimmed());
    } else {
        println!("  Content:   {}", msg.content);
    }
    if msg.is_private {
        println!(
            "  Private to {}",
            msg.recipient_nickname.as_deref().unwrap_or("?").bright_cyan()
        );
    }
    if msg.is_relay {
        println!(
            "  Relayed for {}",
            msg.original_sender.as_deref().unwrap_or("?")
        );
    }
    if let Some(peer) = &msg.sender_peer_id {
        println!("  Peer ID:   {}", peer);
    }
    if let Some(mentions) = &msg.mentions {
        println!("  Mentions:  {}", mentions.join(", "));
    }
    if let Some(room) = &msg.room {
        println!("  Room:      {}", room.bright_green());
    }
}

fn cmd_encode(sender: &str, recipient: Option<&str>, ttl: Option<u8>, text: &str) -> Result<()> {
    let config = config::Config::load()?;
    let sender_id = parse_peer(sender);

    let mut msg = Message::new(sender, text).with_sender_peer_id(sender_id.to_hex());
    if let Some(nick) = recipient {
        msg.is_private = true;
        msg.recipient_nickname = Some(nick.to_string());
    }

    let ttl = ttl.unwrap_or(config.mesh.default_ttl);
    let recipient_id = recipient.map(parse_peer).unwrap_or(PeerId::BROADCAST);
    let packet = Packet::new(PacketType::Message, ttl, sender_id, encode_payload(&msg))
        .with_recipient(recipient_id);

    let encoded = wire::encode(&packet).context("Failed to encode packet")?;
    println!("{}", hex::encode(encoded));
    Ok(())
}

fn cmd_simulate(count: usize, ttl: Option<u8>) -> Result<()> {
    anyhow::ensure!(count >= 2, "Need at least two nodes");
    let config = config::Config::load()?;
    let mesh_config = MeshConfig {
        default_ttl: ttl.unwrap_or(config.mesh.default_ttl),
        ..config.mesh.clone()
    };

    let hub = LocalHub::new();
    let mut nodes = Vec::with_capacity(count);
    let mut sinks: Vec<mpsc::Receiver<MeshEvent>> = Vec::with_capacity(count);
    for i in 0..count {
        let nickname = if i == 0 {
            config.nickname.clone()
        } else {
            format!("node-{}", i)
        };
        let id = PeerId::from_str_lossy(&format!("node-{}", i));
        let (transport, events) = hub.endpoint(id);
        let (sink, rx) = ChannelSink::new(4096);
        let service = MeshService::new(
            nickname,
            id,
            LocalKeys::generate(),
            mesh_config.clone(),
            Arc::new(transport),
            Arc::new(sink),
        );
        service.start()?;
        nodes.push(LocalNode {
            service: Arc::new(service),
            events,
        });
        sinks.push(rx);
    }
    for i in 1..count {
        hub.link(nodes[i - 1].service.local_id(), nodes[i].service.local_id());
    }
    let handshake = pump_until_idle(&mut nodes);

    println!("{}", "Simulated mesh".bold());
    println!(
        "  {} nodes in a line, ttl {}, {} handshake events",
        count, mesh_config.default_ttl, handshake
    );
    println!();

    let first = nodes[0].service.clone();
    let last = nodes[count - 1].service.clone();
    first.send_message(&format!("hello from {}", first.nickname()), vec![], None)?;
    let private = first.send_private_message(
        &format!("just for {}", last.nickname()),
        last.local_id(),
        last.nickname(),
    )?;
    pump_until_idle(&mut nodes);

    for (node, rx) in nodes.iter().zip(sinks.iter_mut()) {
        let service = &node.service;
        println!(
            "{} {} ({})",
            "•".bright_green(),
            service.nickname().bright_cyan(),
            service.local_id().to_string().dimmed()
        );
        let mut received = 0;
        while let Ok(event) = rx.try_recv() {
            if let MeshEvent::MessageReceived { message, from } = event {
                received += 1;
                let tag = if message.is_private { "private" } else { "public" };
                println!(
                    "    [{}] from {}: {}",
                    tag,
                    service.peer_nickname(&from).unwrap_or_else(|| from.to_string()),
                    message.content
                );
            }
        }
        if received == 0 {
            println!("    {}", "(nothing received)".dimmed());
        }
    }

    println!();
    let status = match first.delivery_status(&private.id) {
        Some(DeliveryStatus::Delivered { nickname, .. }) => {
            format!("delivered to {}", nickname).green().to_string()
        }
        Some(other) => format!("{:?}", other).yellow().to_string(),
        None => "untracked".dimmed().to_string(),
    };
    println!("Private message status: {}", status);
    let queued = first.retry_queue().count();
    if queued > 0 {
        println!("Messages waiting for retry: {}", queued);
    }

    for node in &nodes {
        node.service.stop();
    }
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
        ConfigAction::Reset => {
            config::Config::default().save()?;
            println!("{} Configuration reset to defaults", "✓".green());
        }
        ConfigAction::Show => {
            let config = config::Config::load()?;
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }
        }
        ConfigAction::Get { key } => {
            let config = config::Config::load()?;
            match config.get(&key) {
                Some(value) => println!("{} = {}", key.bright_cyan(), value),
                None => anyhow::bail!("Unknown config key: {}", key),
            }
        }
        ConfigAction::Set { key, value } => {
            let mut config = config::Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer_accepts_hex_and_names() {
        assert_eq!(
            parse_peer("0102030405060708"),
            PeerId::new([1, 2, 3, 4, 5, 6, 7, 8])
        );
        assert_eq!(parse_peer("alice"), PeerId::from_str_lossy("alice"));
    }

    #[test]
    fn test_type_name() {
        assert_eq!(type_name(0x04), "Message (0x04)");
        assert_eq!(type_name(0x7f), "unknown (0x7f)");
    }
}
