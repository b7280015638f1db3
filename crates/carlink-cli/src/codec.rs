//! `encode` / `decode` commands: SLIP frames as hex

use anyhow::{Context, Result};
use carlink_core::framing::encode;
use carlink_core::{ControlFunction, FrameDecoder, Packet, ServiceControl, ServiceType};
use clap::ValueEnum;
use colored::Colorize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ServiceArg {
    Control,
    Rpc,
    Pcm,
    Nav,
    BulkData,
}

impl From<ServiceArg> for ServiceType {
    fn from(arg: ServiceArg) -> Self {
        match arg {
            ServiceArg::Control => ServiceType::Control,
            ServiceArg::Rpc => ServiceType::Rpc,
            ServiceArg::Pcm => ServiceType::Pcm,
            ServiceArg::Nav => ServiceType::Nav,
            ServiceArg::BulkData => ServiceType::BulkData,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FunctionArg {
    Security,
    StartService,
    StartServiceAck,
    StartServiceNack,
    EndService,
    EndServiceAck,
    EndServiceNack,
    Heartbeat,
    HeartbeatAck,
}

impl From<FunctionArg> for ControlFunction {
    fn from(arg: FunctionArg) -> Self {
        match arg {
            FunctionArg::Security => ControlFunction::Security,
            FunctionArg::StartService => ControlFunction::StartService,
            FunctionArg::StartServiceAck => ControlFunction::StartServiceAck,
            FunctionArg::StartServiceNack => ControlFunction::StartServiceNack,
            FunctionArg::EndService => ControlFunction::EndService,
            FunctionArg::EndServiceAck => ControlFunction::EndServiceAck,
            FunctionArg::EndServiceNack => ControlFunction::EndServiceNack,
            FunctionArg::Heartbeat => ControlFunction::Heartbeat,
            FunctionArg::HeartbeatAck => ControlFunction::HeartbeatAck,
        }
    }
}

/// Build a packet and return its SLIP frame as hex
pub fn encode_frame(
    service: ServiceArg,
    session_id: u8,
    function: Option<FunctionArg>,
    version: u8,
    payload_hex: &str,
) -> Result<String> {
    let payload = hex::decode(strip_hex(payload_hex)).context("Payload is not valid hex")?;

    let packet = match service {
        ServiceArg::Control => {
            let function: ControlFunction = function
                .context("CONTROL packets need --function")?
                .into();
            Packet::control(function.as_u8(), session_id, payload)
        }
        other => Packet::new(other.into(), session_id, payload),
    }
    .with_version(version);

    let frame = encode(&packet)?;
    Ok(hex::encode(&frame))
}

/// Decode every complete frame in a hex dump
pub fn decode_frames(input_hex: &str) -> Result<Vec<Packet>> {
    let data = hex::decode(strip_hex(input_hex)).context("Input is not valid hex")?;
    let mut decoder = FrameDecoder::new();
    Ok(decoder.decode(&data))
}

pub fn print_packet(index: usize, packet: &Packet) {
    let function = packet
        .function_id()
        .map(|id| match ControlFunction::try_from(id) {
            Ok(function) => format!(" {:?}", function),
            Err(_) => format!(" 0x{:02x}", id),
        })
        .unwrap_or_default();

    println!(
        "{} {}{} session={} version={} payload={} bytes",
        format!("#{}", index).dimmed(),
        packet.service_type().to_string().cyan().bold(),
        function.yellow(),
        packet.session_id(),
        packet.version(),
        packet.payload().len()
    );

    let is_service_control = matches!(
        packet.function_id().and_then(|id| ControlFunction::try_from(id).ok()),
        Some(
            ControlFunction::StartService
                | ControlFunction::StartServiceAck
                | ControlFunction::StartServiceNack
                | ControlFunction::EndService
                | ControlFunction::EndServiceAck
                | ControlFunction::EndServiceNack
        )
    );
    if is_service_control {
        if let Ok(body) = ServiceControl::decode(packet.payload().clone()) {
            println!("    {:?}", body);
            return;
        }
    }
    if !packet.payload().is_empty() {
        println!("    {}", hex::encode(packet.payload()));
    }
}

/// Accept `c0 01 02`, `c0:01:02` and `0xc00102`
fn strip_hex(input: &str) -> String {
    let trimmed = input.trim();
    let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    trimmed
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect()
}
