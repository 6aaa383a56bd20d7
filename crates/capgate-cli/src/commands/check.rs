//! `capgate check` — Validate gateway configuration without touching the host.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;

use capgate_common::config::HostConfig;
use capgate_gateway::gateways::GatewayKind;
use capgate_gateway::{Gateway, HostContext, HostEnv, Profile};

/// Arguments for the `check` command.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Gateway configuration documents, merged in order.
    #[arg(long = "gateways", required = true)]
    pub gateways: Vec<PathBuf>,
}

/// Executes the `check` command.
///
/// Routes the enabled elements against the host profile, configures one
/// gateway per capability, and prints what activation would do.
///
/// # Errors
///
/// Returns an error if a document cannot be read or any element is
/// rejected.
pub fn execute(args: &CheckArgs, host: HostConfig) -> anyhow::Result<()> {
    let config = super::load_gateways(&args.gateways)?;
    let profile = Profile::from_config(&host);
    let routed = config.route(&profile)?;
    let context = Arc::new(HostContext::new(host, HostEnv::capture()));

    println!("Gateway plan");
    println!();
    for (capability, elements) in &routed {
        let mut gateway = Gateway::new(*capability, Arc::clone(&context));
        gateway.configure(elements)?;
        println!("  + {capability} ({} element(s))", elements.len());
        for line in describe(gateway.kind(), &context.config) {
            println!("      {line}");
        }
    }
    if routed.is_empty() {
        println!("  (no enabled gateways)");
    }
    Ok(())
}

/// One line per host change the gateway would make.
fn describe(kind: &GatewayKind, host: &HostConfig) -> Vec<String> {
    match kind {
        GatewayKind::Cgroups(g) => g
            .settings()
            .iter()
            .map(|(setting, value)| format!("{setting} = {value}"))
            .collect(),
        GatewayKind::Network(g) => g
            .firewall_rules(&host.network.chain, "<veth>")
            .iter()
            .map(|rule| format!("iptables -I {rule}"))
            .collect(),
        GatewayKind::DeviceNode(g) => g
            .devices()
            .iter()
            .map(|d| match (d.major_minor, d.mode) {
                (Some((major, minor)), Some(mode)) => {
                    format!("mknod {} c {major} {minor} (mode {mode:o})", d.name)
                }
                (_, Some(mode)) => format!("mknod {} as on the host (mode {mode:o})", d.name),
                _ => format!("mknod {} as on the host", d.name),
            })
            .collect(),
        GatewayKind::File(g) => g
            .files()
            .iter()
            .map(|f| {
                let how = if f.write_buffer {
                    "overlay"
                } else if f.read_only {
                    "bind ro"
                } else {
                    "bind rw"
                };
                format!(
                    "{how} {} -> {}",
                    f.path_host.display(),
                    f.path_container.display()
                )
            })
            .collect(),
        GatewayKind::DBus(g) => g
            .buses()
            .iter()
            .map(|bus| format!("proxy {} bus", bus.as_str()))
            .collect(),
        GatewayKind::PulseAudio(g) => vec![format!("audio: {}", g.audio())],
        GatewayKind::Wayland(g) => vec![format!("display: {}", g.enabled())],
        GatewayKind::Environment(g) => g
            .vars()
            .iter()
            .map(|v| {
                let op = if v.append { "+=" } else { "=" };
                format!("{}{op}{}", v.name, v.value)
            })
            .collect(),
    }
}
