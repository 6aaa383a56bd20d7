//! `capgate attach` — Activate gateways for a running process.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::Args;

use capgate_common::config::HostConfig;
use capgate_common::types::{Capability, ContainerId};
use capgate_gateway::{ContainerHandle, GatewaySet, HostContext, HostEnv, Profile};
use capgate_runtime::NamespaceContainer;

/// Arguments for the `attach` command.
#[derive(Args, Debug)]
pub struct AttachArgs {
    /// Process whose namespaces form the container.
    #[arg(long)]
    pub pid: u32,

    /// Root filesystem of the process, as seen from the host.
    #[arg(long)]
    pub rootfs: PathBuf,

    /// Container name used for sockets, interfaces and state. Defaults
    /// to `pid-<pid>`.
    #[arg(long)]
    pub id: Option<String>,

    /// Gateway configuration documents, merged in order.
    #[arg(long = "gateways", required = true)]
    pub gateways: Vec<PathBuf>,
}

const BOLD: &str = "\x1b[1m";
const GREEN: &str = "\x1b[32m";
const RESET: &str = "\x1b[0m";

/// Executes the `attach` command.
///
/// Activates every enabled gateway, waits for Ctrl+C, then tears the
/// gateways down in reverse order.
///
/// # Errors
///
/// Returns an error if configuration or activation fails, or if teardown
/// is incomplete.
pub fn execute(args: &AttachArgs, host: HostConfig) -> anyhow::Result<()> {
    let config = super::load_gateways(&args.gateways)?;
    let profile = Profile::from_config(&host);
    let routed = config.route(&profile)?;

    let id = ContainerId::new(args.id.clone().unwrap_or_else(|| format!("pid-{}", args.pid)));
    let gateway_dir = host.gateway_dir(id.as_str());
    let context = host_context(host, routed.contains_key(&Capability::Network))?;
    // Installed before any host mutation so a handler failure needs no teardown.
    let running = interrupt_flag()?;

    let mut seed = Vec::new();
    if let Some(path) = context.env.get("PATH") {
        seed.push(("PATH".to_string(), path.to_string()));
    }
    let container = Arc::new(
        NamespaceContainer::attach(id, args.pid, &args.rootfs, gateway_dir)
            .context("attaching to the process")?
            .with_env(seed),
    );
    let handle: Arc<dyn ContainerHandle> = Arc::<NamespaceContainer>::clone(&container);
    let mut set = GatewaySet::new(handle, Arc::new(context));

    if let Err(e) = config.apply(&mut set, &profile).and_then(|()| set.activate()) {
        shutdown(&mut set, &container);
        return Err(e).context("activating gateways");
    }

    eprintln!();
    eprintln!(
        "  {GREEN}{BOLD}{} gateway(s) active{RESET} for {}",
        set.len(),
        container.id()
    );
    for (name, value) in container.environment() {
        eprintln!("    {name}={value}");
    }
    wait_for_shutdown(&running);

    eprintln!();
    eprintln!("  Tearing down gateways...");
    let set_result = set.teardown();
    let detach_result = container.detach();
    set_result?;
    detach_result?;
    eprintln!("  {GREEN}All gateways torn down.{RESET}");
    Ok(())
}

#[cfg(target_os = "linux")]
fn host_context(host: HostConfig, needs_network: bool) -> anyhow::Result<HostContext> {
    use capgate_gateway::HostNetwork;

    let network = if needs_network {
        Some(Arc::new(
            HostNetwork::system(host.network.clone()).context("preparing host networking")?,
        ))
    } else {
        None
    };
    let context = HostContext::new(host, HostEnv::capture());
    Ok(match network {
        Some(network) => context.with_network(network),
        None => context,
    })
}

#[cfg(not(target_os = "linux"))]
fn host_context(host: HostConfig, needs_network: bool) -> anyhow::Result<HostContext> {
    if needs_network {
        anyhow::bail!("the network gateway is only supported on Linux");
    }
    Ok(HostContext::new(host, HostEnv::capture()))
}

fn shutdown(set: &mut GatewaySet, container: &NamespaceContainer) {
    if let Err(e) = set.teardown() {
        tracing::error!(error = %e, "teardown after failed activation is incomplete");
    }
    if let Err(e) = container.detach() {
        tracing::error!(error = %e, "detach after failed activation is incomplete");
    }
}

fn interrupt_flag() -> anyhow::Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;
    Ok(running)
}

fn wait_for_shutdown(running: &AtomicBool) {
    eprintln!();
    eprintln!("  Press {BOLD}Ctrl+C{RESET} to tear down the gateways...");
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(250));
    }
}
