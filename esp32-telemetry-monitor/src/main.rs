#[cfg(feature = "bluez")]
mod bluez;
mod config;

use crate::config::Config;
use esp32_telemetry::simulator::SimulatedTransport;
use esp32_telemetry::{LinkConfig, LinkEvent, LinkStatus, TelemetryLink, Transport};
use eyre::eyre;
use futures::{Stream, StreamExt};
use stable_eyre::eyre;
use stable_eyre::eyre::WrapErr;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), eyre::Report> {
    stable_eyre::install()?;
    pretty_env_logger::init();
    color_backtrace::install();

    let config = Config::from_file()?;
    let link_config = config.link.to_link_config();

    if config.monitor.simulate {
        let transport = SimulatedTransport::new(link_config.service, link_config.channels.clone());
        run_link(transport, link_config).await
    } else {
        run_bluez(link_config).await
    }
}

#[cfg(feature = "bluez")]
async fn run_bluez(link_config: LinkConfig) -> Result<(), eyre::Report> {
    // Connect a Bluetooth session.
    let (dbus_handle, transport) = bluez::BluezTransport::new().await?;

    tokio::select! {
        res = dbus_handle => {
            res?;
            Err(eyre!("D-Bus connection lost"))
        }
        res = run_link(transport, link_config) => res,
    }
}

#[cfg(not(feature = "bluez"))]
async fn run_bluez(_link_config: LinkConfig) -> Result<(), eyre::Report> {
    eyre::bail!(
        "Built without BlueZ support. Set simulate = true in the [monitor] section, or rebuild \
         with --features bluez."
    )
}

/// Run a link until it fails or the user asks to stop, printing everything it reports.
async fn run_link<T: Transport>(transport: T, link_config: LinkConfig) -> Result<(), eyre::Report> {
    println!(
        "Scanning for devices matching {:?}",
        link_config.filter.name_contains
    );
    let (link_handle, link) = TelemetryLink::new(transport, link_config).await?;
    tokio::pin!(link_handle);
    let mut events = link.events();
    link.start_discovery();

    let outcome = tokio::select! {
        res = &mut link_handle => {
            res?;
            return Err(eyre!("Link stopped"));
        }
        status = print_events(&mut events) => match status {
            Some(status) => Err(eyre!("Link ended with status {}", status)),
            None => Err(eyre!("Link events ended")),
        },
        res = signal::ctrl_c() => {
            res.wrap_err("Waiting for Ctrl-C")?;
            println!("Disconnecting");
            link.disconnect();
            Ok(())
        }
    };

    // The link releases its connection once every handle to it is dropped.
    drop(link);
    link_handle.await?;
    outcome
}

/// Print events until the link reaches a status which it won't leave by itself, and return that
/// status.
async fn print_events(events: &mut (impl Stream<Item = LinkEvent> + Unpin)) -> Option<LinkStatus> {
    while let Some(event) = events.next().await {
        match event {
            LinkEvent::Status(state) => {
                println!("{}", state);
                if state.status.is_terminal() {
                    return Some(state.status);
                }
            }
            LinkEvent::Sample(sample) => println!("{}", sample),
            LinkEvent::DecodeError(e) => println!("{}", e),
        }
    }
    None
}
