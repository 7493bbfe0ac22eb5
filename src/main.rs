use color_eyre::{eyre::eyre, Result};
use gcadapter::bridge::{Bridge, ChannelObserver, ControllerEvent};
use gcadapter::config::AppConfig;
use gcadapter::controller::{Buttons, RawControllerState};
use gcadapter::driver::SimulatedDriver;
use gcadapter::poller::PollerHandle;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

// Demo adapter address on the simulated bus
const DEMO_ADAPTER: u8 = 1;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load_or_default(config_path.as_deref())
        .map_err(|e| eyre!("Failed to load settings: {}", e))?;
    setup(config.log_level()?)?;
    info!("Starting with settings: {:?}", config);

    let driver = SimulatedDriver::new(config.simulation.clone());
    driver.attach_adapter(DEMO_ADAPTER);
    driver.plug(DEMO_ADAPTER, 0);

    let (observer, mut events) = ChannelObserver::channel(config.event_channel_capacity);
    let bridge = Bridge::open(
        Arc::new(driver.clone()),
        config.bridge.clone(),
        Arc::new(observer.lifecycle_only()),
    )
    .map_err(|e| eyre!("Failed to open controller bridge: {}", e))?;

    let poller = PollerHandle::spawn(bridge.registry(), Some(config.poller.clone()))
        .map_err(|e| eyre!("Failed to spawn poller: {}", e))?;
    let mut snapshots = poller.subscribe();

    // Lifecycle events
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ControllerEvent::Connected { id, timestamp } => {
                    info!("Connected {} at {}", id, timestamp.format("%H:%M:%S.%3f"))
                }
                ControllerEvent::Disconnected { id, timestamp } => {
                    info!("Disconnected {} at {}", id, timestamp.format("%H:%M:%S.%3f"))
                }
                ControllerEvent::Updated { id, .. } => debug!("Updated {}", id),
            }
        }
    });

    // Scripted input on the simulated adapter
    let scenario = tokio::spawn(run_scenario(driver.clone()));

    // Log snapshots once per second
    let mut report_timer = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = report_timer.tick() => {
                let snapshot = snapshots.borrow_and_update().clone();
                info!("Snapshot #{} with {} controllers", snapshot.sequence, snapshot.controllers.len());
                for (id, state) in &snapshot.controllers {
                    info!(
                        "  [{}] buttons={:#05x} stick=({:.2}, {:.2}) c=({:.2}, {:.2}) l={:.2} r={:.2}",
                        id,
                        state.buttons.bits(),
                        state.stick_x,
                        state.stick_y,
                        state.c_stick_x,
                        state.c_stick_y,
                        state.analog_l,
                        state.analog_r
                    );
                }
            }
            _ = tokio::time::sleep(Duration::ZERO), if scenario.is_finished() => {
                info!("Scenario finished");
                break;
            }
        }
    }

    poller.shutdown().await;
    tokio::task::spawn_blocking(move || bridge.close())
        .await
        .map_err(|e| eyre!("Bridge close task failed: {}", e))?
        .map_err(|e| eyre!("Failed to close controller bridge: {}", e))?;

    info!(
        "Driver contexts opened={} closed={}",
        driver.contexts_opened(),
        driver.contexts_closed()
    );
    Ok(())
}

async fn run_scenario(driver: SimulatedDriver) {
    let step = Duration::from_millis(500);

    for frame in 0..8u8 {
        tokio::time::sleep(step).await;
        let raw = RawControllerState {
            buttons: if frame % 2 == 0 { Buttons::A.bits() } else { 0 },
            stick_x: 128u8.wrapping_add(frame * 15),
            stick_y: 128,
            c_stick_x: 128,
            c_stick_y: 128u8.wrapping_sub(frame * 15),
            trigger_l: frame * 30,
            trigger_r: 0,
        };
        if !driver.set_input(DEMO_ADAPTER, 0, raw) {
            warn!("Controller on port 0 is not plugged");
        }

        match frame {
            2 => {
                driver.plug(DEMO_ADAPTER, 1);
            }
            5 => {
                driver.unplug(DEMO_ADAPTER, 1);
            }
            _ => {}
        }
    }

    tokio::time::sleep(step).await;
    driver.detach_adapter(DEMO_ADAPTER);
    tokio::time::sleep(step).await;
}

fn setup(level: Level) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging(level);
    Ok(())
}

fn setup_logging(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
