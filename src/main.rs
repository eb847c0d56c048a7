use std::time::Duration;

use bevy::app::ScheduleRunnerPlugin;
use bevy::log::LogPlugin;
use bevy::prelude::*;

use conduit::host::log_capture::capture_layer;
use conduit::host::scripts::{register_script_handlers, ScriptHostPlugin};
use conduit::{BridgePlugin, HandlerRegistry, HostSignals};

const TICK_HZ: f64 = 60.0;

fn main() {
    let handlers = register_script_handlers(HandlerRegistry::builtin());

    let mut app = App::new();
    // Shared by the log layer, the script host and the bridge, so it has to
    // exist before any of their plugins build.
    app.insert_resource(HostSignals::default())
        .add_plugins(
            MinimalPlugins.set(ScheduleRunnerPlugin::run_loop(Duration::from_secs_f64(
                1.0 / TICK_HZ,
            ))),
        )
        .add_plugins(LogPlugin {
            custom_layer: capture_layer,
            ..default()
        })
        .add_plugins(ScriptHostPlugin::from_env())
        // Reads its config file here, so load messages reach the log layer.
        .add_plugins(BridgePlugin::default().with_handlers(handlers));

    info!("[Conduit] Headless host running at {TICK_HZ} ticks per second");
    app.run();
}
