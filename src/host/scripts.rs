//! Demo host content: a directory of Rhai scripts. A change on disk triggers a
//! compile, and a clean compile triggers a full runtime reset in which every
//! script entity is torn down and rebuilt.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bevy::prelude::*;
use crossbeam_channel::{Receiver, Sender};
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rhai::Engine;
use serde::Serialize;
use serde_json::json;

use super::HostSignals;
use crate::bridge::handlers::{HandlerRegistry, HandlerResult};
use crate::buffers::{CompilationRecord, Diagnostic, Severity};
use crate::error::HandlerError;

/// Quiet period after the last file event before a reload runs.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(250);
const ENTRY_FN: &str = "update";

pub struct ScriptHostPlugin {
    dir: PathBuf,
    watch: bool,
}

impl ScriptHostPlugin {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            watch: true,
        }
    }

    /// `CONDUIT_SCRIPTS_DIR`, default `scripts`.
    pub fn from_env() -> Self {
        Self::new(std::env::var("CONDUIT_SCRIPTS_DIR").unwrap_or_else(|_| "scripts".to_string()))
    }

    pub fn watching(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }
}

impl Plugin for ScriptHostPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<HostSignals>()
            .init_resource::<ScriptLibrary>()
            .init_resource::<ReloadRequest>()
            .insert_resource(ScriptDir(self.dir.clone()))
            .add_systems(Startup, load_initial_scripts)
            .add_systems(Update, reload_scripts_when_due);

        if self.watch {
            let (tx, rx) = crossbeam_channel::unbounded::<()>();
            let dir = self.dir.clone();
            if let Err(e) = std::thread::Builder::new()
                .name("conduit-script-watch".to_string())
                .spawn(move || run_watcher(dir, tx))
            {
                warn!("[Conduit scripts] Watcher thread not started: {e}");
            }
            app.insert_resource(ScriptWatch {
                events: rx,
                dirty_since: None,
            });
        }
    }
}

#[derive(Resource, Clone, Debug)]
pub struct ScriptDir(pub PathBuf);

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ScriptEntry {
    pub file: String,
    pub functions: Vec<String>,
    pub has_update: bool,
}

/// Scripts from the last clean compile. Replaced wholesale on every reset.
#[derive(Resource, Serialize, Clone, Debug, Default)]
pub struct ScriptLibrary {
    pub generation: u64,
    pub scripts: BTreeMap<String, ScriptEntry>,
}

/// One entity per loaded script, rebuilt on every reset.
#[derive(Component, Clone, Debug)]
pub struct ScriptInstance {
    pub script: String,
    pub generation: u64,
}

/// Set by the `reload_scripts` tool; picked up on the next tick.
#[derive(Resource, Default)]
pub struct ReloadRequest {
    pub requested: bool,
}

#[derive(Resource)]
struct ScriptWatch {
    events: Receiver<()>,
    dirty_since: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Compile failed; the running scripts were left alone.
    Rejected { errors: usize },
    Reloaded { scripts: usize, generation: u64 },
}

/// Compiles every `*.rhai` file directly inside `dir`.
pub fn compile_dir(dir: &Path) -> (BTreeMap<String, ScriptEntry>, CompilationRecord) {
    let unit = dir.display().to_string();
    let mut scripts = BTreeMap::new();
    let mut diagnostics = Vec::new();

    let mut paths: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_script(path))
            .collect(),
        Err(e) => {
            diagnostics.push(Diagnostic {
                severity: Severity::Warning,
                message: format!("cannot read script directory: {e}"),
                file: unit.clone(),
                line: 0,
                column: 0,
            });
            Vec::new()
        }
    };
    paths.sort();

    let engine = Engine::new();
    for path in paths {
        let file = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();

        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(e) => {
                diagnostics.push(Diagnostic {
                    severity: Severity::Error,
                    message: format!("cannot read script: {e}"),
                    file,
                    line: 0,
                    column: 0,
                });
                continue;
            }
        };

        match engine.compile(&source) {
            Ok(ast) => {
                let functions: Vec<String> =
                    ast.iter_functions().map(|f| f.name.to_string()).collect();
                let has_update = functions.iter().any(|f| f == ENTRY_FN);
                if !has_update {
                    diagnostics.push(Diagnostic {
                        severity: Severity::Warning,
                        message: format!("no `{ENTRY_FN}` function; script will never run"),
                        file: file.clone(),
                        line: 0,
                        column: 0,
                    });
                }
                scripts.insert(
                    name,
                    ScriptEntry {
                        file,
                        functions,
                        has_update,
                    },
                );
            }
            Err(rhai::ParseError(kind, pos)) => diagnostics.push(Diagnostic {
                severity: Severity::Error,
                message: kind.to_string(),
                file,
                line: pos.line().unwrap_or(0) as u32,
                column: pos.position().unwrap_or(0) as u32,
            }),
        }
    }

    (scripts, CompilationRecord::new(unit, diagnostics))
}

fn is_script(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|ext| ext == "rhai")
}

/// Compile, then reset and rebuild the script world if the compile was clean.
pub fn run_reload(world: &mut World, dir: &Path, signals: &HostSignals) -> ReloadOutcome {
    signals.notify_compilation_started();
    let (scripts, record) = compile_dir(dir);
    signals.notify_compilation_finished(&record);

    if record.has_errors() {
        let errors = record
            .diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count();
        warn!("[Conduit scripts] Compile failed with {errors} error(s); keeping current scripts");
        return ReloadOutcome::Rejected { errors };
    }

    signals.notify_before_reset();
    let outcome = rebuild(world, scripts);
    signals.notify_after_reset();
    outcome
}

fn rebuild(world: &mut World, scripts: BTreeMap<String, ScriptEntry>) -> ReloadOutcome {
    let stale: Vec<Entity> = world
        .query_filtered::<Entity, With<ScriptInstance>>()
        .iter(world)
        .collect();
    for entity in stale {
        world.despawn(entity);
    }

    let generation = world
        .get_resource::<ScriptLibrary>()
        .map_or(0, |library| library.generation)
        + 1;
    for name in scripts.keys() {
        world.spawn((
            Name::new(format!("script:{name}")),
            ScriptInstance {
                script: name.clone(),
                generation,
            },
        ));
    }
    let count = scripts.len();
    world.insert_resource(ScriptLibrary {
        generation,
        scripts,
    });
    info!("[Conduit scripts] Loaded {count} script(s), generation {generation}");
    ReloadOutcome::Reloaded {
        scripts: count,
        generation,
    }
}

/// First load. Nothing is running yet, so there is nothing to reset.
fn load_initial_scripts(world: &mut World) {
    let dir = world.resource::<ScriptDir>().0.clone();
    let signals = world.resource::<HostSignals>().clone();
    signals.notify_compilation_started();
    let (scripts, record) = compile_dir(&dir);
    signals.notify_compilation_finished(&record);
    if record.has_errors() {
        warn!("[Conduit scripts] Initial compile of {} failed", dir.display());
        return;
    }
    rebuild(world, scripts);
}

fn reload_scripts_when_due(world: &mut World) {
    let now = Instant::now();
    let mut due = std::mem::take(&mut world.resource_mut::<ReloadRequest>().requested);
    if let Some(mut watch) = world.get_resource_mut::<ScriptWatch>() {
        if watch.events.try_iter().count() > 0 {
            watch.dirty_since = Some(now);
        }
        if watch
            .dirty_since
            .is_some_and(|since| now.duration_since(since) >= RELOAD_DEBOUNCE)
        {
            watch.dirty_since = None;
            due = true;
        }
    }
    if !due {
        return;
    }
    let dir = world.resource::<ScriptDir>().0.clone();
    let signals = world.resource::<HostSignals>().clone();
    run_reload(world, &dir, &signals);
}

fn run_watcher(dir: PathBuf, tx: Sender<()>) {
    let mut watcher: RecommendedWatcher =
        match notify::recommended_watcher(move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                let touches_script = matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) && event
                    .paths
                    .iter()
                    .any(|p| p.extension().is_some_and(|ext| ext == "rhai"));
                if touches_script {
                    let _ = tx.send(());
                }
            }
        }) {
            Ok(w) => w,
            Err(e) => {
                warn!("[Conduit scripts] Failed to create watcher: {e}");
                return;
            }
        };

    if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
        warn!("[Conduit scripts] Failed to watch {}: {e}", dir.display());
        return;
    }
    info!("[Conduit scripts] Watching {}", dir.display());

    // The watcher stops when dropped, so this thread keeps it alive.
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}

/// Adds the script host's tool and resource to `registry`.
pub fn register_script_handlers(registry: HandlerRegistry) -> HandlerRegistry {
    registry
        .tool_on_world("reload_scripts", schedule_reload)
        .resource_on_world("scripts", describe_scripts)
}

fn schedule_reload(world: &mut World, _params: serde_json::Value) -> HandlerResult {
    let mut request = world
        .get_resource_mut::<ReloadRequest>()
        .ok_or_else(|| HandlerError::new("unavailable", "script host is not installed"))?;
    request.requested = true;
    Ok(json!({ "scheduled": true }))
}

fn describe_scripts(world: &mut World, _params: serde_json::Value) -> HandlerResult {
    let library = world
        .get_resource::<ScriptLibrary>()
        .ok_or_else(|| HandlerError::new("unavailable", "script host is not installed"))?;
    serde_json::to_value(library).map_err(|e| HandlerError::new("internal", e.to_string()))
}
