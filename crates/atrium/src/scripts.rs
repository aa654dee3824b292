//! # Script Sandbox
//!
//! Evaluates untrusted author-supplied script text in a context that can
//! observe only what the host hands it.
//!
//! ## Capability surface
//!
//! - diagnostic log sink (`log`, `error`), world time
//! - Vec3 / Quat / Euler value types with lerp and slerp helpers
//! - number parsing, `clamp`, `DEG2RAD` / `RAD2DEG`, `uid()`
//! - the three proxies bound at call time: `world`, `app`, `fetch`
//!
//! No file system, no process, no sockets, no host reflection: the engine
//! starts with nothing and only the functions below are registered. Runaway
//! scripts are cut off by operation/recursion/size limits.
//!
//! ## State model
//!
//! Scripts do not get to keep live host objects. Each handler call receives
//! a `shared` map; the sandbox persists that map per (blueprint, version),
//! so re-execution of the same source across rebuilds sees its own state
//! and a version bump starts clean. Mutations of the world are collected as
//! [`ScriptEffects`] and applied by the caller after the handler returns -
//! a throwing script therefore cannot leave a half-applied world.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rhai::{Dynamic, Engine, Scope, AST};

use atrium_core::short_id;
use atrium_shared::math::{DEG2RAD, RAD2DEG};
use atrium_shared::{Mat4, Quat, Value, Vec3};

/// Script subsystem failures. Always caught by the caller and routed to
/// `App::crash`, never unwound through the engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    /// Source did not parse.
    #[error("script compile error: {0}")]
    Compile(String),
    /// A handler threw or hit a sandbox limit.
    #[error("script runtime error: {0}")]
    Runtime(String),
}

/// Which handlers a compiled script defines.
///
/// This is the hot-event subscription record: an app is hot iff its script
/// has an update-phase handler.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandlerSet {
    /// `start()`
    pub start: bool,
    /// `fixed_update(dt)`
    pub fixed_update: bool,
    /// `update(dt)`
    pub update: bool,
    /// `late_update(dt)`
    pub late_update: bool,
    /// `destroy()`
    pub destroy: bool,
    /// `on_event(name, data)`
    pub on_event: bool,
    /// `on_fetch(id, ok, body)`
    pub on_fetch: bool,
}

impl HandlerSet {
    /// True when the script wants per-frame callbacks.
    #[must_use]
    pub const fn needs_tick(&self) -> bool {
        self.fixed_update || self.update || self.late_update
    }
}

/// Mutations a handler asked for, applied by the caller afterwards.
#[derive(Clone, Debug, Default)]
pub struct ScriptEffects {
    /// Local bus emissions: (event name, payload).
    pub emits: Vec<(String, Value)>,
    /// Entity events to broadcast to peers: (event name, payload).
    pub sends: Vec<(String, Value)>,
    /// Replacement for the app's opaque state, if the script set it.
    pub state: Option<Value>,
    /// Requested move of the app root.
    pub move_to: Option<Vec3>,
    /// Fetches started this call: (request id, url).
    pub fetches: Vec<(i64, String)>,
}

type SharedEffects = Arc<Mutex<ScriptEffects>>;

/// Host context for one handler call.
#[derive(Clone, Debug)]
pub struct ScriptCtx {
    /// App entity id (hex).
    pub app_id: String,
    /// App root position at frame start.
    pub position: Vec3,
    /// App opaque state as of this call.
    pub state: Value,
    /// Seconds since the world started.
    pub time: f32,
}

/// The arguments a handler receives.
#[derive(Clone, Debug)]
pub enum HandlerArgs {
    /// No arguments (`start`, `destroy`).
    None,
    /// Frame delta (`fixed_update`, `update`, `late_update`).
    Dt(f32),
    /// Entity event (`on_event`).
    Event {
        /// Event name.
        name: String,
        /// Event payload.
        data: Value,
    },
    /// Fetch completion (`on_fetch`).
    Fetch {
        /// Request id returned by `fetch`.
        request: i64,
        /// Whether the fetch succeeded.
        ok: bool,
        /// Body text on success, error text on failure.
        body: String,
    },
}

// ============================================================================
// PROXIES
// ============================================================================

/// The `world` capability handed to scripts.
#[derive(Clone)]
pub struct WorldProxy {
    effects: SharedEffects,
    time: f32,
}

/// The `app` capability handed to scripts.
#[derive(Clone)]
pub struct AppProxy {
    effects: SharedEffects,
    id: String,
    position: Vec3,
    state: Dynamic,
}

/// The `fetch` capability handed to scripts.
#[derive(Clone)]
pub struct FetchProxy {
    effects: SharedEffects,
    next_request: Arc<AtomicI64>,
}

// ============================================================================
// SANDBOX
// ============================================================================

/// Isolated evaluator for app scripts.
pub struct ScriptSandbox {
    engine: Engine,
    compiled: HashMap<(String, u32), Arc<AST>>,
    shared_state: HashMap<(String, u32), rhai::Map>,
    next_request: Arc<AtomicI64>,
    started: Instant,
}

impl ScriptSandbox {
    /// Creates a sandbox with the capability surface registered and the
    /// runaway limits armed.
    #[must_use]
    pub fn new() -> Self {
        let mut engine = Engine::new();

        // Runaway protection.
        engine.set_max_operations(1_000_000);
        engine.set_max_call_levels(32);
        engine.set_max_string_size(1_000_000);
        engine.set_max_array_size(100_000);
        engine.set_max_map_size(100_000);
        engine.set_max_expr_depths(64, 64);

        // Diagnostics.
        engine.register_fn("log", |msg: &str| {
            tracing::info!(target: "script", "{msg}");
        });
        engine.register_fn("error", |msg: &str| {
            tracing::error!(target: "script", "{msg}");
        });

        // Numbers.
        engine.register_fn("parse_num", |s: &str| s.trim().parse::<f32>().unwrap_or(f32::NAN));
        engine.register_fn("clamp", |x: f32, min: f32, max: f32| x.clamp(min, max));
        engine.register_fn("lerp", |a: f32, b: f32, t: f32| a + (b - a) * t);
        engine.register_fn("uid", short_id);

        // Vector math.
        engine
            .register_type_with_name::<Vec3>("Vec3")
            .register_fn("vec3", Vec3::new)
            .register_get("x", |v: &mut Vec3| v.x)
            .register_get("y", |v: &mut Vec3| v.y)
            .register_get("z", |v: &mut Vec3| v.z)
            .register_fn("+", |a: Vec3, b: Vec3| a + b)
            .register_fn("-", |a: Vec3, b: Vec3| a - b)
            .register_fn("*", |a: Vec3, s: f32| a * s)
            .register_fn("length", Vec3::length)
            .register_fn("distance", Vec3::distance)
            .register_fn("dot", Vec3::dot)
            .register_fn("cross", Vec3::cross)
            .register_fn("normalize", Vec3::normalized)
            .register_fn("lerp", Vec3::lerp)
            .register_fn("to_string", |v: &mut Vec3| format!("({}, {}, {})", v.x, v.y, v.z));

        engine
            .register_type_with_name::<Quat>("Quat")
            .register_fn("quat", Quat::new)
            .register_fn("quat_identity", || Quat::IDENTITY)
            .register_fn("quat_axis_angle", Quat::from_axis_angle)
            .register_fn("quat_yaw", Quat::from_yaw)
            .register_fn("euler", |x: f32, y: f32, z: f32| {
                atrium_shared::Euler::new(x, y, z).to_quat()
            })
            .register_get("x", |q: &mut Quat| q.x)
            .register_get("y", |q: &mut Quat| q.y)
            .register_get("z", |q: &mut Quat| q.z)
            .register_get("w", |q: &mut Quat| q.w)
            .register_fn("*", |a: Quat, b: Quat| a * b)
            .register_fn("rotate", Quat::rotate)
            .register_fn("slerp", Quat::slerp);

        engine
            .register_type_with_name::<Mat4>("Mat4")
            .register_fn("mat4_identity", || Mat4::IDENTITY)
            .register_fn("mat4_from_trs", |position: Vec3, rotation: Quat, scale: Vec3| {
                Mat4::from_transform(atrium_shared::Transform::new(position, rotation, scale))
            })
            .register_fn("*", Mat4::mul)
            .register_fn("transform_point", Mat4::transform_point);

        // Proxies.
        engine
            .register_type_with_name::<WorldProxy>("World")
            .register_fn("time", |w: &mut WorldProxy| w.time)
            .register_fn("emit", |w: &mut WorldProxy, name: &str, data: Dynamic| {
                let payload = dynamic_to_value(&data);
                w.effects.lock().emits.push((name.to_owned(), payload));
            });

        engine
            .register_type_with_name::<AppProxy>("App")
            .register_fn("id", |a: &mut AppProxy| a.id.clone())
            .register_fn("position", |a: &mut AppProxy| a.position)
            .register_fn("state", |a: &mut AppProxy| a.state.clone())
            .register_fn("set_state", |a: &mut AppProxy, state: Dynamic| {
                a.effects.lock().state = Some(dynamic_to_value(&state));
            })
            .register_fn("move_to", |a: &mut AppProxy, target: Vec3| {
                a.effects.lock().move_to = Some(target);
            })
            .register_fn("send", |a: &mut AppProxy, name: &str, data: Dynamic| {
                let payload = dynamic_to_value(&data);
                a.effects.lock().sends.push((name.to_owned(), payload));
            });

        engine
            .register_type_with_name::<FetchProxy>("Fetch")
            .register_fn("fetch", |f: &mut FetchProxy, url: &str| {
                let request = f.next_request.fetch_add(1, Ordering::Relaxed);
                f.effects.lock().fetches.push((request, url.to_owned()));
                request
            });

        Self {
            engine,
            compiled: HashMap::new(),
            shared_state: HashMap::new(),
            next_request: Arc::new(AtomicI64::new(1)),
            started: Instant::now(),
        }
    }

    /// Seconds since the sandbox (world) started.
    #[must_use]
    pub fn now(&self) -> f32 {
        self.started.elapsed().as_secs_f32()
    }

    /// Compiles `source` for (blueprint, version), caching the result, and
    /// reports which handlers it defines.
    pub fn compile(&mut self, blueprint: &str, version: u32, source: &str) -> Result<HandlerSet, ScriptError> {
        let key = (blueprint.to_owned(), version);
        let ast = if let Some(ast) = self.compiled.get(&key) {
            Arc::clone(ast)
        } else {
            let ast = self
                .engine
                .compile(source)
                .map_err(|err| ScriptError::Compile(err.to_string()))?;
            let ast = Arc::new(ast);
            self.compiled.insert(key.clone(), Arc::clone(&ast));
            ast
        };

        let mut handlers = HandlerSet::default();
        for f in ast.iter_functions() {
            match f.name {
                "start" => handlers.start = true,
                "fixed_update" => handlers.fixed_update = true,
                "update" => handlers.update = true,
                "late_update" => handlers.late_update = true,
                "destroy" => handlers.destroy = true,
                "on_event" => handlers.on_event = true,
                "on_fetch" => handlers.on_fetch = true,
                _ => {}
            }
        }
        Ok(handlers)
    }

    /// Calls one handler. `run_globals` additionally executes the script's
    /// top-level statements (the `start` call of a fresh build).
    ///
    /// Returns the effects the script queued. Errors are the caller's to
    /// route (to the app crash path); the sandbox itself stays usable.
    pub fn call(
        &mut self,
        blueprint: &str,
        version: u32,
        handler: &str,
        ctx: &ScriptCtx,
        args: &HandlerArgs,
        run_globals: bool,
    ) -> Result<ScriptEffects, ScriptError> {
        let key = (blueprint.to_owned(), version);
        let Some(ast) = self.compiled.get(&key).map(Arc::clone) else {
            return Err(ScriptError::Runtime(format!(
                "script for {blueprint} v{version} is not compiled"
            )));
        };

        let effects: SharedEffects = Arc::new(Mutex::new(ScriptEffects::default()));
        let shared = self.shared_state.entry(key.clone()).or_default().clone();
        let mut scope = self.build_scope(ctx, &effects, shared);

        let result = self.invoke(&ast, &mut scope, handler, args, run_globals);

        // Persist `shared` even when the handler threw: partially built
        // script state across a crash-rebuild mirrors the state model.
        if let Some(shared) = scope.get_value::<rhai::Map>("shared") {
            self.shared_state.insert(key, shared);
        }

        result.map_err(|err| ScriptError::Runtime(err.to_string()))?;
        let out = effects.lock().clone();
        Ok(out)
    }

    /// Executes only the script's top-level statements (a fresh build with
    /// no `start` handler).
    pub fn run_globals(&mut self, blueprint: &str, version: u32, ctx: &ScriptCtx) -> Result<ScriptEffects, ScriptError> {
        let key = (blueprint.to_owned(), version);
        let Some(ast) = self.compiled.get(&key).map(Arc::clone) else {
            return Err(ScriptError::Runtime(format!(
                "script for {blueprint} v{version} is not compiled"
            )));
        };
        let effects: SharedEffects = Arc::new(Mutex::new(ScriptEffects::default()));
        let shared = self.shared_state.entry(key.clone()).or_default().clone();
        let mut scope = self.build_scope(ctx, &effects, shared);
        let result = self.engine.run_ast_with_scope(&mut scope, &ast);
        if let Some(shared) = scope.get_value::<rhai::Map>("shared") {
            self.shared_state.insert(key, shared);
        }
        result.map_err(|err| ScriptError::Runtime(err.to_string()))?;
        let out = effects.lock().clone();
        Ok(out)
    }

    /// Drops compiled state and shared state for versions other than
    /// `keep_version` of a blueprint (called when a rebuild lands).
    pub fn retire_versions(&mut self, blueprint: &str, keep_version: u32) {
        self.compiled
            .retain(|(bp, v), _| bp != blueprint || *v == keep_version);
        self.shared_state
            .retain(|(bp, v), _| bp != blueprint || *v == keep_version);
    }

    fn build_scope(&self, ctx: &ScriptCtx, effects: &SharedEffects, shared: rhai::Map) -> Scope<'static> {
        let mut scope = Scope::new();
        scope.push_constant("DEG2RAD", DEG2RAD);
        scope.push_constant("RAD2DEG", RAD2DEG);
        scope.push(
            "world",
            WorldProxy {
                effects: Arc::clone(effects),
                time: ctx.time,
            },
        );
        scope.push(
            "app",
            AppProxy {
                effects: Arc::clone(effects),
                id: ctx.app_id.clone(),
                position: ctx.position,
                state: value_to_dynamic(&ctx.state),
            },
        );
        scope.push(
            "fetch",
            FetchProxy {
                effects: Arc::clone(effects),
                next_request: Arc::clone(&self.next_request),
            },
        );
        scope.push("shared", shared);
        scope
    }

    fn invoke(
        &self,
        ast: &AST,
        scope: &mut Scope<'_>,
        handler: &str,
        args: &HandlerArgs,
        run_globals: bool,
    ) -> Result<(), Box<rhai::EvalAltResult>> {
        if run_globals {
            self.engine.run_ast_with_scope(scope, ast)?;
        }
        let options = rhai::CallFnOptions::new().eval_ast(false).rewind_scope(false);
        let call = |scope: &mut Scope<'_>, fn_args: Vec<Dynamic>| {
            self.engine
                .call_fn_with_options::<Dynamic>(options, scope, ast, handler, fn_args)
                .map(|_| ())
        };
        match args {
            HandlerArgs::None => call(scope, vec![]),
            HandlerArgs::Dt(dt) => call(scope, vec![Dynamic::from(*dt)]),
            HandlerArgs::Event { name, data } => call(
                scope,
                vec![Dynamic::from(name.clone()), value_to_dynamic(data)],
            ),
            HandlerArgs::Fetch { request, ok, body } => call(
                scope,
                vec![
                    Dynamic::from(*request),
                    Dynamic::from(*ok),
                    Dynamic::from(body.clone()),
                ],
            ),
        }
    }
}

impl Default for ScriptSandbox {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// VALUE <-> DYNAMIC
// ============================================================================

/// Converts a payload value into a script value.
#[must_use]
pub fn value_to_dynamic(v: &Value) -> Dynamic {
    match v {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Int(i) => Dynamic::from(*i),
        Value::Float(f) => Dynamic::from(*f as f32),
        Value::Str(s) => Dynamic::from(s.clone()),
        Value::Bytes(b) => Dynamic::from_blob(b.clone()),
        Value::Array(items) => {
            let arr: rhai::Array = items.iter().map(value_to_dynamic).collect();
            Dynamic::from(arr)
        }
        Value::Object(map) => {
            let mut out = rhai::Map::new();
            for (key, value) in map {
                out.insert(key.as_str().into(), value_to_dynamic(value));
            }
            Dynamic::from(out)
        }
    }
}

/// Converts a script value back into a payload value. Host types map to
/// their wire forms; anything unrepresentable becomes Null.
#[must_use]
pub fn dynamic_to_value(d: &Dynamic) -> Value {
    if d.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = d.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(i) = d.as_int() {
        return Value::Int(i);
    }
    if let Ok(f) = d.as_float() {
        return Value::Float(f64::from(f));
    }
    if let Some(s) = d.clone().try_cast::<String>() {
        return Value::Str(s);
    }
    if let Some(s) = d.clone().try_cast::<rhai::ImmutableString>() {
        return Value::Str(s.to_string());
    }
    if let Some(b) = d.clone().try_cast::<rhai::Blob>() {
        return Value::Bytes(b);
    }
    if let Some(v) = d.clone().try_cast::<Vec3>() {
        return Value::from_vec3(v);
    }
    if let Some(q) = d.clone().try_cast::<Quat>() {
        return Value::from_quat(q);
    }
    if let Some(arr) = d.clone().try_cast::<rhai::Array>() {
        return Value::Array(arr.iter().map(dynamic_to_value).collect());
    }
    if let Some(map) = d.clone().try_cast::<rhai::Map>() {
        let mut out = std::collections::BTreeMap::new();
        for (key, value) in &map {
            out.insert(key.to_string(), dynamic_to_value(value));
        }
        return Value::Object(out);
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_shared::value::obj;

    fn ctx() -> ScriptCtx {
        ScriptCtx {
            app_id: "a1".to_owned(),
            position: Vec3::new(1.0, 0.0, 2.0),
            state: Value::object(),
            time: 3.5,
        }
    }

    #[test]
    fn test_handler_probe() {
        let mut sandbox = ScriptSandbox::new();
        let handlers = sandbox
            .compile("bp", 1, "fn start() {}\nfn update(dt) {}\n")
            .unwrap();
        assert!(handlers.start);
        assert!(handlers.update);
        assert!(!handlers.fixed_update);
        assert!(handlers.needs_tick());

        let quiet = sandbox.compile("bp2", 1, "fn on_event(name, data) {}").unwrap();
        assert!(!quiet.needs_tick());
        assert!(quiet.on_event);
    }

    #[test]
    fn test_compile_error_reported() {
        let mut sandbox = ScriptSandbox::new();
        assert!(matches!(
            sandbox.compile("bp", 1, "fn start( {"),
            Err(ScriptError::Compile(_))
        ));
    }

    #[test]
    fn test_effects_collected() {
        let mut sandbox = ScriptSandbox::new();
        let src = r#"
            fn start() {
                app.set_state(#{ count: 1 });
                app.send("spin", #{ speed: 2.0 });
                world.emit("ready", app.id());
                fetch.fetch("asset://aa.js");
            }
        "#;
        sandbox.compile("bp", 1, src).unwrap();
        let effects = sandbox
            .call("bp", 1, "start", &ctx(), &HandlerArgs::None, true)
            .unwrap();
        assert_eq!(effects.state.as_ref().and_then(|s| s.get("count")).and_then(Value::as_int), Some(1));
        assert_eq!(effects.sends.len(), 1);
        assert_eq!(effects.sends[0].0, "spin");
        assert_eq!(effects.emits.len(), 1);
        assert_eq!(effects.emits[0].1, Value::Str("a1".to_owned()));
        assert_eq!(effects.fetches.len(), 1);
        assert_eq!(effects.fetches[0].1, "asset://aa.js");
    }

    #[test]
    fn test_shared_state_survives_calls_and_isolates_versions() {
        let mut sandbox = ScriptSandbox::new();
        let src = r#"
            fn update(dt) {
                if !("n" in shared) { shared.n = 0; }
                shared.n += 1;
                app.set_state(#{ n: shared.n });
            }
        "#;
        sandbox.compile("bp", 1, src).unwrap();
        let first = sandbox
            .call("bp", 1, "update", &ctx(), &HandlerArgs::Dt(0.02), false)
            .unwrap();
        let second = sandbox
            .call("bp", 1, "update", &ctx(), &HandlerArgs::Dt(0.02), false)
            .unwrap();
        assert_eq!(first.state.unwrap().get("n").and_then(Value::as_int), Some(1));
        assert_eq!(second.state.unwrap().get("n").and_then(Value::as_int), Some(2));

        // A new version starts from a clean shared record.
        sandbox.compile("bp", 2, src).unwrap();
        let fresh = sandbox
            .call("bp", 2, "update", &ctx(), &HandlerArgs::Dt(0.02), false)
            .unwrap();
        assert_eq!(fresh.state.unwrap().get("n").and_then(Value::as_int), Some(1));
    }

    #[test]
    fn test_runtime_error_is_contained() {
        let mut sandbox = ScriptSandbox::new();
        sandbox
            .compile("bp", 1, "fn start() { this_fn_does_not_exist(); }")
            .unwrap();
        let err = sandbox.call("bp", 1, "start", &ctx(), &HandlerArgs::None, true);
        assert!(matches!(err, Err(ScriptError::Runtime(_))));

        // The sandbox stays usable afterwards.
        sandbox.compile("bp3", 1, "fn start() {}").unwrap();
        assert!(sandbox
            .call("bp3", 1, "start", &ctx(), &HandlerArgs::None, true)
            .is_ok());
    }

    #[test]
    fn test_runaway_loop_is_cut_off() {
        let mut sandbox = ScriptSandbox::new();
        sandbox
            .compile("bp", 1, "fn start() { loop { } }")
            .unwrap();
        assert!(matches!(
            sandbox.call("bp", 1, "start", &ctx(), &HandlerArgs::None, true),
            Err(ScriptError::Runtime(_))
        ));
    }

    #[test]
    fn test_event_args_cross_the_boundary() {
        let mut sandbox = ScriptSandbox::new();
        let src = r#"
            fn on_event(name, data) {
                app.set_state(#{ got: name, speed: data.speed });
            }
        "#;
        sandbox.compile("bp", 1, src).unwrap();
        let effects = sandbox
            .call(
                "bp",
                1,
                "on_event",
                &ctx(),
                &HandlerArgs::Event {
                    name: "spin".to_owned(),
                    data: obj(&[("speed", Value::Float(2.5))]),
                },
                false,
            )
            .unwrap();
        let state = effects.state.unwrap();
        assert_eq!(state.get("got").and_then(Value::as_str), Some("spin"));
        assert!((state.get("speed").and_then(Value::as_f32).unwrap() - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_value_dynamic_roundtrip() {
        let v = obj(&[
            ("a", Value::Int(1)),
            ("b", Value::Str("x".to_owned())),
            ("c", Value::Array(vec![Value::Bool(true), Value::Null])),
        ]);
        assert_eq!(dynamic_to_value(&value_to_dynamic(&v)), v);
    }

    #[test]
    fn test_no_filesystem_surface() {
        let mut sandbox = ScriptSandbox::new();
        sandbox
            .compile("bp", 1, r#"fn start() { open("/etc/passwd"); }"#)
            .unwrap();
        assert!(matches!(
            sandbox.call("bp", 1, "start", &ctx(), &HandlerArgs::None, true),
            Err(ScriptError::Runtime(_))
        ));
    }
}
