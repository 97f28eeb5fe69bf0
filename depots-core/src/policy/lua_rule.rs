//! Lua rule: a sandboxed Lua 5.4 state defining `ploy(id, size)`.
//! Only the string, table, math and utf8 libraries are opened, and the base library is
//! stripped of file access, output, GC control and error trapping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use mlua::{ChunkMode, Function, HookTriggers, Lua, LuaOptions, RegistryKey, StdLib, Value, VmState};

use super::rule::{Rule, RuleError, RuleLimits, PLOY_FUNC};

/// Base-library globals removed from every rule state. `pcall`/`xpcall` go too,
/// otherwise a script could swallow the budget error and keep running.
const REMOVED_GLOBALS: [&str; 6] = ["dofile", "loadfile", "print", "collectgarbage", "pcall", "xpcall"];

/// `load` only accepts source text.
const TEXT_ONLY_LOAD: &str = r##"
local raw_load = load
load = function(chunk, name, _, ...)
    if select("#", ...) > 0 then
        return raw_load(chunk, name, "t", ...)
    end
    return raw_load(chunk, name, "t")
end
"##;

/// Instructions between budget checks.
const HOOK_STEP: u32 = 1_000;

struct LuaState {
    ploy: RegistryKey,
    /// VM instructions used by the current call.
    used: Arc<AtomicU64>,
    lua: Lua,
}

/// One interpreter state per rule; calls are serialized through the mutex.
pub struct LuaRule {
    state: Mutex<Option<LuaState>>,
}

impl LuaRule {
    /// Run `code` in a fresh sandbox and look up its `ploy` function.
    pub fn load(code: &str, limits: &RuleLimits) -> Result<Self, RuleError> {
        let libs = StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8;
        let lua = Lua::new_with(libs, LuaOptions::new()).map_err(runtime)?;
        lua.set_memory_limit(limits.memory_limit).map_err(runtime)?;
        sandbox(&lua).map_err(runtime)?;
        let used = install_budget(&lua, limits.max_operations);

        let chunk = lua
            .load(code)
            .set_mode(ChunkMode::Text)
            .into_function()
            .map_err(|e| RuleError::Compile(e.to_string()))?;
        chunk.call::<()>(()).map_err(runtime)?;

        let entry: Value = lua.globals().get(PLOY_FUNC).map_err(runtime)?;
        let Value::Function(func) = entry else {
            return Err(RuleError::MissingFunction(PLOY_FUNC));
        };
        let ploy = lua.create_registry_value(func).map_err(runtime)?;
        Ok(Self {
            state: Mutex::new(Some(LuaState { ploy, used, lua })),
        })
    }
}

fn sandbox(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals.set(name, Value::Nil)?;
    }
    lua.load(TEXT_ONLY_LOAD).exec()
}

/// Abort any call that runs more than `max_operations` VM instructions.
/// The returned counter must be reset before each call.
fn install_budget(lua: &Lua, max_operations: u64) -> Arc<AtomicU64> {
    let used = Arc::new(AtomicU64::new(0));
    let counter = used.clone();
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_STEP),
        move |_, _| {
            let total = counter.fetch_add(u64::from(HOOK_STEP), Ordering::Relaxed) + u64::from(HOOK_STEP);
            if total > max_operations {
                return Err(mlua::Error::runtime("instruction budget exhausted"));
            }
            Ok(VmState::Continue)
        },
    );
    used
}

impl Rule for LuaRule {
    fn evaluate(&self, id: &[u8], size: u64) -> Result<bool, RuleError> {
        let guard = self.state.lock().map_err(|_| RuleError::Poisoned)?;
        let state = guard.as_ref().ok_or(RuleError::Released)?;
        let func: Function = state.lua.registry_value(&state.ploy).map_err(runtime)?;
        state.used.store(0, Ordering::Relaxed);
        let id = state.lua.create_string(id).map_err(runtime)?;
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        let ret: Value = func.call((id, size)).map_err(runtime)?;
        match ret {
            Value::Boolean(verdict) => Ok(verdict),
            other => Err(RuleError::WrongReturnType(other.type_name().to_string())),
        }
    }

    fn release(&mut self) {
        let slot = match self.state.get_mut() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.take();
    }
}

fn runtime(err: mlua::Error) -> RuleError {
    RuleError::Runtime(err.to_string())
}
