use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use wasmtime::{
    Caller, Config, Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder,
};

use lookout_core::{LookoutError, Result, now_ms};

use crate::api::{HostApi, ResponseHandler};

/// Per-execution state reachable from host functions.
struct HostState {
    api: Arc<dyn HostApi>,
    rt: Handle,
    /// Buffer the guest drains via `host_read_result`.
    result: Vec<u8>,
    /// First tool failure; the iteration fails even if the guest ran on.
    tool_failure: Option<(String, String)>,
    limiter: StoreLimits,
}

/// The WASM capability sandbox.
///
/// The engine is compiled once; each handler execution gets a fresh store
/// with its own fuel budget and memory cap, so a runaway handler burns out
/// without touching the scheduler.
pub struct WasmSandbox {
    engine: Engine,
    fuel: u64,
    max_memory_bytes: usize,
}

impl WasmSandbox {
    pub fn new(fuel: u64, max_memory_mb: u64) -> Result<Self> {
        let mut config = Config::new();
        config.consume_fuel(true);
        let engine = Engine::new(&config).map_err(|e| LookoutError::Sandbox {
            tool: "engine".into(),
            reason: format!("failed to create WASM engine: {e}"),
        })?;
        Ok(Self {
            engine,
            fuel,
            max_memory_bytes: (max_memory_mb as usize) * 1024 * 1024,
        })
    }
}

#[async_trait]
impl ResponseHandler for WasmSandbox {
    async fn handle(&self, code: &str, response: &str, api: Arc<dyn HostApi>) -> Result<()> {
        let module_bytes = BASE64
            .decode(code.trim())
            .map_err(|e| LookoutError::Sandbox {
                tool: "handler".into(),
                reason: format!("code payload is not valid base64: {e}"),
            })?;

        let engine = self.engine.clone();
        let fuel = self.fuel;
        let max_memory = self.max_memory_bytes;
        let response = response.to_string();
        let rt = Handle::current();

        // Guest execution is synchronous and possibly long; keep it off the
        // async workers. Host calls hop back onto the runtime via `rt`.
        tokio::task::spawn_blocking(move || {
            run_guest(engine, fuel, max_memory, module_bytes, response, api, rt)
        })
        .await
        .map_err(|e| LookoutError::Sandbox {
            tool: "handler".into(),
            reason: format!("sandbox thread failed: {e}"),
        })?
    }
}

fn sandbox_err(tool: &str, reason: String) -> LookoutError {
    LookoutError::Sandbox {
        tool: tool.to_string(),
        reason,
    }
}

fn run_guest(
    engine: Engine,
    fuel: u64,
    max_memory: usize,
    module_bytes: Vec<u8>,
    response: String,
    api: Arc<dyn HostApi>,
    rt: Handle,
) -> Result<()> {
    let agent = api.agent_id().to_string();
    let module = Module::new(&engine, &module_bytes)
        .map_err(|e| sandbox_err("handler", format!("failed to compile module: {e}")))?;

    let mut limits = StoreLimitsBuilder::new();
    if max_memory > 0 {
        limits = limits.memory_size(max_memory);
    }
    let mut store = Store::new(
        &engine,
        HostState {
            api,
            rt,
            result: Vec::new(),
            tool_failure: None,
            limiter: limits.build(),
        },
    );
    store.limiter(|state| &mut state.limiter);
    store
        .set_fuel(fuel)
        .map_err(|e| sandbox_err("handler", format!("failed to set fuel: {e}")))?;

    let mut linker: Linker<HostState> = Linker::new(&engine);
    register_host_fns(&mut linker).map_err(|e| sandbox_err("handler", e.to_string()))?;

    let instance = linker
        .instantiate(&mut store, &module)
        .map_err(|e| sandbox_err("handler", format!("failed to instantiate: {e}")))?;

    let memory = instance
        .get_memory(&mut store, "memory")
        .ok_or_else(|| sandbox_err("handler", "module does not export 'memory'".into()))?;
    let malloc = instance
        .get_typed_func::<u32, u32>(&mut store, "lookout_malloc")
        .map_err(|e| sandbox_err("handler", format!("missing export 'lookout_malloc': {e}")))?;
    let entry = instance
        .get_typed_func::<(u32, u32), ()>(&mut store, "lookout_handle")
        .map_err(|e| sandbox_err("handler", format!("missing export 'lookout_handle': {e}")))?;

    // Hand the raw response to the guest.
    let bytes = response.as_bytes();
    let ptr = malloc
        .call(&mut store, bytes.len() as u32)
        .map_err(|e| sandbox_err("lookout_malloc", e.to_string()))?;
    if !bytes.is_empty() {
        let start = ptr as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|&end| end <= memory.data_size(&store))
            .ok_or_else(|| sandbox_err("handler", "response exceeds guest memory".into()))?;
        memory.data_mut(&mut store)[start..end].copy_from_slice(bytes);
    }

    debug!(agent = %agent, module_bytes = module_bytes.len(), "running response handler");
    if let Err(e) = entry.call(&mut store, (ptr, bytes.len() as u32)) {
        warn!(agent = %agent, error = %e, "response handler trapped");
        return Err(sandbox_err("handler", e.to_string()));
    }

    // The guest may swallow a tool error and keep going; the iteration
    // still reports failure for it.
    if let Some((tool, reason)) = store.into_data().tool_failure {
        return Err(sandbox_err(&tool, reason));
    }
    Ok(())
}

/// Read a guest string; `None` on out-of-bounds.
fn read_guest_str(caller: &mut Caller<'_, HostState>, ptr: u32, len: u32) -> Option<String> {
    let memory = caller.get_export("memory")?.into_memory()?;
    let data = memory.data(&caller);
    let start = ptr as usize;
    let end = start.checked_add(len as usize)?;
    if end > data.len() {
        return None;
    }
    Some(String::from_utf8_lossy(&data[start..end]).into_owned())
}

fn record_failure(state: &mut HostState, tool: &str, reason: String) {
    warn!(tool, reason, "sandbox tool call failed");
    if state.tool_failure.is_none() {
        state.tool_failure = Some((tool.to_string(), reason));
    }
}

/// Run an action tool: 0 on success, 1 on failure.
fn action_status(
    caller: &mut Caller<'_, HostState>,
    tool: &str,
    result: Result<()>,
) -> u32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            record_failure(caller.data_mut(), tool, e.to_string());
            1
        }
    }
}

/// Stash a value tool's output for `host_read_result`; returns its length.
fn stash_result(caller: &mut Caller<'_, HostState>, tool: &str, result: Result<String>) -> u32 {
    match result {
        Ok(value) => {
            let len = value.len() as u32;
            caller.data_mut().result = value.into_bytes();
            len
        }
        Err(e) => {
            record_failure(caller.data_mut(), tool, e.to_string());
            caller.data_mut().result.clear();
            0
        }
    }
}

/// Record an out-of-bounds argument; returns the failure status.
fn bounds_failure(caller: &mut Caller<'_, HostState>, tool: &str) -> u32 {
    record_failure(
        caller.data_mut(),
        tool,
        "argument out of guest memory bounds".into(),
    );
    1
}

fn register_host_fns(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap("env", "host_time_ms", || -> f64 { now_ms() as f64 })?;

    linker.func_wrap(
        "env",
        "host_log",
        |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| {
            if let Some(message) = read_guest_str(&mut caller, ptr, len) {
                info!(agent = caller.data().api.agent_id(), "{message}");
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "host_read_result",
        |mut caller: Caller<'_, HostState>, out_ptr: u32, max_len: u32| -> u32 {
            let result = std::mem::take(&mut caller.data_mut().result);
            let n = result.len().min(max_len as usize);
            let Some(memory) = caller.get_export("memory").and_then(|e| e.into_memory()) else {
                return 0;
            };
            let start = out_ptr as usize;
            let Some(end) = start.checked_add(n) else { return 0 };
            let data = memory.data_mut(&mut caller);
            if end > data.len() {
                return 0;
            }
            data[start..end].copy_from_slice(&result[..n]);
            n as u32
        },
    )?;

    linker.func_wrap(
        "env",
        "host_get_memory",
        |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> u32 {
            let Some(target) = read_guest_str(&mut caller, ptr, len) else {
                bounds_failure(&mut caller, "get_memory");
                return 0;
            };
            let api = Arc::clone(&caller.data().api);
            let rt = caller.data().rt.clone();
            let result = rt.block_on(api.get_memory(&target));
            stash_result(&mut caller, "get_memory", result)
        },
    )?;

    linker.func_wrap(
        "env",
        "host_set_memory",
        |mut caller: Caller<'_, HostState>,
         target_ptr: u32,
         target_len: u32,
         value_ptr: u32,
         value_len: u32|
         -> u32 {
            let (Some(target), Some(value)) = (
                read_guest_str(&mut caller, target_ptr, target_len),
                read_guest_str(&mut caller, value_ptr, value_len),
            ) else {
                return bounds_failure(&mut caller, "set_memory");
            };
            let api = Arc::clone(&caller.data().api);
            let rt = caller.data().rt.clone();
            let result = rt.block_on(api.set_memory(&target, &value));
            action_status(&mut caller, "set_memory", result)
        },
    )?;

    linker.func_wrap(
        "env",
        "host_append_memory",
        |mut caller: Caller<'_, HostState>,
         target_ptr: u32,
         target_len: u32,
         value_ptr: u32,
         value_len: u32,
         sep_ptr: u32,
         sep_len: u32|
         -> u32 {
            let (Some(target), Some(value), Some(sep)) = (
                read_guest_str(&mut caller, target_ptr, target_len),
                read_guest_str(&mut caller, value_ptr, value_len),
                read_guest_str(&mut caller, sep_ptr, sep_len),
            ) else {
                return bounds_failure(&mut caller, "append_memory");
            };
            let api = Arc::clone(&caller.data().api);
            let rt = caller.data().rt.clone();
            let result = rt.block_on(api.append_memory(&target, &value, &sep));
            action_status(&mut caller, "append_memory", result)
        },
    )?;

    linker.func_wrap(
        "env",
        "host_start_agent",
        |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> u32 {
            let Some(id) = read_guest_str(&mut caller, ptr, len) else {
                return bounds_failure(&mut caller, "start_agent");
            };
            let api = Arc::clone(&caller.data().api);
            let rt = caller.data().rt.clone();
            let result = rt.block_on(api.start_agent(&id));
            action_status(&mut caller, "start_agent", result)
        },
    )?;

    linker.func_wrap(
        "env",
        "host_stop_agent",
        |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> u32 {
            let Some(id) = read_guest_str(&mut caller, ptr, len) else {
                return bounds_failure(&mut caller, "stop_agent");
            };
            let api = Arc::clone(&caller.data().api);
            let rt = caller.data().rt.clone();
            let result = rt.block_on(api.stop_agent(&id));
            action_status(&mut caller, "stop_agent", result)
        },
    )?;

    linker.func_wrap(
        "env",
        "host_send_message",
        |mut caller: Caller<'_, HostState>,
         service_ptr: u32,
         service_len: u32,
         target_ptr: u32,
         target_len: u32,
         body_ptr: u32,
         body_len: u32|
         -> u32 {
            let (Some(service), Some(target), Some(body)) = (
                read_guest_str(&mut caller, service_ptr, service_len),
                read_guest_str(&mut caller, target_ptr, target_len),
                read_guest_str(&mut caller, body_ptr, body_len),
            ) else {
                return bounds_failure(&mut caller, "send_message");
            };
            let api = Arc::clone(&caller.data().api);
            let rt = caller.data().rt.clone();
            let result = rt.block_on(api.send_message(&service, &target, &body));
            action_status(&mut caller, "send_message", result)
        },
    )?;

    linker.func_wrap(
        "env",
        "host_notify",
        |mut caller: Caller<'_, HostState>,
         title_ptr: u32,
         title_len: u32,
         body_ptr: u32,
         body_len: u32|
         -> u32 {
            let (Some(title), Some(body)) = (
                read_guest_str(&mut caller, title_ptr, title_len),
                read_guest_str(&mut caller, body_ptr, body_len),
            ) else {
                return bounds_failure(&mut caller, "notify");
            };
            let api = Arc::clone(&caller.data().api);
            let rt = caller.data().rt.clone();
            let result = rt.block_on(api.notify(&title, &body));
            action_status(&mut caller, "notify", result)
        },
    )?;

    linker.func_wrap(
        "env",
        "host_start_clip",
        |mut caller: Caller<'_, HostState>| -> u32 {
            let api = Arc::clone(&caller.data().api);
            let rt = caller.data().rt.clone();
            let result = rt.block_on(api.start_clip());
            action_status(&mut caller, "start_clip", result)
        },
    )?;

    linker.func_wrap(
        "env",
        "host_stop_clip",
        |mut caller: Caller<'_, HostState>| -> u32 {
            let api = Arc::clone(&caller.data().api);
            let rt = caller.data().rt.clone();
            let result = rt.block_on(api.stop_clip());
            action_status(&mut caller, "stop_clip", result)
        },
    )?;

    linker.func_wrap(
        "env",
        "host_mark_clip",
        |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> u32 {
            let Some(label) = read_guest_str(&mut caller, ptr, len) else {
                return bounds_failure(&mut caller, "mark_clip");
            };
            let api = Arc::clone(&caller.data().api);
            let rt = caller.data().rt.clone();
            let result = rt.block_on(api.mark_clip(&label));
            action_status(&mut caller, "mark_clip", result)
        },
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records every capability call.
    #[derive(Default)]
    struct RecordingApi {
        calls: Mutex<Vec<(String, String)>>,
        fail_tool: Mutex<Option<String>>,
    }

    impl RecordingApi {
        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().clone()
        }

        fn record(&self, tool: &str, detail: String) -> Result<()> {
            if self.fail_tool.lock().as_deref() == Some(tool) {
                return Err(LookoutError::Sandbox {
                    tool: tool.into(),
                    reason: "scripted failure".into(),
                });
            }
            self.calls.lock().push((tool.to_string(), detail));
            Ok(())
        }
    }

    #[async_trait]
    impl HostApi for RecordingApi {
        fn agent_id(&self) -> &str {
            "self_agent"
        }
        async fn get_memory(&self, target: &str) -> Result<String> {
            self.record("get_memory", target.into())?;
            Ok("remembered".into())
        }
        async fn set_memory(&self, target: &str, value: &str) -> Result<()> {
            self.record("set_memory", format!("{target}={value}"))
        }
        async fn append_memory(&self, target: &str, value: &str, sep: &str) -> Result<()> {
            self.record("append_memory", format!("{target}+{value}+{sep}"))
        }
        async fn start_agent(&self, id: &str) -> Result<()> {
            self.record("start_agent", id.into())
        }
        async fn stop_agent(&self, id: &str) -> Result<()> {
            self.record("stop_agent", id.into())
        }
        async fn send_message(&self, service: &str, target: &str, body: &str) -> Result<()> {
            self.record("send_message", format!("{service}:{target}:{body}"))
        }
        async fn notify(&self, title: &str, body: &str) -> Result<()> {
            self.record("notify", format!("{title}|{body}"))
        }
        async fn start_clip(&self) -> Result<()> {
            self.record("start_clip", String::new())
        }
        async fn stop_clip(&self) -> Result<()> {
            self.record("stop_clip", String::new())
        }
        async fn mark_clip(&self, label: &str) -> Result<()> {
            self.record("mark_clip", label.into())
        }
    }

    fn encode(wat: &str) -> String {
        BASE64.encode(wat.as_bytes())
    }

    /// Calls start_clip, notify("alert", "seen it"), mark_clip("alert").
    const TOOL_CALLER: &str = r#"
        (module
          (import "env" "host_start_clip" (func $start_clip (result i32)))
          (import "env" "host_notify" (func $notify (param i32 i32 i32 i32) (result i32)))
          (import "env" "host_mark_clip" (func $mark (param i32 i32) (result i32)))
          (memory (export "memory") 1)
          (data (i32.const 16) "alert")
          (data (i32.const 32) "seen it")
          (global $bump (mut i32) (i32.const 1024))
          (func (export "lookout_malloc") (param i32) (result i32)
            (local i32)
            global.get $bump
            local.set 1
            global.get $bump
            local.get 0
            i32.add
            global.set $bump
            local.get 1)
          (func (export "lookout_handle") (param i32 i32)
            (drop (call $start_clip))
            (drop (call $notify (i32.const 16) (i32.const 5) (i32.const 32) (i32.const 7)))
            (drop (call $mark (i32.const 16) (i32.const 5)))))
    "#;

    /// Appends the raw response to the caller's own memory.
    const RESPONSE_APPENDER: &str = r#"
        (module
          (import "env" "host_append_memory"
            (func $append (param i32 i32 i32 i32 i32 i32) (result i32)))
          (memory (export "memory") 1)
          (global $bump (mut i32) (i32.const 1024))
          (func (export "lookout_malloc") (param i32) (result i32)
            (local i32)
            global.get $bump
            local.set 1
            global.get $bump
            local.get 0
            i32.add
            global.set $bump
            local.get 1)
          (func (export "lookout_handle") (param i32 i32)
            (drop (call $append
              (i32.const 0) (i32.const 0)
              (local.get 0) (local.get 1)
              (i32.const 0) (i32.const 0)))))
    "#;

    const TRAPPER: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "lookout_malloc") (param i32) (result i32) (i32.const 1024))
          (func (export "lookout_handle") (param i32 i32) unreachable))
    "#;

    const SPINNER: &str = r#"
        (module
          (memory (export "memory") 1)
          (func (export "lookout_malloc") (param i32) (result i32) (i32.const 1024))
          (func (export "lookout_handle") (param i32 i32)
            (loop $spin br $spin)))
    "#;

    fn sandbox() -> WasmSandbox {
        WasmSandbox::new(10_000_000, 16).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handler_reaches_every_requested_tool() {
        let api = Arc::new(RecordingApi::default());
        sandbox()
            .handle(&encode(TOOL_CALLER), "resp", api.clone())
            .await
            .unwrap();

        let calls = api.calls();
        assert_eq!(calls[0].0, "start_clip");
        assert_eq!(calls[1], ("notify".into(), "alert|seen it".into()));
        assert_eq!(calls[2], ("mark_clip".into(), "alert".into()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn response_text_is_visible_to_the_guest() {
        let api = Arc::new(RecordingApi::default());
        sandbox()
            .handle(&encode(RESPONSE_APPENDER), "the model said this", api.clone())
            .await
            .unwrap();

        assert_eq!(
            api.calls(),
            vec![(
                "append_memory".into(),
                "+the model said this+".into()
            )]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn guest_trap_is_caught_as_sandbox_error() {
        let api = Arc::new(RecordingApi::default());
        let err = sandbox().handle(&encode(TRAPPER), "x", api).await;
        assert!(matches!(err, Err(LookoutError::Sandbox { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn infinite_loop_burns_out_on_fuel() {
        let api = Arc::new(RecordingApi::default());
        let err = WasmSandbox::new(100_000, 16)
            .unwrap()
            .handle(&encode(SPINNER), "x", api)
            .await;
        assert!(matches!(err, Err(LookoutError::Sandbox { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_tool_call_fails_the_iteration() {
        let api = Arc::new(RecordingApi::default());
        *api.fail_tool.lock() = Some("notify".to_string());

        let err = sandbox().handle(&encode(TOOL_CALLER), "resp", api.clone()).await;
        match err {
            Err(LookoutError::Sandbox { tool, .. }) => assert_eq!(tool, "notify"),
            other => panic!("expected sandbox error, got {other:?}"),
        }
        // The guest kept going: mark_clip still ran after the failure.
        assert!(api.calls().iter().any(|(t, _)| t == "mark_clip"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn garbage_payload_is_rejected() {
        let api = Arc::new(RecordingApi::default());
        let err = sandbox().handle("not-base64!!!", "x", api.clone()).await;
        assert!(matches!(err, Err(LookoutError::Sandbox { .. })));

        let err = sandbox().handle(&BASE64.encode(b"not wasm"), "x", api).await;
        assert!(matches!(err, Err(LookoutError::Sandbox { .. })));
    }
}
