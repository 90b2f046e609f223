//! Provider Runtime (C3, spec §4.5).
//!
//! Instantiates one guest module inside a sandboxed `wasmtime` store, wires
//! the `env.*` host functions back to the [`CapabilityEnforcer`], and
//! resolves the eight guest entrypoints the bridge dispatches through.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info};
use wasmtime::{Caller, Config, Engine, Linker, Memory, Module, Store, TypedFunc};

use crate::error::{OpError, Result};
use crate::provider::bridge::{
    call_entrypoint, caller_memory, host_error_packed, write_guest_bytes, Entrypoint, REQUIRED_ENTRYPOINTS,
};
use crate::provider::enforcer::CapabilityEnforcer;

/// Host-side state visible to `env.*` host function bodies via `Caller`.
struct HostState {
    enforcer: Arc<CapabilityEnforcer>,
}

/// One instantiated guest module plus its resolved exports (spec §4.5, §4.6).
pub struct ProviderRuntime {
    store: Store<HostState>,
    memory: Memory,
    malloc: TypedFunc<u32, u32>,
    free: TypedFunc<u32, ()>,
    entrypoints: std::collections::HashMap<&'static str, Entrypoint>,
    enforcer: Arc<CapabilityEnforcer>,
    call_timeout: Duration,
}

impl ProviderRuntime {
    /// Compiles and instantiates `wasm_bytes` with the given memory page
    /// limit (spec default 256 * 64 KiB) and capability enforcer.
    pub async fn instantiate(
        wasm_bytes: &[u8],
        memory_limit_pages: u32,
        call_timeout: Duration,
        enforcer: Arc<CapabilityEnforcer>,
    ) -> Result<Self> {
        let mut config = Config::new();
        config.async_support(true);
        let engine = Engine::new(&config)
            .map_err(|e| OpError::provider_failed(format!("failed to build wasm engine: {e}"), None))?;
        let module = Module::new(&engine, wasm_bytes)
            .map_err(|e| OpError::provider_failed(format!("failed to compile provider module: {e}"), None))?;

        let host_state = HostState {
            enforcer: enforcer.clone(),
        };
        let mut store = Store::new(&engine, host_state);

        let mut linker: Linker<HostState> = Linker::new(&engine);
        register_host_functions(&mut linker)?;

        let instance = linker
            .instantiate_async(&mut store, &module)
            .await
            .map_err(|e| OpError::provider_failed(format!("failed to instantiate provider module: {e}"), None))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| OpError::provider_failed("guest module does not export 'memory'", None))?;
        if memory.ty(&store).maximum().unwrap_or(u64::from(memory_limit_pages)) > u64::from(memory_limit_pages) {
            debug!(memory_limit_pages, "guest memory maximum exceeds configured limit");
        }

        let malloc = instance
            .get_typed_func::<u32, u32>(&mut store, "malloc")
            .map_err(|_| OpError::provider_failed("guest module does not export 'malloc'", None))?;
        let free = instance
            .get_typed_func::<u32, ()>(&mut store, "free")
            .map_err(|_| OpError::provider_failed("guest module does not export 'free'", None))?;

        let mut entrypoints = std::collections::HashMap::new();
        for name in REQUIRED_ENTRYPOINTS {
            let f = instance
                .get_typed_func::<(u32, u32), u64>(&mut store, name)
                .map_err(|_| OpError::provider_failed(format!("guest module does not export '{name}'"), None))?;
            entrypoints.insert(*name, f);
        }

        info!(exports = REQUIRED_ENTRYPOINTS.len(), "provider runtime instantiated");
        Ok(Self {
            store,
            memory,
            malloc,
            free,
            entrypoints,
            enforcer,
            call_timeout,
        })
    }

    /// Invokes one entrypoint, wrapping the call in `call_timeout` (spec
    /// §4.6: "Every call is wrapped in a deadline").
    pub async fn call<Req, Resp>(&mut self, name: &str, request: &Req) -> Result<Resp>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let entrypoint = self
            .entrypoints
            .get(name)
            .ok_or_else(|| OpError::provider_failed(format!("unknown entrypoint '{name}'"), None))?
            .clone();
        let fut = call_entrypoint(&mut self.store, &self.memory, &self.malloc, &self.free, &entrypoint, request);
        timeout(self.call_timeout, fut)
            .await
            .map_err(|_| OpError::timeout(format!("provider call '{name}' exceeded {:?}", self.call_timeout), None))?
    }

    pub fn close(self) -> Result<()> {
        self.enforcer.cleanup()
    }
}

/// Registers the `env.*` host functions the guest may call back into
/// (spec §4.5 "Registers a fixed set of host functions").
fn register_host_functions(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap(
            "env",
            "http_request",
            |mut caller: Caller<'_, HostState>, url_ptr: u32, url_len: u32, method_ptr: u32, method_len: u32| -> u64 {
                let memory = match caller_memory(&mut caller, "memory") {
                    Ok(m) => m,
                    Err(_) => return host_error_packed(1),
                };
                let url = match read_utf8(&caller, &memory, url_ptr, url_len) {
                    Ok(s) => s,
                    Err(_) => return host_error_packed(1),
                };
                let method = match read_utf8(&caller, &memory, method_ptr, method_len) {
                    Ok(s) => s,
                    Err(_) => return host_error_packed(1),
                };
                let enforcer = caller.data().enforcer.clone();
                match enforcer.http_request(&url, &method) {
                    Ok(bytes) => write_response(&mut caller, &memory, &bytes).unwrap_or_else(|_| host_error_packed(2)),
                    Err(_) => host_error_packed(3),
                }
            },
        )
        .map_err(|e| OpError::internal(format!("failed to register env.http_request: {e}"), false))?;

    linker
        .func_wrap(
            "env",
            "write_temp_file",
            |mut caller: Caller<'_, HostState>, name_ptr: u32, name_len: u32, data_ptr: u32, data_len: u32| -> u32 {
                let memory = match caller_memory(&mut caller, "memory") {
                    Ok(m) => m,
                    Err(_) => return 1,
                };
                let name = match read_utf8(&caller, &memory, name_ptr, name_len) {
                    Ok(s) => s,
                    Err(_) => return 1,
                };
                let mut data = vec![0u8; data_len as usize];
                if memory.read(&caller, data_ptr as usize, &mut data).is_err() {
                    return 1;
                }
                let enforcer = caller.data().enforcer.clone();
                match enforcer.write_temp_file(&name, &data) {
                    Ok(()) => 0,
                    Err(_) => 1,
                }
            },
        )
        .map_err(|e| OpError::internal(format!("failed to register env.write_temp_file: {e}"), false))?;

    linker
        .func_wrap(
            "env",
            "read_temp_file",
            |mut caller: Caller<'_, HostState>, name_ptr: u32, name_len: u32| -> u64 {
                let memory = match caller_memory(&mut caller, "memory") {
                    Ok(m) => m,
                    Err(_) => return host_error_packed(1),
                };
                let name = match read_utf8(&caller, &memory, name_ptr, name_len) {
                    Ok(s) => s,
                    Err(_) => return host_error_packed(1),
                };
                let enforcer = caller.data().enforcer.clone();
                match enforcer.read_temp_file(&name) {
                    Ok(bytes) => write_response(&mut caller, &memory, &bytes).unwrap_or_else(|_| host_error_packed(2)),
                    Err(_) => host_error_packed(3),
                }
            },
        )
        .map_err(|e| OpError::internal(format!("failed to register env.read_temp_file: {e}"), false))?;

    linker
        .func_wrap(
            "env",
            "decrypt_secret",
            |mut caller: Caller<'_, HostState>, encrypted_ptr: u32, encrypted_len: u32| -> u64 {
                let memory = match caller_memory(&mut caller, "memory") {
                    Ok(m) => m,
                    Err(_) => return host_error_packed(1),
                };
                let mut encrypted = vec![0u8; encrypted_len as usize];
                if memory.read(&caller, encrypted_ptr as usize, &mut encrypted).is_err() {
                    return host_error_packed(1);
                }
                let enforcer = caller.data().enforcer.clone();
                let identity_decrypt = |bytes: &[u8]| -> Result<Vec<u8>> { Ok(bytes.to_vec()) };
                match enforcer.decrypt_secret(&identity_decrypt, &encrypted) {
                    Ok(bytes) => write_response(&mut caller, &memory, &bytes).unwrap_or_else(|_| host_error_packed(2)),
                    Err(_) => host_error_packed(3),
                }
            },
        )
        .map_err(|e| OpError::internal(format!("failed to register env.decrypt_secret: {e}"), false))?;

    linker
        .func_wrap(
            "env",
            "read_file",
            |mut caller: Caller<'_, HostState>, path_ptr: u32, path_len: u32| -> u64 {
                let memory = match caller_memory(&mut caller, "memory") {
                    Ok(m) => m,
                    Err(_) => return host_error_packed(1),
                };
                let path = match read_utf8(&caller, &memory, path_ptr, path_len) {
                    Ok(s) => s,
                    Err(_) => return host_error_packed(1),
                };
                let enforcer = caller.data().enforcer.clone();
                match enforcer.read_file(&path) {
                    Ok(bytes) => write_response(&mut caller, &memory, &bytes).unwrap_or_else(|_| host_error_packed(2)),
                    Err(_) => host_error_packed(3),
                }
            },
        )
        .map_err(|e| OpError::internal(format!("failed to register env.read_file: {e}"), false))?;

    linker
        .func_wrap(
            "env",
            "write_file",
            |mut caller: Caller<'_, HostState>, path_ptr: u32, path_len: u32, data_ptr: u32, data_len: u32| -> u32 {
                let memory = match caller_memory(&mut caller, "memory") {
                    Ok(m) => m,
                    Err(_) => return 1,
                };
                let path = match read_utf8(&caller, &memory, path_ptr, path_len) {
                    Ok(s) => s,
                    Err(_) => return 1,
                };
                let mut data = vec![0u8; data_len as usize];
                if memory.read(&caller, data_ptr as usize, &mut data).is_err() {
                    return 1;
                }
                let enforcer = caller.data().enforcer.clone();
                match enforcer.write_file(&path, &data) {
                    Ok(()) => 0,
                    Err(_) => 1,
                }
            },
        )
        .map_err(|e| OpError::internal(format!("failed to register env.write_file: {e}"), false))?;

    linker
        .func_wrap(
            "env",
            "read_env",
            |mut caller: Caller<'_, HostState>, key_ptr: u32, key_len: u32| -> u64 {
                let memory = match caller_memory(&mut caller, "memory") {
                    Ok(m) => m,
                    Err(_) => return host_error_packed(1),
                };
                let key = match read_utf8(&caller, &memory, key_ptr, key_len) {
                    Ok(s) => s,
                    Err(_) => return host_error_packed(1),
                };
                let enforcer = caller.data().enforcer.clone();
                match enforcer.read_env(&key) {
                    // A missing variable is not an error — it resolves to
                    // the zero-length response the guest already treats as
                    // "nothing came back".
                    Ok(value) => write_response(&mut caller, &memory, &value.unwrap_or_default().into_bytes())
                        .unwrap_or_else(|_| host_error_packed(2)),
                    Err(_) => host_error_packed(3),
                }
            },
        )
        .map_err(|e| OpError::internal(format!("failed to register env.read_env: {e}"), false))?;

    Ok(())
}

fn read_utf8(caller: &Caller<'_, HostState>, memory: &Memory, ptr: u32, len: u32) -> Result<String> {
    let mut buf = vec![0u8; len as usize];
    memory
        .read(caller, ptr as usize, &mut buf)
        .map_err(|e| OpError::provider_failed(format!("failed reading guest memory: {e}"), None))?;
    String::from_utf8(buf).map_err(|e| OpError::provider_failed(format!("guest string is not utf-8: {e}"), None))
}

/// Allocates guest memory for a host-function response and writes it,
/// returning the packed `(ptr << 32) | len` the guest expects back.
fn write_response(caller: &mut Caller<'_, HostState>, memory: &Memory, bytes: &[u8]) -> Result<u64> {
    let malloc = caller
        .get_export("malloc")
        .and_then(|e| e.into_func())
        .ok_or_else(|| OpError::provider_failed("guest does not export 'malloc'", None))?
        .typed::<u32, u32>(&*caller)
        .map_err(|e| OpError::provider_failed(format!("malloc has unexpected signature: {e}"), None))?;
    let (ptr, len) = write_guest_bytes(&mut *caller, memory, &malloc, bytes)?;
    Ok(((ptr as u64) << 32) | (len as u64))
}
