//! Host↔Guest Bridge (C2, spec §4.6).
//!
//! Marshals JSON requests across the WASM linear-memory boundary using the
//! `malloc`/`free` packed-`u64` calling convention and deserializes the
//! guest's JSON response.

use serde::de::DeserializeOwned;
use serde::Serialize;
use wasmtime::{AsContextMut, Caller, Memory, TypedFunc};

use crate::error::{OpError, Result};

/// The eight entrypoints every guest module must export.
pub const REQUIRED_ENTRYPOINTS: &[&str] = &[
    "provider_init",
    "provider_read",
    "provider_plan",
    "provider_apply",
    "provider_destroy",
    "provider_validate",
    "provider_schema",
    "provider_metadata",
];

/// One `(input_ptr, input_len) -> packed_u64` guest export.
pub type Entrypoint = TypedFunc<(u32, u32), u64>;

fn pack(ptr: u32, len: u32) -> u64 {
    ((ptr as u64) << 32) | (len as u64)
}

fn unpack(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, value as u32)
}

/// Interprets a packed guest return value, distinguishing the two zero-length
/// cases: `(ptr=0, len=0)` is the legitimate empty-object result
/// `write_guest_bytes` itself produces, while `(ptr=code, len=0)` with a
/// nonzero `ptr` is a guest entrypoint signaling failure through the same
/// upper-bits channel `host_error_packed` writes for host functions.
pub fn unpack_with_error(value: u64) -> std::result::Result<(u32, u32), u32> {
    let (ptr, len) = unpack(value);
    if len == 0 && ptr != 0 {
        return Err(ptr);
    }
    Ok((ptr, len))
}

/// Writes `bytes` into guest memory via `malloc`, returning `(ptr, len)`.
pub fn write_guest_bytes(
    mut ctx: impl AsContextMut,
    memory: &Memory,
    malloc: &TypedFunc<u32, u32>,
    bytes: &[u8],
) -> Result<(u32, u32)> {
    let len = bytes.len() as u32;
    if len == 0 {
        return Ok((0, 0));
    }
    let ptr = malloc
        .call(&mut ctx, len)
        .map_err(|e| OpError::provider_failed(format!("guest malloc failed: {e}"), None))?;
    memory
        .write(&mut ctx, ptr as usize, bytes)
        .map_err(|e| OpError::provider_failed(format!("failed writing guest memory: {e}"), None))?;
    Ok((ptr, len))
}

/// Reads `len` bytes from guest memory at `ptr`, then frees the allocation.
pub fn read_and_free_guest_bytes(
    mut ctx: impl AsContextMut,
    memory: &Memory,
    free: &TypedFunc<u32, ()>,
    ptr: u32,
    len: u32,
) -> Result<Vec<u8>> {
    if len == 0 {
        free.call(&mut ctx, ptr).ok();
        return Ok(b"{}".to_vec());
    }
    let mut buf = vec![0u8; len as usize];
    memory
        .read(&mut ctx, ptr as usize, &mut buf)
        .map_err(|e| OpError::provider_failed(format!("failed reading guest memory: {e}"), None))?;
    free.call(&mut ctx, ptr)
        .map_err(|e| OpError::provider_failed(format!("guest free failed: {e}"), None))?;
    Ok(buf)
}

/// `write_guest_bytes`'s counterpart for calls driven directly against a
/// `Store` with `Config::async_support(true)` (every real entrypoint call —
/// `wasmtime` requires `call_async` there instead of `call`). Host functions
/// reached through a `Caller` keep using the sync `write_guest_bytes` above;
/// they are already running inside the fiber the outer `call_async` set up.
async fn write_guest_bytes_async<C>(
    mut ctx: C,
    memory: &Memory,
    malloc: &TypedFunc<u32, u32>,
    bytes: &[u8],
) -> Result<(u32, u32)>
where
    C: AsContextMut + Send,
    C::Data: Send,
{
    let len = bytes.len() as u32;
    if len == 0 {
        return Ok((0, 0));
    }
    let ptr = malloc
        .call_async(&mut ctx, len)
        .await
        .map_err(|e| OpError::provider_failed(format!("guest malloc failed: {e}"), None))?;
    memory
        .write(&mut ctx, ptr as usize, bytes)
        .map_err(|e| OpError::provider_failed(format!("failed writing guest memory: {e}"), None))?;
    Ok((ptr, len))
}

async fn read_and_free_guest_bytes_async<C>(
    mut ctx: C,
    memory: &Memory,
    free: &TypedFunc<u32, ()>,
    ptr: u32,
    len: u32,
) -> Result<Vec<u8>>
where
    C: AsContextMut + Send,
    C::Data: Send,
{
    if len == 0 {
        free.call_async(&mut ctx, ptr).await.ok();
        return Ok(b"{}".to_vec());
    }
    let mut buf = vec![0u8; len as usize];
    memory
        .read(&mut ctx, ptr as usize, &mut buf)
        .map_err(|e| OpError::provider_failed(format!("failed reading guest memory: {e}"), None))?;
    free.call_async(&mut ctx, ptr)
        .await
        .map_err(|e| OpError::provider_failed(format!("guest free failed: {e}"), None))?;
    Ok(buf)
}

/// Full round trip for one entrypoint call: serialize, marshal in, invoke,
/// unmarshal out, deserialize (spec §4.6 steps 1-5). Runs every guest call
/// through `call_async`, matching the `Config::async_support(true)` the
/// runtime instantiates with.
pub async fn call_entrypoint<C, Req, Resp>(
    mut ctx: C,
    memory: &Memory,
    malloc: &TypedFunc<u32, u32>,
    free: &TypedFunc<u32, ()>,
    entrypoint: &Entrypoint,
    request: &Req,
) -> Result<Resp>
where
    C: AsContextMut + Send,
    C::Data: Send,
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let payload = serde_json::to_vec(request)?;
    let (in_ptr, in_len) = write_guest_bytes_async(&mut ctx, memory, malloc, &payload).await?;
    let packed = entrypoint
        .call_async(&mut ctx, (in_ptr, in_len))
        .await
        .map_err(|e| OpError::provider_failed(format!("guest entrypoint trapped: {e}"), None));
    if in_len > 0 {
        free.call_async(&mut ctx, in_ptr).await.ok();
    }
    let packed = packed?;
    let (out_ptr, out_len) = unpack_with_error(packed)
        .map_err(|code| OpError::provider_failed(format!("guest entrypoint returned error code {code}"), None))?;
    let bytes = read_and_free_guest_bytes_async(&mut ctx, memory, free, out_ptr, out_len).await?;
    let response: Resp = serde_json::from_slice(&bytes)?;
    Ok(response)
}

/// Marks a host-function return path carrying an error code in the upper 32
/// bits (spec §4.6 "Errors returned via the host-function channel").
pub fn host_error_packed(code: u32) -> u64 {
    (code as u64) << 32
}

pub fn caller_memory<T>(caller: &mut Caller<'_, T>, export_name: &str) -> Result<Memory> {
    caller
        .get_export(export_name)
        .and_then(|e| e.into_memory())
        .ok_or_else(|| OpError::provider_failed(format!("guest export '{export_name}' is not a memory"), None))
}
