//! # lookout-sandbox
//!
//! Executes user-authored response-handling code inside a constrained
//! capability sandbox. The code is a WASM module instantiated per iteration
//! in a fresh fuel-limited store; the only capabilities it has are the host
//! functions registered on the linker — the fixed table defined by
//! [`HostApi`]. No WASI, no ambient anything.
//!
//! ## Guest ABI
//!
//! The handler module must export:
//!
//! - `memory` — linear memory
//! - `lookout_malloc(len: u32) -> u32` — allocate `len` bytes, return pointer
//! - `lookout_handle(response_ptr: u32, response_len: u32)` — entry point;
//!   the host writes the raw model response into guest memory and calls this
//!
//! Host functions that produce a value (e.g. `host_get_memory`) return the
//! value's byte length; the guest fetches the bytes with
//! `host_read_result(out_ptr, max_len)`. Host functions that only act
//! return `0` on success and `1` on failure.

pub mod api;
pub mod host;

pub use api::{HostApi, ResponseHandler};
pub use host::WasmSandbox;
