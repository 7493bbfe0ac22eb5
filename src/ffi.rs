//! C ABI driver adapter
//!
//! Lets a native driver library be plugged in as a [`Driver`]. The embedder
//! hands over a [`NativeDriverApi`] function table; the bridge hands the
//! driver back a [`NativeCallbackTable`] of `extern "C"` trampolines.
//!
//! ```text
//! context_create(user)                         -> ctx (null on failure)
//! context_delete(user, ctx)                    -> 0 on success
//! set_callbacks(user, ctx, table | null)       -> 0 on success
//! latest_state(user, ctx, adapter, port, out)  -> 1 if `out` was written
//!
//! on_plug(cb_user, adapter, port)   -> handle (0 = rejected)
//! on_unplug(cb_user, handle)
//! on_state(cb_user, handle, state | null)
//! ```
//!
//! The trampolines never unwind into native code: panics are caught and
//! logged, and bad arguments are dropped.

use std::collections::HashMap;
use std::ffi::{c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

use crate::bridge::{ContextHandle, Driver, DriverCallbacks, DriverError, NativeHandle};
use crate::controller::{ControllerIdentity, RawControllerState, PORTS_PER_ADAPTER};

pub type GcPlugFn = unsafe extern "C" fn(user_data: *mut c_void, adapter: c_int, port: c_int) -> u64;
pub type GcUnplugFn = unsafe extern "C" fn(user_data: *mut c_void, handle: u64);
pub type GcStateFn =
    unsafe extern "C" fn(user_data: *mut c_void, handle: u64, state: *const RawControllerState);

/// Callback table passed to the native driver. The driver copies it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NativeCallbackTable {
    pub user_data: *mut c_void,
    pub on_plug: GcPlugFn,
    pub on_unplug: GcUnplugFn,
    pub on_state: GcStateFn,
}

/// Function table exported by a native driver library.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NativeDriverApi {
    pub user_data: *mut c_void,
    pub context_create: unsafe extern "C" fn(user_data: *mut c_void) -> *mut c_void,
    pub context_delete: unsafe extern "C" fn(user_data: *mut c_void, context: *mut c_void) -> c_int,
    pub set_callbacks: unsafe extern "C" fn(
        user_data: *mut c_void,
        context: *mut c_void,
        table: *const NativeCallbackTable,
    ) -> c_int,
    pub latest_state: Option<
        unsafe extern "C" fn(
            user_data: *mut c_void,
            context: *mut c_void,
            adapter: c_int,
            port: c_int,
            out: *mut RawControllerState,
        ) -> c_int,
    >,
}

// Callbacks are boxed so their address stays fixed while the driver holds it
type CallbackBox = Box<Arc<dyn DriverCallbacks>>;

struct NativeContext {
    raw: *mut c_void,
    callbacks: Option<CallbackBox>,
}

/// [`Driver`] implemented over a native function table.
pub struct NativeDriver {
    api: NativeDriverApi,
    contexts: Mutex<HashMap<ContextHandle, NativeContext>>,
    next_context: AtomicU64,
}

// The embedder guarantees the function table is callable from any thread
// (see `NativeDriver::new`); the context pointers are only passed back to it.
unsafe impl Send for NativeDriver {}
unsafe impl Sync for NativeDriver {}

impl NativeDriver {
    /// Wraps a native function table.
    ///
    /// # Safety
    ///
    /// Every function in `api` must be safe to call from any thread with the
    /// given `user_data`. After `set_callbacks` returns (with a table or with
    /// null), the driver must no longer invoke callbacks from the previous
    /// table, and it must not call any callback after `context_delete`.
    pub unsafe fn new(api: NativeDriverApi) -> Self {
        Self {
            api,
            contexts: Mutex::new(HashMap::new()),
            next_context: AtomicU64::new(1),
        }
    }

    fn contexts(&self) -> std::sync::MutexGuard<'_, HashMap<ContextHandle, NativeContext>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Driver for NativeDriver {
    fn open_context(&self) -> Result<ContextHandle, DriverError> {
        let raw = unsafe { (self.api.context_create)(self.api.user_data) };
        if raw.is_null() {
            return Err(DriverError::Unavailable(
                "native context_create returned null".to_string(),
            ));
        }

        let handle = ContextHandle(self.next_context.fetch_add(1, Ordering::Relaxed));
        self.contexts().insert(
            handle,
            NativeContext {
                raw,
                callbacks: None,
            },
        );
        info!("Native driver context {} created", handle);
        Ok(handle)
    }

    fn close_context(&self, context: ContextHandle) -> Result<(), DriverError> {
        let entry = self
            .contexts()
            .remove(&context)
            .ok_or(DriverError::UnknownContext(context))?;

        let status = unsafe { (self.api.context_delete)(self.api.user_data, entry.raw) };
        drop(entry.callbacks);

        if status != 0 {
            return Err(DriverError::CallFailed(format!(
                "context_delete returned {}",
                status
            )));
        }
        info!("Native driver context {} deleted", context);
        Ok(())
    }

    fn set_callbacks(
        &self,
        context: ContextHandle,
        callbacks: Arc<dyn DriverCallbacks>,
    ) -> Result<(), DriverError> {
        let mut contexts = self.contexts();
        let entry = contexts
            .get_mut(&context)
            .ok_or(DriverError::UnknownContext(context))?;

        let boxed: CallbackBox = Box::new(callbacks);
        let table = NativeCallbackTable {
            user_data: &*boxed as *const Arc<dyn DriverCallbacks> as *mut c_void,
            on_plug: gc_bridge_on_plug,
            on_unplug: gc_bridge_on_unplug,
            on_state: gc_bridge_on_state,
        };

        let status = unsafe { (self.api.set_callbacks)(self.api.user_data, entry.raw, &table) };
        if status != 0 {
            return Err(DriverError::CallFailed(format!(
                "set_callbacks returned {}",
                status
            )));
        }

        // The previous table is no longer referenced by the driver
        entry.callbacks = Some(boxed);
        debug!("Installed native callbacks on {}", context);
        Ok(())
    }

    fn clear_callbacks(&self, context: ContextHandle) {
        let mut contexts = self.contexts();
        let Some(entry) = contexts.get_mut(&context) else {
            debug!("clear_callbacks on unknown context {}", context);
            return;
        };

        let status =
            unsafe { (self.api.set_callbacks)(self.api.user_data, entry.raw, ptr::null()) };
        if status != 0 {
            // Keep the callbacks alive; the driver may still reference them
            warn!("Native set_callbacks(null) returned {}", status);
            return;
        }
        entry.callbacks = None;
    }

    fn latest_state(
        &self,
        context: ContextHandle,
        id: ControllerIdentity,
    ) -> Option<RawControllerState> {
        let latest_state = self.api.latest_state?;
        let raw = self.contexts().get(&context)?.raw;

        let mut out = RawControllerState::default();
        let written = unsafe {
            latest_state(
                self.api.user_data,
                raw,
                id.adapter as c_int,
                id.port as c_int,
                &mut out,
            )
        };
        (written == 1).then_some(out)
    }
}

impl Drop for NativeDriver {
    fn drop(&mut self) {
        let contexts: Vec<_> = self.contexts().keys().copied().collect();
        for context in contexts {
            warn!("Native context {} still open on drop, deleting", context);
            if let Err(e) = self.close_context(context) {
                error!("Failed to delete native context {}: {}", context, e);
            }
        }
    }
}

unsafe fn callbacks_from<'a>(user_data: *mut c_void) -> Option<&'a Arc<dyn DriverCallbacks>> {
    (user_data as *const Arc<dyn DriverCallbacks>).as_ref()
}

fn controller_slot(adapter: c_int, port: c_int) -> Option<(u8, u8)> {
    let adapter = u8::try_from(adapter).ok()?;
    let port = u8::try_from(port).ok().filter(|p| *p < PORTS_PER_ADAPTER)?;
    Some((adapter, port))
}

extern "C" fn gc_bridge_on_plug(user_data: *mut c_void, adapter: c_int, port: c_int) -> u64 {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let callbacks = unsafe { callbacks_from(user_data) }?;
        let Some((adapter, port)) = controller_slot(adapter, port) else {
            warn!("Rejecting plug for invalid slot {}:{}", adapter, port);
            return None;
        };
        Some(callbacks.on_plug(adapter, port))
    }));

    match result {
        Ok(Some(handle)) => handle.0,
        Ok(None) => NativeHandle::NULL.0,
        Err(_) => {
            error!("Panic in native plug trampoline");
            NativeHandle::NULL.0
        }
    }
}

extern "C" fn gc_bridge_on_unplug(user_data: *mut c_void, handle: u64) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        if let Some(callbacks) = unsafe { callbacks_from(user_data) } {
            callbacks.on_unplug(NativeHandle(handle));
        }
    }));

    if result.is_err() {
        error!("Panic in native unplug trampoline");
    }
}

extern "C" fn gc_bridge_on_state(
    user_data: *mut c_void,
    handle: u64,
    state: *const RawControllerState,
) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        if let Some(callbacks) = unsafe { callbacks_from(user_data) } {
            let raw = unsafe { state.as_ref() }.copied();
            callbacks.on_state(NativeHandle(handle), raw);
        }
    }));

    if result.is_err() {
        error!("Panic in native state trampoline");
    }
}
