//! Host tasking-runtime binding via runtime symbol resolution.
//!
//! The tasking runtime is linked into the final application, not into this
//! library, and different runtime generations expose different polling
//! registration conventions. [`HostRuntime::resolve`] performs the
//! capability negotiation once at attach time:
//!
//! - every mandatory entry point (event-counter get/increase/decrease) is
//!   resolved with `dlsym`; a missing one fails initialization with a
//!   diagnostic naming the symbol;
//! - for polling registration, the newer periodic convention (callback
//!   returns the next invocation delay in microseconds) is preferred when
//!   present, with fallback to the older service convention (callback
//!   returns a "done" flag and the runtime picks the cadence);
//! - CPU topology entry points are optional; when absent, the current CPU
//!   comes from `sched_getcpu` and the CPU→NUMA map from sysfs.
//!
//! After resolution every call is a direct function-pointer call.

use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::tasking::{CounterHandle, PollingHandler, PollingRegistration, TaskingRuntime};

// Mandatory event-counter API.
const SYM_GET_COUNTER: &CStr = c"nanos6_get_current_event_counter";
const SYM_INCREASE: &CStr = c"nanos6_increase_current_task_event_counter";
const SYM_DECREASE: &CStr = c"nanos6_decrease_task_event_counter";

// Older registration convention: callback returns nonzero when done.
const SYM_REGISTER_SERVICE: &CStr = c"nanos6_register_polling_service";
const SYM_UNREGISTER_SERVICE: &CStr = c"nanos6_unregister_polling_service";

// Newer registration convention: callback returns the next delay in µs.
const SYM_REGISTER_PERIODIC: &CStr = c"nanos6_register_periodic_callback";
const SYM_UNREGISTER_PERIODIC: &CStr = c"nanos6_unregister_periodic_callback";

// Optional topology API.
const SYM_CURRENT_CPU: &CStr = c"nanos6_get_current_virtual_cpu";

type GetCounterFn = unsafe extern "C" fn() -> *mut c_void;
type AdjustCounterFn = unsafe extern "C" fn(*mut c_void, u32);
type ServiceFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type RegisterServiceFn = unsafe extern "C" fn(*const c_char, ServiceFn, *mut c_void);
type UnregisterServiceFn = unsafe extern "C" fn(*const c_char, ServiceFn, *mut c_void);
type PeriodicFn = unsafe extern "C" fn(*mut c_void) -> u64;
type RegisterPeriodicFn =
    unsafe extern "C" fn(*const c_char, PeriodicFn, *mut c_void, u64) -> *mut c_void;
type UnregisterPeriodicFn = unsafe extern "C" fn(*mut c_void);
type CurrentCpuFn = unsafe extern "C" fn() -> u64;

/// Which polling registration convention the runtime offers.
enum PollingApi {
    Service {
        register: RegisterServiceFn,
        unregister: UnregisterServiceFn,
    },
    Periodic {
        register: RegisterPeriodicFn,
        unregister: UnregisterPeriodicFn,
    },
}

/// Heap context handed to the runtime as the callback argument.
struct CallbackContext {
    handler: PollingHandler,
    /// Next-delay answer for the periodic convention, in µs.
    period_us: u64,
}

unsafe extern "C" fn service_trampoline(data: *mut c_void) -> c_int {
    let ctx = unsafe { &*(data as *const CallbackContext) };
    (ctx.handler)();
    0 // never "done"; unregistration is explicit
}

unsafe extern "C" fn periodic_trampoline(data: *mut c_void) -> u64 {
    let ctx = unsafe { &*(data as *const CallbackContext) };
    (ctx.handler)();
    ctx.period_us
}

struct RegistrationRecord {
    /// Keeps the callback context alive until unregistration.
    context: *mut CallbackContext,
    /// Name passed at registration (service convention identifies the
    /// registration by the (name, fn, data) triple).
    name: CString,
    /// Runtime-side handle (periodic convention).
    runtime_handle: *mut c_void,
}

unsafe impl Send for RegistrationRecord {}

/// Tasking-runtime binding resolved from the host process.
pub struct HostRuntime {
    get_counter: GetCounterFn,
    increase: AdjustCounterFn,
    decrease: AdjustCounterFn,
    polling: PollingApi,
    current_cpu: Option<CurrentCpuFn>,
    numa_map: Option<Vec<usize>>,
    registrations: Mutex<HashMap<u64, RegistrationRecord>>,
    next_registration: AtomicU64,
}

impl HostRuntime {
    /// Resolve the runtime's entry points from the current process image.
    pub fn resolve() -> io::Result<Self> {
        let polling = match (
            lookup(SYM_REGISTER_PERIODIC),
            lookup(SYM_UNREGISTER_PERIODIC),
        ) {
            (Some(register), Some(unregister)) => PollingApi::Periodic {
                register: unsafe { std::mem::transmute::<*mut c_void, RegisterPeriodicFn>(register) },
                unregister: unsafe {
                    std::mem::transmute::<*mut c_void, UnregisterPeriodicFn>(unregister)
                },
            },
            _ => PollingApi::Service {
                register: unsafe {
                    std::mem::transmute::<*mut c_void, RegisterServiceFn>(mandatory(
                        SYM_REGISTER_SERVICE,
                    )?)
                },
                unregister: unsafe {
                    std::mem::transmute::<*mut c_void, UnregisterServiceFn>(mandatory(
                        SYM_UNREGISTER_SERVICE,
                    )?)
                },
            },
        };

        Ok(Self {
            get_counter: unsafe {
                std::mem::transmute::<*mut c_void, GetCounterFn>(mandatory(SYM_GET_COUNTER)?)
            },
            increase: unsafe {
                std::mem::transmute::<*mut c_void, AdjustCounterFn>(mandatory(SYM_INCREASE)?)
            },
            decrease: unsafe {
                std::mem::transmute::<*mut c_void, AdjustCounterFn>(mandatory(SYM_DECREASE)?)
            },
            polling,
            current_cpu: lookup(SYM_CURRENT_CPU)
                .map(|sym| unsafe { std::mem::transmute::<*mut c_void, CurrentCpuFn>(sym) }),
            numa_map: read_sysfs_numa_map(),
            registrations: Mutex::new(HashMap::new()),
            next_registration: AtomicU64::new(1),
        })
    }
}

impl TaskingRuntime for HostRuntime {
    fn current_task_counter(&self) -> CounterHandle {
        let raw = unsafe { (self.get_counter)() };
        CounterHandle::from_raw(raw as u64)
    }

    fn increase_counter(&self, counter: CounterHandle, amount: u32) {
        unsafe { (self.increase)(counter.as_raw() as *mut c_void, amount) }
    }

    fn decrease_counter(&self, counter: CounterHandle, amount: u32) {
        unsafe { (self.decrease)(counter.as_raw() as *mut c_void, amount) }
    }

    fn register_polling(
        &self,
        name: &str,
        period: Duration,
        handler: PollingHandler,
    ) -> PollingRegistration {
        let context = Box::into_raw(Box::new(CallbackContext {
            handler,
            period_us: period.as_micros().max(1) as u64,
        }));
        let name = CString::new(name).expect("polling name contains NUL");

        let runtime_handle = match &self.polling {
            PollingApi::Service { register, .. } => {
                unsafe {
                    register(name.as_ptr(), service_trampoline, context as *mut c_void)
                };
                std::ptr::null_mut()
            }
            PollingApi::Periodic { register, .. } => unsafe {
                register(
                    name.as_ptr(),
                    periodic_trampoline,
                    context as *mut c_void,
                    (*context).period_us,
                )
            },
        };

        let id = self.next_registration.fetch_add(1, Ordering::Relaxed);
        self.registrations
            .lock()
            .expect("registration table poisoned")
            .insert(
                id,
                RegistrationRecord {
                    context,
                    name,
                    runtime_handle,
                },
            );
        PollingRegistration(id)
    }

    fn unregister_polling(&self, registration: PollingRegistration) {
        let record = self
            .registrations
            .lock()
            .expect("registration table poisoned")
            .remove(&registration.0);
        let Some(record) = record else {
            return;
        };

        match &self.polling {
            PollingApi::Service { unregister, .. } => unsafe {
                unregister(
                    record.name.as_ptr(),
                    service_trampoline,
                    record.context as *mut c_void,
                )
            },
            PollingApi::Periodic { unregister, .. } => unsafe {
                unregister(record.runtime_handle)
            },
        }

        // The runtime no longer invokes the callback; release its context.
        drop(unsafe { Box::from_raw(record.context) });
    }

    fn current_cpu(&self) -> Option<usize> {
        if let Some(f) = self.current_cpu {
            return Some(unsafe { f() } as usize);
        }
        let cpu = unsafe { libc::sched_getcpu() };
        (cpu >= 0).then_some(cpu as usize)
    }

    fn cpu_numa_map(&self) -> Option<Vec<usize>> {
        self.numa_map.clone()
    }
}

fn lookup(symbol: &CStr) -> Option<*mut c_void> {
    let ptr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, symbol.as_ptr()) };
    (!ptr.is_null()).then_some(ptr)
}

fn mandatory(symbol: &CStr) -> io::Result<*mut c_void> {
    lookup(symbol).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!(
                "tasking runtime symbol {:?} could not be resolved; \
                 is the application linked against a task-aware runtime?",
                symbol
            ),
        )
    })
}

/// CPU→NUMA map from sysfs, for runtimes without a topology API.
fn read_sysfs_numa_map() -> Option<Vec<usize>> {
    let nodes = std::fs::read_dir("/sys/devices/system/node").ok()?;

    let mut pairs: Vec<(usize, usize)> = Vec::new();
    for entry in nodes.flatten() {
        let name = entry.file_name();
        let name = name.to_str()?;
        let Some(node) = name.strip_prefix("node").and_then(|n| n.parse().ok()) else {
            continue;
        };
        let cpulist = std::fs::read_to_string(entry.path().join("cpulist")).ok()?;
        for cpu in parse_cpu_list(&cpulist) {
            pairs.push((cpu, node));
        }
    }
    if pairs.is_empty() {
        return None;
    }

    let max_cpu = pairs.iter().map(|(cpu, _)| *cpu).max()?;
    let mut map = vec![0usize; max_cpu + 1];
    for (cpu, node) in pairs {
        map[cpu] = node;
    }
    Some(map)
}

/// Parse a sysfs cpulist like `0-3,8,10-11`.
fn parse_cpu_list(list: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',') {
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.trim().parse::<usize>(), hi.trim().parse::<usize>()) {
                    cpus.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(cpu) = part.trim().parse() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_list("0-1,4,6-7\n"), vec![0, 1, 4, 6, 7]);
        assert_eq!(parse_cpu_list("5"), vec![5]);
        assert!(parse_cpu_list("").is_empty());
        assert!(parse_cpu_list("garbage").is_empty());
    }

    #[test]
    fn test_resolve_fails_without_runtime() {
        // The test binary is not linked against a tasking runtime, so the
        // mandatory counter symbols cannot resolve.
        assert!(HostRuntime::resolve().is_err());
    }
}
