//! Fallible allocation gate.
//!
//! Rust's global allocator aborts the process on a true out-of-memory
//! condition, so every growth point that must surface `NoMemory` instead goes
//! through this module: a `try_reserve`-based reservation plus a thread-local
//! deterministic failure injector that tests arm to exercise the
//! out-of-memory paths.

use std::{cell::Cell, collections::VecDeque};

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("allocation failed")]
pub struct AllocError;

#[derive(Clone, Copy, Debug, Default)]
struct Injector {
    /// Claims to let through before failing. Meaningful only while `fail > 0`.
    skip: u32,
    /// Consecutive claims to fail once `skip` reaches zero.
    fail: u32,
}

thread_local! {
    static INJECTOR: Cell<Injector> = const { Cell::new(Injector { skip: 0, fail: 0 }) };
}

/// Arms the failure injector: the next `skip` claims succeed, the `fail`
/// claims after them fail, then the injector disarms itself.
pub fn fail_claims(skip: u32, fail: u32) {
    INJECTOR.with(|i| i.set(Injector { skip, fail }));
}

/// Disarms the failure injector.
pub fn reset() {
    INJECTOR.with(|i| i.set(Injector::default()));
}

/// True while armed failures remain pending.
pub fn failures_pending() -> bool {
    INJECTOR.with(|i| i.get().fail > 0)
}

/// Accounts for one allocation attempt against the injector.
pub fn claim() -> Result<(), AllocError> {
    INJECTOR.with(|cell| {
        let mut state = cell.get();
        if state.fail == 0 {
            return Ok(());
        }
        if state.skip > 0 {
            state.skip -= 1;
            cell.set(state);
            return Ok(());
        }
        state.fail -= 1;
        cell.set(state);
        Err(AllocError)
    })
}

/// Reserves room for `additional` more elements, failing instead of aborting.
pub fn reserve_vec<T>(vec: &mut Vec<T>, additional: usize) -> Result<(), AllocError> {
    claim()?;
    vec.try_reserve(additional).map_err(|_| AllocError)
}

/// [`reserve_vec`] for a `VecDeque`.
pub fn reserve_deque<T>(deque: &mut VecDeque<T>, additional: usize) -> Result<(), AllocError> {
    claim()?;
    deque.try_reserve(additional).map_err(|_| AllocError)
}

/// Copies `source` into a fresh heap string, failing instead of aborting.
pub fn new_string(source: &str) -> Result<String, AllocError> {
    claim()?;
    let mut out = String::new();
    out.try_reserve(source.len()).map_err(|_| AllocError)?;
    out.push_str(source);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injector_skips_then_fails_then_disarms() {
        fail_claims(2, 1);
        assert_eq!(claim(), Ok(()));
        assert_eq!(claim(), Ok(()));
        assert_eq!(claim(), Err(AllocError));
        assert_eq!(claim(), Ok(()));
        assert!(!failures_pending());
    }

    #[test]
    fn reset_disarms() {
        fail_claims(0, 5);
        assert!(failures_pending());
        reset();
        assert_eq!(claim(), Ok(()));
    }

    #[test]
    fn reserve_vec_respects_injector() {
        let mut v: Vec<u8> = Vec::new();
        fail_claims(0, 1);
        assert_eq!(reserve_vec(&mut v, 16), Err(AllocError));
        assert_eq!(reserve_vec(&mut v, 16), Ok(()));
        assert!(v.capacity() >= 16);
    }

    #[test]
    fn new_string_copies() {
        assert_eq!(new_string("abc").unwrap(), "abc");
    }
}
