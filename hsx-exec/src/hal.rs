//! HAL module dispatch.
//!
//! Peripheral drivers are external collaborators behind fixed module IDs
//! 0x10..=0x17. The executive dispatches SVCs into whatever implementation
//! was injected for a bank; unbound banks and unimplemented functions
//! answer `ENOSYS`.

use hsx_abi::{MODULE_HAL_FIRST, MODULE_HAL_LAST, status};

/// Result of a HAL call: R0 status plus the auxiliary R1 value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HalResult {
    pub status: u32,
    pub r1: u32,
}

impl HalResult {
    pub fn ok(r1: u32) -> Self {
        Self {
            status: status::OK,
            r1,
        }
    }

    pub fn err(status: u32) -> Self {
        Self { status, r1: 0 }
    }
}

/// One peripheral module bank.
pub trait HalModule: Send {
    /// Handle `function` with the caller's R1..R5 as arguments.
    fn call(&mut self, function: u8, args: [u32; 5]) -> HalResult;
}

const BANKS: usize = (MODULE_HAL_LAST - MODULE_HAL_FIRST + 1) as usize;

/// The installed HAL banks.
#[derive(Default)]
pub struct HalBank {
    modules: [Option<Box<dyn HalModule>>; BANKS],
}

impl HalBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an implementation for a module ID. Replaces any previous one.
    pub fn install(&mut self, module: u8, implementation: Box<dyn HalModule>) {
        assert!(
            (MODULE_HAL_FIRST..=MODULE_HAL_LAST).contains(&module),
            "module id {module:#x} outside the HAL range"
        );
        self.modules[(module - MODULE_HAL_FIRST) as usize] = Some(implementation);
    }

    /// Dispatch a decoded `(module, function)` pair.
    pub fn dispatch(&mut self, module: u8, function: u8, args: [u32; 5]) -> HalResult {
        if !(MODULE_HAL_FIRST..=MODULE_HAL_LAST).contains(&module) {
            return HalResult::err(status::ENOSYS);
        }
        match &mut self.modules[(module - MODULE_HAL_FIRST) as usize] {
            Some(implementation) => implementation.call(function, args),
            None => HalResult::err(status::ENOSYS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl HalModule for Echo {
        fn call(&mut self, function: u8, args: [u32; 5]) -> HalResult {
            match function {
                1 => HalResult::ok(args[0].wrapping_add(1)),
                _ => HalResult::err(status::ENOSYS),
            }
        }
    }

    #[test]
    fn unbound_bank_answers_enosys() {
        let mut bank = HalBank::new();
        assert_eq!(
            bank.dispatch(0x10, 1, [0; 5]),
            HalResult::err(status::ENOSYS)
        );
        assert_eq!(
            bank.dispatch(0x42, 1, [0; 5]),
            HalResult::err(status::ENOSYS)
        );
    }

    #[test]
    fn installed_bank_handles_calls() {
        let mut bank = HalBank::new();
        bank.install(0x12, Box::new(Echo));
        assert_eq!(bank.dispatch(0x12, 1, [41, 0, 0, 0, 0]), HalResult::ok(42));
        assert_eq!(
            bank.dispatch(0x12, 9, [0; 5]),
            HalResult::err(status::ENOSYS)
        );
    }
}
