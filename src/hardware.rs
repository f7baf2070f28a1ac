//! The native-method seam: hardware-access leaf methods live outside the
//! core and are consulted through a single dispatch hook.

use microclr_asm::NativeMethod;

use crate::value::Variable;

/// Dispatch hook for built-in methods. `args[0]` is the `this` reference
/// for instance methods. Returning `false` means the method is not
/// implemented, which the interpreter surfaces as `MissingMethod`.
pub trait HardwareAccess {
    /// Execute `method` over `args`, writing the return value (if any)
    /// into `result`.
    fn execute_hardware_access(
        &mut self,
        method: NativeMethod,
        args: &mut [Variable],
        result: &mut Variable,
    ) -> bool;
}

/// A hook with no native methods at all; every dispatch reports unhandled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHardware;

impl HardwareAccess for NoHardware {
    fn execute_hardware_access(
        &mut self,
        _method: NativeMethod,
        _args: &mut [Variable],
        _result: &mut Variable,
    ) -> bool {
        false
    }
}
