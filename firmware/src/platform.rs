//! Cortex-M glue: critical sections, restart, and the panic handler.

use core::panic::PanicInfo;

use cortex_m::interrupt;
use cortex_m::peripheral::SCB;
use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use node_core::session::{RestartReason, SystemControl};

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                interrupt::enable();
            }
        }
    }
}

/// Restarts through the system control block.
#[derive(Copy, Clone, Debug, Default)]
pub struct CortexRestart;

impl SystemControl for CortexRestart {
    fn restart(&self, reason: RestartReason) {
        defmt::error!("system reset: {}", defmt::Display2Format(&reason));
        SCB::sys_reset();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    defmt::error!("PANIC: {}", defmt::Display2Format(info));
    SCB::sys_reset();
}
