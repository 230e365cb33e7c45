//! OTG core low-level driver: register map, hardware channel pool and
//! the transfer scheduler / interrupt service.

pub mod channel;
pub mod regs;
pub mod sched;
